//! Lazily populated device capabilities.
//!
//! Each query hits the device at most once. A `DeviceCaps` is created next
//! to the device and passed by reference to every prepare phase; prepares
//! run one after another before any client thread starts.

use std::sync::{Arc, OnceLock};

use super::{Device, EngineInfo};
use crate::error::DeviceError;

pub struct DeviceCaps {
    device: Arc<dyn Device>,
    engines: OnceLock<Vec<EngineInfo>>,
    timestamp_frequency: OnceLock<u64>,
    slice_mask: OnceLock<u64>,
    load_balance: OnceLock<bool>,
}

impl DeviceCaps {
    pub fn new(device: Arc<dyn Device>) -> Self {
        Self {
            device,
            engines: OnceLock::new(),
            timestamp_frequency: OnceLock::new(),
            slice_mask: OnceLock::new(),
            load_balance: OnceLock::new(),
        }
    }

    pub fn device(&self) -> &Arc<dyn Device> {
        &self.device
    }

    /// Physical engine topology.
    pub fn engines(&self) -> Result<&[EngineInfo], DeviceError> {
        if let Some(engines) = self.engines.get() {
            return Ok(engines);
        }
        let engines = self.device.engines()?;
        log::debug!(
            "Engine topology: {:?}",
            engines.iter().map(|e| e.name.as_str()).collect::<Vec<_>>()
        );
        Ok(self.engines.get_or_init(|| engines))
    }

    /// Timestamp counter frequency in Hz.
    pub fn timestamp_frequency(&self) -> Result<u64, DeviceError> {
        if let Some(&freq) = self.timestamp_frequency.get() {
            return Ok(freq);
        }
        let freq = self.device.timestamp_frequency()?;
        log::debug!("Timestamp frequency: {} Hz", freq);
        Ok(*self.timestamp_frequency.get_or_init(|| freq))
    }

    /// Full slice mask of the device.
    pub fn default_slice_mask(&self) -> Result<u64, DeviceError> {
        if let Some(&mask) = self.slice_mask.get() {
            return Ok(mask);
        }
        let mask = self.device.default_slice_mask()?;
        Ok(*self.slice_mask.get_or_init(|| mask))
    }

    pub fn supports_load_balance(&self) -> Result<bool, DeviceError> {
        if let Some(&lb) = self.load_balance.get() {
            return Ok(lb);
        }
        let lb = self.device.supports_load_balance()?;
        Ok(*self.load_balance.get_or_init(|| lb))
    }

    /// Index of the engine named exactly `name`.
    pub fn engine_index(&self, name: &str) -> Result<Option<usize>, DeviceError> {
        Ok(self.engines()?.iter().position(|e| e.name == name))
    }

    /// Indices of every instance of engine class `class`.
    pub fn class_instances(&self, class: &str) -> Result<Vec<usize>, DeviceError> {
        Ok(self
            .engines()?
            .iter()
            .enumerate()
            .filter(|(_, e)| e.class == class)
            .map(|(i, _)| i)
            .collect())
    }

    /// Resolve an engine name: an exact instance name first, then every
    /// instance of a class with that name.
    pub fn resolve(&self, name: &str) -> Result<Vec<usize>, DeviceError> {
        match self.engine_index(name)? {
            Some(index) => Ok(vec![index]),
            None => self.class_instances(name),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::{SimConfig, SimDevice};

    fn caps() -> (Arc<SimDevice>, DeviceCaps) {
        let sim = Arc::new(SimDevice::new(SimConfig::with_engines(&["RCS", "VCS1", "VCS2"])).unwrap());
        let caps = DeviceCaps::new(sim.clone());
        (sim, caps)
    }

    #[test]
    fn test_queries_hit_device_once() {
        let (sim, caps) = caps();
        for _ in 0..3 {
            assert_eq!(caps.engines().unwrap().len(), 3);
            caps.timestamp_frequency().unwrap();
            caps.default_slice_mask().unwrap();
            caps.supports_load_balance().unwrap();
        }
        assert_eq!(sim.stats().capability_queries, 4);
    }

    #[test]
    fn test_resolve_instance_and_class() {
        let (_sim, caps) = caps();
        assert_eq!(caps.resolve("VCS2").unwrap(), vec![2]);
        assert_eq!(caps.resolve("VCS").unwrap(), vec![1, 2]);
        assert_eq!(caps.resolve("RCS").unwrap(), vec![0]);
        assert!(caps.resolve("BCS").unwrap().is_empty());
    }
}
