//! Buffer objects of the simulated device.
//!
//! Buffers use sparse page storage, so declaring a large working set costs
//! nothing until someone writes into it. Unwritten bytes read as zero.

use std::collections::{BTreeMap, HashMap};

use crate::device::BufferHandle;
use crate::error::DeviceError;

/// Largest single buffer the simulated device accepts (64 GiB).
pub const MAX_BUFFER_SIZE: u64 = 1 << 36;

const PAGE_SIZE: usize = 4096;
const PAGE_MASK: u64 = !(PAGE_SIZE as u64 - 1);

struct SimBuffer {
    size: u64,
    /// page address -> page data
    pages: BTreeMap<u64, Box<[u8; PAGE_SIZE]>>,
}

impl SimBuffer {
    fn check_range(&self, handle: BufferHandle, offset: u64, len: usize) -> Result<(), DeviceError> {
        match offset.checked_add(len as u64) {
            Some(end) if end <= self.size => Ok(()),
            _ => Err(DeviceError::BufferRange {
                handle: handle.0,
                offset,
                len,
            }),
        }
    }

    fn write(&mut self, offset: u64, data: &[u8]) {
        let mut addr = offset;
        let mut remaining = data;

        while !remaining.is_empty() {
            let page = self
                .pages
                .entry(addr & PAGE_MASK)
                .or_insert_with(|| Box::new([0u8; PAGE_SIZE]));
            let page_offset = (addr & !PAGE_MASK) as usize;
            let count = remaining.len().min(PAGE_SIZE - page_offset);

            page[page_offset..page_offset + count].copy_from_slice(&remaining[..count]);

            addr += count as u64;
            remaining = &remaining[count..];
        }
    }

    fn read(&self, offset: u64, buf: &mut [u8]) {
        let mut addr = offset;
        let mut done = 0;

        while done < buf.len() {
            let page_offset = (addr & !PAGE_MASK) as usize;
            let count = (buf.len() - done).min(PAGE_SIZE - page_offset);
            let out = &mut buf[done..done + count];

            match self.pages.get(&(addr & PAGE_MASK)) {
                Some(page) => out.copy_from_slice(&page[page_offset..page_offset + count]),
                None => out.fill(0),
            }

            addr += count as u64;
            done += count;
        }
    }
}

/// All live buffer objects.
#[derive(Default)]
pub struct BufferStore {
    buffers: HashMap<u32, SimBuffer>,
    next_handle: u32,
}

impl BufferStore {
    pub fn create(&mut self, size: u64) -> Result<BufferHandle, DeviceError> {
        if size == 0 {
            return Err(DeviceError::InvalidParam("zero sized buffer".to_string()));
        }
        if size > MAX_BUFFER_SIZE {
            return Err(DeviceError::OutOfMemory(size));
        }

        self.next_handle += 1;
        let handle = BufferHandle(self.next_handle);
        self.buffers.insert(
            handle.0,
            SimBuffer {
                size,
                pages: BTreeMap::new(),
            },
        );
        Ok(handle)
    }

    pub fn contains(&self, handle: BufferHandle) -> bool {
        self.buffers.contains_key(&handle.0)
    }

    pub fn size(&self, handle: BufferHandle) -> Result<u64, DeviceError> {
        self.get(handle).map(|b| b.size)
    }

    fn get(&self, handle: BufferHandle) -> Result<&SimBuffer, DeviceError> {
        self.buffers
            .get(&handle.0)
            .ok_or(DeviceError::InvalidBuffer(handle.0))
    }

    pub fn write(&mut self, handle: BufferHandle, offset: u64, data: &[u8]) -> Result<(), DeviceError> {
        let buffer = self
            .buffers
            .get_mut(&handle.0)
            .ok_or(DeviceError::InvalidBuffer(handle.0))?;
        buffer.check_range(handle, offset, data.len())?;
        buffer.write(offset, data);
        Ok(())
    }

    pub fn read(&self, handle: BufferHandle, offset: u64, buf: &mut [u8]) -> Result<(), DeviceError> {
        let buffer = self.get(handle)?;
        buffer.check_range(handle, offset, buf.len())?;
        buffer.read(offset, buf);
        Ok(())
    }

    pub fn destroy(&mut self, handle: BufferHandle) -> Result<(), DeviceError> {
        self.buffers
            .remove(&handle.0)
            .map(|_| ())
            .ok_or(DeviceError::InvalidBuffer(handle.0))
    }

    pub fn len(&self) -> usize {
        self.buffers.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_unwritten_reads_zero() {
        let mut store = BufferStore::default();
        let handle = store.create(1 << 30).unwrap();
        let mut buf = [0xAAu8; 16];
        store.read(handle, 12345, &mut buf).unwrap();
        assert_eq!(buf, [0u8; 16]);
    }

    #[test]
    fn test_write_across_pages() {
        let mut store = BufferStore::default();
        let handle = store.create(3 * PAGE_SIZE as u64).unwrap();
        let data: Vec<u8> = (0..6000).map(|i| i as u8).collect();
        store.write(handle, 100, &data).unwrap();

        let mut back = vec![0u8; 6000];
        store.read(handle, 100, &mut back).unwrap();
        assert_eq!(back, data);
    }

    #[test]
    fn test_range_and_handle_checks() {
        let mut store = BufferStore::default();
        let handle = store.create(64).unwrap();
        assert!(matches!(
            store.write(handle, 60, &[0; 8]),
            Err(DeviceError::BufferRange { .. })
        ));
        store.destroy(handle).unwrap();
        assert_eq!(store.destroy(handle), Err(DeviceError::InvalidBuffer(handle.0)));
        assert!(store.create(0).is_err());
        assert_eq!(store.create(MAX_BUFFER_SIZE + 1), Err(DeviceError::OutOfMemory(MAX_BUFFER_SIZE + 1)));
    }
}
