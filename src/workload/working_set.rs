//! Working-set allocation.
//!
//! Each buffer's size is drawn from its `[min, max]` bounds with the
//! caller's buffer-size stream, then allocated on the device. Every buffer
//! gets its (set, slot) tag written once at allocation.

use rand::Rng;

use crate::device::{BufferHandle, Device};
use crate::error::{Result, WsimError};
use crate::parser::{BufferSize, WorkingSetDecl};

/// One allocated buffer of a working set.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WorkingSetBuffer {
    pub handle: BufferHandle,
    pub size: u64,
}

/// An allocated working set.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkingSet {
    pub id: u32,
    pub shared: bool,
    pub buffers: Vec<WorkingSetBuffer>,
}

/// Draw a concrete size; fixed specs never consume randomness.
pub fn draw_size<R: Rng + ?Sized>(size: &BufferSize, rng: &mut R) -> u64 {
    if size.min == size.max {
        size.min
    } else {
        rng.gen_range(size.min..=size.max)
    }
}

impl WorkingSet {
    /// Allocate every buffer of `decl`.
    ///
    /// On failure the buffers created so far are released again.
    pub fn allocate<R: Rng + ?Sized>(decl: &WorkingSetDecl, device: &dyn Device, rng: &mut R) -> Result<Self> {
        let mut set = Self {
            id: decl.id,
            shared: decl.shared,
            buffers: Vec::with_capacity(decl.sizes.len()),
        };

        for (slot, spec) in decl.sizes.iter().enumerate() {
            let size = draw_size(spec, rng);
            let buffer = device.create_buffer(size).and_then(|handle| {
                let tag = (u64::from(decl.id) << 32) | slot as u64;
                let tag = tag.to_le_bytes();
                let len = tag.len().min(size as usize);
                device.write_buffer(handle, 0, &tag[..len])?;
                Ok(WorkingSetBuffer { handle, size })
            });

            match buffer {
                Ok(buffer) => set.buffers.push(buffer),
                Err(source) => {
                    set.release(device);
                    return Err(WsimError::resource(
                        format!("working set {} buffer {} ({} bytes)", decl.id, slot, size),
                        source,
                    ));
                }
            }
        }

        log::debug!(
            "allocated {} working set {}: {} buffers, {} bytes",
            if decl.shared { "shared" } else { "private" },
            decl.id,
            set.buffers.len(),
            set.total_size()
        );
        Ok(set)
    }

    pub fn handle(&self, slot: usize) -> Option<BufferHandle> {
        self.buffers.get(slot).map(|b| b.handle)
    }

    pub fn total_size(&self) -> u64 {
        self.buffers.iter().map(|b| b.size).sum()
    }

    /// Destroy every buffer. Failures are logged, not returned.
    pub fn release(&mut self, device: &dyn Device) {
        for buffer in self.buffers.drain(..) {
            if let Err(e) = device.destroy_buffer(buffer.handle) {
                log::warn!("working set {}: failed to release buffer: {}", self.id, e);
            }
        }
    }
}
