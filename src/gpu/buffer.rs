// gpu/buffer.rs — device buffers and blocking host ↔ device transfers.
//
// A matrix lives on the GPU as a flat storage buffer in the same packed,
// row-major, interleaved layout as `HostImage`. There is no row padding:
// kernels address bytes directly, so only the *total* size matters.
//
// ALIGNMENT
// ─────────
// wgpu requires buffer sizes, copy sizes and `write_buffer` lengths to be
// multiples of `COPY_BUFFER_ALIGNMENT` (4). Every buffer is therefore
// rounded up to the next 4 bytes (and to at least 4, so a 0×0 matrix still
// has a bindable buffer). The handle remembers the logical length; the
// padding bytes are never observed by callers.
//
// READBACK
// ────────
// Storage buffers cannot be mapped. A readback copies into a
// `MAP_READ | COPY_DST` staging buffer, maps it and polls the device until
// the map callback fires.

use std::sync::Arc;

use log::debug;

use crate::backend::MemoryBudget;
use crate::error::{Error, Result};
use crate::gpu::device::GpuDevice;

const ALIGN: u64 = wgpu::COPY_BUFFER_ALIGNMENT;

/// A matrix buffer resident on the GPU.
///
/// Dropping it returns `len` bytes to the owning device's budget. wgpu keeps
/// the memory itself alive until submitted work using it has finished.
#[derive(Debug)]
pub struct GpuBuffer {
    raw: wgpu::Buffer,
    len: usize,
    budget: Arc<MemoryBudget>,
}

impl GpuBuffer {
    /// Logical length in bytes.
    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// The underlying wgpu buffer, `STORAGE | COPY_SRC | COPY_DST`.
    pub fn raw(&self) -> &wgpu::Buffer {
        &self.raw
    }

    pub(crate) fn is_from(&self, budget: &Arc<MemoryBudget>) -> bool {
        Arc::ptr_eq(&self.budget, budget)
    }
}

impl Drop for GpuBuffer {
    fn drop(&mut self) {
        self.budget.release(self.len);
    }
}

/// Size of the wgpu buffer backing `bytes` logical bytes.
pub(crate) fn padded_size(bytes: usize) -> u64 {
    align_to((bytes as u64).max(ALIGN), ALIGN)
}

/// Round `value` up to the next multiple of `alignment`.
#[inline]
pub(crate) fn align_to(value: u64, alignment: u64) -> u64 {
    value.div_ceil(alignment) * alignment
}

impl GpuDevice {
    /// Allocate a zero-initialised buffer of `bytes` logical bytes.
    pub(crate) fn allocate_buffer(&self, bytes: usize) -> Result<GpuBuffer> {
        let size = padded_size(bytes);
        if size > self.max_buffer_bytes() {
            return Err(Error::Allocation(format!(
                "{bytes} bytes exceeds the device limit of {} bytes",
                self.max_buffer_bytes()
            )));
        }
        self.budget.reserve(bytes)?;

        self.device.push_error_scope(wgpu::ErrorFilter::OutOfMemory);
        self.device.push_error_scope(wgpu::ErrorFilter::Validation);
        // wgpu zero-initialises new buffers.
        let raw = self.device.create_buffer(&wgpu::BufferDescriptor {
            label: Some("DeviceMat"),
            size,
            usage: wgpu::BufferUsages::STORAGE
                | wgpu::BufferUsages::COPY_SRC
                | wgpu::BufferUsages::COPY_DST,
            mapped_at_creation: false,
        });
        let validation = pollster::block_on(self.device.pop_error_scope());
        let oom = pollster::block_on(self.device.pop_error_scope());

        if let Some(e) = validation.or(oom) {
            self.budget.release(bytes);
            return Err(Error::Allocation(format!("{bytes} bytes: {e}")));
        }
        debug!("gpu: allocated {bytes} bytes ({size} padded)");
        Ok(GpuBuffer { raw, len: bytes, budget: Arc::clone(&self.budget) })
    }

    /// Blocking host → device copy into the start of `dst`.
    ///
    /// An unaligned `src` is zero-padded to 4 bytes, overwriting at most
    /// three bytes past `src.len()`.
    pub(crate) fn upload_bytes(&self, dst: &GpuBuffer, src: &[u8]) -> Result<()> {
        if src.len() > dst.len() {
            return Err(Error::Transfer(format!(
                "{} bytes do not fit a {} byte buffer",
                src.len(),
                dst.len()
            )));
        }
        if src.is_empty() {
            return Ok(());
        }

        let aligned = align_to(src.len() as u64, ALIGN) as usize;
        if aligned == src.len() {
            self.queue.write_buffer(&dst.raw, 0, src);
        } else {
            let mut staging = vec![0u8; aligned];
            staging[..src.len()].copy_from_slice(src);
            self.queue.write_buffer(&dst.raw, 0, &staging);
        }
        // write_buffer is staged until the next submit.
        self.queue.submit(std::iter::empty());
        self.device.poll(wgpu::Maintain::Wait);
        Ok(())
    }

    /// Blocking device → host copy of `dst.len()` bytes from the start of
    /// `src`. Waits for all previously submitted work.
    pub(crate) fn readback_bytes(&self, src: &wgpu::Buffer, dst: &mut [u8]) -> Result<()> {
        if dst.len() as u64 > src.size() {
            return Err(Error::Transfer(format!(
                "{} bytes requested from a {} byte buffer",
                dst.len(),
                src.size()
            )));
        }
        if dst.is_empty() {
            return Ok(());
        }

        let size = align_to(dst.len() as u64, ALIGN);
        let staging = self.device.create_buffer(&wgpu::BufferDescriptor {
            label: Some("DeviceMat::readback"),
            size,
            usage: wgpu::BufferUsages::MAP_READ | wgpu::BufferUsages::COPY_DST,
            mapped_at_creation: false,
        });

        let mut encoder = self.device.create_command_encoder(&wgpu::CommandEncoderDescriptor {
            label: Some("DeviceMat::readback"),
        });
        encoder.copy_buffer_to_buffer(src, 0, &staging, 0, size);
        self.queue.submit(std::iter::once(encoder.finish()));

        // Map the buffer — async in wgpu's API, but we block here via
        // device.poll(Wait) after requesting the map.
        let slice = staging.slice(..);
        let (sender, receiver) = std::sync::mpsc::channel();
        slice.map_async(wgpu::MapMode::Read, move |result| {
            // The receiver outlives the poll below; a send failure only
            // means nobody is waiting any more.
            let _ = sender.send(result);
        });
        self.device.poll(wgpu::Maintain::Wait);
        receiver
            .recv()
            .map_err(|_| Error::Transfer("readback map callback never fired".into()))?
            .map_err(|e| Error::Transfer(format!("readback map failed: {e}")))?;

        {
            let mapped = slice.get_mapped_range();
            dst.copy_from_slice(&mapped[..dst.len()]);
        }
        staging.unmap();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_align_to() {
        assert_eq!(align_to(0, 4), 0);
        assert_eq!(align_to(1, 4), 4);
        assert_eq!(align_to(256, 256), 256);
        assert_eq!(align_to(257, 256), 512);
    }

    #[test]
    fn test_padded_size_never_zero() {
        assert_eq!(padded_size(0), 4);
        assert_eq!(padded_size(3), 4);
        assert_eq!(padded_size(5), 8);
        assert_eq!(padded_size(12), 12);
    }
}
