// backend.rs — the device seam behind `DeviceMat`.
//
// A backend owns raw byte buffers and runs the handful of kernels a device
// matrix needs. It knows nothing about handles: shapes arrive already
// validated, and the caller guarantees that no destination aliases a
// source (`DeviceMat` enforces this with `&mut` borrows).
//
// Two backends ship with the crate:
//   - `gpu::GpuDevice`   — wgpu compute kernels.
//   - `host::HostDevice` — CPU reference, the ground truth the GPU kernels
//                          are validated against.
//
// Buffers are taken by shared reference even when written. Both backends
// have interior mutability (wgpu buffers are written through the queue, host
// buffers sit behind a lock), and asynchronous work must be able to keep a
// buffer alive after the call returns.
//
// A buffer carries the budget it was reserved from and returns its bytes
// there when its storage is dropped. On the host that is after the last
// queued kernel holding it has run.

use std::sync::atomic::{AtomicUsize, Ordering};

use log::{debug, warn};

use crate::depth::Depth;
use crate::error::{Error, Result};
use crate::exec::{Exec, Stream};
use crate::types::{MinMaxLoc, Scalar, Shape};

pub trait Backend: Send + Sync + Sized + 'static {
    /// Device-resident storage for one matrix.
    type Buffer: Send + Sync;
    type Stream: Stream;

    /// Human-readable device name, for logs.
    fn name(&self) -> String;

    fn create_stream(&self) -> Self::Stream;

    /// Allocate a zero-initialised buffer of `bytes` bytes.
    fn allocate(&self, bytes: usize) -> Result<Self::Buffer>;

    /// Usable size of `buffer` in bytes.
    fn buffer_len(&self, buffer: &Self::Buffer) -> usize;

    /// `true` when `buffer` was allocated by this device.
    fn owns(&self, buffer: &Self::Buffer) -> bool;

    /// Blocking host → device copy of `src.len()` bytes.
    fn write(&self, dst: &Self::Buffer, src: &[u8]) -> Result<()>;

    /// Blocking device → host copy of `dst.len()` bytes.
    fn read(&self, src: &Self::Buffer, dst: &mut [u8]) -> Result<()>;

    /// Copy the first `bytes` bytes of `src` into `dst`.
    fn copy(
        &self,
        src: &Self::Buffer,
        dst: &Self::Buffer,
        bytes: usize,
        exec: Exec<'_, Self::Stream>,
    ) -> Result<()>;

    /// Scatter each channel of `src` (layout `shape`) into its own plane.
    fn split(
        &self,
        src: &Self::Buffer,
        shape: Shape,
        dsts: &[&Self::Buffer],
        exec: Exec<'_, Self::Stream>,
    ) -> Result<()>;

    /// Interleave one plane per channel into `dst` (layout `shape`).
    fn merge(
        &self,
        srcs: &[&Self::Buffer],
        dst: &Self::Buffer,
        shape: Shape,
        exec: Exec<'_, Self::Stream>,
    ) -> Result<()>;

    /// `dst = a ^ b` over `bytes` bytes.
    fn bitwise_xor(
        &self,
        a: &Self::Buffer,
        b: &Self::Buffer,
        dst: &Self::Buffer,
        bytes: usize,
        exec: Exec<'_, Self::Stream>,
    ) -> Result<()>;

    /// Number of non-zero values in a single-channel buffer. Blocking.
    fn count_non_zero(&self, src: &Self::Buffer, shape: Shape) -> Result<usize>;

    /// Extremes of a non-empty single-channel buffer. Blocking.
    fn min_max_loc(&self, src: &Self::Buffer, shape: Shape) -> Result<MinMaxLoc>;

    /// `dst = saturate(src * alpha + beta)` converted to `depth`.
    #[allow(clippy::too_many_arguments)]
    fn convert(
        &self,
        src: &Self::Buffer,
        shape: Shape,
        dst: &Self::Buffer,
        depth: Depth,
        alpha: f64,
        beta: f64,
        exec: Exec<'_, Self::Stream>,
    ) -> Result<()>;

    /// Write `value` into every pixel whose `mask` byte is non-zero, or
    /// every pixel when `mask` is `None`. The mask is one byte per pixel.
    fn fill(
        &self,
        dst: &Self::Buffer,
        shape: Shape,
        value: &Scalar,
        mask: Option<&Self::Buffer>,
        exec: Exec<'_, Self::Stream>,
    ) -> Result<()>;
}

// ---------------------------------------------------------------------------
// Memory budget
// ---------------------------------------------------------------------------

/// Byte accounting for one device, with an optional ceiling.
///
/// Shared between a device and every buffer it allocates.
#[derive(Debug, Default)]
pub struct MemoryBudget {
    limit: Option<usize>,
    used: AtomicUsize,
}

impl MemoryBudget {
    pub fn new(limit: Option<usize>) -> Self {
        Self { limit, used: AtomicUsize::new(0) }
    }

    pub fn limit(&self) -> Option<usize> {
        self.limit
    }

    /// Bytes currently held by live buffers.
    pub fn used(&self) -> usize {
        self.used.load(Ordering::Acquire)
    }

    /// Claim `bytes`, failing if the ceiling would be exceeded.
    ///
    /// # Errors
    /// `Allocation` when the request does not fit.
    pub fn reserve(&self, bytes: usize) -> Result<()> {
        let mut current = self.used.load(Ordering::Acquire);
        loop {
            let next = current
                .checked_add(bytes)
                .ok_or_else(|| Error::Allocation(format!("{bytes} bytes overflows the byte count")))?;
            if !fits_in_budget(next, self.limit) {
                warn!(
                    "allocation of {bytes} bytes rejected: {current} of {} bytes in use",
                    self.limit.unwrap_or(usize::MAX)
                );
                return Err(Error::Allocation(format!(
                    "{bytes} bytes requested, {} of {} bytes available",
                    self.limit.unwrap_or(usize::MAX).saturating_sub(current),
                    self.limit.unwrap_or(usize::MAX)
                )));
            }
            match self.used.compare_exchange_weak(current, next, Ordering::AcqRel, Ordering::Acquire) {
                Ok(_) => {
                    debug!("reserved {bytes} bytes ({next} in use)");
                    return Ok(());
                }
                Err(actual) => current = actual,
            }
        }
    }

    /// Return `bytes` claimed by `reserve`. Over-release clamps at zero.
    pub fn release(&self, bytes: usize) {
        let before = self
            .used
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |used| Some(used.saturating_sub(bytes)))
            .unwrap_or_else(|used| used);
        if bytes > before {
            warn!("released {bytes} bytes with only {before} in use");
        }
        debug!("released {bytes} bytes ({} in use)", before.saturating_sub(bytes));
    }
}

/// `true` when `required_bytes` fits in `budget` (`None` means unlimited).
pub fn fits_in_budget(required_bytes: usize, budget: Option<usize>) -> bool {
    match budget {
        Some(b) => required_bytes <= b,
        None => true,
    }
}
