// gpu/mod.rs — GPU acceleration layer.
//
// wgpu-based implementation of the `Backend` seam. The host backend in
// `crate::host` remains the authoritative reference — every GPU kernel is
// validated against it value-for-value.
//
// Layout:
//   device   — adapter selection, profiles, limits, workgroup sizing
//   buffer   — storage buffers and blocking host ↔ device transfers
//   stream   — asynchronous submission bookmarks on the device queue
//   kernels  — WGSL compute pipelines and their uniform parameter blocks
//   backend  — `impl Backend for GpuDevice`, wiring the above together

pub mod buffer;
pub mod device;
pub mod stream;

mod backend;
mod kernels;

pub use buffer::GpuBuffer;
pub use device::{acceleration_available, AdapterInfo, DeviceProfile, Dispatch, GpuDevice, WorkgroupSize};
pub use stream::GpuStream;
