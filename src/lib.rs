// devmat: device-resident image matrices with a CPU reference backend.
//
// A `DeviceMat` owns one buffer on a `Backend` (wgpu GPU or host CPU) and
// offers the handful of operations a detection pipeline needs between
// stages: transfer, split/merge, min/max, equality, depth conversion,
// reshape and masked fill, each synchronous or queued on a stream.

pub mod backend;
pub mod config;
pub mod depth;
pub mod error;
pub mod exec;
pub mod gpu;
pub mod host;
pub mod image;
pub mod mat;
pub mod types;

pub use backend::{Backend, MemoryBudget};
pub use config::{load_config, open_device, BackendPreference, Device, DeviceConfig};
pub use depth::{Depth, Element};
pub use error::{Error, Result};
pub use exec::{Exec, Stream};
pub use gpu::{acceleration_available, DeviceProfile, GpuDevice};
pub use host::HostDevice;
pub use image::HostImage;
pub use mat::DeviceMat;
pub use types::{MinMax, MinMaxLoc, Point, Rect, Scalar, Shape, Size, MAX_CHANNELS};

/// A matrix on the wgpu device.
pub type GpuMat = DeviceMat<GpuDevice>;
/// A matrix on the host reference device.
pub type HostMat = DeviceMat<HostDevice>;
