// mat.rs — `DeviceMat`, a matrix handle owning one device buffer.
//
// A handle is rows × cols pixels of `channels` interleaved values of one
// `Depth`, resident on a `Backend`. It owns its buffer exclusively: the
// buffer is allocated on construction and freed when the handle is dropped
// (or passed to `release`). Its bytes return to the device budget once no
// queued work still uses it.
//
// Operations take sources by `&` and destinations by `&mut`, so a source
// can never alias a destination and a split cannot write one plane twice.
// Everything that can be enqueued takes an `Exec`; see `crate::exec`.
//
// Validation happens before any device work: an operation that returns
// `ShapeMismatch` has not touched any of its buffers.

use std::fmt;
use std::sync::Arc;

use log::debug;

use crate::backend::Backend;
use crate::depth::Depth;
use crate::error::{Error, Result};
use crate::exec::Exec;
use crate::image::HostImage;
use crate::types::{MinMax, Scalar, Shape, Size};

pub struct DeviceMat<B: Backend> {
    device: Arc<B>,
    buffer: B::Buffer,
    shape: Shape,
}

impl<B: Backend> DeviceMat<B> {
    // -----------------------------------------------------------------------
    // Construction
    // -----------------------------------------------------------------------

    /// Allocate a zero-initialised matrix.
    ///
    /// # Errors
    /// `ShapeMismatch` for a channel count outside `1..=MAX_CHANNELS`,
    /// `Allocation` when the device cannot hold the buffer.
    pub fn new(
        device: &Arc<B>,
        rows: usize,
        cols: usize,
        channels: usize,
        depth: Depth,
    ) -> Result<Self> {
        Self::with_shape(device, Shape::new(rows, cols, channels, depth)?)
    }

    pub fn with_shape(device: &Arc<B>, shape: Shape) -> Result<Self> {
        let buffer = device.allocate(shape.byte_len())?;
        debug!("{}: new {shape} matrix", device.name());
        Ok(Self { device: Arc::clone(device), buffer, shape })
    }

    /// Allocate a matrix shaped like `host` and upload it (blocking).
    pub fn from_host(device: &Arc<B>, host: &HostImage) -> Result<Self> {
        let mut mat = Self::with_shape(device, host.shape())?;
        mat.upload(host)?;
        Ok(mat)
    }

    /// Take ownership of a buffer obtained from `device.allocate`.
    ///
    /// # Errors
    /// `Device` when the buffer belongs to another device, `ShapeMismatch`
    /// when it is smaller than `shape` requires. The buffer is freed either
    /// way, against the budget it was allocated from.
    pub fn from_raw_parts(device: &Arc<B>, buffer: B::Buffer, shape: Shape) -> Result<Self> {
        if !device.owns(&buffer) {
            return Err(Error::device(format!("buffer was not allocated by {}", device.name())));
        }
        let len = device.buffer_len(&buffer);
        if len < shape.byte_len() {
            return Err(Error::shape(format!(
                "{len} byte buffer cannot hold a {shape} matrix ({} bytes)",
                shape.byte_len()
            )));
        }
        Ok(Self { device: Arc::clone(device), buffer, shape })
    }

    /// Free the device buffer now. Equivalent to dropping the handle.
    pub fn release(self) {}

    // -----------------------------------------------------------------------
    // Transfer
    // -----------------------------------------------------------------------

    /// Blocking host → device copy.
    ///
    /// # Errors
    /// `ShapeMismatch` unless `host` has exactly this matrix's shape.
    pub fn upload(&mut self, host: &HostImage) -> Result<()> {
        self.check_host(host)?;
        self.device.write(&self.buffer, host.as_bytes())
    }

    /// Blocking device → host copy. Waits for previously submitted work.
    pub fn download(&self, host: &mut HostImage) -> Result<()> {
        self.check_host(host)?;
        self.device.read(&self.buffer, host.as_bytes_mut())
    }

    /// Download into a newly allocated host image.
    pub fn to_host(&self) -> Result<HostImage> {
        let mut host = HostImage::from_shape(self.shape);
        self.download(&mut host)?;
        Ok(host)
    }

    // -----------------------------------------------------------------------
    // Shape queries
    // -----------------------------------------------------------------------

    #[inline]
    pub fn shape(&self) -> Shape {
        self.shape
    }

    #[inline]
    pub fn size(&self) -> Size {
        self.shape.size()
    }

    #[inline]
    pub fn rows(&self) -> usize {
        self.shape.rows()
    }

    #[inline]
    pub fn cols(&self) -> usize {
        self.shape.cols()
    }

    #[inline]
    pub fn channels(&self) -> usize {
        self.shape.channels()
    }

    #[inline]
    pub fn depth(&self) -> Depth {
        self.shape.depth()
    }

    pub fn type_code(&self) -> i32 {
        self.shape.type_code()
    }

    pub fn device(&self) -> &Arc<B> {
        &self.device
    }

    /// The backend buffer. Bytes beyond `shape().byte_len()` are unspecified.
    pub fn buffer(&self) -> &B::Buffer {
        &self.buffer
    }

    // -----------------------------------------------------------------------
    // Channel decomposition
    // -----------------------------------------------------------------------

    /// Copy into `dst`, which must have the same shape.
    pub fn copy_to(&self, dst: &mut Self, exec: Exec<'_, B::Stream>) -> Result<()> {
        self.check_device(dst)?;
        if dst.shape != self.shape {
            return Err(Error::shape(format!(
                "copy of {} into {}",
                self.shape, dst.shape
            )));
        }
        self.device.copy(&self.buffer, &dst.buffer, self.shape.byte_len(), exec)
    }

    /// Write channel `c` into `dsts[c]`.
    ///
    /// Every destination must be a single-channel matrix of this size and
    /// depth, one per channel. A single-channel matrix is copied.
    pub fn split_into(&self, dsts: &mut [&mut Self], exec: Exec<'_, B::Stream>) -> Result<()> {
        {
            let planes: Vec<&Self> = dsts.iter().map(|d| &**d).collect();
            self.check_planes(&planes, "split")?;
        }

        if let [only] = &mut *dsts {
            return self.copy_to(only, exec);
        }
        let buffers: Vec<&B::Buffer> = dsts.iter().map(|d| &d.buffer).collect();
        self.device.split(&self.buffer, self.shape, &buffers, exec)
    }

    /// Split into newly allocated single-channel matrices.
    pub fn split(&self, exec: Exec<'_, B::Stream>) -> Result<Vec<Self>> {
        let mut planes = (0..self.channels())
            .map(|_| Self::with_shape(&self.device, self.shape.plane()))
            .collect::<Result<Vec<_>>>()?;
        {
            let mut refs: Vec<&mut Self> = planes.iter_mut().collect();
            self.split_into(&mut refs, exec)?;
        }
        Ok(planes)
    }

    /// Interleave `srcs[c]` into channel `c` of this matrix. The inverse of
    /// `split_into`, with the same requirements on the planes.
    pub fn merge_from(&mut self, srcs: &[&Self], exec: Exec<'_, B::Stream>) -> Result<()> {
        self.check_planes(srcs, "merge")?;

        if let [only] = srcs {
            return only.copy_to(self, exec);
        }
        let buffers: Vec<&B::Buffer> = srcs.iter().map(|s| &s.buffer).collect();
        self.device.merge(&buffers, &self.buffer, self.shape, exec)
    }

    // -----------------------------------------------------------------------
    // Reductions
    // -----------------------------------------------------------------------

    /// Per-channel minimum and maximum with their first locations in
    /// row-major order. Blocking.
    ///
    /// # Errors
    /// `ShapeMismatch` for an empty matrix.
    pub fn min_max(&self) -> Result<MinMax> {
        if self.shape.is_empty() {
            return Err(Error::shape(format!("min/max of an empty {} matrix", self.shape)));
        }
        if self.channels() == 1 {
            let loc = self.device.min_max_loc(&self.buffer, self.shape)?;
            return Ok(std::iter::once(loc).collect());
        }

        // Temporaries are released when `planes` drops, on every path.
        let planes = self.split(Exec::Sync)?;
        planes
            .iter()
            .map(|p| self.device.min_max_loc(&p.buffer, p.shape))
            .collect()
    }

    /// Number of non-zero values of a single-channel matrix. Blocking.
    pub fn count_non_zero(&self) -> Result<usize> {
        if self.channels() != 1 {
            return Err(Error::shape(format!(
                "count_non_zero needs one channel, not {}",
                self.channels()
            )));
        }
        self.device.count_non_zero(&self.buffer, self.shape)
    }

    /// `dst = self ^ other`, bit by bit. All three share one shape.
    pub fn bitwise_xor(&self, other: &Self, dst: &mut Self, exec: Exec<'_, B::Stream>) -> Result<()> {
        self.check_device(other)?;
        self.check_device(dst)?;
        if other.shape != self.shape || dst.shape != self.shape {
            return Err(Error::shape(format!(
                "xor of {} and {} into {}",
                self.shape, other.shape, dst.shape
            )));
        }
        self.device
            .bitwise_xor(&self.buffer, &other.buffer, &dst.buffer, self.shape.byte_len(), exec)
    }

    /// `true` when both matrices have the same size, channel count and
    /// depth and identical bytes. Blocking.
    pub fn equals(&self, other: &Self) -> Result<bool> {
        self.check_device(other)?;
        if self.shape != other.shape {
            return Ok(false);
        }
        if self.shape.is_empty() {
            return Ok(true);
        }

        let mut diff = Self::with_shape(&self.device, self.shape)?;
        self.bitwise_xor(other, &mut diff, Exec::Sync)?;
        // Flattened to single-channel bytes: a differing sign bit of -0.0
        // must count, which a per-value float test would miss.
        let bytes = Shape::new(1, self.shape.byte_len(), 1, Depth::U8)?;
        let differing = self.device.count_non_zero(&diff.buffer, bytes)?;
        Ok(differing == 0)
    }

    // -----------------------------------------------------------------------
    // Conversion, reshape, fill
    // -----------------------------------------------------------------------

    /// New matrix of `depth` with the same size and channels, values
    /// converted with saturation.
    pub fn convert_to(&self, depth: Depth, exec: Exec<'_, B::Stream>) -> Result<Self> {
        self.convert_to_scaled(depth, 1.0, 0.0, exec)
    }

    /// As `convert_to`, computing `saturate(value * alpha + beta)`.
    pub fn convert_to_scaled(
        &self,
        depth: Depth,
        alpha: f64,
        beta: f64,
        exec: Exec<'_, B::Stream>,
    ) -> Result<Self> {
        let dst = Self::with_shape(&self.device, self.shape.with_depth(depth)?)?;
        self.device
            .convert(&self.buffer, self.shape, &dst.buffer, depth, alpha, beta, exec)?;
        Ok(dst)
    }

    /// The same buffer reinterpreted with `channels` channels and `rows`
    /// rows (`0` keeps the current value). Nothing is copied.
    ///
    /// # Errors
    /// `ShapeMismatch` when the values cannot be laid out that way. The
    /// handle is consumed either way; check `shape().reshape(..)` first to
    /// keep it on failure.
    pub fn reshape(mut self, channels: usize, rows: usize) -> Result<Self> {
        self.shape = self.shape.reshape(channels, rows)?;
        Ok(self)
    }

    /// Write `value` into every pixel, or every pixel whose `mask` value is
    /// non-zero. The mask is a single-channel `U8` matrix of the same size.
    pub fn set_to(
        &mut self,
        value: impl Into<Scalar>,
        mask: Option<&Self>,
        exec: Exec<'_, B::Stream>,
    ) -> Result<()> {
        if let Some(m) = mask {
            self.check_device(m)?;
            if m.size() != self.size() || m.channels() != 1 || m.depth() != Depth::U8 {
                return Err(Error::shape(format!(
                    "mask must be {}x{} 8UC1, got {}",
                    self.rows(),
                    self.cols(),
                    m.shape
                )));
            }
        }
        self.device.fill(
            &self.buffer,
            self.shape,
            &value.into(),
            mask.map(|m| &m.buffer),
            exec,
        )
    }

    // -----------------------------------------------------------------------
    // Validation
    // -----------------------------------------------------------------------

    fn check_device(&self, other: &Self) -> Result<()> {
        if Arc::ptr_eq(&self.device, &other.device) {
            Ok(())
        } else {
            Err(Error::device("matrices belong to different devices"))
        }
    }

    fn check_host(&self, host: &HostImage) -> Result<()> {
        if host.shape() != self.shape {
            return Err(Error::shape(format!(
                "host image {} does not match device matrix {}",
                host.shape(),
                self.shape
            )));
        }
        Ok(())
    }

    /// One single-channel plane per channel, each of this size and depth.
    fn check_planes(&self, planes: &[&Self], op: &str) -> Result<()> {
        if planes.len() != self.channels() {
            return Err(Error::shape(format!(
                "{op} of {} needs {} planes, got {}",
                self.shape,
                self.channels(),
                planes.len()
            )));
        }
        let want = self.shape.plane();
        for (c, plane) in planes.iter().enumerate() {
            self.check_device(plane)?;
            if plane.shape != want {
                return Err(Error::shape(format!(
                    "{op} plane {c} is {}, expected {want}",
                    plane.shape
                )));
            }
        }
        Ok(())
    }
}

impl<B: Backend> fmt::Debug for DeviceMat<B> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DeviceMat")
            .field("device", &self.device.name())
            .field("shape", &self.shape)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::host::HostDevice;

    fn host() -> Arc<HostDevice> {
        Arc::new(HostDevice::new())
    }

    #[test]
    fn test_drop_releases_exactly_once() {
        let dev = host();
        let a = DeviceMat::new(&dev, 2, 3, 2, Depth::U16).unwrap();
        assert_eq!(dev.budget().used(), 24);
        let b = DeviceMat::new(&dev, 1, 1, 1, Depth::F64).unwrap();
        a.release();
        assert_eq!(dev.budget().used(), 8);
        drop(b);
        assert_eq!(dev.budget().used(), 0);
    }

    #[test]
    fn test_from_raw_parts_checks_size() {
        let dev = host();
        let small = dev.allocate(3).unwrap();
        let shape = Shape::new(2, 2, 1, Depth::U8).unwrap();
        let err = DeviceMat::from_raw_parts(&dev, small, shape).unwrap_err();
        assert!(matches!(err, Error::ShapeMismatch(_)));
        assert_eq!(dev.budget().used(), 0);

        let ok = dev.allocate(4).unwrap();
        let mat = DeviceMat::from_raw_parts(&dev, ok, shape).unwrap();
        assert_eq!(mat.shape(), shape);
    }

    #[test]
    fn test_from_raw_parts_rejects_foreign_buffer() {
        let (d1, d2) = (host(), host());
        let foreign = d2.allocate(4).unwrap();
        let shape = Shape::new(2, 2, 1, Depth::U8).unwrap();
        let err = DeviceMat::from_raw_parts(&d1, foreign, shape).unwrap_err();
        assert!(matches!(err, Error::Device(_)));
        assert_eq!(d1.budget().used(), 0);
        assert_eq!(d2.budget().used(), 0);

        let kept = DeviceMat::new(&d1, 1, 2, 1, Depth::U8).unwrap();
        let foreign = d2.allocate(2).unwrap();
        assert!(DeviceMat::from_raw_parts(&d1, foreign, kept.shape()).is_err());
        assert_eq!(d1.budget().used(), 2);
    }

    #[test]
    fn test_cross_device_rejected() {
        let (d1, d2) = (host(), host());
        let a = DeviceMat::new(&d1, 1, 1, 1, Depth::U8).unwrap();
        let mut b = DeviceMat::new(&d2, 1, 1, 1, Depth::U8).unwrap();
        assert!(matches!(a.copy_to(&mut b, Exec::Sync), Err(Error::Device(_))));
        assert!(matches!(a.equals(&b), Err(Error::Device(_))));
    }

    #[test]
    fn test_reshape_keeps_buffer() {
        let dev = host();
        let m = DeviceMat::new(&dev, 2, 3, 1, Depth::U8).unwrap();
        assert!(m.shape().reshape(4, 0).is_err());
        let m = m.reshape(3, 0).unwrap();
        assert_eq!((m.rows(), m.cols(), m.channels()), (2, 1, 3));
        // No second allocation.
        assert_eq!(dev.budget().used(), 6);
    }

    #[test]
    fn test_failed_reshape_releases_handle() {
        let dev = host();
        let m = DeviceMat::new(&dev, 2, 3, 1, Depth::U8).unwrap();
        assert!(matches!(m.reshape(4, 0), Err(Error::ShapeMismatch(_))));
        assert_eq!(dev.budget().used(), 0);
    }

    #[test]
    fn test_equals_sees_negative_zero() {
        let dev = host();
        let a = HostImage::from_vec(1, 2, 1, vec![0.0f32, 1.0]).unwrap();
        let b = HostImage::from_vec(1, 2, 1, vec![-0.0f32, 1.0]).unwrap();
        let a = DeviceMat::from_host(&dev, &a).unwrap();
        let b = DeviceMat::from_host(&dev, &b).unwrap();
        assert!(!a.equals(&b).unwrap());
        assert!(a.equals(&a).unwrap());
    }
}
