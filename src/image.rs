// image.rs — host-side image buffer, the source and target of transfers.
//
// `HostImage` is the host mirror of a device matrix: rows × cols pixels,
// each pixel `channels` interleaved values of one `Depth`.
//
// Memory layout (rows=2, cols=3, channels=2, depth=U16):
//
//   byte offset:  0   2   4   6   8  10 | 12  14  16  18  20  22
//   value:       c0  c1  c0  c1  c0  c1 | c0  c1  c0  c1  c0  c1
//   pixel:       (0,0)   (1,0)   (2,0)  | (0,1)   (1,1)   (2,1)
//
// Rows are packed: no stride padding. The device buffers use the same
// packing, so an upload is one contiguous copy.
//
// STORAGE ALIGNMENT
// ─────────────────
// Bytes are stored in a `Vec<u64>` and exposed as `&[u8]`. A plain
// `Vec<u8>` only guarantees 1-byte alignment, which would make a typed
// view such as `&[f64]` fail `bytemuck`'s alignment check at random.
// Eight-byte words satisfy every `Element` type.

use std::fmt;

use crate::depth::{Depth, Element};
use crate::error::{Error, Result};
use crate::types::{Rect, Scalar, Shape, Size};

/// A dense host image with a runtime depth and channel count.
#[derive(Clone)]
pub struct HostImage {
    words: Vec<u64>,
    shape: Shape,
}

impl HostImage {
    // --- Constructors ---

    /// Zero-initialised image.
    ///
    /// # Errors
    /// `ShapeMismatch` if `channels` is outside `1..=MAX_CHANNELS`.
    pub fn new(rows: usize, cols: usize, channels: usize, depth: Depth) -> Result<Self> {
        Ok(Self::from_shape(Shape::new(rows, cols, channels, depth)?))
    }

    /// Zero-initialised image of a validated shape.
    pub fn from_shape(shape: Shape) -> Self {
        HostImage {
            words: vec![0u64; shape.byte_len().div_ceil(8)],
            shape,
        }
    }

    /// Build from interleaved typed values; the depth comes from `T`.
    ///
    /// # Errors
    /// `ShapeMismatch` if `data.len() != rows * cols * channels`.
    pub fn from_vec<T: Element>(
        rows: usize,
        cols: usize,
        channels: usize,
        data: Vec<T>,
    ) -> Result<Self> {
        let shape = Shape::new(rows, cols, channels, T::DEPTH)?;
        Self::from_bytes(shape, bytemuck::cast_slice(&data))
    }

    /// Build from raw bytes in the layout described by `shape`.
    ///
    /// # Errors
    /// `ShapeMismatch` if `bytes.len() != shape.byte_len()`.
    pub fn from_bytes(shape: Shape, bytes: &[u8]) -> Result<Self> {
        if bytes.len() != shape.byte_len() {
            return Err(Error::shape(format!(
                "{} bytes supplied for a {shape} image of {} bytes",
                bytes.len(),
                shape.byte_len()
            )));
        }
        let mut img = Self::from_shape(shape);
        img.as_bytes_mut().copy_from_slice(bytes);
        Ok(img)
    }

    // --- Accessors ---

    #[inline]
    pub fn shape(&self) -> Shape {
        self.shape
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

    #[inline]
    pub fn size(&self) -> Size {
        self.shape.size()
    }

    /// The packed pixel bytes, `shape().byte_len()` long.
    pub fn as_bytes(&self) -> &[u8] {
        let len = self.shape.byte_len();
        &bytemuck::cast_slice(&self.words)[..len]
    }

    pub fn as_bytes_mut(&mut self) -> &mut [u8] {
        let len = self.shape.byte_len();
        &mut bytemuck::cast_slice_mut(&mut self.words)[..len]
    }

    /// Typed view of all values.
    ///
    /// # Errors
    /// `ShapeMismatch` if `T` does not match the image depth.
    pub fn as_slice<T: Element>(&self) -> Result<&[T]> {
        self.check_depth::<T>()?;
        Ok(bytemuck::cast_slice(self.as_bytes()))
    }

    pub fn as_mut_slice<T: Element>(&mut self) -> Result<&mut [T]> {
        self.check_depth::<T>()?;
        Ok(bytemuck::cast_slice_mut(self.as_bytes_mut()))
    }

    /// Typed value of channel `c` at column `x`, row `y`.
    ///
    /// # Panics
    /// Panics if `T` does not match the depth or the position is out of bounds.
    pub fn get<T: Element>(&self, x: usize, y: usize, c: usize) -> T {
        assert_eq!(T::DEPTH, self.depth(), "typed read of a {} image", self.depth());
        let offset = self.offset(x, y, c);
        bytemuck::pod_read_unaligned(&self.as_bytes()[offset..offset + T::DEPTH.byte_width()])
    }

    /// # Panics
    /// Panics if `T` does not match the depth or the position is out of bounds.
    pub fn set<T: Element>(&mut self, x: usize, y: usize, c: usize, value: T) {
        assert_eq!(T::DEPTH, self.depth(), "typed write to a {} image", self.depth());
        let offset = self.offset(x, y, c);
        self.as_bytes_mut()[offset..offset + T::DEPTH.byte_width()]
            .copy_from_slice(bytemuck::bytes_of(&value));
    }

    /// Value of channel `c` at (`x`, `y`) as f64, whatever the depth.
    pub fn value(&self, x: usize, y: usize, c: usize) -> f64 {
        let offset = self.offset(x, y, c);
        self.depth().read(&self.as_bytes()[offset..])
    }

    /// Saturating write of `value` into channel `c` at (`x`, `y`).
    pub fn set_value(&mut self, x: usize, y: usize, c: usize, value: f64) {
        let offset = self.offset(x, y, c);
        let depth = self.depth();
        depth.write(value, &mut self.as_bytes_mut()[offset..]);
    }

    /// Bytes of one row.
    pub fn row_bytes(&self, y: usize) -> &[u8] {
        assert!(y < self.rows(), "row {y} out of bounds (rows {})", self.rows());
        let row_len = self.cols() * self.shape.elem_size();
        &self.as_bytes()[y * row_len..(y + 1) * row_len]
    }

    // --- Drawing ---

    /// Draw the outline of `rect` with the given per-channel colour.
    ///
    /// The outline is `thickness` pixels wide, drawn inside the rectangle and
    /// clipped to the image. Edges that fall outside the image are skipped.
    pub fn draw_rect(&mut self, rect: Rect, color: Scalar, thickness: usize) {
        let t = thickness.max(1);
        let x1 = (rect.x + rect.width).min(self.cols());
        let y1 = (rect.y + rect.height).min(self.rows());
        if rect.x >= x1 || rect.y >= y1 {
            return;
        }

        let pixel = color.encode(self.depth(), self.channels());
        let elem = self.shape.elem_size();
        let cols = self.cols();
        let bytes = self.as_bytes_mut();
        for y in rect.y..y1 {
            let horizontal = y < rect.y + t || y + t >= rect.y + rect.height;
            for x in rect.x..x1 {
                let vertical = x < rect.x + t || x + t >= rect.x + rect.width;
                if horizontal || vertical {
                    let at = (y * cols + x) * elem;
                    bytes[at..at + elem].copy_from_slice(&pixel);
                }
            }
        }
    }

    // --- Internal helpers ---

    fn check_depth<T: Element>(&self) -> Result<()> {
        if T::DEPTH != self.depth() {
            return Err(Error::shape(format!(
                "{} view requested of a {} image",
                T::DEPTH,
                self.depth()
            )));
        }
        Ok(())
    }

    #[inline]
    fn offset(&self, x: usize, y: usize, c: usize) -> usize {
        assert!(
            x < self.cols() && y < self.rows() && c < self.channels(),
            "value ({x},{y},c{c}) out of bounds for image {}",
            self.shape,
        );
        ((y * self.cols() + x) * self.channels() + c) * self.depth().byte_width()
    }
}

impl PartialEq for HostImage {
    fn eq(&self, other: &Self) -> bool {
        self.shape == other.shape && self.as_bytes() == other.as_bytes()
    }
}

// Debug formatting — shows the top-left corner, useful for small images in tests.
impl fmt::Debug for HostImage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "HostImage {{ {} }}", self.shape)?;
        for y in 0..self.rows().min(8) {
            write!(f, "  row {y}: [")?;
            for x in 0..self.cols().min(8) {
                if x > 0 {
                    write!(f, ", ")?;
                }
                let px: Vec<f64> = (0..self.channels()).map(|c| self.value(x, y, c)).collect();
                if px.len() == 1 {
                    write!(f, "{}", px[0])?;
                } else {
                    write!(f, "{px:?}")?;
                }
            }
            if self.cols() > 8 {
                write!(f, ", ...")?;
            }
            writeln!(f, "]")?;
        }
        write!(f, "}}")
    }
}
