// types.rs — small value types shared by host and device buffers.

use std::fmt;

use crate::depth::Depth;
use crate::error::{Error, Result};

/// Largest channel count a buffer may carry.
///
/// Matches the device module of the wrapped library: split/merge and scalar
/// fill are defined for at most four channels.
pub const MAX_CHANNELS: usize = 4;

/// Image size: `width` is the column count, `height` the row count.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct Size {
    pub width: usize,
    pub height: usize,
}

impl Size {
    pub fn new(width: usize, height: usize) -> Self {
        Self { width, height }
    }

    pub fn area(&self) -> usize {
        self.width * self.height
    }
}

impl fmt::Display for Size {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}×{}", self.width, self.height)
    }
}

/// Pixel position: `x` is the column, `y` the row.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct Point {
    pub x: usize,
    pub y: usize,
}

impl Point {
    pub fn new(x: usize, y: usize) -> Self {
        Self { x, y }
    }

    /// Position of the `index`-th element of a row-major buffer.
    pub(crate) fn from_linear(index: usize, cols: usize) -> Self {
        Self { x: index % cols, y: index / cols }
    }
}

/// Axis-aligned rectangle in image pixel coordinates.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct Rect {
    pub x: usize,
    pub y: usize,
    pub width: usize,
    pub height: usize,
}

impl Rect {
    pub fn new(x: usize, y: usize, width: usize, height: usize) -> Self {
        Self { x, y, width, height }
    }

    /// A `size`×`size` square centred on `p`, clipped at the origin.
    pub fn around(p: Point, size: usize) -> Self {
        let half = size / 2;
        Self {
            x: p.x.saturating_sub(half),
            y: p.y.saturating_sub(half),
            width: size,
            height: size,
        }
    }
}

/// Per-channel value, as used for fills. Channels beyond the buffer's
/// channel count are ignored.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct Scalar(pub [f64; 4]);

impl Scalar {
    /// The same value in every channel.
    pub fn all(v: f64) -> Self {
        Self([v; 4])
    }

    /// Encode one pixel (`channels` values of `depth`), saturating.
    pub(crate) fn encode(&self, depth: Depth, channels: usize) -> Vec<u8> {
        let width = depth.byte_width();
        let mut out = vec![0u8; width * channels];
        for (c, chunk) in out.chunks_exact_mut(width).enumerate() {
            depth.write(self.0[c], chunk);
        }
        out
    }
}

impl From<f64> for Scalar {
    fn from(v: f64) -> Self {
        Self::all(v)
    }
}

// ---------------------------------------------------------------------------
// Shape
// ---------------------------------------------------------------------------

/// Validated layout of a dense, row-major, channel-interleaved buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Shape {
    rows: usize,
    cols: usize,
    channels: usize,
    depth: Depth,
}

impl Shape {
    /// # Errors
    /// `ShapeMismatch` if `channels` is outside `1..=MAX_CHANNELS`,
    /// `Allocation` if the buffer would exceed `isize::MAX` bytes.
    pub fn new(rows: usize, cols: usize, channels: usize, depth: Depth) -> Result<Self> {
        if channels == 0 || channels > MAX_CHANNELS {
            return Err(Error::shape(format!(
                "channel count {channels} outside 1..={MAX_CHANNELS}"
            )));
        }
        // Every other size computation on a `Shape` is bounded by this one.
        let bytes = rows
            .checked_mul(cols)
            .and_then(|n| n.checked_mul(channels * depth.byte_width()))
            .filter(|&b| b <= isize::MAX as usize);
        if bytes.is_none() {
            return Err(Error::Allocation(format!(
                "{rows}x{cols} {depth}C{channels} exceeds the addressable size"
            )));
        }
        Ok(Self { rows, cols, channels, depth })
    }

    #[inline]
    pub fn rows(&self) -> usize {
        self.rows
    }

    #[inline]
    pub fn cols(&self) -> usize {
        self.cols
    }

    #[inline]
    pub fn channels(&self) -> usize {
        self.channels
    }

    #[inline]
    pub fn depth(&self) -> Depth {
        self.depth
    }

    #[inline]
    pub fn size(&self) -> Size {
        Size::new(self.cols, self.rows)
    }

    /// Number of pixels (`rows * cols`).
    #[inline]
    pub fn total(&self) -> usize {
        self.rows * self.cols
    }

    /// Bytes per pixel (all channels).
    #[inline]
    pub fn elem_size(&self) -> usize {
        self.channels * self.depth.byte_width()
    }

    #[inline]
    pub fn byte_len(&self) -> usize {
        self.total() * self.elem_size()
    }

    pub fn is_empty(&self) -> bool {
        self.total() == 0
    }

    /// Packed native type code (depth + channels).
    pub fn type_code(&self) -> i32 {
        self.depth.make_type(self.channels)
    }

    /// The single-channel shape of one plane of this buffer.
    pub fn plane(&self) -> Shape {
        Shape { channels: 1, ..*self }
    }

    /// Same size and channel count, different depth.
    ///
    /// # Errors
    /// `Allocation` when the wider depth overflows the addressable size.
    pub fn with_depth(&self, depth: Depth) -> Result<Shape> {
        Shape::new(self.rows, self.cols, self.channels, depth)
    }

    /// Compute the layout after reinterpreting the same bytes with
    /// `new_channels` channels and `new_rows` rows.
    ///
    /// `0` keeps the current value. With `new_rows == 0` the row count only
    /// stays fixed and the column count absorbs the channel change; with
    /// `new_rows > 0` the element total is redistributed across the rows.
    ///
    /// # Errors
    /// `ShapeMismatch` when the element count cannot be split that way.
    pub fn reshape(&self, new_channels: usize, new_rows: usize) -> Result<Shape> {
        let cn = if new_channels == 0 { self.channels } else { new_channels };
        let row_width = self.cols * self.channels;
        let (rows, cols) = if new_rows > 0 {
            let total = row_width * self.rows;
            if total % new_rows != 0 {
                return Err(Error::shape(format!(
                    "cannot spread {total} values over {new_rows} rows"
                )));
            }
            let width = total / new_rows;
            if width % cn != 0 {
                return Err(Error::shape(format!(
                    "row width {width} is not a multiple of {cn} channels"
                )));
            }
            (new_rows, width / cn)
        } else if cn != self.channels {
            if row_width % cn != 0 {
                return Err(Error::shape(format!(
                    "row width {row_width} is not a multiple of {cn} channels"
                )));
            }
            (self.rows, row_width / cn)
        } else {
            (self.rows, self.cols)
        };
        Shape::new(rows, cols, cn, self.depth)
    }
}

impl fmt::Display for Shape {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}x{} {}C{}", self.rows, self.cols, self.depth, self.channels)
    }
}

// ---------------------------------------------------------------------------
// Reduction results
// ---------------------------------------------------------------------------

/// Extremes of one channel. Locations are the first occurrence in row-major
/// order.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct MinMaxLoc {
    pub min: f64,
    pub max: f64,
    pub min_loc: Point,
    pub max_loc: Point,
}

/// Per-channel extremes, one entry per channel in each vector.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct MinMax {
    pub min_values: Vec<f64>,
    pub max_values: Vec<f64>,
    pub min_locations: Vec<Point>,
    pub max_locations: Vec<Point>,
}

impl FromIterator<MinMaxLoc> for MinMax {
    fn from_iter<I: IntoIterator<Item = MinMaxLoc>>(iter: I) -> Self {
        let mut out = MinMax::default();
        for m in iter {
            out.min_values.push(m.min);
            out.max_values.push(m.max);
            out.min_locations.push(m.min_loc);
            out.max_locations.push(m.max_loc);
        }
        out
    }
}
