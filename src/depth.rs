// depth.rs — element depth: a closed enumeration resolved at construction.
//
// Every buffer in the crate is an untyped byte array plus a `Depth` tag.
// The tag is looked up in `DEPTH_TABLE` for its byte width and the native
// type code used by the wrapped vision library (CV_8U = 0 … CV_64F = 6).
// There is no runtime type reflection: typed access goes through the
// `Element` trait, whose `DEPTH` constant names the tag for a Rust type.
//
// VALUE CODEC
// ───────────
// Kernels that need the numeric value of an element (conversion, min/max,
// fill) go through `Depth::read` / `Depth::write`. Values travel as f64,
// which represents every depth exactly. Writes saturate the way the wrapped
// library's `saturate_cast` does:
//
//   integer targets: NaN → 0, otherwise round half to even, then clamp
//   float targets:   plain cast (f64 → f32 rounds to nearest)

use std::fmt;

/// Pixel component type of a buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Depth {
    U8,
    I8,
    U16,
    I16,
    I32,
    F32,
    F64,
}

struct DepthInfo {
    width: usize,
    code: i32,
    name: &'static str,
}

// Indexed by `Depth as usize`; order must match the enum declaration.
const DEPTH_TABLE: [DepthInfo; 7] = [
    DepthInfo { width: 1, code: 0, name: "8U" },
    DepthInfo { width: 1, code: 1, name: "8S" },
    DepthInfo { width: 2, code: 2, name: "16U" },
    DepthInfo { width: 2, code: 3, name: "16S" },
    DepthInfo { width: 4, code: 4, name: "32S" },
    DepthInfo { width: 4, code: 5, name: "32F" },
    DepthInfo { width: 8, code: 6, name: "64F" },
];

/// Bits reserved for the depth in a packed type code.
const DEPTH_BITS: i32 = 3;

impl Depth {
    pub const ALL: [Depth; 7] = [
        Depth::U8,
        Depth::I8,
        Depth::U16,
        Depth::I16,
        Depth::I32,
        Depth::F32,
        Depth::F64,
    ];

    #[inline]
    fn info(self) -> &'static DepthInfo {
        &DEPTH_TABLE[self as usize]
    }

    /// Size of one channel value in bytes.
    #[inline]
    pub fn byte_width(self) -> usize {
        self.info().width
    }

    /// Native depth code (CV_8U … CV_64F).
    #[inline]
    pub fn type_code(self) -> i32 {
        self.info().code
    }

    pub fn from_type_code(code: i32) -> Option<Depth> {
        let depth = code & ((1 << DEPTH_BITS) - 1);
        Depth::ALL.iter().copied().find(|d| d.type_code() == depth)
    }

    /// Packed depth + channel code, `CV_MAKETYPE(depth, channels)`.
    pub fn make_type(self, channels: usize) -> i32 {
        self.type_code() + (((channels as i32) - 1) << DEPTH_BITS)
    }

    pub fn is_float(self) -> bool {
        matches!(self, Depth::F32 | Depth::F64)
    }

    /// Representable range for integer depths, `None` for floats.
    pub fn int_range(self) -> Option<(f64, f64)> {
        match self {
            Depth::U8 => Some((u8::MIN as f64, u8::MAX as f64)),
            Depth::I8 => Some((i8::MIN as f64, i8::MAX as f64)),
            Depth::U16 => Some((u16::MIN as f64, u16::MAX as f64)),
            Depth::I16 => Some((i16::MIN as f64, i16::MAX as f64)),
            Depth::I32 => Some((i32::MIN as f64, i32::MAX as f64)),
            Depth::F32 | Depth::F64 => None,
        }
    }

    /// Decode one value from the first `byte_width()` bytes of `bytes`.
    ///
    /// # Panics
    /// Panics if `bytes` is shorter than `byte_width()`.
    #[inline]
    pub fn read(self, bytes: &[u8]) -> f64 {
        match self {
            Depth::U8 => bytes[0] as f64,
            Depth::I8 => bytes[0] as i8 as f64,
            Depth::U16 => u16::from_ne_bytes([bytes[0], bytes[1]]) as f64,
            Depth::I16 => i16::from_ne_bytes([bytes[0], bytes[1]]) as f64,
            Depth::I32 => i32::from_ne_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]) as f64,
            Depth::F32 => f32::from_ne_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]) as f64,
            Depth::F64 => {
                let mut raw = [0u8; 8];
                raw.copy_from_slice(&bytes[..8]);
                f64::from_ne_bytes(raw)
            }
        }
    }

    /// Encode `value` with saturation into the first `byte_width()` bytes.
    ///
    /// # Panics
    /// Panics if `out` is shorter than `byte_width()`.
    #[inline]
    pub fn write(self, value: f64, out: &mut [u8]) {
        let width = self.byte_width();
        match self {
            Depth::U8 => out[0] = saturate(value, self) as u8,
            Depth::I8 => out[0] = saturate(value, self) as i8 as u8,
            Depth::U16 => out[..width].copy_from_slice(&(saturate(value, self) as u16).to_ne_bytes()),
            Depth::I16 => out[..width].copy_from_slice(&(saturate(value, self) as i16).to_ne_bytes()),
            Depth::I32 => out[..width].copy_from_slice(&(saturate(value, self) as i32).to_ne_bytes()),
            Depth::F32 => out[..width].copy_from_slice(&(value as f32).to_ne_bytes()),
            Depth::F64 => out[..width].copy_from_slice(&value.to_ne_bytes()),
        }
    }
}

/// Round half to even and clamp into the depth's integer range.
#[inline]
fn saturate(value: f64, depth: Depth) -> f64 {
    match depth.int_range() {
        Some(_) if value.is_nan() => 0.0,
        Some((lo, hi)) => value.round_ties_even().clamp(lo, hi),
        None => value,
    }
}

impl fmt::Display for Depth {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.info().name)
    }
}

// ---------------------------------------------------------------------------
// Element trait
// ---------------------------------------------------------------------------

/// Rust types that can be stored in a buffer of a given `Depth`.
///
/// `bytemuck::Pod` lets typed slices be viewed as bytes (and back) without
/// unsafe casts.
pub trait Element: bytemuck::Pod + PartialOrd + Send + Sync + 'static {
    const DEPTH: Depth;
}

macro_rules! impl_element {
    ($($t:ty => $d:expr),* $(,)?) => {
        $(impl Element for $t {
            const DEPTH: Depth = $d;
        })*
    };
}

impl_element! {
    u8 => Depth::U8,
    i8 => Depth::I8,
    u16 => Depth::U16,
    i16 => Depth::I16,
    i32 => Depth::I32,
    f32 => Depth::F32,
    f64 => Depth::F64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn table_matches_enum_order() {
        for (i, d) in Depth::ALL.iter().enumerate() {
            assert_eq!(*d as usize, i);
            assert_eq!(d.type_code(), i as i32);
        }
    }

    #[test]
    fn make_type_packs_channels() {
        // CV_8UC3 == 16, CV_32FC1 == 5, CV_16SC4 == 27
        assert_eq!(Depth::U8.make_type(3), 16);
        assert_eq!(Depth::F32.make_type(1), 5);
        assert_eq!(Depth::I16.make_type(4), 27);
        assert_eq!(Depth::from_type_code(16), Some(Depth::U8));
        assert_eq!(Depth::from_type_code(27), Some(Depth::I16));
        assert_eq!(Depth::from_type_code(7), None);
    }

    #[test]
    fn write_saturates_integers() {
        let mut b = [0u8; 8];
        Depth::U8.write(300.0, &mut b);
        assert_eq!(b[0], 255);
        Depth::U8.write(-4.0, &mut b);
        assert_eq!(b[0], 0);
        Depth::I8.write(-200.0, &mut b);
        assert_eq!(b[0] as i8, -128);
        Depth::U16.write(f64::NAN, &mut b);
        assert_eq!(Depth::U16.read(&b), 0.0);
    }

    #[test]
    fn write_rounds_half_to_even() {
        let mut b = [0u8; 8];
        Depth::U8.write(2.5, &mut b);
        assert_eq!(b[0], 2);
        Depth::U8.write(3.5, &mut b);
        assert_eq!(b[0], 4);
        Depth::I32.write(-1.5, &mut b);
        assert_eq!(Depth::I32.read(&b), -2.0);
    }

    #[test]
    fn read_write_every_depth() {
        let mut b = [0u8; 8];
        for d in Depth::ALL {
            d.write(-7.0, &mut b);
            let expected = if matches!(d, Depth::U8 | Depth::U16) { 0.0 } else { -7.0 };
            assert_eq!(d.read(&b), expected, "depth {d}");
        }
    }

    #[test]
    fn element_depths() {
        assert_eq!(<u8 as Element>::DEPTH, Depth::U8);
        assert_eq!(<f64 as Element>::DEPTH, Depth::F64);
        assert_eq!(std::mem::size_of::<i16>(), Depth::I16.byte_width());
    }
}
