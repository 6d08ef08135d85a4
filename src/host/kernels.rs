// host/kernels.rs — CPU reference kernels over packed byte buffers.
//
// These are the authoritative implementations: every GPU kernel is checked
// against them value-for-value. They work on raw bytes plus a `Shape`, the
// same inputs the WGSL kernels receive, so the two stay comparable.
//
// All functions assume validated inputs (slices at least as long as the
// shape requires); they index and panic otherwise.

use std::cmp::Ordering;

use crate::depth::Depth;
use crate::types::{MinMaxLoc, Point, Shape};

/// Copy channel `channel` of the interleaved `src` into the plane `dst`.
pub fn split_plane(src: &[u8], shape: Shape, channel: usize, dst: &mut [u8]) {
    let width = shape.depth().byte_width();
    let elem = shape.elem_size();
    let plane = &mut dst[..shape.total() * width];
    for (i, out) in plane.chunks_exact_mut(width).enumerate() {
        let at = i * elem + channel * width;
        out.copy_from_slice(&src[at..at + width]);
    }
}

/// Copy the plane `src` into channel `channel` of the interleaved `dst`.
pub fn merge_plane(src: &[u8], shape: Shape, channel: usize, dst: &mut [u8]) {
    let width = shape.depth().byte_width();
    let elem = shape.elem_size();
    let plane = &src[..shape.total() * width];
    for (i, value) in plane.chunks_exact(width).enumerate() {
        let at = i * elem + channel * width;
        dst[at..at + width].copy_from_slice(value);
    }
}

pub fn xor(a: &[u8], b: &[u8], dst: &mut [u8]) {
    for ((d, &x), &y) in dst.iter_mut().zip(a).zip(b) {
        *d = x ^ y;
    }
}

/// Values of `depth` in `src[..count * width]` that compare unequal to zero.
/// Float `-0.0` counts as zero and NaN as non-zero.
pub fn count_non_zero(src: &[u8], depth: Depth, count: usize) -> usize {
    let width = depth.byte_width();
    src[..count * width]
        .chunks_exact(width)
        .filter(|v| depth.read(v) != 0.0)
        .count()
}

/// Extremes of a single-channel buffer, or `None` when it is empty.
///
/// Values are ordered with IEEE total order, so `-0.0 < 0.0` and NaNs sort
/// past the infinities by sign. Ties keep the first position.
pub fn min_max_loc(src: &[u8], shape: Shape) -> Option<MinMaxLoc> {
    let depth = shape.depth();
    let width = depth.byte_width();
    let mut values = src[..shape.total() * width].chunks_exact(width).map(|v| depth.read(v));

    let first = values.next()?;
    let (mut min, mut max) = (first, first);
    let (mut min_i, mut max_i) = (0usize, 0usize);
    for (i, v) in values.enumerate().map(|(i, v)| (i + 1, v)) {
        if v.total_cmp(&min) == Ordering::Less {
            min = v;
            min_i = i;
        }
        if v.total_cmp(&max) == Ordering::Greater {
            max = v;
            max_i = i;
        }
    }

    let cols = shape.cols();
    Some(MinMaxLoc {
        min,
        max,
        min_loc: Point::from_linear(min_i, cols),
        max_loc: Point::from_linear(max_i, cols),
    })
}

/// `dst = saturate(src * alpha + beta)` for `count` values.
pub fn convert(
    src: &[u8],
    src_depth: Depth,
    dst: &mut [u8],
    dst_depth: Depth,
    count: usize,
    alpha: f64,
    beta: f64,
) {
    let (sw, dw) = (src_depth.byte_width(), dst_depth.byte_width());
    let identity = alpha == 1.0 && beta == 0.0;
    for (s, d) in src[..count * sw]
        .chunks_exact(sw)
        .zip(dst[..count * dw].chunks_exact_mut(dw))
    {
        let v = src_depth.read(s);
        dst_depth.write(if identity { v } else { v * alpha + beta }, d);
    }
}

/// Write the encoded `pixel` into every pixel of `dst` selected by `mask`.
pub fn fill(dst: &mut [u8], shape: Shape, pixel: &[u8], mask: Option<&[u8]>) {
    let elem = shape.elem_size();
    let pixels = dst[..shape.byte_len()].chunks_exact_mut(elem);
    match mask {
        None => pixels.for_each(|px| px.copy_from_slice(pixel)),
        Some(mask) => {
            for (px, _) in pixels.zip(mask).filter(|&(_, &m)| m != 0) {
                px.copy_from_slice(pixel);
            }
        }
    }
}
