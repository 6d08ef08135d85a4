// gpu/backend.rs — `Backend` implementation for `GpuDevice`.
//
// Every enqueueable operation follows the same shape:
//
//   1. check that an async stream belongs to this device;
//   2. open a validation error scope;
//   3. record one command encoder (copy or compute passes);
//   4. submit: Exec::Sync waits for the device, Exec::Async hands the
//      command buffer to the stream and returns;
//   5. close the scope — any validation failure becomes `Error::Device`.
//
// Reductions (count_non_zero, min_max_loc) are always blocking: they end in
// a readback of a few bytes.
//
// 64-bit floats are stored, copied, split, merged, compared and filled like
// any other depth (those kernels only move bytes), but WGSL has no f64, so
// `convert` and `min_max_loc` report `Error::Unsupported` for `F64`.

use std::sync::Arc;

use log::debug;

use crate::backend::Backend;
use crate::depth::Depth;
use crate::error::{Error, Result};
use crate::exec::Exec;
use crate::gpu::buffer::{align_to, GpuBuffer};
use crate::gpu::device::GpuDevice;
use crate::gpu::kernels::{
    ConvertParams, CountParams, FillParams, MergeParams, MinMaxParams, SplitParams, XorParams,
};
use crate::gpu::stream::GpuStream;
use crate::types::{MinMaxLoc, Point, Scalar, Shape, MAX_CHANNELS};

fn as_u32(n: usize, what: &str) -> Result<u32> {
    u32::try_from(n).map_err(|_| Error::device(format!("{what} of {n} exceeds kernel indexing range")))
}

/// Words needed to cover `bytes` bytes.
fn words(bytes: usize) -> usize {
    bytes.div_ceil(4)
}

impl GpuDevice {
    fn check_stream(&self, exec: Exec<'_, GpuStream>) -> Result<()> {
        match exec {
            Exec::Async(stream) if !stream.belongs_to(&self.device) => {
                Err(Error::device("stream belongs to a different device"))
            }
            _ => Ok(()),
        }
    }

    /// Run `f` inside a validation error scope.
    fn scoped<T>(&self, op: &str, f: impl FnOnce() -> Result<T>) -> Result<T> {
        self.device.push_error_scope(wgpu::ErrorFilter::Validation);
        let out = f();
        match pollster::block_on(self.device.pop_error_scope()) {
            Some(e) => Err(Error::device(format!("{op}: {e}"))),
            None => out,
        }
    }

    fn encoder(&self, label: &str) -> wgpu::CommandEncoder {
        self.device
            .create_command_encoder(&wgpu::CommandEncoderDescriptor { label: Some(label) })
    }

    fn finish(&self, encoder: wgpu::CommandEncoder, exec: Exec<'_, GpuStream>) {
        match exec {
            Exec::Sync => {
                self.queue.submit(std::iter::once(encoder.finish()));
                self.device.poll(wgpu::Maintain::Wait);
            }
            Exec::Async(stream) => stream.submit(encoder.finish()),
        }
    }

    /// Record one encoder with `record` and submit it according to `exec`.
    fn run_kernel(
        &self,
        op: &'static str,
        exec: Exec<'_, GpuStream>,
        record: impl FnOnce(&mut wgpu::CommandEncoder) -> Result<()>,
    ) -> Result<()> {
        self.check_stream(exec)?;
        self.scoped(op, || {
            let mut encoder = self.encoder(op);
            record(&mut encoder)?;
            self.finish(encoder, exec);
            debug!("gpu: {op} submitted ({})", if exec.is_async() { "async" } else { "sync" });
            Ok(())
        })
    }
}

impl Backend for GpuDevice {
    type Buffer = GpuBuffer;
    type Stream = GpuStream;

    fn name(&self) -> String {
        self.adapter_info.to_string()
    }

    fn create_stream(&self) -> GpuStream {
        GpuStream::new(Arc::clone(&self.device), Arc::clone(&self.queue))
    }

    fn allocate(&self, bytes: usize) -> Result<GpuBuffer> {
        self.allocate_buffer(bytes)
    }

    fn buffer_len(&self, buffer: &GpuBuffer) -> usize {
        buffer.len()
    }

    fn owns(&self, buffer: &GpuBuffer) -> bool {
        buffer.is_from(&self.budget)
    }

    fn write(&self, dst: &GpuBuffer, src: &[u8]) -> Result<()> {
        self.upload_bytes(dst, src)
    }

    fn read(&self, src: &GpuBuffer, dst: &mut [u8]) -> Result<()> {
        if dst.len() > src.len() {
            return Err(Error::Transfer(format!(
                "{} bytes requested from a {} byte buffer",
                dst.len(),
                src.len()
            )));
        }
        self.readback_bytes(src.raw(), dst)
    }

    fn copy(
        &self,
        src: &GpuBuffer,
        dst: &GpuBuffer,
        bytes: usize,
        exec: Exec<'_, GpuStream>,
    ) -> Result<()> {
        let size = align_to(bytes as u64, wgpu::COPY_BUFFER_ALIGNMENT);
        self.run_kernel("copy", exec, |encoder| {
            if size > 0 {
                encoder.copy_buffer_to_buffer(src.raw(), 0, dst.raw(), 0, size);
            }
            Ok(())
        })
    }

    fn split(
        &self,
        src: &GpuBuffer,
        shape: Shape,
        dsts: &[&GpuBuffer],
        exec: Exec<'_, GpuStream>,
    ) -> Result<()> {
        let width = shape.depth().byte_width();
        let plane_bytes = shape.total() * width;
        let dispatch = self.dispatch_linear(as_u32(words(plane_bytes), "split words")?);
        let kernels = self.kernels();

        self.run_kernel("split", exec, |encoder| {
            for (c, dst) in dsts.iter().enumerate() {
                let params = SplitParams {
                    plane_bytes: as_u32(plane_bytes, "plane bytes")?,
                    elem_bytes: as_u32(shape.elem_size(), "element size")?,
                    width: width as u32,
                    channel: c as u32,
                    row_pitch: dispatch.row_pitch,
                    _pad: [0; 3],
                };
                kernels.split.encode(
                    &self.device,
                    encoder,
                    &[src.raw(), dst.raw()],
                    bytemuck::bytes_of(&params),
                    dispatch,
                );
            }
            Ok(())
        })
    }

    fn merge(
        &self,
        srcs: &[&GpuBuffer],
        dst: &GpuBuffer,
        shape: Shape,
        exec: Exec<'_, GpuStream>,
    ) -> Result<()> {
        let kernels = self.kernels();
        let mut planes = [&kernels.dummy; MAX_CHANNELS];
        for (slot, src) in planes.iter_mut().zip(srcs) {
            *slot = src.raw();
        }
        let total_bytes = shape.byte_len();
        let dispatch = self.dispatch_linear(as_u32(words(total_bytes), "merge words")?);
        let params = MergeParams {
            total_bytes: as_u32(total_bytes, "merge bytes")?,
            elem_bytes: as_u32(shape.elem_size(), "element size")?,
            width: shape.depth().byte_width() as u32,
            channels: srcs.len() as u32,
            row_pitch: dispatch.row_pitch,
            _pad: [0; 3],
        };

        self.run_kernel("merge", exec, |encoder| {
            kernels.merge.encode(
                &self.device,
                encoder,
                &[planes[0], planes[1], planes[2], planes[3], dst.raw()],
                bytemuck::bytes_of(&params),
                dispatch,
            );
            Ok(())
        })
    }

    fn bitwise_xor(
        &self,
        a: &GpuBuffer,
        b: &GpuBuffer,
        dst: &GpuBuffer,
        bytes: usize,
        exec: Exec<'_, GpuStream>,
    ) -> Result<()> {
        let n = as_u32(words(bytes), "xor words")?;
        let dispatch = self.dispatch_linear(n);
        let params = XorParams { words: n, row_pitch: dispatch.row_pitch, _pad: [0; 2] };
        let kernels = self.kernels();

        self.run_kernel("bitwise_xor", exec, |encoder| {
            kernels.xor.encode(
                &self.device,
                encoder,
                &[a.raw(), b.raw(), dst.raw()],
                bytemuck::bytes_of(&params),
                dispatch,
            );
            Ok(())
        })
    }

    fn count_non_zero(&self, src: &GpuBuffer, shape: Shape) -> Result<usize> {
        let depth = shape.depth();
        let (lo_mask, hi_mask) = match depth {
            Depth::F32 => (0x7fff_ffff, 0),
            Depth::F64 => (0xffff_ffff, 0x7fff_ffff),
            _ => (0xffff_ffff, 0xffff_ffff),
        };
        let count = as_u32(shape.total(), "element count")?;
        let dispatch = self.dispatch_linear(count);
        let params = CountParams {
            count,
            width: depth.byte_width() as u32,
            lo_mask,
            hi_mask,
            row_pitch: dispatch.row_pitch,
            _pad: [0; 3],
        };
        let kernels = self.kernels();

        let counter = self.scoped("count_non_zero", || {
            use wgpu::util::DeviceExt;
            let counter = self.device.create_buffer_init(&wgpu::util::BufferInitDescriptor {
                label: Some("count_nonzero counter"),
                contents: bytemuck::bytes_of(&0u32),
                usage: wgpu::BufferUsages::STORAGE | wgpu::BufferUsages::COPY_SRC,
            });
            let mut encoder = self.encoder("count_non_zero");
            kernels.count_nonzero.encode(
                &self.device,
                &mut encoder,
                &[src.raw(), &counter],
                bytemuck::bytes_of(&params),
                dispatch,
            );
            self.queue.submit(std::iter::once(encoder.finish()));
            Ok(counter)
        })?;

        let mut out = [0u8; 4];
        self.readback_bytes(&counter, &mut out)?;
        Ok(u32::from_le_bytes(out) as usize)
    }

    fn min_max_loc(&self, src: &GpuBuffer, shape: Shape) -> Result<MinMaxLoc> {
        let depth = shape.depth();
        if depth == Depth::F64 {
            return Err(Error::Unsupported { op: "min_max_loc", depth });
        }
        if shape.is_empty() {
            return Err(Error::shape("min/max of an empty buffer"));
        }
        let flip = match depth {
            Depth::I8 => 0x80,
            Depth::I16 => 0x8000,
            Depth::I32 => 0x8000_0000,
            _ => 0,
        };
        let count = as_u32(shape.total(), "element count")?;
        let dispatch = self.dispatch_linear(count);
        let params = MinMaxParams {
            count,
            width: depth.byte_width() as u32,
            flip,
            is_float: u32::from(depth == Depth::F32),
            row_pitch: dispatch.row_pitch,
            _pad: [0; 3],
        };
        let kernels = self.kernels();

        let result = self.scoped("min_max_loc", || {
            use wgpu::util::DeviceExt;
            let init: [u32; 4] = [u32::MAX, 0, u32::MAX, u32::MAX];
            let result = self.device.create_buffer_init(&wgpu::util::BufferInitDescriptor {
                label: Some("minmax result"),
                contents: bytemuck::cast_slice(&init),
                usage: wgpu::BufferUsages::STORAGE | wgpu::BufferUsages::COPY_SRC,
            });
            let mut encoder = self.encoder("min_max_loc");
            kernels
                .minmax
                .encode(&self.device, &mut encoder, src.raw(), &result, &params, dispatch);
            self.queue.submit(std::iter::once(encoder.finish()));
            Ok(result)
        })?;

        let mut raw = [0u8; 16];
        self.readback_bytes(&result, &mut raw)?;
        let r: [u32; 4] = bytemuck::cast(raw);
        if r[2] == u32::MAX || r[3] == u32::MAX {
            return Err(Error::device("min/max reduction found no location"));
        }

        let cols = shape.cols();
        Ok(MinMaxLoc {
            min: key_to_value(r[0], depth),
            max: key_to_value(r[1], depth),
            min_loc: Point::from_linear(r[2] as usize, cols),
            max_loc: Point::from_linear(r[3] as usize, cols),
        })
    }

    fn convert(
        &self,
        src: &GpuBuffer,
        shape: Shape,
        dst: &GpuBuffer,
        depth: Depth,
        alpha: f64,
        beta: f64,
        exec: Exec<'_, GpuStream>,
    ) -> Result<()> {
        for d in [shape.depth(), depth] {
            if d == Depth::F64 {
                return Err(Error::Unsupported { op: "convert", depth: d });
            }
        }
        let count = shape.total() * shape.channels();
        let dst_width = depth.byte_width();
        let dispatch = self.dispatch_linear(as_u32(words(count * dst_width), "convert words")?);
        let (dst_lo, dst_hi) = depth.int_range().unwrap_or((0.0, 0.0));
        let exact = exact_integer(shape.depth(), depth, alpha, beta);
        let params = ConvertParams {
            count: as_u32(count, "element count")?,
            src_width: shape.depth().byte_width() as u32,
            src_kind: kind(shape.depth()),
            dst_width: dst_width as u32,
            dst_kind: kind(depth),
            row_pitch: dispatch.row_pitch,
            alpha: alpha as f32,
            beta: beta as f32,
            dst_lo: dst_lo as f32,
            dst_hi: dst_hi as f32,
            int_lo: dst_lo as i32,
            int_hi: dst_hi as i32,
            exact: u32::from(exact),
            _pad: [0; 3],
        };
        let kernels = self.kernels();

        self.run_kernel("convert", exec, |encoder| {
            kernels.convert.encode(
                &self.device,
                encoder,
                &[src.raw(), dst.raw()],
                bytemuck::bytes_of(&params),
                dispatch,
            );
            Ok(())
        })
    }

    fn fill(
        &self,
        dst: &GpuBuffer,
        shape: Shape,
        value: &Scalar,
        mask: Option<&GpuBuffer>,
        exec: Exec<'_, GpuStream>,
    ) -> Result<()> {
        let mut pattern = [0u8; 32];
        let pixel = value.encode(shape.depth(), shape.channels());
        pattern[..pixel.len()].copy_from_slice(&pixel);

        let total_bytes = shape.byte_len();
        let dispatch = self.dispatch_linear(as_u32(words(total_bytes), "fill words")?);
        let params = FillParams {
            pattern: bytemuck::cast(pattern),
            total_bytes: as_u32(total_bytes, "fill bytes")?,
            elem_bytes: as_u32(shape.elem_size(), "element size")?,
            has_mask: u32::from(mask.is_some()),
            row_pitch: dispatch.row_pitch,
        };
        let kernels = self.kernels();
        let mask = mask.map_or(&kernels.dummy, GpuBuffer::raw);

        self.run_kernel("fill", exec, |encoder| {
            kernels.fill.encode(
                &self.device,
                encoder,
                &[dst.raw(), mask],
                bytemuck::bytes_of(&params),
                dispatch,
            );
            Ok(())
        })
    }
}

/// Value class for the conversion kernel: 0 unsigned, 1 signed, 2 float.
fn kind(depth: Depth) -> u32 {
    match depth.int_range() {
        None => 2,
        Some((lo, _)) if lo < 0.0 => 1,
        Some(_) => 0,
    }
}

/// `true` when the conversion can run in i32 without going through f32:
/// integer to integer, unscaled.
fn exact_integer(from: Depth, to: Depth, alpha: f64, beta: f64) -> bool {
    alpha == 1.0 && beta == 0.0 && !from.is_float() && !to.is_float()
}

/// Invert the order-preserving key the min/max kernel reduces over.
fn key_to_value(key: u32, depth: Depth) -> f64 {
    match depth {
        Depth::U8 | Depth::U16 => f64::from(key),
        Depth::I8 => f64::from((key ^ 0x80) as u8 as i8),
        Depth::I16 => f64::from((key ^ 0x8000) as u16 as i16),
        Depth::I32 => f64::from((key ^ 0x8000_0000) as i32),
        _ => {
            let bits = if key & 0x8000_0000 != 0 { key & 0x7fff_ffff } else { !key };
            f64::from(f32::from_bits(bits))
        }
    }
}
