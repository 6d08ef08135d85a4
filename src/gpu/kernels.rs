// gpu/kernels.rs — compute pipelines for the matrix operations.
//
// Every kernel treats its buffers as flat `array<u32>` and works on whole
// words, so 8- and 16-bit depths never race on a shared word. Shapes and
// depths arrive through a small uniform `Params` struct per kernel, one
// `#[repr(C)]` Rust mirror each.
//
// PIPELINE CREATION
// ──────────────────
// `GpuKernels::new` compiles all seven shaders at once, on the first kernel
// call a device sees (see `GpuDevice::kernels`). The workgroup size is baked
// in by replacing `{{WG_SIZE}}` in the WGSL source. Bind group layouts are
// explicit rather than derived from the shader so that the two min/max
// entry points can share one layout and one bind group.
//
// NEW RUST CONCEPTS
// ──────────────────
// - `#[derive(Pod, Zeroable)]` — bytemuck proves at compile time that the
//   struct has no padding or invalid bit patterns, so `bytes_of(&params)`
//   is a zero-copy view suitable for a uniform buffer.
// - `include_str!` — the WGSL source is embedded in the binary; no files
//   are read at runtime.

use bytemuck::{Pod, Zeroable};
use log::debug;
use wgpu::util::DeviceExt;

use crate::gpu::device::Dispatch;

// ---------------------------------------------------------------------------
// Uniform parameter blocks (must match the WGSL `Params` structs exactly)
// ---------------------------------------------------------------------------

#[repr(C)]
#[derive(Debug, Clone, Copy, Pod, Zeroable)]
pub(crate) struct SplitParams {
    pub plane_bytes: u32,
    pub elem_bytes: u32,
    pub width: u32,
    pub channel: u32,
    pub row_pitch: u32,
    pub _pad: [u32; 3],
}

#[repr(C)]
#[derive(Debug, Clone, Copy, Pod, Zeroable)]
pub(crate) struct MergeParams {
    pub total_bytes: u32,
    pub elem_bytes: u32,
    pub width: u32,
    pub channels: u32,
    pub row_pitch: u32,
    pub _pad: [u32; 3],
}

#[repr(C)]
#[derive(Debug, Clone, Copy, Pod, Zeroable)]
pub(crate) struct XorParams {
    pub words: u32,
    pub row_pitch: u32,
    pub _pad: [u32; 2],
}

#[repr(C)]
#[derive(Debug, Clone, Copy, Pod, Zeroable)]
pub(crate) struct CountParams {
    pub count: u32,
    pub width: u32,
    pub lo_mask: u32,
    pub hi_mask: u32,
    pub row_pitch: u32,
    pub _pad: [u32; 3],
}

#[repr(C)]
#[derive(Debug, Clone, Copy, Pod, Zeroable)]
pub(crate) struct MinMaxParams {
    pub count: u32,
    pub width: u32,
    pub flip: u32,
    pub is_float: u32,
    pub row_pitch: u32,
    pub _pad: [u32; 3],
}

#[repr(C)]
#[derive(Debug, Clone, Copy, Pod, Zeroable)]
pub(crate) struct ConvertParams {
    pub count: u32,
    pub src_width: u32,
    pub src_kind: u32,
    pub dst_width: u32,
    pub dst_kind: u32,
    pub row_pitch: u32,
    pub alpha: f32,
    pub beta: f32,
    pub dst_lo: f32,
    pub dst_hi: f32,
    pub int_lo: i32,
    pub int_hi: i32,
    /// Non-zero for an unscaled integer → integer conversion.
    pub exact: u32,
    pub _pad: [u32; 3],
}

#[repr(C)]
#[derive(Debug, Clone, Copy, Pod, Zeroable)]
pub(crate) struct FillParams {
    pub pattern: [u32; 8],
    pub total_bytes: u32,
    pub elem_bytes: u32,
    pub has_mask: u32,
    pub row_pitch: u32,
}

// ---------------------------------------------------------------------------
// Kernels
// ---------------------------------------------------------------------------

/// Binding kind, in binding-index order. The uniform is always last.
#[derive(Clone, Copy)]
enum Slot {
    Read,
    ReadWrite,
    Uniform,
}

/// One compiled entry point with the layout its bind groups are built from.
pub(crate) struct Kernel {
    pub pipeline: wgpu::ComputePipeline,
    pub bgl: wgpu::BindGroupLayout,
    label: &'static str,
}

impl Kernel {
    /// Record one dispatch of this kernel into `encoder`.
    ///
    /// `buffers` bind to slots `0..n` in order and the uniform built from
    /// `params` binds to slot `n`.
    pub fn encode(
        &self,
        device: &wgpu::Device,
        encoder: &mut wgpu::CommandEncoder,
        buffers: &[&wgpu::Buffer],
        params: &[u8],
        dispatch: Dispatch,
    ) {
        let bind_group = self.bind(device, buffers, params);
        encode_pass(encoder, self.label, &self.pipeline, &bind_group, dispatch);
    }

    fn bind(&self, device: &wgpu::Device, buffers: &[&wgpu::Buffer], params: &[u8]) -> wgpu::BindGroup {
        let params_buf = device.create_buffer_init(&wgpu::util::BufferInitDescriptor {
            label: Some(self.label),
            contents: params,
            usage: wgpu::BufferUsages::UNIFORM,
        });

        let bound: Vec<&wgpu::Buffer> =
            buffers.iter().copied().chain(std::iter::once(&params_buf)).collect();
        let entries: Vec<wgpu::BindGroupEntry> = bound
            .iter()
            .enumerate()
            .map(|(i, buf)| wgpu::BindGroupEntry {
                binding: i as u32,
                resource: buf.as_entire_binding(),
            })
            .collect();

        device.create_bind_group(&wgpu::BindGroupDescriptor {
            label: Some(self.label),
            layout: &self.bgl,
            entries: &entries,
        })
    }
}

/// The min/max reduction: two entry points over one layout.
pub(crate) struct MinMaxKernel {
    reduce: Kernel,
    locate: wgpu::ComputePipeline,
}

impl MinMaxKernel {
    /// Record both passes. wgpu orders the second pass after the first's
    /// storage writes.
    pub fn encode(
        &self,
        device: &wgpu::Device,
        encoder: &mut wgpu::CommandEncoder,
        src: &wgpu::Buffer,
        result: &wgpu::Buffer,
        params: &MinMaxParams,
        dispatch: Dispatch,
    ) {
        let bind_group = self.reduce.bind(device, &[src, result], bytemuck::bytes_of(params));
        encode_pass(encoder, "reduce_keys", &self.reduce.pipeline, &bind_group, dispatch);
        encode_pass(encoder, "locate", &self.locate, &bind_group, dispatch);
    }
}

/// Every pipeline the matrix operations need, compiled for one device.
pub(crate) struct GpuKernels {
    pub split: Kernel,
    pub merge: Kernel,
    pub xor: Kernel,
    pub count_nonzero: Kernel,
    pub minmax: MinMaxKernel,
    pub convert: Kernel,
    pub fill: Kernel,
    /// 4-byte stand-in for optional storage bindings (merge planes, mask).
    pub dummy: wgpu::Buffer,
}

impl GpuKernels {
    pub fn new(device: &wgpu::Device, wg_size: u32) -> Self {
        use Slot::{Read, ReadWrite, Uniform};
        debug!("compiling matrix kernels, workgroup size {wg_size}");

        let split = build(
            device,
            wg_size,
            include_str!("../shaders/split.wgsl"),
            &["split_channel"],
            &[Read, ReadWrite, Uniform],
        );
        let merge = build(
            device,
            wg_size,
            include_str!("../shaders/merge.wgsl"),
            &["merge_channels"],
            &[Read, Read, Read, Read, ReadWrite, Uniform],
        );
        let xor = build(
            device,
            wg_size,
            include_str!("../shaders/xor.wgsl"),
            &["bitwise_xor"],
            &[Read, Read, ReadWrite, Uniform],
        );
        let count_nonzero = build(
            device,
            wg_size,
            include_str!("../shaders/count_nonzero.wgsl"),
            &["count_nonzero"],
            &[Read, ReadWrite, Uniform],
        );
        let minmax = build(
            device,
            wg_size,
            include_str!("../shaders/minmax.wgsl"),
            &["reduce_keys", "locate"],
            &[Read, ReadWrite, Uniform],
        );
        let convert = build(
            device,
            wg_size,
            include_str!("../shaders/convert.wgsl"),
            &["convert_depth"],
            &[Read, ReadWrite, Uniform],
        );
        let fill = build(
            device,
            wg_size,
            include_str!("../shaders/fill.wgsl"),
            &["fill_pixels"],
            &[ReadWrite, Read, Uniform],
        );

        let dummy = device.create_buffer(&wgpu::BufferDescriptor {
            label: Some("dummy binding"),
            size: wgpu::COPY_BUFFER_ALIGNMENT,
            usage: wgpu::BufferUsages::STORAGE,
            mapped_at_creation: false,
        });

        GpuKernels {
            split: single(split),
            merge: single(merge),
            xor: single(xor),
            count_nonzero: single(count_nonzero),
            minmax: {
                let (bgl, mut pipelines) = minmax;
                let (locate_label, locate) = pipelines.remove(1);
                let (label, pipeline) = pipelines.remove(0);
                debug_assert_eq!(locate_label, "locate");
                MinMaxKernel { reduce: Kernel { pipeline, bgl, label }, locate }
            },
            convert: single(convert),
            fill: single(fill),
            dummy,
        }
    }
}

type Built = (wgpu::BindGroupLayout, Vec<(&'static str, wgpu::ComputePipeline)>);

fn single((bgl, mut pipelines): Built) -> Kernel {
    let (label, pipeline) = pipelines.remove(0);
    Kernel { pipeline, bgl, label }
}

/// Compile `template` and create one pipeline per entry point, all sharing
/// a layout described by `slots`.
fn build(
    device: &wgpu::Device,
    wg_size: u32,
    template: &str,
    entry_points: &[&'static str],
    slots: &[Slot],
) -> Built {
    let source = template.replace("{{WG_SIZE}}", &wg_size.to_string());
    let label = entry_points[0];

    let shader = device.create_shader_module(wgpu::ShaderModuleDescriptor {
        label: Some(label),
        source: wgpu::ShaderSource::Wgsl(source.into()),
    });

    let entries: Vec<wgpu::BindGroupLayoutEntry> = slots
        .iter()
        .enumerate()
        .map(|(i, slot)| wgpu::BindGroupLayoutEntry {
            binding: i as u32,
            visibility: wgpu::ShaderStages::COMPUTE,
            ty: wgpu::BindingType::Buffer {
                ty: match slot {
                    Slot::Read => wgpu::BufferBindingType::Storage { read_only: true },
                    Slot::ReadWrite => wgpu::BufferBindingType::Storage { read_only: false },
                    Slot::Uniform => wgpu::BufferBindingType::Uniform,
                },
                has_dynamic_offset: false,
                min_binding_size: None,
            },
            count: None,
        })
        .collect();

    let bgl = device.create_bind_group_layout(&wgpu::BindGroupLayoutDescriptor {
        label: Some(label),
        entries: &entries,
    });

    let pipeline_layout = device.create_pipeline_layout(&wgpu::PipelineLayoutDescriptor {
        label: Some(label),
        bind_group_layouts: &[&bgl],
        push_constant_ranges: &[],
    });

    let pipelines = entry_points
        .iter()
        .map(|&entry_point| {
            let pipeline = device.create_compute_pipeline(&wgpu::ComputePipelineDescriptor {
                label: Some(entry_point),
                layout: Some(&pipeline_layout),
                module: &shader,
                entry_point,
                compilation_options: wgpu::PipelineCompilationOptions::default(),
                cache: None,
            });
            (entry_point, pipeline)
        })
        .collect();

    (bgl, pipelines)
}

fn encode_pass(
    encoder: &mut wgpu::CommandEncoder,
    label: &str,
    pipeline: &wgpu::ComputePipeline,
    bind_group: &wgpu::BindGroup,
    dispatch: Dispatch,
) {
    let mut pass = encoder.begin_compute_pass(&wgpu::ComputePassDescriptor {
        label: Some(label),
        timestamp_writes: None,
    });
    pass.set_pipeline(pipeline);
    pass.set_bind_group(0, bind_group, &[]);
    pass.dispatch_workgroups(dispatch.x, dispatch.y, 1);
}
