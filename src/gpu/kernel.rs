// gpu/kernel.rs — compute pipelines with positional arguments.
//
// A `GpuKernel` is one entry point of a compiled program. Its bind group
// layout is derived from the kernel signature, one binding per argument
// slot:
//
//   ArgKind::ReadBuffer   storage, read_only
//   ArgKind::WriteBuffer  storage, read_write
//   ArgKind::Int          uniform, 16-byte `ScalarParam`
//
// Arguments are set one slot at a time, like a classic kernel API. The bind
// group is rebuilt lazily at dispatch when a buffer slot changed or the
// global size differs from the last dispatch; scalar updates go through
// `queue.write_buffer` and leave the bind group intact.
//
// Storage buffers are bound with exactly `global` vectors, so the shader's
// `arrayLength` guard matches the configured size even when a shared buffer
// is larger.

use std::num::NonZeroU64;

use wgpu::util::DeviceExt;

use crate::error::DeviceError;
use crate::runtime::{check_arg, ArgKind, KernelArg, KernelDef};
use crate::stage::VECTOR_WIDTH;

use super::buffer::GpuBuffer;
use super::device::{GpuDevice, GpuEvent, WorkgroupSize};

/// Uniform layout of an `Int` argument (must match the WGSL params struct).
#[repr(C)]
#[derive(Copy, Clone, Debug, bytemuck::Pod, bytemuck::Zeroable)]
struct ScalarParam {
    value: i32,
    _pad: [i32; 3],
}

impl ScalarParam {
    fn new(value: i32) -> Self {
        ScalarParam { value, _pad: [0; 3] }
    }
}

#[derive(Debug)]
enum Binding {
    Buffer(GpuBuffer),
    Scalar(wgpu::Buffer),
}

/// A compute pipeline plus its bound arguments.
pub struct GpuKernel {
    def: &'static KernelDef,
    pipeline: wgpu::ComputePipeline,
    bgl: wgpu::BindGroupLayout,
    slots: Vec<Option<Binding>>,
    /// Lanes the pipeline was compiled with; later device changes do not apply.
    workgroup_size: WorkgroupSize,
    /// Bind group of the last dispatch and the global size it was built for.
    bind_group: Option<(wgpu::BindGroup, usize)>,
}

impl std::fmt::Debug for GpuKernel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GpuKernel")
            .field("entry", &self.def.entry)
            .field("workgroup_size", &self.workgroup_size)
            .field("slots", &self.slots)
            .finish()
    }
}

fn layout_entry(binding: u32, kind: ArgKind) -> wgpu::BindGroupLayoutEntry {
    let ty = match kind {
        ArgKind::ReadBuffer => wgpu::BufferBindingType::Storage { read_only: true },
        ArgKind::WriteBuffer => wgpu::BufferBindingType::Storage { read_only: false },
        ArgKind::Int => wgpu::BufferBindingType::Uniform,
    };
    wgpu::BindGroupLayoutEntry {
        binding,
        visibility: wgpu::ShaderStages::COMPUTE,
        ty: wgpu::BindingType::Buffer {
            ty,
            has_dynamic_offset: false,
            min_binding_size: None,
        },
        count: None,
    }
}

impl GpuKernel {
    pub(crate) fn new(gpu: &GpuDevice, program: usize, entry: &str) -> Result<Self, DeviceError> {
        let (program, module) = gpu.program(program)?;
        let workgroup_size = gpu.workgroup_size;
        let def = program.kernel(entry).ok_or_else(|| DeviceError::UnknownKernel {
            program: program.name,
            entry: entry.to_string(),
        })?;

        let entries: Vec<wgpu::BindGroupLayoutEntry> = def
            .args
            .iter()
            .enumerate()
            .map(|(i, &kind)| layout_entry(i as u32, kind))
            .collect();

        let (bgl, pipeline) = gpu.scoped(def.entry, 0, || {
            let bgl = gpu.device.create_bind_group_layout(&wgpu::BindGroupLayoutDescriptor {
                label: Some(def.entry),
                entries: &entries,
            });
            let pipeline_layout = gpu.device.create_pipeline_layout(&wgpu::PipelineLayoutDescriptor {
                label: Some(def.entry),
                bind_group_layouts: &[&bgl],
                push_constant_ranges: &[],
            });
            let pipeline = gpu.device.create_compute_pipeline(&wgpu::ComputePipelineDescriptor {
                label: Some(def.entry),
                layout: Some(&pipeline_layout),
                module,
                entry_point: def.entry,
                compilation_options: wgpu::PipelineCompilationOptions::default(),
                cache: None,
            });
            (bgl, pipeline)
        })?;

        Ok(GpuKernel {
            def,
            pipeline,
            bgl,
            slots: def.args.iter().map(|_| None).collect(),
            workgroup_size,
            bind_group: None,
        })
    }

    pub(crate) fn set_arg(
        &mut self,
        gpu: &GpuDevice,
        index: u32,
        arg: KernelArg<'_, GpuBuffer>,
    ) -> Result<(), DeviceError> {
        let memory = match &arg {
            KernelArg::Buffer(b) => Some(b.memory()),
            KernelArg::Int(_) => None,
        };
        check_arg(self.def, index, &arg, memory)?;
        let slot = &mut self.slots[index as usize];

        match arg {
            KernelArg::Buffer(buffer) => {
                *slot = Some(Binding::Buffer(buffer.clone()));
                self.bind_group = None;
            }
            KernelArg::Int(value) => {
                let param = ScalarParam::new(value);
                match slot {
                    Some(Binding::Scalar(uniform)) => {
                        gpu.queue.write_buffer(uniform, 0, bytemuck::bytes_of(&param));
                    }
                    _ => {
                        let uniform = gpu.device.create_buffer_init(&wgpu::util::BufferInitDescriptor {
                            label: Some(self.def.entry),
                            contents: bytemuck::bytes_of(&param),
                            usage: wgpu::BufferUsages::UNIFORM | wgpu::BufferUsages::COPY_DST,
                        });
                        *slot = Some(Binding::Scalar(uniform));
                        self.bind_group = None;
                    }
                }
            }
        }
        Ok(())
    }

    fn invalid(&self, index: usize, reason: impl Into<String>) -> DeviceError {
        DeviceError::InvalidArgument {
            kernel: self.def.entry,
            index: index as u32,
            reason: reason.into(),
        }
    }

    fn build_bind_group(&self, gpu: &GpuDevice, global: usize) -> Result<wgpu::BindGroup, DeviceError> {
        let vector_bytes = (VECTOR_WIDTH * std::mem::size_of::<f32>()) as u64;
        let size = NonZeroU64::new(global as u64 * vector_bytes);

        let mut entries = Vec::with_capacity(self.slots.len());
        for (i, slot) in self.slots.iter().enumerate() {
            let resource = match slot {
                None => return Err(self.invalid(i, "argument not set")),
                Some(Binding::Buffer(b)) => {
                    if b.len() < global * VECTOR_WIDTH {
                        return Err(self.invalid(
                            i,
                            format!("buffer `{}` holds {} elements, launch needs {}", b.label(), b.len(), global * VECTOR_WIDTH),
                        ));
                    }
                    wgpu::BindingResource::Buffer(wgpu::BufferBinding {
                        buffer: b.raw(),
                        offset: 0,
                        size,
                    })
                }
                Some(Binding::Scalar(uniform)) => uniform.as_entire_binding(),
            };
            entries.push(wgpu::BindGroupEntry {
                binding: i as u32,
                resource,
            });
        }

        gpu.scoped(self.def.entry, 0, || {
            gpu.device.create_bind_group(&wgpu::BindGroupDescriptor {
                label: Some(self.def.entry),
                layout: &self.bgl,
                entries: &entries,
            })
        })
    }

    pub(crate) fn dispatch(&mut self, gpu: &GpuDevice, global: usize) -> Result<GpuEvent, DeviceError> {
        let workgroups = self.workgroup_size.dispatch_size(global);
        let max = gpu.device.limits().max_compute_workgroups_per_dimension;
        let workgroups = u32::try_from(workgroups)
            .ok()
            .filter(|&w| w <= max)
            .ok_or(DeviceError::DispatchTooLarge {
                workgroups: u32::try_from(workgroups).unwrap_or(u32::MAX),
                max,
            })?;

        let stale = !matches!(&self.bind_group, Some((_, g)) if *g == global);
        if stale {
            let bind_group = self.build_bind_group(gpu, global)?;
            self.bind_group = Some((bind_group, global));
        }
        let Some((bind_group, _)) = &self.bind_group else {
            return Err(self.invalid(0, "bind group missing after rebuild"));
        };

        let index = gpu.scoped(self.def.entry, 0, || {
            let mut encoder = gpu.device.create_command_encoder(&wgpu::CommandEncoderDescriptor {
                label: Some(self.def.entry),
            });
            {
                let mut pass = encoder.begin_compute_pass(&wgpu::ComputePassDescriptor {
                    label: Some(self.def.entry),
                    timestamp_writes: None,
                });
                pass.set_pipeline(&self.pipeline);
                pass.set_bind_group(0, bind_group, &[]);
                pass.dispatch_workgroups(workgroups, 1, 1);
            }
            gpu.queue.submit(std::iter::once(encoder.finish()))
        })?;
        tracing::trace!(kernel = self.def.entry, global, workgroups, "dispatch submitted");
        Ok(GpuEvent { index })
    }
}
