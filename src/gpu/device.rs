// gpu/device.rs — wgpu device behind the `Device` trait.
//
// Responsibilities:
//   - Enumerate Vulkan adapters and select the first non-CPU one.
//   - Expose a `DeviceProfile` for simulating hardware limits on a
//     development machine (e.g., cap invocations to match Raspberry Pi).
//   - Provide `WorkgroupSize`, the 1-D workgroup every elementwise kernel
//     is compiled with, validated against the active profile.
//   - Compile the registered programs and implement `Device` on top of
//     wgpu buffers, pipelines and the single queue (buffer.rs, kernel.rs).
//
// ADAPTER SELECTION:
// wgpu's default `request_adapter` uses power preference heuristics that
// may grab llvmpipe/softpipe on WSL2 (where the software renderer appears
// as a valid Vulkan device). We enumerate explicitly and prefer anything
// that is not DeviceType::Cpu.
//
// DEVICE LIMITS:
// We request *lower* limits than the hardware actually supports when
// running under a non-Native profile. wgpu validates every dispatch against
// the requested limits, so violations that would fail on RPi are caught at
// dev time on the laptop.
//
// ERROR CAPTURE:
// wgpu reports allocation and validation failures asynchronously through
// an uncaptured-error handler that panics by default. Every call that can
// fail that way runs inside `scoped`, which pushes OutOfMemory and
// Validation error scopes and turns a popped error into a `DeviceError`.
//
// ORDERING:
// Every copy and dispatch is its own queue submission. wgpu executes
// submissions in order, so a token passed as a dependency has always been
// submitted before the dependent work and needs no explicit wait.

use std::fmt;
use std::sync::mpsc::Receiver;

use parking_lot::Mutex;

use crate::error::DeviceError;
use crate::math;
use crate::runtime::{Device, KernelArg, Memory, Program};

use super::buffer::GpuBuffer;
use super::kernel::GpuKernel;

/// Hardware profile controlling device limits and default workgroup sizes.
///
/// Use `Native` for best performance on your development machine.
/// Use `RaspberryPi` to simulate RPi 4/5 constraints; wgpu will reject
/// any dispatch that exceeds the RPi's actual Vulkan limits.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeviceProfile {
    /// Use the adapter's actual hardware limits. No artificial caps.
    Native,
    /// Simulate Raspberry Pi 4/5 (Broadcom VideoCore VI/VII, V3DV Vulkan).
    /// Caps `max_compute_invocations_per_workgroup` to 256.
    RaspberryPi,
}

impl fmt::Display for DeviceProfile {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DeviceProfile::Native => write!(f, "Native"),
            DeviceProfile::RaspberryPi => write!(f, "RaspberryPi (simulated limits)"),
        }
    }
}

/// Invocations per workgroup of the 1-D elementwise dispatches.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WorkgroupSize {
    pub lanes: u32,
}

impl WorkgroupSize {
    /// Validated default for the given profile.
    ///
    /// - `Native`: 128 lanes, 4 NVIDIA warps or 2 AMD wavefronts.
    /// - `RaspberryPi`: 64 lanes, well inside the 256 invocation limit.
    fn for_profile(profile: DeviceProfile) -> Self {
        match profile {
            DeviceProfile::Native => WorkgroupSize { lanes: 128 },
            DeviceProfile::RaspberryPi => WorkgroupSize { lanes: 64 },
        }
    }

    /// Workgroups needed to cover `global` work items.
    pub fn dispatch_size(&self, global: usize) -> u64 {
        (global as u64).div_ceil(self.lanes as u64)
    }
}

impl fmt::Display for WorkgroupSize {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} lanes", self.lanes)
    }
}

/// Cached adapter information for logging and debugging.
#[derive(Debug, Clone)]
pub struct AdapterInfo {
    pub name: String,
    pub vendor: u32,
    pub device: u32,
    pub device_type: wgpu::DeviceType,
    pub backend: wgpu::Backend,
}

impl fmt::Display for AdapterInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} ({:?}, {:?})",
            self.name, self.backend, self.device_type
        )
    }
}

/// Completion token: the queue submission that carried the work.
#[derive(Debug, Clone)]
pub struct GpuEvent {
    pub(crate) index: wgpu::SubmissionIndex,
}

/// A staging buffer with a map request in flight, unmapped by `finish`.
pub(crate) struct PendingMap {
    pub(crate) buffer: GpuBuffer,
    pub(crate) done: Receiver<Result<(), wgpu::BufferAsyncError>>,
}

/// The GPU context: adapter, device, queue, active profile and the compiled
/// programs.
///
/// # Field drop order
/// Rust drops struct fields in declaration order (top → bottom).
/// `_instance` is declared last so the `wgpu::Instance` outlives `device`
/// and `queue`. dzn (the D3D12-to-Vulkan layer on WSL2) crashes when the
/// Vulkan instance is destroyed while device-level objects still refer to it.
pub struct GpuDevice {
    pub device: wgpu::Device,
    pub queue: wgpu::Queue,
    pub profile: DeviceProfile,
    pub adapter_info: AdapterInfo,
    pub workgroup_size: WorkgroupSize,
    programs: Vec<&'static Program>,
    /// One compiled module per program, same order.
    modules: Vec<wgpu::ShaderModule>,
    pub(crate) pending_maps: Mutex<Vec<PendingMap>>,
    _instance: wgpu::Instance,
}

impl GpuDevice {
    /// Create a `GpuDevice` with `DeviceProfile::Native` limits and the
    /// built-in programs (index 0: math).
    pub fn new() -> Result<Self, DeviceError> {
        Self::new_with_profile(DeviceProfile::Native)
    }

    pub fn new_with_profile(profile: DeviceProfile) -> Result<Self, DeviceError> {
        Self::new_with_programs(profile, &[&math::PROGRAM])
    }

    /// Create a device and compile `programs`. A stage selects one by its
    /// position in this slice (`StageInfo::program`).
    pub fn new_with_programs(
        profile: DeviceProfile,
        programs: &[&'static Program],
    ) -> Result<Self, DeviceError> {
        pollster::block_on(Self::init_async(profile, programs))
    }

    async fn init_async(
        profile: DeviceProfile,
        programs: &[&'static Program],
    ) -> Result<Self, DeviceError> {
        // Validation layer in debug builds for shader error feedback.
        // ALLOW_UNDERLYING_NONCOMPLIANT_ADAPTER lets dzn on WSL2 through.
        let flags = if cfg!(debug_assertions) {
            wgpu::InstanceFlags::VALIDATION
                | wgpu::InstanceFlags::ALLOW_UNDERLYING_NONCOMPLIANT_ADAPTER
        } else {
            wgpu::InstanceFlags::ALLOW_UNDERLYING_NONCOMPLIANT_ADAPTER
        };

        let instance = wgpu::Instance::new(wgpu::InstanceDescriptor {
            backends: wgpu::Backends::VULKAN,
            flags,
            ..Default::default()
        });

        // Tiered selection:
        //   1. Any hardware, virtual or "Other" (dzn) adapter.
        //   2. Last resort: whatever exists, even a software renderer.
        let all_adapters: Vec<wgpu::Adapter> = instance
            .enumerate_adapters(wgpu::Backends::VULKAN)
            .into_iter()
            .collect();

        if all_adapters.is_empty() {
            return Err(DeviceError::NoSuitableAdapter);
        }

        for a in &all_adapters {
            let info = a.get_info();
            tracing::info!(
                name = %info.name,
                backend = ?info.backend,
                device_type = ?info.device_type,
                "Vulkan adapter found"
            );
        }

        let adapter = all_adapters
            .into_iter()
            .find(|a| matches!(
                a.get_info().device_type,
                wgpu::DeviceType::DiscreteGpu | wgpu::DeviceType::IntegratedGpu
                    | wgpu::DeviceType::VirtualGpu | wgpu::DeviceType::Other
            ))
            .or_else(|| instance
                .enumerate_adapters(wgpu::Backends::VULKAN)
                .into_iter()
                .next())
            .ok_or(DeviceError::NoSuitableAdapter)?;

        let raw_info = adapter.get_info();
        let adapter_info = AdapterInfo {
            name: raw_info.name.clone(),
            vendor: raw_info.vendor,
            device: raw_info.device,
            device_type: raw_info.device_type,
            backend: raw_info.backend,
        };

        // Auto-detect RPi when the caller passed Native but the adapter is V3D.
        let profile = match profile {
            DeviceProfile::Native if raw_info.name.to_ascii_lowercase().contains("v3d") => {
                tracing::info!("V3D adapter detected, using RaspberryPi profile");
                DeviceProfile::RaspberryPi
            }
            other => other,
        };

        let limits = limits_for_profile(profile);

        let (device, queue): (wgpu::Device, wgpu::Queue) = adapter
            .request_device(
                &wgpu::DeviceDescriptor {
                    label: Some("gf-stages"),
                    required_features: wgpu::Features::empty(),
                    required_limits: limits,
                    memory_hints: wgpu::MemoryHints::default(),
                },
                None,
            )
            .await?;

        let workgroup_size = WorkgroupSize::for_profile(profile);
        let modules = compile_programs(&device, programs, workgroup_size)?;

        tracing::info!(
            adapter = %adapter_info,
            %profile,
            %workgroup_size,
            programs = programs.len(),
            "GPU device ready"
        );

        Ok(GpuDevice {
            device,
            queue,
            profile,
            adapter_info,
            workgroup_size,
            programs: programs.to_vec(),
            modules,
            pending_maps: Mutex::new(Vec::new()),
            _instance: instance,
        })
    }

    /// Override the default workgroup size, validating against the active
    /// profile, and recompile every program with it.
    ///
    /// Kernels created earlier keep the workgroup size they were built with.
    pub fn set_workgroup_size(&mut self, lanes: u32) -> Result<(), DeviceError> {
        let max = max_invocations_for_profile(self.profile);
        if lanes == 0 {
            return Err(DeviceError::Validation("workgroup size must be positive".into()));
        }
        if lanes > max {
            return Err(DeviceError::WorkgroupTooLarge { total: lanes, max });
        }
        let workgroup_size = WorkgroupSize { lanes };
        self.modules = compile_programs(&self.device, &self.programs, workgroup_size)?;
        self.workgroup_size = workgroup_size;
        Ok(())
    }

    pub(crate) fn program(&self, index: usize) -> Result<(&'static Program, &wgpu::ShaderModule), DeviceError> {
        match (self.programs.get(index), self.modules.get(index)) {
            (Some(p), Some(m)) => Ok((*p, m)),
            _ => Err(DeviceError::UnknownProgram(index)),
        }
    }

    /// Run `f` inside OutOfMemory and Validation error scopes.
    pub(crate) fn scoped<T>(&self, label: &str, bytes: u64, f: impl FnOnce() -> T) -> Result<T, DeviceError> {
        self.device.push_error_scope(wgpu::ErrorFilter::Validation);
        self.device.push_error_scope(wgpu::ErrorFilter::OutOfMemory);
        let value = f();
        let oom = pollster::block_on(self.device.pop_error_scope());
        let validation = pollster::block_on(self.device.pop_error_scope());
        match (oom, validation) {
            (Some(_), _) => Err(DeviceError::OutOfMemory {
                label: label.to_string(),
                bytes,
            }),
            (None, Some(err)) => Err(DeviceError::Validation(format!("{label}: {err}"))),
            (None, None) => Ok(value),
        }
    }
}

impl fmt::Display for GpuDevice {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "GpuDevice {{ adapter: {}, profile: {}, workgroup: {} }}",
            self.adapter_info, self.profile, self.workgroup_size
        )
    }
}

impl fmt::Debug for GpuDevice {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("GpuDevice")
            .field("adapter", &self.adapter_info)
            .field("profile", &self.profile)
            .field("workgroup_size", &self.workgroup_size)
            .field("programs", &self.programs.iter().map(|p| p.name).collect::<Vec<_>>())
            .finish()
    }
}

impl Device for GpuDevice {
    type Buffer = GpuBuffer;
    type Kernel = GpuKernel;
    type Event = GpuEvent;

    fn alloc(&self, label: &str, len: usize, memory: Memory) -> Result<GpuBuffer, DeviceError> {
        self.alloc_buffer(label, len, memory)
    }

    fn buffer_len(&self, buffer: &GpuBuffer) -> usize {
        buffer.len()
    }

    fn same_buffer(&self, a: &GpuBuffer, b: &GpuBuffer) -> bool {
        a.same(b)
    }

    fn touch(&self, staging: &GpuBuffer) -> Result<(), DeviceError> {
        self.touch_buffer(staging)
    }

    fn finish(&self) -> Result<(), DeviceError> {
        self.finish_maps()
    }

    fn write_host(&self, staging: &GpuBuffer, data: &[f32]) -> Result<(), DeviceError> {
        self.map_write(staging, data)
    }

    fn read_host(&self, staging: &GpuBuffer) -> Result<Vec<f32>, DeviceError> {
        self.map_read(staging)
    }

    fn enqueue_copy(
        &self,
        src: &GpuBuffer,
        dst: &GpuBuffer,
        len: usize,
        blocking: bool,
        _deps: &[GpuEvent],
    ) -> Result<GpuEvent, DeviceError> {
        let event = self.copy_buffer(src, dst, len)?;
        if blocking {
            self.wait(std::slice::from_ref(&event))?;
        }
        Ok(event)
    }

    fn create_kernel(&self, program: usize, entry: &str) -> Result<GpuKernel, DeviceError> {
        GpuKernel::new(self, program, entry)
    }

    fn set_arg(
        &self,
        kernel: &mut GpuKernel,
        index: u32,
        arg: KernelArg<'_, GpuBuffer>,
    ) -> Result<(), DeviceError> {
        kernel.set_arg(self, index, arg)
    }

    fn enqueue_kernel(
        &self,
        kernel: &mut GpuKernel,
        global: usize,
        _deps: &[GpuEvent],
    ) -> Result<GpuEvent, DeviceError> {
        kernel.dispatch(self, global)
    }

    fn wait(&self, events: &[GpuEvent]) -> Result<(), DeviceError> {
        for event in events {
            self.device
                .poll(wgpu::Maintain::WaitForSubmissionIndex(event.index.clone()));
        }
        Ok(())
    }
}

// ============================================================
// Program compilation
// ============================================================

/// Substitute the workgroup size into each program and compile it.
fn compile_programs(
    device: &wgpu::Device,
    programs: &[&'static Program],
    workgroup_size: WorkgroupSize,
) -> Result<Vec<wgpu::ShaderModule>, DeviceError> {
    programs
        .iter()
        .map(|program| {
            let source = specialize(program.source, workgroup_size);
            device.push_error_scope(wgpu::ErrorFilter::Validation);
            let module = device.create_shader_module(wgpu::ShaderModuleDescriptor {
                label: Some(program.name),
                source: wgpu::ShaderSource::Wgsl(source.into()),
            });
            match pollster::block_on(device.pop_error_scope()) {
                Some(err) => Err(DeviceError::Validation(format!("program `{}`: {err}", program.name))),
                None => Ok(module),
            }
        })
        .collect()
}

fn specialize(source: &str, workgroup_size: WorkgroupSize) -> String {
    source.replace("{{WG_SIZE}}", &workgroup_size.lanes.to_string())
}

// ============================================================
// Limits helpers
// ============================================================

/// Build wgpu limits for the given profile.
fn limits_for_profile(profile: DeviceProfile) -> wgpu::Limits {
    match profile {
        DeviceProfile::Native => wgpu::Limits::default(),

        DeviceProfile::RaspberryPi => wgpu::Limits {
            // VideoCore VI/VII: vulkaninfo reports 256 max invocations.
            max_compute_invocations_per_workgroup: 256,
            max_compute_workgroup_size_x: 256,
            max_compute_workgroup_size_y: 256,
            max_compute_workgroup_size_z: 64,
            max_texture_dimension_2d: 4096,
            // RPi 4 shares 4 GiB with the CPU; 128 MiB per binding is safe.
            max_storage_buffer_binding_size: 128 << 20,
            ..wgpu::Limits::default()
        },
    }
}

/// Maximum compute invocations per workgroup for the given profile.
fn max_invocations_for_profile(profile: DeviceProfile) -> u32 {
    match profile {
        DeviceProfile::Native => wgpu::Limits::default().max_compute_invocations_per_workgroup,
        DeviceProfile::RaspberryPi => 256,
    }
}

// ============================================================
// Tests
// ============================================================
