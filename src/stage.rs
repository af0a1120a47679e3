// stage.rs — the generic compute stage harness.
//
// A stage owns one kernel on one device, plus the host and device buffers of
// its roles, and exposes the lifecycle
//
//   init(dims, staging) → write(role, data) → run() → read(role)
//
// `StageCore` implements the lifecycle once, for any `Device` and any
// `Role` set. Concrete stages (`Mult`, `Pown`) wrap a core, choose the
// kernel entry point, bind their scalar parameters, and implement `Stage`
// to expose the shared operations.
//
// LIFECYCLE
// ─────────
//   UNCONFIGURED ──init──▶ CONFIGURED ──init──▶ CONFIGURED
//
// `init` validates the dimensions before touching any state. A failed
// allocation leaves the stage unconfigured. Every operation other than
// `init`, `bind`, `bind_host` and the accessors requires CONFIGURED.
//
// ORDERING
// ────────
// `write`, `run` and `read` enqueue work on the device's single ordered
// queue and return a completion token. Passing tokens as `deps` orders work
// across stages; blocking variants wait before returning. Nothing is
// reordered or retried here.

use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::error::{ConfigError, StageError};
use crate::runtime::{Device, KernelArg};
use crate::staging::{Direction, Placement, Role, Slot, StageMemory, Staging};

/// Elements processed per work item.
pub const VECTOR_WIDTH: usize = 4;

/// Validated problem size of a configured stage.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Workspace {
    pub width: u32,
    pub height: u32,
    /// Element count, `width * height`.
    pub len: usize,
    /// Work items, `len / VECTOR_WIDTH`.
    pub global: usize,
}

impl Workspace {
    pub fn new(width: u32, height: u32) -> Result<Self, ConfigError> {
        let len = width as usize * height as usize;
        if len == 0 {
            return Err(ConfigError::ZeroElements { width, height });
        }
        if len % VECTOR_WIDTH != 0 {
            return Err(ConfigError::NotVectorMultiple {
                count: len,
                vector_width: VECTOR_WIDTH,
            });
        }
        Ok(Workspace {
            width,
            height,
            len,
            global: len / VECTOR_WIDTH,
        })
    }
}

/// Construction parameters shared by all stages.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct StageInfo {
    /// Index of the program holding the stage's kernel on its device.
    pub program: usize,
}

/// Lifecycle, buffers and kernel of one stage.
pub struct StageCore<D: Device, R: Role> {
    name: &'static str,
    device: Arc<D>,
    kernel: D::Kernel,
    staging: Staging,
    workspace: Option<Workspace>,
    memory: StageMemory<D::Buffer, R>,
}

impl<D: Device, R: Role> StageCore<D, R> {
    /// Create the stage's kernel. No buffers are allocated until `configure`.
    pub fn new(name: &'static str, device: Arc<D>, info: StageInfo, entry: &str) -> Result<Self, StageError> {
        let kernel = device.create_kernel(info.program, entry)?;
        tracing::debug!(stage = name, program = info.program, entry, "kernel created");
        Ok(StageCore {
            name,
            device,
            kernel,
            staging: Staging::default(),
            workspace: None,
            memory: StageMemory::new(),
        })
    }

    /// Validate dimensions, bring buffers in line with them and bind every
    /// device buffer to its argument slot.
    pub fn configure(&mut self, width: u32, height: u32, staging: Staging) -> Result<(), StageError> {
        let ws = Workspace::new(width, height)?;

        self.workspace = None;
        self.staging = staging;
        self.memory.allocate(&*self.device, self.name, ws.len, staging)?;

        for &role in R::ALL {
            if let Some(buffer) = self.memory.get(Placement::Device, role) {
                self.device
                    .set_arg(&mut self.kernel, role.index() as u32, KernelArg::Buffer(buffer))?;
            }
        }

        tracing::debug!(stage = self.name, width, height, %staging, global = ws.global, "configured");
        self.workspace = Some(ws);
        Ok(())
    }

    /// Bind a scalar argument. Valid in any state.
    pub fn set_scalar(&mut self, index: u32, value: i32) -> Result<(), StageError> {
        self.device.set_arg(&mut self.kernel, index, KernelArg::Int(value))?;
        Ok(())
    }

    fn workspace(&self) -> Result<Workspace, ConfigError> {
        self.workspace.ok_or(ConfigError::NotInitialized { stage: self.name })
    }

    // -----------------------------------------------------------------------
    // Transfers and execution
    // -----------------------------------------------------------------------

    /// Copy `data` (if given) into the role's staging buffer and enqueue the
    /// staging → device transfer after `deps`.
    ///
    /// Returns `Ok(None)` without doing anything when `role` is not an input
    /// or the policy has no input staging.
    pub fn write(
        &mut self,
        role: R,
        data: Option<&[f32]>,
        blocking: bool,
        deps: &[D::Event],
    ) -> Result<Option<D::Event>, StageError> {
        let ws = self.workspace()?;
        if role.direction() != Direction::Input || !self.staging.stages_input() {
            tracing::trace!(stage = self.name, role = role.name(), "write outside staging policy");
            return Ok(None);
        }
        let (Some(host), Some(dev)) = (
            self.memory.get(Placement::Host, role),
            self.memory.get(Placement::Device, role),
        ) else {
            return Ok(None);
        };

        if let Some(data) = data {
            if data.len() < ws.len {
                return Err(ConfigError::InputLength {
                    expected: ws.len,
                    actual: data.len(),
                }
                .into());
            }
            self.device.write_host(host, &data[..ws.len])?;
        }

        let event = self.device.enqueue_copy(host, dev, ws.len, blocking, deps)?;
        tracing::trace!(stage = self.name, role = role.name(), blocking, "write enqueued");
        Ok(Some(event))
    }

    /// Enqueue the kernel over the configured global size after `deps`.
    /// Never blocks and never copies results back.
    pub fn run(&mut self, deps: &[D::Event]) -> Result<D::Event, StageError> {
        let ws = self.workspace()?;
        let event = self.device.enqueue_kernel(&mut self.kernel, ws.global, deps)?;
        tracing::trace!(stage = self.name, global = ws.global, "kernel enqueued");
        Ok(event)
    }

    /// Run and wait for completion, returning the wall time.
    pub fn run_timed(&mut self, deps: &[D::Event]) -> Result<Duration, StageError> {
        let start = Instant::now();
        let event = self.run(deps)?;
        self.device.wait(&[event])?;
        Ok(start.elapsed())
    }

    /// Enqueue the device → staging transfer of an output role after `deps`.
    ///
    /// Returns `Ok(None)` without doing anything when `role` is not an
    /// output or the policy has no output staging. The host view
    /// (`staged`) is valid once the returned token completes.
    pub fn read(
        &mut self,
        role: R,
        blocking: bool,
        deps: &[D::Event],
    ) -> Result<Option<D::Event>, StageError> {
        let ws = self.workspace()?;
        if role.direction() != Direction::Output || !self.staging.stages_output() {
            tracing::trace!(stage = self.name, role = role.name(), "read outside staging policy");
            return Ok(None);
        }
        let (Some(host), Some(dev)) = (
            self.memory.get(Placement::Host, role),
            self.memory.get(Placement::Device, role),
        ) else {
            return Ok(None);
        };

        let event = self.device.enqueue_copy(dev, host, ws.len, blocking, deps)?;
        tracing::trace!(stage = self.name, role = role.name(), blocking, "read enqueued");
        Ok(Some(event))
    }

    /// Blocking read returning the host data, or `None` outside the policy.
    pub fn read_vec(&mut self, role: R) -> Result<Option<Vec<f32>>, StageError> {
        match self.read(role, true, &[])? {
            Some(_) => self.staged(role),
            None => Ok(None),
        }
    }

    /// Current contents of the role's staging buffer, trimmed to the stage
    /// size. `None` when the policy does not stage the role's direction or
    /// the role has no staging buffer.
    pub fn staged(&self, role: R) -> Result<Option<Vec<f32>>, StageError> {
        let ws = self.workspace()?;
        if !self.staging.covers(role.direction()) {
            return Ok(None);
        }
        let Some(host) = self.memory.get(Placement::Host, role) else {
            return Ok(None);
        };
        let mut data = self.device.read_host(host)?;
        data.truncate(ws.len);
        Ok(Some(data))
    }

    /// Fill an input role's staging buffer without enqueueing a transfer.
    /// A later `write(role, None, ..)` moves it to the device.
    ///
    /// Returns `false` when `role` is not an input, the policy has no input
    /// staging, or the role has no staging buffer.
    pub fn stage_input(&mut self, role: R, data: &[f32]) -> Result<bool, StageError> {
        let ws = self.workspace()?;
        if role.direction() != Direction::Input || !self.staging.stages_input() {
            return Ok(false);
        }
        let Some(host) = self.memory.get(Placement::Host, role) else {
            return Ok(false);
        };
        if data.len() < ws.len {
            return Err(ConfigError::InputLength {
                expected: ws.len,
                actual: data.len(),
            }
            .into());
        }
        self.device.write_host(host, &data[..ws.len])?;
        Ok(true)
    }

    // -----------------------------------------------------------------------
    // Buffer handles
    // -----------------------------------------------------------------------

    pub fn get(&self, role: R) -> Option<&D::Buffer> {
        self.memory.get(Placement::Device, role)
    }

    pub fn get_host(&self, role: R) -> Option<&D::Buffer> {
        self.memory.get(Placement::Host, role)
    }

    pub fn slot(&self, placement: Placement, role: R) -> &Slot<D::Buffer> {
        self.memory.slot(placement, role)
    }

    /// Share `buffer` as the role's device buffer. Normally called before
    /// `init`; on a configured stage the kernel argument is rebound at once.
    pub fn bind(&mut self, role: R, buffer: D::Buffer) -> Result<(), StageError> {
        tracing::debug!(stage = self.name, role = role.name(), "binding shared device buffer");
        if self.workspace.is_some() {
            self.device
                .set_arg(&mut self.kernel, role.index() as u32, KernelArg::Buffer(&buffer))?;
        }
        self.memory.bind(Placement::Device, role, buffer);
        Ok(())
    }

    /// Share `buffer` as the role's staging buffer.
    pub fn bind_host(&mut self, role: R, buffer: D::Buffer) {
        tracing::debug!(stage = self.name, role = role.name(), "binding shared staging buffer");
        self.memory.bind(Placement::Host, role, buffer);
    }

    // -----------------------------------------------------------------------
    // Accessors
    // -----------------------------------------------------------------------

    pub fn name(&self) -> &'static str {
        self.name
    }

    pub fn device(&self) -> &Arc<D> {
        &self.device
    }

    pub fn staging(&self) -> Staging {
        self.staging
    }

    pub fn is_configured(&self) -> bool {
        self.workspace.is_some()
    }

    /// Configured width, 0 before `init`.
    pub fn width(&self) -> u32 {
        self.workspace.map_or(0, |ws| ws.width)
    }

    /// Configured height, 0 before `init`.
    pub fn height(&self) -> u32 {
        self.workspace.map_or(0, |ws| ws.height)
    }

    /// Configured element count, 0 before `init`.
    pub fn len(&self) -> usize {
        self.workspace.map_or(0, |ws| ws.len)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Operations common to every stage, delegated to its `StageCore`.
///
/// Stage-specific `init` lives on the concrete type, since its parameters
/// differ per stage.
pub trait Stage {
    type Device: Device;
    type Role: Role;

    fn core(&self) -> &StageCore<Self::Device, Self::Role>;
    fn core_mut(&mut self) -> &mut StageCore<Self::Device, Self::Role>;

    fn write(
        &mut self,
        role: Self::Role,
        data: Option<&[f32]>,
        blocking: bool,
        deps: &[<Self::Device as Device>::Event],
    ) -> Result<Option<<Self::Device as Device>::Event>, StageError> {
        self.core_mut().write(role, data, blocking, deps)
    }

    fn run(
        &mut self,
        deps: &[<Self::Device as Device>::Event],
    ) -> Result<<Self::Device as Device>::Event, StageError> {
        self.core_mut().run(deps)
    }

    fn run_timed(&mut self, deps: &[<Self::Device as Device>::Event]) -> Result<Duration, StageError> {
        self.core_mut().run_timed(deps)
    }

    fn read(
        &mut self,
        role: Self::Role,
        blocking: bool,
        deps: &[<Self::Device as Device>::Event],
    ) -> Result<Option<<Self::Device as Device>::Event>, StageError> {
        self.core_mut().read(role, blocking, deps)
    }

    fn read_vec(&mut self, role: Self::Role) -> Result<Option<Vec<f32>>, StageError> {
        self.core_mut().read_vec(role)
    }

    fn staged(&self, role: Self::Role) -> Result<Option<Vec<f32>>, StageError> {
        self.core().staged(role)
    }

    fn stage_input(&mut self, role: Self::Role, data: &[f32]) -> Result<bool, StageError> {
        self.core_mut().stage_input(role, data)
    }

    fn get(&self, role: Self::Role) -> Option<&<Self::Device as Device>::Buffer> {
        self.core().get(role)
    }

    fn get_host(&self, role: Self::Role) -> Option<&<Self::Device as Device>::Buffer> {
        self.core().get_host(role)
    }

    fn bind(&mut self, role: Self::Role, buffer: <Self::Device as Device>::Buffer) -> Result<(), StageError> {
        self.core_mut().bind(role, buffer)
    }

    fn bind_host(&mut self, role: Self::Role, buffer: <Self::Device as Device>::Buffer) {
        self.core_mut().bind_host(role, buffer)
    }

    fn staging(&self) -> Staging {
        self.core().staging()
    }

    fn is_configured(&self) -> bool {
        self.core().is_configured()
    }

    fn width(&self) -> u32 {
        self.core().width()
    }

    fn height(&self) -> u32 {
        self.core().height()
    }

    fn len(&self) -> usize {
        self.core().len()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
