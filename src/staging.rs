// staging.rs — staging policy, buffer roles, and per-role buffer slots.
//
// Every stage addresses its buffers by ROLE (`MultRole::InA`, ...). A role
// has a direction (input or output) and an index, which is also its kernel
// argument slot. Each role owns up to two buffers:
//
//   Placement::Host    host-visible staging memory, used only for transfers
//   Placement::Device  kernel-bound memory, always present after init
//
// STAGING POLICY
// ──────────────
// Which staging buffers exist is a pure function of the policy and the
// role's direction:
//
//              Input roles   Output roles
//   None           -              -
//   Input          ✓              -
//   Output         -              ✓
//   InputOutput    ✓              ✓
//
// `write`/`read` on a role without staging are silent no-ops.
//
// OWNERSHIP
// ─────────
// A slot is `Unbound`, `Owned` (allocated by this stage) or `Shared`
// (bound by the caller before init, typically another stage's buffer).
// Only owned buffers are ever reallocated or released. Shared buffers are
// used verbatim, whatever their size.

use std::fmt;
use std::marker::PhantomData;

use crate::error::DeviceError;
use crate::runtime::{Device, Memory};

/// Which host/device transfers a stage performs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum Staging {
    /// No staging buffers; the caller moves data via shared device buffers.
    None,
    /// Staging for input roles only.
    Input,
    /// Staging for output roles only.
    Output,
    /// Staging for every role.
    #[default]
    InputOutput,
}

impl Staging {
    /// Whether roles of `direction` get a staging buffer under this policy.
    pub fn covers(self, direction: Direction) -> bool {
        match (self, direction) {
            (Staging::InputOutput, _) => true,
            (Staging::Input, Direction::Input) => true,
            (Staging::Output, Direction::Output) => true,
            _ => false,
        }
    }

    pub fn stages_input(self) -> bool {
        self.covers(Direction::Input)
    }

    pub fn stages_output(self) -> bool {
        self.covers(Direction::Output)
    }
}

impl fmt::Display for Staging {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Staging::None => "none",
            Staging::Input => "input",
            Staging::Output => "output",
            Staging::InputOutput => "input+output",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Direction {
    /// Read by the kernel, written by the host.
    Input,
    /// Written by the kernel, read by the host.
    Output,
}

/// Which of a role's two buffers an operation addresses.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Placement {
    Host,
    Device,
}

/// A closed set of buffer roles for one stage kind.
pub trait Role: Copy + Eq + fmt::Debug + 'static {
    /// Every role, ordered by `index`.
    const ALL: &'static [Self];

    /// Position in the slot tables; equal to the kernel argument slot.
    fn index(self) -> usize;

    fn direction(self) -> Direction;

    fn name(self) -> &'static str;

    /// Memory kind of the role's kernel-bound buffer.
    fn device_memory(self) -> Memory {
        match self.direction() {
            Direction::Input => Memory::ReadOnly,
            Direction::Output => Memory::WriteOnly,
        }
    }

    /// Memory kind of the role's staging buffer.
    fn staging_memory(self) -> Memory {
        match self.direction() {
            Direction::Input => Memory::StagingIn,
            Direction::Output => Memory::StagingOut,
        }
    }
}

/// Binding state of one buffer.
#[derive(Debug, Clone, Default)]
pub enum Slot<B> {
    #[default]
    Unbound,
    /// Allocated by the stage; reallocated when the size changes.
    Owned(B),
    /// Provided by the caller; never reallocated or released here.
    Shared(B),
}

impl<B> Slot<B> {
    pub fn buffer(&self) -> Option<&B> {
        match self {
            Slot::Unbound => None,
            Slot::Owned(b) | Slot::Shared(b) => Some(b),
        }
    }

    pub fn is_shared(&self) -> bool {
        matches!(self, Slot::Shared(_))
    }

    pub fn is_owned(&self) -> bool {
        matches!(self, Slot::Owned(_))
    }
}

/// Host and device slot tables of a stage, indexed by role.
#[derive(Debug)]
pub struct StageMemory<B, R> {
    host: Vec<Slot<B>>,
    device: Vec<Slot<B>>,
    _role: PhantomData<R>,
}

impl<B: Clone, R: Role> StageMemory<B, R> {
    pub fn new() -> Self {
        StageMemory {
            host: R::ALL.iter().map(|_| Slot::Unbound).collect(),
            device: R::ALL.iter().map(|_| Slot::Unbound).collect(),
            _role: PhantomData,
        }
    }

    fn table(&self, placement: Placement) -> &[Slot<B>] {
        match placement {
            Placement::Host => &self.host,
            Placement::Device => &self.device,
        }
    }

    fn table_mut(&mut self, placement: Placement) -> &mut [Slot<B>] {
        match placement {
            Placement::Host => &mut self.host,
            Placement::Device => &mut self.device,
        }
    }

    pub fn slot(&self, placement: Placement, role: R) -> &Slot<B> {
        &self.table(placement)[role.index()]
    }

    pub fn get(&self, placement: Placement, role: R) -> Option<&B> {
        self.slot(placement, role).buffer()
    }

    /// Use `buffer` for `role` instead of allocating one.
    pub fn bind(&mut self, placement: Placement, role: R, buffer: B) {
        self.table_mut(placement)[role.index()] = Slot::Shared(buffer);
    }

    /// Bring every slot in line with `len` elements under `staging`.
    ///
    /// Staging buffers the policy covers are allocated if missing (or owned
    /// with the wrong size) and touched with one map/unmap round trip,
    /// completed by a single `finish`. Owned staging buffers the policy no
    /// longer covers are released. Every device slot is then ensured with
    /// its role's memory kind.
    pub fn allocate<D>(
        &mut self,
        device: &D,
        stage: &str,
        len: usize,
        staging: Staging,
    ) -> Result<(), DeviceError>
    where
        D: Device<Buffer = B>,
    {
        let mut touched = 0usize;
        let staged = self.stage_host(device, stage, len, staging, &mut touched);
        if touched > 0 {
            // Touched buffers must be completed even when a later role failed.
            if let Err(err) = device.finish() {
                if staged.is_ok() {
                    return Err(err);
                }
                tracing::warn!(stage, %err, "finish after failed staging setup");
            }
        }
        staged?;

        for &role in R::ALL {
            let label = format!("{stage}::{}", role.name());
            ensure(device, &mut self.device[role.index()], &label, len, role.device_memory())?;
        }
        Ok(())
    }

    /// Ensure and touch the staging buffers `staging` covers, counting the
    /// touches in `touched` so the caller can finish them on any outcome.
    fn stage_host<D>(
        &mut self,
        device: &D,
        stage: &str,
        len: usize,
        staging: Staging,
        touched: &mut usize,
    ) -> Result<(), DeviceError>
    where
        D: Device<Buffer = B>,
    {
        for &role in R::ALL {
            let slot = &mut self.host[role.index()];
            if staging.covers(role.direction()) {
                let label = format!("{stage}::{}::staging", role.name());
                let buffer = ensure(device, slot, &label, len, role.staging_memory())?;
                device.touch(buffer)?;
                *touched += 1;
            } else if slot.is_owned() {
                tracing::debug!(stage, role = role.name(), "releasing staging buffer outside policy");
                *slot = Slot::Unbound;
            }
        }
        Ok(())
    }
}

impl<B: Clone, R: Role> Default for StageMemory<B, R> {
    fn default() -> Self {
        Self::new()
    }
}

/// Make `slot` hold a usable buffer of `len` elements.
fn ensure<'s, D: Device>(
    device: &D,
    slot: &'s mut Slot<D::Buffer>,
    label: &str,
    len: usize,
    memory: Memory,
) -> Result<&'s D::Buffer, DeviceError> {
    let reuse = match &*slot {
        Slot::Shared(b) => {
            let have = device.buffer_len(b);
            if have < len {
                tracing::warn!(buffer = label, have, need = len, "shared buffer smaller than stage size");
            }
            true
        }
        Slot::Owned(b) => device.buffer_len(b) == len,
        Slot::Unbound => false,
    };
    if !reuse {
        let bytes = len * std::mem::size_of::<f32>();
        tracing::debug!(buffer = label, ?memory, bytes, "allocating");
        *slot = Slot::Owned(device.alloc(label, len, memory)?);
    }
    slot.buffer().ok_or_else(|| DeviceError::BufferMismatch {
        label: label.to_string(),
        reason: "slot left unbound after allocation".to_string(),
    })
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
