// runtime.rs — the device interface every stage is written against.
//
// A stage needs very little from the accelerator runtime:
//
//   - buffers, allocated with a memory kind (staging vs kernel-bound),
//   - a way to touch staging memory so it is resident before first use,
//   - host copies into and out of staging memory,
//   - an ordered queue of copies and kernel launches, each returning a
//     completion token that later operations can wait on,
//   - kernels looked up by (program index, entry point) with positional
//     argument slots.
//
// `Device` captures exactly that. Two implementations exist:
//
//   gpu::GpuDevice    wgpu compute on the first real adapter.
//   host::HostDevice  in-process reference device. Executes every
//                     operation eagerly on the calling thread using the
//                     program's host kernels. Tests run against it so the
//                     harness semantics are checked without a GPU.
//
// PROGRAMS
// ────────
// A `Program` is the unit the runtime compiles: one WGSL source plus the
// signature of every kernel in it. The signature lists argument kinds by
// slot; the GPU backend builds its bind group layout from it and the host
// backend validates bindings against it. Each kernel also carries a host
// implementation with identical numeric behaviour.

use std::fmt;

use crate::error::DeviceError;
use crate::host::HostArgs;

/// What a buffer is used for. Decides usage flags on the GPU and which
/// host operations are legal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Memory {
    /// Host-visible staging memory feeding a device input.
    StagingIn,
    /// Host-visible staging memory receiving a device output.
    StagingOut,
    /// Kernel input.
    ReadOnly,
    /// Kernel output.
    WriteOnly,
    ReadWrite,
}

impl Memory {
    pub fn is_staging(self) -> bool {
        matches!(self, Memory::StagingIn | Memory::StagingOut)
    }
}

/// Kind of a positional kernel argument.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArgKind {
    /// Storage buffer the kernel only reads.
    ReadBuffer,
    /// Storage buffer the kernel writes.
    WriteBuffer,
    /// 32-bit signed scalar.
    Int,
}

/// A value bound to a kernel argument slot.
#[derive(Debug)]
pub enum KernelArg<'a, B> {
    Buffer(&'a B),
    Int(i32),
}

/// Host implementation of a kernel: `(arguments, global work size)`.
pub type HostKernelFn = fn(&HostArgs<'_>, usize) -> Result<(), DeviceError>;

/// Signature and host implementation of one kernel entry point.
pub struct KernelDef {
    pub entry: &'static str,
    pub args: &'static [ArgKind],
    pub host: HostKernelFn,
}

impl fmt::Debug for KernelDef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("KernelDef")
            .field("entry", &self.entry)
            .field("args", &self.args)
            .finish()
    }
}

/// A compilable unit of kernels.
#[derive(Debug)]
pub struct Program {
    pub name: &'static str,
    /// WGSL source. `{{WG_SIZE}}` is replaced with the device's workgroup
    /// size before compilation.
    pub source: &'static str,
    pub kernels: &'static [KernelDef],
}

impl Program {
    pub fn kernel(&self, entry: &str) -> Option<&'static KernelDef> {
        self.kernels.iter().find(|k| k.entry == entry)
    }
}

/// The accelerator runtime as seen by a stage.
///
/// All enqueue operations go to one ordered queue. Tokens returned by
/// `enqueue_*` may be passed as `deps` to later operations and to `wait`.
pub trait Device {
    /// Shared handle to a buffer. Cloning aliases the same memory.
    type Buffer: Clone + fmt::Debug;
    type Kernel;
    /// Completion token.
    type Event: Clone + fmt::Debug;

    /// Allocate `len` f32 elements.
    fn alloc(&self, label: &str, len: usize, memory: Memory) -> Result<Self::Buffer, DeviceError>;

    /// Length in f32 elements.
    fn buffer_len(&self, buffer: &Self::Buffer) -> usize;

    fn same_buffer(&self, a: &Self::Buffer, b: &Self::Buffer) -> bool;

    /// Request a non-blocking map/unmap round trip on a staging buffer.
    /// Completed by the next `finish`.
    fn touch(&self, staging: &Self::Buffer) -> Result<(), DeviceError>;

    /// Block until every queued operation and pending touch completes.
    fn finish(&self) -> Result<(), DeviceError>;

    /// Synchronous host copy into staging memory.
    fn write_host(&self, staging: &Self::Buffer, data: &[f32]) -> Result<(), DeviceError>;

    /// Synchronous host copy out of staging memory. Waits for transfers
    /// still targeting the buffer.
    fn read_host(&self, staging: &Self::Buffer) -> Result<Vec<f32>, DeviceError>;

    /// Copy the first `len` elements of `src` into `dst`.
    fn enqueue_copy(
        &self,
        src: &Self::Buffer,
        dst: &Self::Buffer,
        len: usize,
        blocking: bool,
        deps: &[Self::Event],
    ) -> Result<Self::Event, DeviceError>;

    fn create_kernel(&self, program: usize, entry: &str) -> Result<Self::Kernel, DeviceError>;

    fn set_arg(
        &self,
        kernel: &mut Self::Kernel,
        index: u32,
        arg: KernelArg<'_, Self::Buffer>,
    ) -> Result<(), DeviceError>;

    /// Launch over `global` work items. Never blocks.
    fn enqueue_kernel(
        &self,
        kernel: &mut Self::Kernel,
        global: usize,
        deps: &[Self::Event],
    ) -> Result<Self::Event, DeviceError>;

    fn wait(&self, events: &[Self::Event]) -> Result<(), DeviceError>;
}

/// Check a binding against a kernel signature. Shared by both backends.
pub(crate) fn check_arg<B>(
    def: &KernelDef,
    index: u32,
    arg: &KernelArg<'_, B>,
    memory: Option<Memory>,
) -> Result<(), DeviceError> {
    let invalid = |reason: String| DeviceError::InvalidArgument {
        kernel: def.entry,
        index,
        reason,
    };
    let kind = def
        .args
        .get(index as usize)
        .ok_or_else(|| invalid(format!("kernel takes {} arguments", def.args.len())))?;

    match (kind, arg) {
        (ArgKind::Int, KernelArg::Int(_)) => Ok(()),
        (ArgKind::ReadBuffer | ArgKind::WriteBuffer, KernelArg::Buffer(_)) => match memory {
            Some(m) if m.is_staging() => {
                Err(invalid(format!("{m:?} memory cannot be bound to a kernel")))
            }
            _ => Ok(()),
        },
        (expected, _) => Err(invalid(format!("expected {expected:?}"))),
    }
}
