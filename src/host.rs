// host.rs — in-process reference device.
//
// `HostDevice` implements `Device` without an accelerator. Buffers are
// `Vec<f32>` behind a lock, kernels are the programs' host implementations,
// and every enqueued operation executes immediately on the calling thread.
// A completion token is therefore already complete when it is returned;
// blocking and non-blocking variants behave the same.
//
// It serves two purposes:
//   1. The harness (staging policies, ownership, sharing, re-init) is tested
//      against it, deterministically, in CI without a GPU.
//   2. A CPU fallback for callers that want the stage API without wgpu.
//
// The argument checks mirror what the GPU backend enforces, so a binding
// mistake fails the same way on both.

use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;

use parking_lot::RwLock;

use crate::error::DeviceError;
use crate::math;
use crate::runtime::{check_arg, Device, KernelArg, KernelDef, Memory, Program};

const F32_SIZE: u64 = std::mem::size_of::<f32>() as u64;

// ---------------------------------------------------------------------------
// Buffers
// ---------------------------------------------------------------------------

/// Shared handle to host-resident memory.
#[derive(Clone)]
pub struct HostBuffer(Arc<HostBufferInner>);

struct HostBufferInner {
    label: String,
    memory: Memory,
    data: RwLock<Vec<f32>>,
}

impl HostBuffer {
    pub fn label(&self) -> &str {
        &self.0.label
    }

    pub fn memory(&self) -> Memory {
        self.0.memory
    }

    fn len(&self) -> usize {
        self.0.data.read().len()
    }
}

impl std::fmt::Debug for HostBuffer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HostBuffer")
            .field("label", &self.0.label)
            .field("memory", &self.0.memory)
            .field("len", &self.len())
            .finish()
    }
}

// ---------------------------------------------------------------------------
// Kernels
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
enum HostArg {
    Buffer(HostBuffer),
    Int(i32),
}

/// A host kernel with its bound arguments.
#[derive(Debug)]
pub struct HostKernel {
    def: &'static KernelDef,
    args: Vec<Option<HostArg>>,
}

/// Argument view handed to a host kernel implementation.
pub struct HostArgs<'a> {
    kernel: &'static str,
    args: &'a [Option<HostArg>],
}

impl HostArgs<'_> {
    fn invalid(&self, index: u32, reason: impl Into<String>) -> DeviceError {
        DeviceError::InvalidArgument {
            kernel: self.kernel,
            index,
            reason: reason.into(),
        }
    }

    fn buffer(&self, index: u32, len: usize) -> Result<&HostBuffer, DeviceError> {
        match self.args.get(index as usize) {
            Some(Some(HostArg::Buffer(b))) if b.len() >= len => Ok(b),
            Some(Some(HostArg::Buffer(b))) => Err(self.invalid(
                index,
                format!("buffer `{}` holds {} elements, launch needs {len}", b.label(), b.len()),
            )),
            Some(Some(HostArg::Int(_))) => Err(self.invalid(index, "expected a buffer")),
            _ => Err(self.invalid(index, "argument not set")),
        }
    }

    /// Snapshot the first `len` elements of a buffer argument.
    ///
    /// Copying keeps in-place launches (input aliased to output) free of
    /// lock re-entry.
    pub fn read(&self, index: u32, len: usize) -> Result<Vec<f32>, DeviceError> {
        let buf = self.buffer(index, len)?;
        let data = buf.0.data.read();
        Ok(data[..len].to_vec())
    }

    /// Store `data` at the start of a buffer argument.
    pub fn write(&self, index: u32, data: &[f32]) -> Result<(), DeviceError> {
        let buf = self.buffer(index, data.len())?;
        buf.0.data.write()[..data.len()].copy_from_slice(data);
        Ok(())
    }

    pub fn int(&self, index: u32) -> Result<i32, DeviceError> {
        match self.args.get(index as usize) {
            Some(Some(HostArg::Int(v))) => Ok(*v),
            Some(Some(HostArg::Buffer(_))) => Err(self.invalid(index, "expected an int")),
            _ => Err(self.invalid(index, "argument not set")),
        }
    }
}

// ---------------------------------------------------------------------------
// Events
// ---------------------------------------------------------------------------

/// Completion token of the host device. Work has already finished when the
/// token is created; `seq` records its position in the queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct HostEvent {
    pub seq: u64,
}

// ---------------------------------------------------------------------------
// HostDevice
// ---------------------------------------------------------------------------

/// Reference device executing kernels on the calling thread.
#[derive(Debug)]
pub struct HostDevice {
    programs: Vec<&'static Program>,
    /// Largest single allocation accepted, in bytes.
    max_allocation: u64,
    submitted: AtomicU64,
    /// Staging buffers touched since the last `finish`.
    pending_touches: AtomicUsize,
}

impl HostDevice {
    /// Host device with the built-in programs (index 0: math).
    pub fn new() -> Self {
        Self::with_programs(&[&math::PROGRAM])
    }

    pub fn with_programs(programs: &[&'static Program]) -> Self {
        HostDevice {
            programs: programs.to_vec(),
            max_allocation: u64::MAX,
            submitted: AtomicU64::new(0),
            pending_touches: AtomicUsize::new(0),
        }
    }

    /// Cap the size of a single allocation. Requests above the cap fail
    /// with `DeviceError::OutOfMemory`, as an exhausted device would.
    pub fn with_memory_limit(mut self, bytes: u64) -> Self {
        self.max_allocation = bytes;
        self
    }

    /// Number of operations enqueued so far.
    pub fn submitted(&self) -> u64 {
        self.submitted.load(Ordering::Relaxed)
    }

    /// Touched staging buffers still waiting for `finish`.
    pub fn pending_touches(&self) -> usize {
        self.pending_touches.load(Ordering::Relaxed)
    }

    fn next_event(&self) -> HostEvent {
        HostEvent {
            seq: self.submitted.fetch_add(1, Ordering::Relaxed) + 1,
        }
    }
}

impl Default for HostDevice {
    fn default() -> Self {
        Self::new()
    }
}

fn require_staging(buffer: &HostBuffer) -> Result<(), DeviceError> {
    if buffer.memory().is_staging() {
        Ok(())
    } else {
        Err(DeviceError::BufferMismatch {
            label: buffer.label().to_string(),
            reason: format!("{:?} memory is not host visible", buffer.memory()),
        })
    }
}

impl Device for HostDevice {
    type Buffer = HostBuffer;
    type Kernel = HostKernel;
    type Event = HostEvent;

    fn alloc(&self, label: &str, len: usize, memory: Memory) -> Result<HostBuffer, DeviceError> {
        let bytes = len as u64 * F32_SIZE;
        if bytes > self.max_allocation {
            return Err(DeviceError::OutOfMemory {
                label: label.to_string(),
                bytes,
            });
        }
        Ok(HostBuffer(Arc::new(HostBufferInner {
            label: label.to_string(),
            memory,
            data: RwLock::new(vec![0.0; len]),
        })))
    }

    fn buffer_len(&self, buffer: &HostBuffer) -> usize {
        buffer.len()
    }

    fn same_buffer(&self, a: &HostBuffer, b: &HostBuffer) -> bool {
        Arc::ptr_eq(&a.0, &b.0)
    }

    fn touch(&self, staging: &HostBuffer) -> Result<(), DeviceError> {
        require_staging(staging)?;
        self.pending_touches.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    fn finish(&self) -> Result<(), DeviceError> {
        self.pending_touches.store(0, Ordering::Relaxed);
        Ok(())
    }

    fn write_host(&self, staging: &HostBuffer, data: &[f32]) -> Result<(), DeviceError> {
        require_staging(staging)?;
        let mut dst = staging.0.data.write();
        if data.len() > dst.len() {
            return Err(DeviceError::BufferMismatch {
                label: staging.label().to_string(),
                reason: format!("{} elements do not fit in {}", data.len(), dst.len()),
            });
        }
        dst[..data.len()].copy_from_slice(data);
        Ok(())
    }

    fn read_host(&self, staging: &HostBuffer) -> Result<Vec<f32>, DeviceError> {
        require_staging(staging)?;
        Ok(staging.0.data.read().clone())
    }

    fn enqueue_copy(
        &self,
        src: &HostBuffer,
        dst: &HostBuffer,
        len: usize,
        _blocking: bool,
        _deps: &[HostEvent],
    ) -> Result<HostEvent, DeviceError> {
        for buf in [src, dst] {
            if buf.len() < len {
                return Err(DeviceError::BufferMismatch {
                    label: buf.label().to_string(),
                    reason: format!("copy of {len} elements exceeds {}", buf.len()),
                });
            }
        }
        if !self.same_buffer(src, dst) {
            let from = src.0.data.read();
            dst.0.data.write()[..len].copy_from_slice(&from[..len]);
        }
        let event = self.next_event();
        tracing::trace!(src = src.label(), dst = dst.label(), len, seq = event.seq, "host copy");
        Ok(event)
    }

    fn create_kernel(&self, program: usize, entry: &str) -> Result<HostKernel, DeviceError> {
        let program = self
            .programs
            .get(program)
            .ok_or(DeviceError::UnknownProgram(program))?;
        let def = program.kernel(entry).ok_or_else(|| DeviceError::UnknownKernel {
            program: program.name,
            entry: entry.to_string(),
        })?;
        Ok(HostKernel {
            def,
            args: vec![None; def.args.len()],
        })
    }

    fn set_arg(
        &self,
        kernel: &mut HostKernel,
        index: u32,
        arg: KernelArg<'_, HostBuffer>,
    ) -> Result<(), DeviceError> {
        let memory = match &arg {
            KernelArg::Buffer(b) => Some(b.memory()),
            KernelArg::Int(_) => None,
        };
        check_arg(kernel.def, index, &arg, memory)?;
        kernel.args[index as usize] = Some(match arg {
            KernelArg::Buffer(b) => HostArg::Buffer(b.clone()),
            KernelArg::Int(v) => HostArg::Int(v),
        });
        Ok(())
    }

    fn enqueue_kernel(
        &self,
        kernel: &mut HostKernel,
        global: usize,
        _deps: &[HostEvent],
    ) -> Result<HostEvent, DeviceError> {
        let args = HostArgs {
            kernel: kernel.def.entry,
            args: &kernel.args,
        };
        (kernel.def.host)(&args, global)?;
        let event = self.next_event();
        tracing::trace!(kernel = kernel.def.entry, global, seq = event.seq, "host launch");
        Ok(event)
    }

    fn wait(&self, _events: &[HostEvent]) -> Result<(), DeviceError> {
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
