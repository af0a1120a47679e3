// error.rs — error taxonomy shared by every stage and device.
//
// Three classes of outcome leave a stage operation:
//
//   ConfigError   the caller violated a stage contract (bad dimensions,
//                 short input, use before `init`). `init` treats the
//                 dimension errors as fatal and exits the process.
//   DeviceError   the accelerator runtime reported a failure during
//                 allocation, transfer, binding, or execution. Surfaced to
//                 the caller, never retried.
//   Ok(None)      a `write`/`read` outside the configured staging policy.
//                 Defined behaviour, not an error (see staging.rs).
//
// `StageError` wraps the first two so stage methods have one error type.
// `OrExit` terminates at a pipeline boundary with a diagnostic that carries
// a short, greppable code.

use thiserror::Error;

/// Contract violations by the caller of a stage.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConfigError {
    #[error("the image cannot have zeroed dimensions ({width}x{height})")]
    ZeroElements { width: u32, height: u32 },

    #[error("the number of elements in the array has to be a multiple of {vector_width} (got {count})")]
    NotVectorMultiple { count: usize, vector_width: usize },

    #[error("stage `{stage}` used before init")]
    NotInitialized { stage: &'static str },

    #[error("input holds {actual} elements, the stage is configured for {expected}")]
    InputLength { expected: usize, actual: usize },
}

impl ConfigError {
    pub fn code(&self) -> &'static str {
        match self {
            ConfigError::ZeroElements { .. } => "ZERO_ELEMENTS",
            ConfigError::NotVectorMultiple { .. } => "NOT_VECTOR_MULTIPLE",
            ConfigError::NotInitialized { .. } => "NOT_INITIALIZED",
            ConfigError::InputLength { .. } => "INPUT_LENGTH",
        }
    }
}

/// Failures reported by the device runtime.
#[derive(Debug, Error)]
pub enum DeviceError {
    /// No adapter passed the non-CPU filter.
    #[error(
        "no suitable Vulkan adapter found (only CPU/software renderers visible); \
         check that `vulkaninfo` lists a real GPU"
    )]
    NoSuitableAdapter,

    #[error("device request failed: {0}")]
    DeviceRequest(#[from] wgpu::RequestDeviceError),

    #[error("workgroup size {total} exceeds profile limit of {max} invocations")]
    WorkgroupTooLarge { total: u32, max: u32 },

    #[error("out of device memory allocating `{label}` ({bytes} bytes)")]
    OutOfMemory { label: String, bytes: u64 },

    #[error("device validation failed: {0}")]
    Validation(String),

    #[error("no program registered at index {0}")]
    UnknownProgram(usize),

    #[error("program `{program}` has no kernel `{entry}`")]
    UnknownKernel { program: &'static str, entry: String },

    #[error("kernel `{kernel}` argument {index}: {reason}")]
    InvalidArgument {
        kernel: &'static str,
        index: u32,
        reason: String,
    },

    #[error("buffer `{label}`: {reason}")]
    BufferMismatch { label: String, reason: String },

    #[error("buffer map failed: {0}")]
    Map(#[from] wgpu::BufferAsyncError),

    #[error("buffer map callback was dropped before completion")]
    MapDropped,

    #[error("dispatch of {workgroups} workgroups exceeds the per-dimension limit of {max}")]
    DispatchTooLarge { workgroups: u32, max: u32 },
}

impl DeviceError {
    /// Short identifier printed alongside the message at exit.
    pub fn code(&self) -> &'static str {
        match self {
            DeviceError::NoSuitableAdapter => "DEVICE_NOT_FOUND",
            DeviceError::DeviceRequest(_) => "DEVICE_NOT_AVAILABLE",
            DeviceError::WorkgroupTooLarge { .. } => "INVALID_WORK_GROUP_SIZE",
            DeviceError::OutOfMemory { .. } => "MEM_OBJECT_ALLOCATION_FAILURE",
            DeviceError::Validation(_) => "INVALID_OPERATION",
            DeviceError::UnknownProgram(_) => "INVALID_PROGRAM",
            DeviceError::UnknownKernel { .. } => "INVALID_KERNEL_NAME",
            DeviceError::InvalidArgument { .. } => "INVALID_KERNEL_ARGS",
            DeviceError::BufferMismatch { .. } => "INVALID_MEM_OBJECT",
            DeviceError::Map(_) | DeviceError::MapDropped => "MAP_FAILURE",
            DeviceError::DispatchTooLarge { .. } => "INVALID_GLOBAL_WORK_SIZE",
        }
    }
}

/// Error type returned by stage operations.
#[derive(Debug, Error)]
pub enum StageError {
    #[error("configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("device error: {0}")]
    Device(#[from] DeviceError),
}

impl StageError {
    pub fn code(&self) -> &'static str {
        match self {
            StageError::Config(e) => e.code(),
            StageError::Device(e) => e.code(),
        }
    }

    /// Dimension violations, the class `init` refuses to continue past.
    pub fn is_fatal_config(&self) -> bool {
        matches!(
            self,
            StageError::Config(
                ConfigError::ZeroElements { .. } | ConfigError::NotVectorMultiple { .. }
            )
        )
    }
}

/// Print the stage diagnostic and terminate with `EXIT_FAILURE`.
pub(crate) fn fatal(stage: &str, err: &StageError) -> ! {
    tracing::error!(stage, code = err.code(), %err, "fatal configuration error");
    eprintln!("Error[{stage}]: {err}");
    std::process::exit(1)
}

/// Terminate the process on error, printing the message and its code.
///
/// Intended for the outermost pipeline boundary (demos, benches, tools)
/// where there is no finer-grained recovery.
pub trait OrExit<T> {
    fn or_exit(self) -> T;
}

impl<T, E> OrExit<T> for Result<T, E>
where
    E: Into<StageError>,
{
    fn or_exit(self) -> T {
        match self {
            Ok(value) => value,
            Err(e) => {
                let err: StageError = e.into();
                tracing::error!(code = err.code(), %err, "unrecoverable stage error");
                eprintln!("{err} ({})", err.code());
                std::process::exit(1)
            }
        }
    }
}
