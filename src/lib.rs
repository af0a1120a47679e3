// gf-stages: staged buffer execution harness for GPU image pipelines
//
// Each building block is a compute stage owning one kernel, host staging
// memory and device memory, with the lifecycle init → write → run → read.
// Stages chain without host round trips by sharing device buffers.

pub mod error;
pub mod runtime;
pub mod host;
pub mod gpu;
pub mod staging;
pub mod stage;
pub mod reference;
pub mod math;

pub use error::{ConfigError, DeviceError, OrExit, StageError};
pub use gpu::{DeviceProfile, GpuDevice};
pub use host::HostDevice;
pub use math::{Mult, MultRole, Pown, PownRole};
pub use runtime::{Device, Memory};
pub use stage::{Stage, StageInfo, VECTOR_WIDTH};
pub use staging::{Placement, Staging};
