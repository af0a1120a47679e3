// gpu/mod.rs — wgpu implementation of the `Device` trait.
//
// The stages in the parent crate are written against `runtime::Device` and
// never touch wgpu directly. This module supplies the accelerator behind it:
//
//   device.rs  adapter selection, profiles, program compilation, the trait
//   buffer.rs  buffers, host mapping, queue copies
//   kernel.rs  pipelines, positional arguments, dispatch
//
// The host reference device (crate::host) runs the same programs on the
// CPU; every GPU result is validated against it in tests/test_gpu.rs.

pub mod buffer;
pub mod device;
pub mod kernel;

pub use buffer::GpuBuffer;
pub use device::{AdapterInfo, DeviceProfile, GpuDevice, GpuEvent, WorkgroupSize};
pub use kernel::GpuKernel;
