// math/program.rs — the elementwise math program.
//
// One WGSL module (src/shaders/math.wgsl) holding both kernels, with the
// signature of each and its host implementation. Argument slots:
//
//   mult    0: a (read)   1: b (read)    2: out (write)
//   pown_   0: in (read)  1: out (write) 2: n (int)

use crate::error::DeviceError;
use crate::host::HostArgs;
use crate::reference;
use crate::runtime::{ArgKind, KernelDef, Program};
use crate::stage::VECTOR_WIDTH;

pub const MULT_ENTRY: &str = "mult";
pub const POWN_ENTRY: &str = "pown_";

static KERNELS: [KernelDef; 2] = [
    KernelDef {
        entry: MULT_ENTRY,
        args: &[ArgKind::ReadBuffer, ArgKind::ReadBuffer, ArgKind::WriteBuffer],
        host: mult_host,
    },
    KernelDef {
        entry: POWN_ENTRY,
        args: &[ArgKind::ReadBuffer, ArgKind::WriteBuffer, ArgKind::Int],
        host: pown_host,
    },
];

/// Elementwise math kernels.
pub static PROGRAM: Program = Program {
    name: "math",
    source: include_str!("../shaders/math.wgsl"),
    kernels: &KERNELS,
};

fn mult_host(args: &HostArgs<'_>, global: usize) -> Result<(), DeviceError> {
    let len = global * VECTOR_WIDTH;
    let a = args.read(0, len)?;
    let b = args.read(1, len)?;
    let mut out = vec![0.0; len];
    reference::mult(&a, &b, &mut out);
    args.write(2, &out)
}

fn pown_host(args: &HostArgs<'_>, global: usize) -> Result<(), DeviceError> {
    let len = global * VECTOR_WIDTH;
    let n = args.int(2)?;
    let input = args.read(0, len)?;
    let mut out = vec![0.0; len];
    reference::pown(&input, &mut out, n);
    args.write(1, &out)
}
