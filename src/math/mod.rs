// math/ — elementwise arithmetic stages.
//
//   Mult   out = a * b         (binary, no parameters)
//   Pown   out = in ^ n        (unary, runtime-mutable integer exponent)
//
// Both run on any `Device` and share the program in program.rs.

pub mod mult;
pub mod pown;
pub mod program;

pub use mult::{Mult, MultRole};
pub use pown::{Pown, PownRole};
pub use program::PROGRAM;
