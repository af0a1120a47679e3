// math/mult.rs — elementwise binary multiply stage.
//
//   out[i] = a[i] * b[i]
//
// Roles InA and InB are kernel inputs, Out is the kernel output. With the
// default policy all three have staging buffers; `write` fills the inputs
// and `read` fetches the output.

use std::sync::Arc;

use crate::error::{fatal, StageError};
use crate::math::program::MULT_ENTRY;
use crate::runtime::Device;
use crate::stage::{Stage, StageCore, StageInfo};
use crate::staging::{Direction, Role, Staging};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MultRole {
    InA,
    InB,
    Out,
}

impl Role for MultRole {
    const ALL: &'static [Self] = &[MultRole::InA, MultRole::InB, MultRole::Out];

    fn index(self) -> usize {
        match self {
            MultRole::InA => 0,
            MultRole::InB => 1,
            MultRole::Out => 2,
        }
    }

    fn direction(self) -> Direction {
        match self {
            MultRole::InA | MultRole::InB => Direction::Input,
            MultRole::Out => Direction::Output,
        }
    }

    fn name(self) -> &'static str {
        match self {
            MultRole::InA => "in_a",
            MultRole::InB => "in_b",
            MultRole::Out => "out",
        }
    }
}

/// Elementwise product of two arrays.
pub struct Mult<D: Device> {
    core: StageCore<D, MultRole>,
}

impl<D: Device> Mult<D> {
    pub const NAME: &'static str = "Mult";

    pub fn new(device: Arc<D>, info: StageInfo) -> Result<Self, StageError> {
        Ok(Mult {
            core: StageCore::new(Self::NAME, device, info, MULT_ENTRY)?,
        })
    }

    /// Configure for `width * height` elements.
    ///
    /// Dimension errors terminate the process with a diagnostic; device
    /// errors are returned.
    pub fn init(&mut self, width: u32, height: u32, staging: Staging) -> Result<(), StageError> {
        match self.try_init(width, height, staging) {
            Err(e) if e.is_fatal_config() => fatal(Self::NAME, &e),
            other => other,
        }
    }

    /// Like `init`, but returns dimension errors instead of exiting.
    pub fn try_init(&mut self, width: u32, height: u32, staging: Staging) -> Result<(), StageError> {
        self.core.configure(width, height, staging)
    }
}

impl<D: Device> Stage for Mult<D> {
    type Device = D;
    type Role = MultRole;

    fn core(&self) -> &StageCore<D, MultRole> {
        &self.core
    }

    fn core_mut(&mut self) -> &mut StageCore<D, MultRole> {
        &mut self.core
    }
}
