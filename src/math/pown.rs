// math/pown.rs — elementwise integer power stage.
//
//   out[i] = in[i] ^ n
//
// `n` is a kernel scalar in argument slot 2. It may be changed at any time
// with `set_exponent`; the new value applies from the next `run` and no
// buffer is touched.

use std::sync::Arc;

use crate::error::{fatal, StageError};
use crate::math::program::POWN_ENTRY;
use crate::runtime::Device;
use crate::stage::{Stage, StageCore, StageInfo};
use crate::staging::{Direction, Role, Staging};

/// Argument slot of the exponent.
const EXPONENT_SLOT: u32 = 2;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PownRole {
    In,
    Out,
}

impl Role for PownRole {
    const ALL: &'static [Self] = &[PownRole::In, PownRole::Out];

    fn index(self) -> usize {
        match self {
            PownRole::In => 0,
            PownRole::Out => 1,
        }
    }

    fn direction(self) -> Direction {
        match self {
            PownRole::In => Direction::Input,
            PownRole::Out => Direction::Output,
        }
    }

    fn name(self) -> &'static str {
        match self {
            PownRole::In => "in",
            PownRole::Out => "out",
        }
    }
}

/// Elementwise integer power of an array.
pub struct Pown<D: Device> {
    core: StageCore<D, PownRole>,
    n: i32,
}

impl<D: Device> Pown<D> {
    pub const NAME: &'static str = "Pown";

    /// Create the stage with exponent 1.
    pub fn new(device: Arc<D>, info: StageInfo) -> Result<Self, StageError> {
        let mut stage = Pown {
            core: StageCore::new(Self::NAME, device, info, POWN_ENTRY)?,
            n: 1,
        };
        stage.core.set_scalar(EXPONENT_SLOT, stage.n)?;
        Ok(stage)
    }

    /// Configure for `width * height` elements with exponent `n`.
    ///
    /// Dimension errors terminate the process with a diagnostic; device
    /// errors are returned.
    pub fn init(&mut self, width: u32, height: u32, n: i32, staging: Staging) -> Result<(), StageError> {
        match self.try_init(width, height, n, staging) {
            Err(e) if e.is_fatal_config() => fatal(Self::NAME, &e),
            other => other,
        }
    }

    /// Like `init`, but returns dimension errors instead of exiting.
    pub fn try_init(&mut self, width: u32, height: u32, n: i32, staging: Staging) -> Result<(), StageError> {
        self.core.configure(width, height, staging)?;
        self.set_exponent(n)
    }

    pub fn exponent(&self) -> i32 {
        self.n
    }

    /// Store `n` and rebind it to the kernel. Effective from the next
    /// `run`; on an unconfigured stage it is overridden by `init`'s `n`.
    pub fn set_exponent(&mut self, n: i32) -> Result<(), StageError> {
        self.core.set_scalar(EXPONENT_SLOT, n)?;
        self.n = n;
        tracing::debug!(stage = Self::NAME, n, "exponent set");
        Ok(())
    }
}

impl<D: Device> Stage for Pown<D> {
    type Device = D;
    type Role = PownRole;

    fn core(&self) -> &StageCore<D, PownRole> {
        &self.core
    }

    fn core_mut(&mut self) -> &mut StageCore<D, PownRole> {
        &mut self.core
    }
}
