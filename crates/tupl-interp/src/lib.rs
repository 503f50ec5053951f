//! Predicate/update interpreter.
//!
//! A register machine with eight registers executed against one row as part
//! of a row request. Programs have five regions in a fixed order:
//! initial-read, main-execution, final-update, final-read, subroutines.
//! Output is the initial-read values followed by the final-read values;
//! final-update values go through the attribute codec exactly like an
//! explicit update list.

pub mod engine;
pub mod opcode;
pub mod program;

pub use engine::{InterpLimits, InterpOutcome, Interpreter, RegValue, RunOptions};
pub use opcode::{Cond, Instr, NUM_REGS, Opcode, Reg};
pub use program::{InterpretedProgram, Label, ProgramBuilder, Subroutine};
