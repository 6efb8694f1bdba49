//! A CHIP-8 virtual machine.
//!
//! [`chip8::Chip8`] owns all emulated state. A host loads a ROM, calls
//! [`chip8::Chip8::step`] at its chosen instruction rate, calls
//! [`chip8::Chip8::tick_timers`] at 60 Hz, updates the keypad between steps and
//! reads the framebuffer and sound flag back out.

pub mod chip8;
pub mod error;
pub mod instruction;
pub mod state;

pub use chip8::{Chip8, MachineState};
pub use error::{Fault, FaultKind, LoadError};
pub use state::{Key, Quirks, Register};
