//! Engines shipped with the decompiler.

pub mod stackvm;

pub use stackvm::StackVm;
