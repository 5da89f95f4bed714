//! Compute-API trait and the types that cross it

mod traits;
mod types;

pub use traits::ComputeApi;
pub use types::{ContextHandle, KernelHandle, MemFlags, MemHandle, ProgramHandle, WorkRange};
