//! Pure logic for the RPI engine. Nothing here touches the filesystem or spawns processes.

pub mod complexity;
pub mod cycle_failure;
pub mod executor_select;
pub mod gate_policy;
pub mod phase;
pub mod queue;
