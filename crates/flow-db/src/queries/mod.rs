//! Query modules, one per table family.

pub mod dead_letters;
pub mod executions;
pub mod tasks;
pub mod workers;
pub mod workflows;
