// Plan scheduler module: trigger evaluation and execution hand-off

pub mod engine;
mod plan;

pub use engine::{ExecutionOutcome, Firing, PlanExecutor, PlanScheduler, TickReport};
