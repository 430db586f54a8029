//! Loan lifecycle orchestration

pub mod engine;
pub mod machine;

#[cfg(test)]
mod scenarios;

pub use engine::{Adapters, EngineConfig, LoanEngine};
pub use machine::{next_state, Trigger};
