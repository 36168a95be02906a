//! Task module - definitions, per-user progress, completion checks and the
//! dispatcher that grants rewards.
//!
//! This module is designed with formal verification in mind:
//! - Task kinds are a closed enum with exhaustive matching
//! - Invariants are documented and enforced in constructors
//! - Pure decisions are separated from IO operations

mod dispatcher;
mod progress;
pub mod task;
mod verification;

pub use dispatcher::{Dispatcher, EvaluationGuard, EvaluationLocks};
pub use progress::{ProgressRecord, TaskView, VisitPhase};
pub use task::{TaskDefinition, TaskError, TaskKind, TaskRecord};
pub use verification::{
    JoinChannelStrategy, Outcome, ReferralStrategy, StrategyInput, Verdict, VisitStep,
    VisitStrategy,
};
