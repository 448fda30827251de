//! Self-play debate engine.
//!
//! Two personas argue through a fixed stage schedule. Each round the
//! orchestrator queries both personas through a [`ModelClient`], has a
//! [`Judge`] score the exchange, classifies the interaction dynamics and
//! nudges each persona's tactic policy toward what scored well.

pub mod collaborator;
pub mod conversation;
pub mod dynamics;
pub mod error;
pub mod evaluation;
pub mod journal;
pub mod orchestrator;
pub mod persistence;
pub mod persona;
pub mod planning;
pub mod policy;
pub mod prompts;
pub mod schedule;
pub mod session;
pub mod skills;
pub mod text;

pub use collaborator::{
    Judge, JudgeError, JudgeRequest, ModelClient, ModelRequest, ModelResponse, TransportError,
    Usage,
};
pub use error::{EngineError, RetryCategory, RoundError};
pub use evaluation::{FinalEvaluation, RoundEvaluation, Winner};
pub use orchestrator::{EngineConfig, RoundOrchestrator, RoundOutcome, StateLayout, TopicSource};
pub use persona::{PerPersona, Persona};
pub use schedule::{ScheduleConfig, Stage, StageSchedule};
pub use session::{Session, StatusReport};
