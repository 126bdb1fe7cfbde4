//! Session lifecycle tracking: records quiz interactions against an explicit
//! session handle and persists them through a tracking sink.

pub mod state_machine;
pub mod tracker;

pub use state_machine::{SessionState, SessionStateMachine};
pub use tracker::{PageContext, QuizTracker, SessionHandle};
