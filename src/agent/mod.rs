//! Agent Loop
//!
//! One turn = one full cycle from an input (user text or a heartbeat tick)
//! to a final reply or a bounded termination:
//!
//! ```text
//! GATHER ──► MODEL_CALL ──► DONE
//!               │  ▲
//!               ▼  │
//!             DISPATCH (sequential, failure-isolated)
//! ```
//!
//! The loop is the sole writer of the conversation log and emits a lazy
//! stream of typed events so callers can watch progress.

pub mod heartbeat;
pub mod turn;

pub use heartbeat::Heartbeat;
pub use turn::{Agent, AgentEvent};
