//! Capability Runtime
//!
//! The live half of the self-extension system. A capability is a named Rhai
//! script registered in the durable store; this module keeps the in-memory
//! mapping from capability name to an invocable handle and gates every new
//! or updated script through a three-stage validation pipeline before it is
//! trusted.
//!
//! ```text
//! write_capability ──► Validator ──► store upsert ──► Registry.reload_one
//!                        │ syntax
//!                        │ binding
//!                        │ shape
//!                        └── structured rejection (returned to the model)
//! ```
//!
//! A capability is either absent from the registry or fully loaded and
//! invocable; there is no partially-registered state visible to callers.

pub mod registry;
pub mod validator;

pub use registry::{CapabilityRegistry, LoadReport, LoadedCapability};
pub use validator::{ValidationError, ValidationOutcome, Validator};
