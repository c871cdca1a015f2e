//! Core domain types
//!
//! These types are shared between the state store (which persists them), the
//! orchestrator (which drives them through the stages) and the CLI (which
//! renders them).

pub mod image;
pub mod log;
pub mod run;
