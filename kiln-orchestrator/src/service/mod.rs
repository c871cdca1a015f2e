//! Service Module
//!
//! The pipeline orchestrator and the backend ports it is generic over.

pub mod pipeline;
pub mod ports;
