//! Repository Module
//!
//! Persistence of the pipeline run record and the statistics derived from it.

pub mod state;
pub mod stats;
