//! # Conveyor Server Library
//!
//! Startup helpers and the built-in callables of the dispatcher process.

pub mod callables;
pub mod startup;
