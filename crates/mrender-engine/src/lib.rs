//! Manim CLI wrapper.
//!
//! This crate provides:
//! - Type-safe render command building (renderer backend, quality preset)
//! - Process spawning with stdout and stderr merged into one ordered line stream
//! - Graceful termination (SIGTERM, then kill)
//! - Detection of the "File ready at" artifact marker

pub mod command;
pub mod error;
pub mod marker;

pub use command::{check_engine, Quality, RenderCommand, RenderProcess, RenderRunner, Renderer};
pub use error::{EngineError, EngineResult};
pub use marker::{scan_line, MarkerScanner};
