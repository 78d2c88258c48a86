//! Outbound services.

pub mod codegen;

pub use codegen::{detect_scene_names, strip_code_fences, CodeGenerator, GeminiClient};
