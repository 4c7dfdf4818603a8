//! Shared utility functions for automl-forge.
//!
//! Currently the parsing helpers for LLM responses.

pub mod extraction;

pub use extraction::{extract_code, extract_json_object, fenced_blocks, find_matching_brace, FencedBlock};
