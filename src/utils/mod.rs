//! Shared utility functions for legacy-forge.
//!
//! Currently this holds payload extraction from backend responses.

pub mod extraction;

pub use extraction::{
    extract_code_block, extract_json, fenced_blocks, find_matching_brace, try_extract_json,
    ExtractionError, ExtractionResult, FencedBlock,
};
