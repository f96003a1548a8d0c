//! Prompts for the backend-assisted pipeline stages.
//!
//! - [`extraction`] - structural analysis of the legacy source
//! - [`generation`] - target-language code, with retry feedback
//! - [`validation`] - behavioral review of the generated code
//! - [`documentation`] - migration narrative
//!
//! The mapper is rule-based and has no prompt.

pub mod documentation;
pub mod extraction;
pub mod generation;
pub mod validation;

pub use documentation::build_documentation_prompt;
pub use extraction::build_extraction_prompt;
pub use generation::{build_generation_prompt, GenerationInputs};
pub use validation::build_validation_prompt;
