//! Pipeline stages.
//!
//! - [`ExtractorAgent`] - structural analysis of the legacy source
//! - [`MapperAgent`] - rule-based translation plan
//! - [`GeneratorAgent`] - target-language code, one attempt per run
//! - [`ValidatorAgent`] - static checks plus backend-reported tests
//! - [`DocumenterAgent`] - migration report

pub mod documenter;
pub mod error;
pub mod extractor;
pub mod generator;
pub mod mapper;
pub mod scan;
pub mod validator;

pub use documenter::DocumenterAgent;
pub use error::{FailureCategory, StageError, StageResult};
pub use extractor::ExtractorAgent;
pub use generator::GeneratorAgent;
pub use mapper::{map_schema, MapperAgent};
pub use scan::{scan, LexicalScan};
pub use validator::ValidatorAgent;
