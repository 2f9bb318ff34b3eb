//! Sansu Coach · analysis core for photographed math word problems.
//!
//! The crate turns a problem text (or a photographed page) into a guided,
//! step-by-step explanation for elementary-school students: difficulty
//! estimation, staged generation against an AI backend, structural
//! verification, and an arithmetic quality gate with bounded repair.

pub mod config;
pub mod domain;
pub mod error;
pub mod expr;
pub mod gate;
pub mod gemini;
pub mod json_repair;
pub mod level;
pub mod openai;
pub mod pipeline;
pub mod prompts;
pub mod provider;
pub mod telemetry;
pub mod transport;
pub mod util;
pub mod verify;

pub use config::ProviderConfig;
pub use domain::{AnalysisResult, DrillResult, ExtractedProblem, Problem, Step};
pub use error::AiError;
pub use pipeline::AnalyzeOptions;
pub use provider::AiProvider;
