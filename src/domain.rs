//! Domain models shared by the pipeline: difficulty profile, steps, problems,
//! analysis results, and drill (practice problem) results.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Coarse difficulty tier driving model selection and step-count policy.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Difficulty {
  Easy,
  Normal,
  Hard,
}

impl Default for Difficulty {
  fn default() -> Self { Difficulty::Normal }
}

impl std::fmt::Display for Difficulty {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    match self {
      Difficulty::Easy => write!(f, "easy"),
      Difficulty::Normal => write!(f, "normal"),
      Difficulty::Hard => write!(f, "hard"),
    }
  }
}

/// Boolean keyword signals plus a conditional-connective count.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct LevelSignals {
  pub has_fraction: bool,
  pub has_ratio: bool,
  pub has_percentage: bool,
  pub has_area: bool,
  pub has_unit_rate: bool,
  pub has_gcd: bool,
  pub has_lcm: bool,
  pub has_geometry: bool,
  pub has_graph: bool,
  pub num_conditions: u32,
}

/// Result of the difficulty estimator. Immutable once derived; the pipeline
/// only reads it to choose model tier, step-count policy, and vocabulary.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct DifficultyProfile {
  pub difficulty: Difficulty,
  pub tags: Vec<String>,
  pub confidence: f64,
  pub signals: LevelSignals,
}

/// Optional intermediate calculation attached to a step.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct CalculationRecord {
  pub expression: String,
  pub result: f64,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub unit: Option<String>,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub note: Option<String>,
}

/// One pedagogical step. `hint` never states a computed result; `solution`
/// never contains raw arithmetic; the numbers live in `calculation`.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Step {
  pub order: u32,
  pub hint: String,
  pub solution: String,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub calculation: Option<CalculationRecord>,
}

/// Short named technique hint shown above the steps.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct MethodHint {
  pub label: String,
  pub pitch: String,
}

/// One analyzed problem. `final_answer` is the only field allowed to state a
/// definitive conclusion.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Problem {
  pub id: String,
  pub problem_text: String,
  pub steps: Vec<Step>,
  pub final_answer: String,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub method_hint: Option<MethodHint>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AnalysisStatus {
  Success,
  Error,
}

/// Top-level unit returned by the pipeline. `debug` is attached only when the
/// caller requested debug mode.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct AnalysisResult {
  pub status: AnalysisStatus,
  pub problems: Vec<Problem>,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub meta: Option<DifficultyProfile>,
  #[serde(default, rename = "_debug", skip_serializing_if = "Option::is_none")]
  pub debug: Option<BTreeMap<String, serde_json::Value>>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct DrillProblem {
  pub question: String,
  pub answer: String,
  pub explanation: String,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct DrillResult {
  pub problems: Vec<DrillProblem>,
}

/// One problem transcribed from an image by the extraction stage.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ExtractedProblem {
  pub id: String,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub title: Option<String>,
  pub problem_text: String,
}

pub fn new_problem_id() -> String {
  format!("problem_{}", Uuid::new_v4().simple())
}
