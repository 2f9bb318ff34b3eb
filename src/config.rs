//! Runtime configuration: backend choice, model tiers, and pipeline policy.
//!
//! Everything is resolved once at startup. Env picks the backend and models;
//! an optional TOML file (POLICY_CONFIG_PATH) overrides the tunable policy
//! knobs (timeouts, retries, token budgets, prompt rule strings). Stage logic
//! never reads the environment directly.

use std::time::Duration;

use serde::Deserialize;
use tracing::{error, info};

use crate::domain::Difficulty;
use crate::prompts::PromptPolicy;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Backend {
  OpenAi,
  Gemini,
}

impl Backend {
  pub fn name(self) -> &'static str {
    match self {
      Backend::OpenAi => "openai",
      Backend::Gemini => "gemini",
    }
  }
}

/// Fast tier for routine calls, pro tier for hard problems, geometry, paying
/// callers, and retry escalation.
#[derive(Clone, Debug)]
pub struct ModelTier {
  pub fast: String,
  pub pro: String,
}

/// Timing, retry, and budget knobs. Defaults reflect the tuned production
/// values; override via TOML when experimenting.
#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct PipelinePolicy {
  pub plan_timeout_secs: u64,
  pub header_timeout_secs: u64,
  pub chunk_timeout_secs: u64,
  /// Wall-clock budget for the whole steps stage across all chunks.
  pub steps_total_budget_secs: u64,
  pub single_shot_timeout_secs: u64,
  pub extraction_timeout_secs: u64,
  pub drill_timeout_secs: u64,
  /// Wall-clock guard for one analysis; past this the pipeline stops starting
  /// new stages and degrades to its shortest remaining path.
  pub total_budget_secs: u64,
  /// Retries after the first attempt (so attempts = max_retries + 1).
  pub max_retries: u32,
  /// Chunk size halves on each steps-stage failure: 4, then 2, then 1.
  pub initial_chunk_size: usize,
  pub max_tokens_easy: u32,
  pub max_tokens_normal: u32,
  pub max_tokens_hard: u32,
}

impl Default for PipelinePolicy {
  fn default() -> Self {
    Self {
      plan_timeout_secs: 10,
      header_timeout_secs: 25,
      chunk_timeout_secs: 40,
      steps_total_budget_secs: 25,
      single_shot_timeout_secs: 30,
      extraction_timeout_secs: 25,
      drill_timeout_secs: 30,
      total_budget_secs: 30,
      max_retries: 2,
      initial_chunk_size: 4,
      max_tokens_easy: 1200,
      max_tokens_normal: 2200,
      max_tokens_hard: 3200,
    }
  }
}

impl PipelinePolicy {
  pub fn plan_timeout(&self) -> Duration {
    Duration::from_secs(self.plan_timeout_secs)
  }
  pub fn header_timeout(&self) -> Duration {
    Duration::from_secs(self.header_timeout_secs)
  }
  pub fn chunk_timeout(&self) -> Duration {
    Duration::from_secs(self.chunk_timeout_secs)
  }
  pub fn steps_total_budget(&self) -> Duration {
    Duration::from_secs(self.steps_total_budget_secs)
  }
  pub fn single_shot_timeout(&self) -> Duration {
    Duration::from_secs(self.single_shot_timeout_secs)
  }
  pub fn extraction_timeout(&self) -> Duration {
    Duration::from_secs(self.extraction_timeout_secs)
  }
  pub fn drill_timeout(&self) -> Duration {
    Duration::from_secs(self.drill_timeout_secs)
  }
  pub fn total_budget(&self) -> Duration {
    Duration::from_secs(self.total_budget_secs)
  }

  /// Output-token budget by difficulty; geometry always gets the large budget
  /// because figure descriptions inflate every step.
  pub fn max_tokens(&self, difficulty: Difficulty, has_geometry: bool) -> u32 {
    if has_geometry {
      return self.max_tokens_hard;
    }
    match difficulty {
      Difficulty::Easy => self.max_tokens_easy,
      Difficulty::Normal => self.max_tokens_normal,
      Difficulty::Hard => self.max_tokens_hard,
    }
  }
}

/// TOML override file schema.
#[derive(Debug, Default, Deserialize)]
struct PolicyFile {
  #[serde(default)]
  pipeline: Option<PipelinePolicy>,
  #[serde(default)]
  prompts: Option<PromptPolicy>,
}

#[derive(Clone, Debug)]
pub struct ProviderConfig {
  pub backend: Backend,
  pub models: ModelTier,
  pub policy: PipelinePolicy,
  pub prompts: PromptPolicy,
  /// Attach the `_debug` accumulator to results.
  pub debug: bool,
}

impl ProviderConfig {
  /// Resolve configuration from the environment. Does not verify credentials;
  /// transport construction does that and reports `MissingCredentials`.
  pub fn from_env() -> Self {
    let backend = match std::env::var("AI_PROVIDER").as_deref() {
      Ok("gemini") => Backend::Gemini,
      _ => Backend::OpenAi,
    };

    let models = match backend {
      Backend::OpenAi => ModelTier {
        fast: std::env::var("OPENAI_FAST_MODEL").unwrap_or_else(|_| "gpt-5-mini".into()),
        pro: std::env::var("OPENAI_PRO_MODEL").unwrap_or_else(|_| "gpt-5".into()),
      },
      Backend::Gemini => ModelTier {
        fast: std::env::var("GEMINI_FAST_MODEL").unwrap_or_else(|_| "gemini-2.5-flash".into()),
        pro: std::env::var("GEMINI_PRO_MODEL").unwrap_or_else(|_| "gemini-2.5-pro".into()),
      },
    };

    let overrides = load_policy_overrides_from_env().unwrap_or_default();
    // named debug_mode: a bare `debug` shorthand collides with
    // `tracing::field::debug` inside the info! expansion
    let debug_mode = matches!(std::env::var("ANALYZE_DEBUG").as_deref(), Ok("1") | Ok("true"));

    info!(
      backend = backend.name(),
      fast_model = %models.fast,
      pro_model = %models.pro,
      debug = debug_mode,
      "provider configuration resolved"
    );

    Self {
      backend,
      models,
      policy: overrides.pipeline.unwrap_or_default(),
      prompts: overrides.prompts.unwrap_or_default(),
      debug: debug_mode,
    }
  }
}

/// Attempt to load policy overrides from POLICY_CONFIG_PATH. On any parsing or
/// IO error, returns None and the defaults stand.
fn load_policy_overrides_from_env() -> Option<PolicyFile> {
  let path = std::env::var("POLICY_CONFIG_PATH").ok()?;
  match std::fs::read_to_string(&path) {
    Ok(s) => match toml::from_str::<PolicyFile>(&s) {
      Ok(file) => {
        info!(%path, "Loaded policy config (TOML)");
        Some(file)
      }
      Err(e) => {
        error!(%path, error = %e, "Failed to parse TOML policy config");
        None
      }
    },
    Err(e) => {
      error!(%path, error = %e, "Failed to read TOML policy config file");
      None
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn default_policy_matches_tuned_values() {
    let policy = PipelinePolicy::default();
    assert_eq!(policy.plan_timeout(), Duration::from_secs(10));
    assert_eq!(policy.chunk_timeout(), Duration::from_secs(40));
    assert_eq!(policy.steps_total_budget(), Duration::from_secs(25));
    assert_eq!(policy.max_retries, 2);
    assert_eq!(policy.initial_chunk_size, 4);
  }

  #[test]
  fn token_budget_scales_with_difficulty_and_geometry() {
    let policy = PipelinePolicy::default();
    assert_eq!(policy.max_tokens(Difficulty::Easy, false), 1200);
    assert_eq!(policy.max_tokens(Difficulty::Normal, false), 2200);
    assert_eq!(policy.max_tokens(Difficulty::Hard, false), 3200);
    assert_eq!(policy.max_tokens(Difficulty::Easy, true), 3200);
  }

  #[test]
  fn partial_toml_override_keeps_other_defaults() {
    let file: PolicyFile = toml::from_str(
      r#"
      [pipeline]
      chunk_timeout_secs = 12
      "#,
    )
    .unwrap();
    let pipeline = file.pipeline.unwrap();
    assert_eq!(pipeline.chunk_timeout_secs, 12);
    assert_eq!(pipeline.plan_timeout_secs, 10);
    assert!(file.prompts.is_none());
  }

  #[test]
  fn from_env_resolves_backend_and_debug_flag() {
    std::env::remove_var("AI_PROVIDER");
    std::env::set_var("ANALYZE_DEBUG", "1");
    let config = ProviderConfig::from_env();
    assert_eq!(config.backend, Backend::OpenAi);
    assert!(config.debug);
    std::env::remove_var("ANALYZE_DEBUG");
  }

  #[test]
  fn prompt_rules_are_overridable() {
    let file: PolicyFile = toml::from_str(
      r#"
      [prompts]
      step_count_easy = "ステップ数は1〜2。"
      "#,
    )
    .unwrap();
    let prompts = file.prompts.unwrap();
    assert_eq!(prompts.step_count_easy, "ステップ数は1〜2。");
    assert!(prompts.step_count_hard.contains("5〜7"));
  }
}
