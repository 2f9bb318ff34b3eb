//! Provider facade: backend selection at startup plus the four public
//! operations (extract, analyze, analyze with controls, drill).
//!
//! The backend is chosen exactly once when the provider is built; everything
//! downstream talks to the `AiTransport` trait and never branches on the
//! backend again.

use std::sync::Arc;

use tracing::{info, instrument};

use crate::config::{Backend, ProviderConfig};
use crate::domain::{AnalysisResult, DrillResult, ExtractedProblem};
use crate::error::AiError;
use crate::gemini::GeminiTransport;
use crate::level;
use crate::openai::OpenAiTransport;
use crate::pipeline::{AnalyzeOptions, Pipeline};
use crate::transport::{AiTransport, ImagePart};

pub struct AiProvider {
  pipeline: Pipeline,
  debug: bool,
}

impl AiProvider {
  /// Build the provider for the configured backend. Missing credentials are a
  /// configuration error, reported as such rather than as a transport failure.
  pub fn from_config(config: &ProviderConfig) -> Result<Self, AiError> {
    let transport: Arc<dyn AiTransport> = match config.backend {
      Backend::OpenAi => Arc::new(
        OpenAiTransport::from_env().ok_or(AiError::MissingCredentials { backend: "openai" })?,
      ),
      Backend::Gemini => Arc::new(
        GeminiTransport::from_env().ok_or(AiError::MissingCredentials { backend: "gemini" })?,
      ),
    };
    info!(backend = config.backend.name(), "AI provider ready");

    Ok(Self {
      pipeline: Pipeline::new(
        transport,
        config.models.clone(),
        config.policy.clone(),
        config.prompts.clone(),
      ),
      debug: config.debug,
    })
  }

  #[cfg(test)]
  pub fn for_transport(transport: Arc<dyn AiTransport>, config: &ProviderConfig) -> Self {
    Self {
      pipeline: Pipeline::new(
        transport,
        config.models.clone(),
        config.policy.clone(),
        config.prompts.clone(),
      ),
      debug: config.debug,
    }
  }

  /// Transcribe every problem visible in a photographed page.
  pub async fn extract_problem_text(
    &self,
    mime_type: &str,
    base64_data: &str,
  ) -> Result<Vec<ExtractedProblem>, AiError> {
    self
      .pipeline
      .extract_problems(ImagePart {
        mime_type: mime_type.to_string(),
        base64_data: base64_data.to_string(),
      })
      .await
  }

  /// Analyze a problem text with default controls: difficulty estimated from
  /// the text itself, fast tier unless the profile demands otherwise.
  #[instrument(level = "info", skip(self, problem_text), fields(text_len = problem_text.len()))]
  pub async fn analyze_from_text(&self, problem_text: &str) -> Result<AnalysisResult, AiError> {
    self
      .analyze_with_controls(problem_text, AnalyzeOptions { debug: self.debug, ..Default::default() })
      .await
  }

  /// Analyze with explicit caller controls (pro tier, forced difficulty,
  /// original photo for the single-shot fallback, debug trace). The estimated
  /// profile is always attached as `meta`.
  pub async fn analyze_with_controls(
    &self,
    problem_text: &str,
    options: AnalyzeOptions,
  ) -> Result<AnalysisResult, AiError> {
    let profile = level::estimate(problem_text);
    self.pipeline.analyze(problem_text, &profile, options).await
  }

  /// Generate three practice problems isomorphic to the given one.
  pub async fn generate_drill(&self, problem_text: &str) -> Result<DrillResult, AiError> {
    self.pipeline.generate_drill(problem_text).await
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::config::{ModelTier, PipelinePolicy};
  use crate::prompts::PromptPolicy;
  use crate::transport::GenerateRequest;
  use async_trait::async_trait;
  use serde_json::json;

  fn test_config() -> ProviderConfig {
    ProviderConfig {
      backend: Backend::OpenAi,
      models: ModelTier { fast: "fast-model".into(), pro: "pro-model".into() },
      policy: PipelinePolicy::default(),
      prompts: PromptPolicy::default(),
      debug: false,
    }
  }

  struct DrillOnly;

  #[async_trait]
  impl AiTransport for DrillOnly {
    async fn generate(&self, request: GenerateRequest) -> Result<String, AiError> {
      assert_eq!(request.schema_name, "drill");
      Ok(
        json!({
          "problems": [
            { "question": "みかんが4こずつ5ふくろ。ぜんぶで何こ？", "answer": "20こ", "explanation": "4×5だよ" },
            { "question": "えんぴつが6本ずつ3箱。ぜんぶで何本？", "answer": "18本", "explanation": "6×3だよ" },
            { "question": "シールが8まいずつ2人分。ぜんぶで何まい？", "answer": "16まい", "explanation": "8×2だよ" }
          ]
        })
        .to_string(),
      )
    }

    fn backend_name(&self) -> &'static str {
      "fake"
    }
  }

  #[tokio::test]
  async fn drill_flows_through_the_facade() {
    let provider = AiProvider::for_transport(Arc::new(DrillOnly), &test_config());
    let drill = provider
      .generate_drill("りんごが3こずつ4ふくろあります。ぜんぶで何こですか。")
      .await
      .unwrap();
    assert_eq!(drill.problems.len(), 3);
    assert_eq!(drill.problems[0].answer, "20こ");
  }
}
