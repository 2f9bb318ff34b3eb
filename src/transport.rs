//! Backend-neutral transport seam.
//!
//! The pipeline is written against `AiTransport` so that OpenAI-style and
//! Gemini-style wire formats stay confined to their own modules, and tests can
//! drive the orchestration with a scripted fake. One request = one model call
//! returning the raw text payload; JSON extraction happens upstream in
//! `json_repair`.

use async_trait::async_trait;
use serde_json::Value;
use std::time::Duration;

use crate::error::AiError;

/// Inline image attachment, already base64-encoded.
#[derive(Clone, Debug)]
pub struct ImagePart {
  pub mime_type: String,
  pub base64_data: String,
}

#[derive(Clone, Debug)]
pub struct GenerateRequest {
  pub instruction: String,
  /// JSON schema the backend is asked to conform to.
  pub schema: Value,
  /// Short name used for the backend's schema envelope and for logging.
  pub schema_name: &'static str,
  pub image: Option<ImagePart>,
  pub model: String,
  pub max_output_tokens: u32,
  /// Per-call deadline; the call is abandoned (and the HTTP request dropped)
  /// when it elapses.
  pub timeout: Duration,
}

#[async_trait]
pub trait AiTransport: Send + Sync {
  /// Perform one structured-output model call and return the raw text body.
  async fn generate(&self, request: GenerateRequest) -> Result<String, AiError>;

  /// Label for logs ("openai" / "gemini").
  fn backend_name(&self) -> &'static str;
}

/// Race a transport call against its own deadline. Dropping the inner future
/// on timeout also drops the underlying HTTP request.
pub async fn generate_with_timeout(
  transport: &dyn AiTransport,
  request: GenerateRequest,
) -> Result<String, AiError> {
  let context = format!("{}/{}", transport.backend_name(), request.schema_name);
  let deadline = request.timeout;
  match tokio::time::timeout(deadline, transport.generate(request)).await {
    Ok(result) => result,
    Err(_) => Err(AiError::Timeout { context }),
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use serde_json::json;
  use std::sync::atomic::{AtomicUsize, Ordering};

  struct SlowTransport {
    calls: AtomicUsize,
  }

  #[async_trait]
  impl AiTransport for SlowTransport {
    async fn generate(&self, _request: GenerateRequest) -> Result<String, AiError> {
      self.calls.fetch_add(1, Ordering::SeqCst);
      tokio::time::sleep(Duration::from_secs(60)).await;
      Ok("{}".into())
    }

    fn backend_name(&self) -> &'static str {
      "fake"
    }
  }

  fn request(timeout: Duration) -> GenerateRequest {
    GenerateRequest {
      instruction: "test".into(),
      schema: json!({"type": "object"}),
      schema_name: "plan",
      image: None,
      model: "model-a".into(),
      max_output_tokens: 100,
      timeout,
    }
  }

  #[tokio::test(start_paused = true)]
  async fn deadline_turns_into_timeout_error() {
    let transport = SlowTransport { calls: AtomicUsize::new(0) };
    let err = generate_with_timeout(&transport, request(Duration::from_secs(5)))
      .await
      .unwrap_err();
    match err {
      AiError::Timeout { context } => assert_eq!(context, "fake/plan"),
      other => panic!("expected timeout, got {other:?}"),
    }
    assert_eq!(transport.calls.load(Ordering::SeqCst), 1);
  }
}
