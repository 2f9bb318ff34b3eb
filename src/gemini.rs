//! Gemini transport, mirroring the OpenAI one over the generateContent API.
//!
//! Structured output goes through `generationConfig.responseSchema`; images
//! ride along as `inlineData`. The API key is passed as a query parameter per
//! the Gemini convention, so the URL never appears in logs.

use async_trait::async_trait;
use reqwest::header::{CONTENT_TYPE, USER_AGENT};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{info, instrument, warn};

use crate::error::AiError;
use crate::transport::{AiTransport, GenerateRequest};

#[derive(Clone)]
pub struct GeminiTransport {
  client: reqwest::Client,
  api_key: String,
  base_url: String,
}

impl GeminiTransport {
  /// Construct the transport if we find GEMINI_API_KEY; otherwise None.
  pub fn from_env() -> Option<Self> {
    let api_key = std::env::var("GEMINI_API_KEY").ok()?;
    let base_url = std::env::var("GEMINI_BASE_URL")
      .unwrap_or_else(|_| "https://generativelanguage.googleapis.com/v1beta".into());

    let client = reqwest::Client::builder().build().ok()?;

    Some(Self { client, api_key, base_url })
  }
}

#[async_trait]
impl AiTransport for GeminiTransport {
  #[instrument(
    level = "info",
    skip(self, request),
    fields(model = %request.model, schema = request.schema_name, has_image = request.image.is_some())
  )]
  async fn generate(&self, request: GenerateRequest) -> Result<String, AiError> {
    let url = format!(
      "{}/models/{}:generateContent?key={}",
      self.base_url, request.model, self.api_key
    );
    let body = build_request_body(&request);

    let start = std::time::Instant::now();
    let res = self
      .client
      .post(&url)
      .header(USER_AGENT, "sansu-coach/0.1")
      .header(CONTENT_TYPE, "application/json")
      .json(&body)
      .send()
      .await
      .map_err(|e| AiError::Transport(e.to_string()))?;

    if !res.status().is_success() {
      let status = res.status();
      let body = res.text().await.unwrap_or_default();
      let msg = extract_gemini_error(&body).unwrap_or(body);
      warn!(%status, error = %msg, "Gemini call failed");
      return Err(AiError::Transport(format!("Gemini HTTP {status}: {msg}")));
    }

    let parsed: GenerateContentBody = res
      .json()
      .await
      .map_err(|e| AiError::Transport(format!("Gemini response decode: {e}")))?;

    if let Some(usage) = &parsed.usage_metadata {
      info!(
        prompt_tokens = ?usage.prompt_token_count,
        candidate_tokens = ?usage.candidates_token_count,
        total_tokens = ?usage.total_token_count,
        elapsed = ?start.elapsed(),
        "Gemini usage"
      );
    }

    let text = collect_candidate_text(&parsed);
    if text.trim().is_empty() {
      return Err(AiError::Transport("Gemini returned an empty candidate".into()));
    }
    Ok(text)
  }

  fn backend_name(&self) -> &'static str {
    "gemini"
  }
}

fn build_request_body(request: &GenerateRequest) -> GenerateContentRequest {
  let mut parts = vec![Part { text: Some(request.instruction.clone()), inline_data: None }];
  if let Some(image) = &request.image {
    parts.push(Part {
      text: None,
      inline_data: Some(InlineData {
        mime_type: image.mime_type.clone(),
        data: image.base64_data.clone(),
      }),
    });
  }

  GenerateContentRequest {
    contents: vec![Content { parts }],
    generation_config: GenerationConfig {
      response_mime_type: "application/json".into(),
      response_schema: strip_unsupported_keywords(request.schema.clone()),
      max_output_tokens: request.max_output_tokens,
    },
  }
}

/// Gemini's responseSchema dialect rejects `additionalProperties`; drop it
/// recursively rather than maintaining two schema builders.
fn strip_unsupported_keywords(mut schema: Value) -> Value {
  if let Some(object) = schema.as_object_mut() {
    object.remove("additionalProperties");
    for value in object.values_mut() {
      let taken = value.take();
      *value = strip_unsupported_keywords(taken);
    }
  } else if let Some(items) = schema.as_array_mut() {
    for value in items.iter_mut() {
      let taken = value.take();
      *value = strip_unsupported_keywords(taken);
    }
  }
  schema
}

fn collect_candidate_text(body: &GenerateContentBody) -> String {
  body
    .candidates
    .first()
    .map(|candidate| {
      candidate
        .content
        .parts
        .iter()
        .filter_map(|part| part.text.as_deref())
        .collect::<Vec<_>>()
        .join("")
    })
    .unwrap_or_default()
}

// --- generateContent DTOs ---

#[derive(Serialize)]
struct GenerateContentRequest {
  contents: Vec<Content>,
  #[serde(rename = "generationConfig")]
  generation_config: GenerationConfig,
}
#[derive(Serialize)]
struct Content {
  parts: Vec<Part>,
}
#[derive(Serialize)]
struct Part {
  #[serde(skip_serializing_if = "Option::is_none")]
  text: Option<String>,
  #[serde(rename = "inlineData", skip_serializing_if = "Option::is_none")]
  inline_data: Option<InlineData>,
}
#[derive(Serialize)]
struct InlineData {
  #[serde(rename = "mimeType")]
  mime_type: String,
  data: String,
}
#[derive(Serialize)]
struct GenerationConfig {
  #[serde(rename = "responseMimeType")]
  response_mime_type: String,
  #[serde(rename = "responseSchema")]
  response_schema: Value,
  #[serde(rename = "maxOutputTokens")]
  max_output_tokens: u32,
}

#[derive(Deserialize)]
struct GenerateContentBody {
  #[serde(default)]
  candidates: Vec<Candidate>,
  #[serde(rename = "usageMetadata", default)]
  usage_metadata: Option<UsageMetadata>,
}
#[derive(Deserialize)]
struct Candidate {
  #[serde(default)]
  content: CandidateContent,
}
#[derive(Deserialize, Default)]
struct CandidateContent {
  #[serde(default)]
  parts: Vec<CandidatePart>,
}
#[derive(Deserialize)]
struct CandidatePart {
  #[serde(default)]
  text: Option<String>,
}
#[derive(Deserialize)]
struct UsageMetadata {
  #[serde(rename = "promptTokenCount", default)]
  prompt_token_count: Option<u32>,
  #[serde(rename = "candidatesTokenCount", default)]
  candidates_token_count: Option<u32>,
  #[serde(rename = "totalTokenCount", default)]
  total_token_count: Option<u32>,
}

fn extract_gemini_error(body: &str) -> Option<String> {
  #[derive(Deserialize)]
  struct EWrap {
    error: EObj,
  }
  #[derive(Deserialize)]
  struct EObj {
    message: String,
  }
  serde_json::from_str::<EWrap>(body).ok().map(|w| w.error.message)
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::transport::ImagePart;
  use serde_json::json;
  use std::time::Duration;

  #[test]
  fn request_body_uses_inline_data_and_response_schema() {
    let request = GenerateRequest {
      instruction: "抽出".into(),
      schema: json!({
        "type": "object",
        "additionalProperties": false,
        "properties": { "a": { "type": "string" } }
      }),
      schema_name: "extraction",
      image: Some(ImagePart { mime_type: "image/png".into(), base64_data: "QUJD".into() }),
      model: "gemini-2.5-flash".into(),
      max_output_tokens: 2200,
      timeout: Duration::from_secs(25),
    };
    let value = serde_json::to_value(build_request_body(&request)).unwrap();
    assert_eq!(value["contents"][0]["parts"][0]["text"], "抽出");
    assert_eq!(value["contents"][0]["parts"][1]["inlineData"]["mimeType"], "image/png");
    assert_eq!(value["generationConfig"]["responseMimeType"], "application/json");
    assert_eq!(value["generationConfig"]["maxOutputTokens"], 2200);
    // additionalProperties must not survive into the Gemini dialect
    assert!(value["generationConfig"]["responseSchema"]
      .get("additionalProperties")
      .is_none());
  }

  #[test]
  fn unsupported_keywords_are_stripped_recursively() {
    let schema = json!({
      "type": "object",
      "additionalProperties": false,
      "properties": {
        "steps": {
          "type": "array",
          "items": { "type": "object", "additionalProperties": false }
        }
      }
    });
    let stripped = strip_unsupported_keywords(schema);
    assert!(stripped.get("additionalProperties").is_none());
    assert!(stripped["properties"]["steps"]["items"]
      .get("additionalProperties")
      .is_none());
  }

  #[test]
  fn first_candidate_text_is_used() {
    let body: GenerateContentBody = serde_json::from_str(
      r#"{"candidates":[{"content":{"parts":[{"text":"{\"x\":"},{"text":"2}"}]}},{"content":{"parts":[{"text":"ignored"}]}}]}"#,
    )
    .unwrap();
    assert_eq!(collect_candidate_text(&body), r#"{"x":2}"#);
  }

  #[test]
  fn empty_candidates_yield_empty_text() {
    let body: GenerateContentBody = serde_json::from_str(r#"{"candidates":[]}"#).unwrap();
    assert_eq!(collect_candidate_text(&body), "");
  }
}
