//! OpenAI transport for our use-cases.
//!
//! We only call the Responses endpoint with strict JSON-schema output, with an
//! optional inline image for extraction. Calls are instrumented and log model
//! names, latencies, and response sizes (not contents).
//!
//! NOTE: We never log the API key and we keep payload truncations short to
//! avoid leaking photographed homework.

use async_trait::async_trait;
use reqwest::header::{AUTHORIZATION, CONTENT_TYPE, USER_AGENT};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{info, instrument, warn};

use crate::error::AiError;
use crate::transport::{AiTransport, GenerateRequest};

#[derive(Clone)]
pub struct OpenAiTransport {
  client: reqwest::Client,
  api_key: String,
  base_url: String,
}

impl OpenAiTransport {
  /// Construct the transport if we find OPENAI_API_KEY; otherwise None.
  pub fn from_env() -> Option<Self> {
    let api_key = std::env::var("OPENAI_API_KEY").ok()?;
    let base_url =
      std::env::var("OPENAI_BASE_URL").unwrap_or_else(|_| "https://api.openai.com/v1".into());

    // Per-call deadlines are enforced upstream; no client-level timeout here
    // so a long steps chunk is not cut off by an unrelated global setting.
    let client = reqwest::Client::builder().build().ok()?;

    Some(Self { client, api_key, base_url })
  }
}

#[async_trait]
impl AiTransport for OpenAiTransport {
  #[instrument(
    level = "info",
    skip(self, request),
    fields(model = %request.model, schema = request.schema_name, has_image = request.image.is_some())
  )]
  async fn generate(&self, request: GenerateRequest) -> Result<String, AiError> {
    let url = format!("{}/responses", self.base_url);
    let body = build_request_body(&request);

    let start = std::time::Instant::now();
    let res = self
      .client
      .post(&url)
      .header(USER_AGENT, "sansu-coach/0.1")
      .header(CONTENT_TYPE, "application/json")
      .header(AUTHORIZATION, format!("Bearer {}", self.api_key))
      .json(&body)
      .send()
      .await
      .map_err(|e| AiError::Transport(e.to_string()))?;

    if !res.status().is_success() {
      let status = res.status();
      let body = res.text().await.unwrap_or_default();
      let msg = extract_openai_error(&body).unwrap_or(body);
      warn!(%status, error = %msg, "OpenAI call failed");
      return Err(AiError::Transport(format!("OpenAI HTTP {status}: {msg}")));
    }

    let parsed: ResponsesBody = res
      .json()
      .await
      .map_err(|e| AiError::Transport(format!("OpenAI response decode: {e}")))?;

    if let Some(usage) = &parsed.usage {
      info!(
        input_tokens = ?usage.input_tokens,
        output_tokens = ?usage.output_tokens,
        total_tokens = ?usage.total_tokens,
        elapsed = ?start.elapsed(),
        "OpenAI usage"
      );
    }

    let text = collect_output_text(&parsed);
    if text.trim().is_empty() {
      return Err(AiError::Transport("OpenAI returned an empty output".into()));
    }
    Ok(text)
  }

  fn backend_name(&self) -> &'static str {
    "openai"
  }
}

fn build_request_body(request: &GenerateRequest) -> ResponsesRequest {
  let mut content = vec![InputContent::Text { text: request.instruction.clone() }];
  if let Some(image) = &request.image {
    content.push(InputContent::Image {
      image_url: format!("data:{};base64,{}", image.mime_type, image.base64_data),
    });
  }

  ResponsesRequest {
    model: request.model.clone(),
    input: vec![InputItem { role: "user".into(), content }],
    text: TextOptions {
      format: SchemaFormat {
        r#type: "json_schema".into(),
        name: request.schema_name.into(),
        strict: true,
        schema: request.schema.clone(),
      },
    },
    max_output_tokens: request.max_output_tokens,
  }
}

fn collect_output_text(body: &ResponsesBody) -> String {
  body
    .output
    .iter()
    .flat_map(|item| item.content.iter())
    .filter_map(|part| part.text.as_deref())
    .collect::<Vec<_>>()
    .join("")
}

// --- Responses DTOs ---

#[derive(Serialize)]
struct ResponsesRequest {
  model: String,
  input: Vec<InputItem>,
  text: TextOptions,
  max_output_tokens: u32,
}
#[derive(Serialize)]
struct InputItem {
  role: String,
  content: Vec<InputContent>,
}
#[derive(Serialize)]
#[serde(tag = "type")]
enum InputContent {
  #[serde(rename = "input_text")]
  Text { text: String },
  #[serde(rename = "input_image")]
  Image { image_url: String },
}
#[derive(Serialize)]
struct TextOptions {
  format: SchemaFormat,
}
#[derive(Serialize)]
struct SchemaFormat {
  r#type: String,
  name: String,
  strict: bool,
  schema: Value,
}

#[derive(Deserialize)]
struct ResponsesBody {
  #[serde(default)]
  output: Vec<OutputItem>,
  #[serde(default)]
  usage: Option<Usage>,
}
#[derive(Deserialize)]
struct OutputItem {
  #[serde(default)]
  content: Vec<OutputContent>,
}
#[derive(Deserialize)]
struct OutputContent {
  #[serde(default)]
  text: Option<String>,
}
#[derive(Deserialize)]
struct Usage {
  #[serde(default)]
  input_tokens: Option<u32>,
  #[serde(default)]
  output_tokens: Option<u32>,
  #[serde(default)]
  total_tokens: Option<u32>,
}

/// Try to extract a clean error message from an OpenAI error body.
fn extract_openai_error(body: &str) -> Option<String> {
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
