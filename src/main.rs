//! Sansu Coach · CLI driver for the analysis core.
//!
//! Usage:
//!   sansu-coach analyze <problem text>
//!   sansu-coach extract <image path>
//!   sansu-coach drill <problem text>
//!
//! Important env variables:
//!   AI_PROVIDER        : "openai" (default) or "gemini"
//!   OPENAI_API_KEY     : enables the OpenAI backend if present
//!   OPENAI_BASE_URL    : default "https://api.openai.com/v1"
//!   GEMINI_API_KEY     : enables the Gemini backend if present
//!   POLICY_CONFIG_PATH : path to TOML policy overrides (timeouts, prompts)
//!   ANALYZE_DEBUG      : "1" attaches the _debug trace to results
//!   LOG_LEVEL          : tracing filter, e.g. "debug" or full directives
//!   LOG_FORMAT         : "pretty" (default) or "json"

use base64::Engine as _;
use tracing::info;

use sansu_coach::{telemetry, AiProvider, ProviderConfig};

fn usage() -> ! {
  eprintln!("usage: sansu-coach <analyze|extract|drill> <problem text | image path>");
  std::process::exit(2);
}

fn mime_for_path(path: &str) -> &'static str {
  match path.rsplit('.').next() {
    Some("png") => "image/png",
    Some("webp") => "image/webp",
    _ => "image/jpeg",
  }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
  telemetry::init_tracing();

  let mut args = std::env::args().skip(1);
  let (Some(command), Some(input)) = (args.next(), args.next()) else { usage() };

  let config = ProviderConfig::from_env();
  let provider = AiProvider::from_config(&config)?;

  match command.as_str() {
    "analyze" => {
      let result = provider.analyze_from_text(&input).await?;
      println!("{}", serde_json::to_string_pretty(&result)?);
    }
    "extract" => {
      let bytes = std::fs::read(&input)?;
      let encoded = base64::engine::general_purpose::STANDARD.encode(&bytes);
      info!(path = %input, bytes = bytes.len(), "image loaded");
      let problems = provider.extract_problem_text(mime_for_path(&input), &encoded).await?;
      println!("{}", serde_json::to_string_pretty(&problems)?);
    }
    "drill" => {
      let drill = provider.generate_drill(&input).await?;
      println!("{}", serde_json::to_string_pretty(&drill)?);
    }
    _ => usage(),
  }

  Ok(())
}
