//! Error taxonomy for the analysis core.
//!
//! Internal stage failures are caught and classified inside the pipeline;
//! callers only ever see `MissingCredentials` (configuration, not retryable)
//! or `Exhausted` (all tiers and fallbacks spent). The user-facing message on
//! `Exhausted` stays generic; diagnostic detail travels in the debug map.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum AiError {
  /// No API key configured for the selected backend. Surfaced immediately so
  /// the caller can show an operator-facing message instead of a user-facing one.
  #[error("{backend} credentials are not set")]
  MissingCredentials { backend: &'static str },

  /// HTTP-level failure (connect, non-2xx, body read).
  #[error("transport error: {0}")]
  Transport(String),

  /// A stage call lost the race against its timer.
  #[error("timeout: {context}")]
  Timeout { context: String },

  /// Response text did not contain a parseable JSON object, even after repair.
  #[error("malformed JSON in {context}: {detail}")]
  MalformedJson { context: String, detail: String },

  /// Structural verification rejected a candidate (missing fields, repetition,
  /// missing judgement step).
  #[error("verification failed: {issues:?}")]
  VerificationFailed { issues: Vec<String> },

  /// The arithmetic quality gate rejected a candidate with a reason code.
  #[error("quality gate rejected: {reason}")]
  QualityGate { reason: String },

  /// Every tier and fallback path failed.
  #[error("AIが問題を読み取れませんでした。明るい場所でもういちど撮ってみてね。")]
  Exhausted,
}

impl AiError {
  /// Timeouts and malformed JSON both drive the same escalation policy.
  pub fn is_recoverable(&self) -> bool {
    matches!(
      self,
      AiError::Timeout { .. }
        | AiError::Transport(_)
        | AiError::MalformedJson { .. }
        | AiError::VerificationFailed { .. }
        | AiError::QualityGate { .. }
    )
  }

  pub fn is_timeout(&self) -> bool {
    matches!(self, AiError::Timeout { .. })
  }
}
