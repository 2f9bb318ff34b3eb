//! Orchestration engine: plan, chunked step generation, header, assembly,
//! verification, quality gate, and the single-shot fallback ladder.
//!
//! Control flow is explicit throughout. `PipelineState` plus the pure
//! `next_state` function describe the escalation policy (chunk back-off,
//! model escalation, single-shot fallback); the async driver walks that
//! policy while charging everything against wall-clock budgets. Internal
//! failures never escape one attempt: the outer loop either produces a result
//! or ends in `AiError::Exhausted`.

use std::collections::BTreeMap;
use std::sync::Arc;
use tokio::time::Instant;

use serde::Deserialize;
use serde_json::json;
use tracing::{info, instrument, warn};

use crate::config::{ModelTier, PipelinePolicy};
use crate::domain::{
  new_problem_id, AnalysisResult, AnalysisStatus, DifficultyProfile, DrillResult,
  ExtractedProblem, MethodHint, Problem, Step,
};
use crate::error::AiError;
use crate::gate::{normalize_calc_expressions, repair_calculations, validate_calculations, GateOutcome};
use crate::json_repair::extract_json;
use crate::prompts::{self, PromptPolicy, Stage, StepsChunkContext};
use crate::transport::{generate_with_timeout, AiTransport, GenerateRequest, ImagePart};
use crate::verify::{
  normalize_step_orders, verify_analysis, verify_steps, VerifyOptions,
  ISSUE_DUPLICATE_SIMILARITY, ISSUE_MISSING_JUDGEMENT_STEP,
};

const JUDGEMENT_STEP_TITLE: &str = "計算した結果を見比べて、答えを決める";

/// Caller-supplied controls for one analysis.
#[derive(Clone, Debug, Default)]
pub struct AnalyzeOptions {
  /// Paying callers always get the pro tier.
  pub is_pro: bool,
  /// Override the estimated difficulty (parent/teacher controls).
  pub forced_difficulty: Option<crate::domain::Difficulty>,
  /// Original photo, when the text came from extraction. The single-shot
  /// fallback sends it alongside the text so the model can re-read anything
  /// the transcription garbled.
  pub image: Option<ImagePart>,
  /// Attach the `_debug` accumulator to the result.
  pub debug: bool,
}

// ---- escalation state machine ----------------------------------------------

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PipelineState {
  Planning,
  GeneratingSteps { chunk_size: usize, escalated: bool },
  Assembling,
  SingleShot,
  Failed,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum StageEvent {
  Succeeded,
  TimedOut,
  Malformed,
}

/// Pure transition function for the escalation policy. Chunk size halves on
/// failure down to 1; at size 1 a timeout buys one model escalation; after
/// that any failure drops to the single-shot fallback.
pub fn next_state(state: PipelineState, event: StageEvent) -> PipelineState {
  match (state, event) {
    (PipelineState::Planning, StageEvent::Succeeded) => {
      PipelineState::GeneratingSteps { chunk_size: 4, escalated: false }
    }
    (PipelineState::Planning, _) => PipelineState::SingleShot,

    (PipelineState::GeneratingSteps { .. }, StageEvent::Succeeded) => PipelineState::Assembling,
    (PipelineState::GeneratingSteps { chunk_size, escalated }, event) => {
      if chunk_size > 1 {
        PipelineState::GeneratingSteps { chunk_size: chunk_size / 2, escalated }
      } else if event == StageEvent::TimedOut && !escalated {
        PipelineState::GeneratingSteps { chunk_size: 1, escalated: true }
      } else {
        PipelineState::SingleShot
      }
    }

    (PipelineState::Assembling, StageEvent::Succeeded) => PipelineState::Assembling,
    (PipelineState::Assembling, _) => PipelineState::SingleShot,

    (PipelineState::SingleShot, StageEvent::Succeeded) => PipelineState::SingleShot,
    (PipelineState::SingleShot, _) => PipelineState::Failed,

    (PipelineState::Failed, _) => PipelineState::Failed,
  }
}

// ---- stage payloads ---------------------------------------------------------

#[derive(Deserialize)]
struct PlanPayload {
  #[allow(dead_code)]
  step_count: u32,
  step_titles: Vec<String>,
}

#[derive(Deserialize)]
struct ChunkPayload {
  steps: Vec<Step>,
}

#[derive(Deserialize)]
struct HeaderPayload {
  method_hint: MethodHint,
  final_answer: String,
}

#[derive(Deserialize)]
struct SingleShotPayload {
  status: String,
  problems: Vec<Problem>,
}

#[derive(Deserialize)]
struct ExtractionPayload {
  problems: Vec<ExtractedProblem>,
}

// ---- debug accumulator ------------------------------------------------------

#[derive(Default)]
struct DebugTrace {
  models_tried: Vec<String>,
  chunk_events: Vec<String>,
  verify_issues: Vec<String>,
  gate_attempts: Vec<String>,
  fallback_reason: Option<String>,
  attempts: u32,
}

impl DebugTrace {
  fn note_model(&mut self, model: &str) {
    if self.models_tried.last().map(String::as_str) != Some(model) {
      self.models_tried.push(model.to_string());
    }
  }

  fn into_map(self, elapsed_ms: u128) -> BTreeMap<String, serde_json::Value> {
    let mut map = BTreeMap::new();
    map.insert("models_tried".into(), json!(self.models_tried));
    map.insert("chunk_events".into(), json!(self.chunk_events));
    map.insert("verify_issues".into(), json!(self.verify_issues));
    map.insert("gate_attempts".into(), json!(self.gate_attempts));
    map.insert("fallback_reason".into(), json!(self.fallback_reason));
    map.insert("attempts".into(), json!(self.attempts));
    map.insert("elapsed_ms".into(), json!(elapsed_ms as u64));
    map
  }
}

// ---- engine -----------------------------------------------------------------

pub struct Pipeline {
  transport: Arc<dyn AiTransport>,
  models: ModelTier,
  policy: PipelinePolicy,
  prompts: PromptPolicy,
}

impl Pipeline {
  pub fn new(
    transport: Arc<dyn AiTransport>,
    models: ModelTier,
    policy: PipelinePolicy,
    prompts: PromptPolicy,
  ) -> Self {
    Self { transport, models, policy, prompts }
  }

  /// Mid-attempt wall-clock check. Surfacing the overrun as a recoverable
  /// timeout lets the caller drop to the shortest remaining path instead of
  /// starting a stage that cannot finish in time.
  fn ensure_within_budget(&self, start: Instant, context: &str) -> Result<(), AiError> {
    if start.elapsed() >= self.policy.total_budget() {
      return Err(AiError::Timeout { context: format!("total_budget/{context}") });
    }
    Ok(())
  }

  fn select_model(&self, profile: &DifficultyProfile, options: &AnalyzeOptions, attempt: u32) -> &str {
    let difficulty = options.forced_difficulty.unwrap_or(profile.difficulty);
    let wants_pro = attempt > 0
      || options.is_pro
      || difficulty == crate::domain::Difficulty::Hard
      || profile.signals.has_geometry;
    if wants_pro {
      &self.models.pro
    } else {
      &self.models.fast
    }
  }

  async fn call_stage<T: for<'de> Deserialize<'de>>(
    &self,
    stage: Stage,
    instruction: String,
    schema: serde_json::Value,
    image: Option<ImagePart>,
    model: &str,
    max_output_tokens: u32,
    timeout: std::time::Duration,
  ) -> Result<T, AiError> {
    let raw = generate_with_timeout(
      self.transport.as_ref(),
      GenerateRequest {
        instruction,
        schema,
        schema_name: stage.name(),
        image,
        model: model.to_string(),
        max_output_tokens,
        timeout,
      },
    )
    .await?;
    extract_json(&raw, stage.name())
  }

  /// Transcribe every problem visible in the image. Blank transcriptions are
  /// dropped; surviving entries always carry an id.
  #[instrument(level = "info", skip(self, image), fields(mime = %image.mime_type))]
  pub async fn extract_problems(&self, image: ImagePart) -> Result<Vec<ExtractedProblem>, AiError> {
    let (instruction, schema) = prompts::build_extraction();
    let payload: ExtractionPayload = self
      .call_stage(
        Stage::Extraction,
        instruction,
        schema,
        Some(image),
        &self.models.fast,
        self.policy.max_tokens_normal,
        self.policy.extraction_timeout(),
      )
      .await?;

    let mut problems: Vec<ExtractedProblem> = payload
      .problems
      .into_iter()
      .filter(|p| !p.problem_text.trim().is_empty())
      .collect();
    for problem in &mut problems {
      if problem.id.trim().is_empty() {
        problem.id = new_problem_id();
      }
    }
    info!(count = problems.len(), "extraction finished");
    Ok(problems)
  }

  /// Generate three isomorphic practice problems.
  #[instrument(level = "info", skip(self, problem_text), fields(text_len = problem_text.len()))]
  pub async fn generate_drill(&self, problem_text: &str) -> Result<DrillResult, AiError> {
    let (instruction, schema) = prompts::build_drill(problem_text);
    self
      .call_stage(
        Stage::Drill,
        instruction,
        schema,
        None,
        &self.models.fast,
        self.policy.max_tokens_normal,
        self.policy.drill_timeout(),
      )
      .await
  }

  /// Analyze one problem text into a guided explanation, walking the full
  /// escalation ladder. Errors other than `MissingCredentials` collapse into
  /// `Exhausted` once every attempt is spent.
  #[instrument(
    level = "info",
    skip(self, problem_text, profile),
    fields(difficulty = %profile.difficulty, is_pro = options.is_pro, text_len = problem_text.len())
  )]
  pub async fn analyze(
    &self,
    problem_text: &str,
    profile: &DifficultyProfile,
    options: AnalyzeOptions,
  ) -> Result<AnalysisResult, AiError> {
    let start = Instant::now();
    let mut trace = DebugTrace::default();
    let difficulty = options.forced_difficulty.unwrap_or(profile.difficulty);
    let max_tokens = self.policy.max_tokens(difficulty, profile.signals.has_geometry);

    let attempts = self.policy.max_retries + 1;
    for attempt in 0..attempts {
      trace.attempts = attempt + 1;
      let model = self.select_model(profile, &options, attempt).to_string();
      trace.note_model(&model);

      // Past the wall-clock guard the structured path cannot finish in time;
      // only the shortest remaining path gets a chance.
      let degraded = start.elapsed() >= self.policy.total_budget();
      if degraded {
        trace
          .chunk_events
          .push(format!("attempt {attempt}: budget exceeded, degraded path"));
      }

      let structured = if degraded {
        Err(AiError::Timeout { context: "total_budget".into() })
      } else {
        self
          .structured_attempt(problem_text, difficulty, &model, max_tokens, start, &mut trace)
          .await
      };

      let candidate = match structured {
        Ok(problems) => Ok(problems),
        Err(err) if err.is_recoverable() || degraded => {
          warn!(attempt, error = %err, "structured path failed, trying single-shot");
          trace.fallback_reason = Some(err.to_string());
          self
            .single_shot_attempt(
              problem_text,
              difficulty,
              &model,
              max_tokens,
              options.image.as_ref(),
              None,
              &mut trace,
            )
            .await
        }
        Err(err) => return Err(err),
      };

      let problems = match candidate {
        Ok(problems) => problems,
        Err(err) => {
          warn!(attempt, error = %err, "attempt failed");
          continue;
        }
      };

      let gated = self
        .gate_with_retry(
          problems,
          problem_text,
          difficulty,
          &model,
          max_tokens,
          options.image.as_ref(),
          &mut trace,
        )
        .await;
      match gated {
        Ok(problems) => {
          info!(attempt, elapsed = ?start.elapsed(), "analysis succeeded");
          return Ok(self.finish(problems, profile, &options, trace, start));
        }
        Err(err) => {
          warn!(attempt, error = %err, "quality gate exhausted for this attempt");
          continue;
        }
      }
    }

    warn!(elapsed = ?start.elapsed(), "all attempts exhausted");
    Err(AiError::Exhausted)
  }

  fn finish(
    &self,
    problems: Vec<Problem>,
    profile: &DifficultyProfile,
    options: &AnalyzeOptions,
    trace: DebugTrace,
    start: Instant,
  ) -> AnalysisResult {
    AnalysisResult {
      status: AnalysisStatus::Success,
      problems,
      meta: Some(profile.clone()),
      debug: options.debug.then(|| trace.into_map(start.elapsed().as_millis())),
    }
  }

  // ---- structured path ------------------------------------------------------

  async fn structured_attempt(
    &self,
    problem_text: &str,
    difficulty: crate::domain::Difficulty,
    model: &str,
    max_tokens: u32,
    start: Instant,
    trace: &mut DebugTrace,
  ) -> Result<Vec<Problem>, AiError> {
    let (instruction, schema) = prompts::build_plan(&self.prompts, problem_text, difficulty);
    let plan: PlanPayload = self
      .call_stage(Stage::Plan, instruction, schema, None, model, max_tokens, self.policy.plan_timeout())
      .await?;
    if plan.step_titles.is_empty() {
      return Err(AiError::VerificationFailed { issues: vec!["plan_empty".into()] });
    }

    let mut steps = self
      .generate_steps(problem_text, difficulty, &plan.step_titles, model, max_tokens, trace)
      .await?;

    self.ensure_within_budget(start, "header")?;
    let (instruction, schema) =
      prompts::build_header(&self.prompts, problem_text, difficulty, &plan.step_titles);
    let header: HeaderPayload = self
      .call_stage(Stage::Header, instruction, schema, None, model, max_tokens, self.policy.header_timeout())
      .await?;

    normalize_step_orders(&mut steps);
    let mut problem = Problem {
      id: new_problem_id(),
      problem_text: problem_text.to_string(),
      steps,
      final_answer: header.final_answer,
      method_hint: Some(header.method_hint),
    };

    self
      .repair_structure(&mut problem, problem_text, difficulty, model, max_tokens, start, trace)
      .await?;

    Ok(vec![problem])
  }

  /// Walk the plan in chunks, shrinking and escalating per `next_state`.
  async fn generate_steps(
    &self,
    problem_text: &str,
    difficulty: crate::domain::Difficulty,
    step_titles: &[String],
    model: &str,
    max_tokens: u32,
    trace: &mut DebugTrace,
  ) -> Result<Vec<Step>, AiError> {
    let stage_start = Instant::now();
    let mut steps: Vec<Step> = Vec::new();
    let mut state = PipelineState::GeneratingSteps {
      chunk_size: self.policy.initial_chunk_size,
      escalated: false,
    };
    let mut index = 0usize;
    let mut model = model.to_string();

    while index < step_titles.len() {
      let PipelineState::GeneratingSteps { chunk_size, escalated } = state else {
        return Err(AiError::Timeout { context: "steps_chunks".into() });
      };

      let remaining_budget = self
        .policy
        .steps_total_budget()
        .checked_sub(stage_start.elapsed())
        .ok_or_else(|| AiError::Timeout { context: "steps_budget".into() })?;

      let end = (index + chunk_size).min(step_titles.len());
      match self
        .call_chunk(problem_text, difficulty, &step_titles[index..end], index, false, &model, max_tokens, remaining_budget)
        .await
      {
        Ok(mut chunk) => {
          trace.chunk_events.push(format!("chunk {}..{} ok ({} steps)", index + 1, end, chunk.len()));
          steps.append(&mut chunk);
          index = end;
        }
        Err(err) if err.is_recoverable() => {
          trace.chunk_events.push(format!("chunk {}..{} failed: {err}", index + 1, end));
          let event = if err.is_timeout() { StageEvent::TimedOut } else { StageEvent::Malformed };
          state = next_state(PipelineState::GeneratingSteps { chunk_size, escalated }, event);
          match state {
            PipelineState::GeneratingSteps { escalated: true, .. } if !escalated => {
              trace.chunk_events.push(format!("escalating steps model to {}", self.models.pro));
              model = self.models.pro.clone();
              trace.note_model(&model);
            }
            PipelineState::GeneratingSteps { .. } => {}
            _ => return Err(err),
          }
        }
        Err(err) => return Err(err),
      }
    }

    Ok(steps)
  }

  #[allow(clippy::too_many_arguments)]
  async fn call_chunk(
    &self,
    problem_text: &str,
    difficulty: crate::domain::Difficulty,
    titles: &[String],
    start_index: usize,
    force_judgement_step: bool,
    model: &str,
    max_tokens: u32,
    remaining_budget: std::time::Duration,
  ) -> Result<Vec<Step>, AiError> {
    let ctx = StepsChunkContext {
      problem_text,
      difficulty,
      step_titles: titles,
      start_order: start_index as u32 + 1,
      end_order: (start_index + titles.len()) as u32,
      force_judgement_step,
    };
    let (instruction, schema) = prompts::build_steps_chunk(&self.prompts, &ctx);
    let timeout = self.policy.chunk_timeout().min(remaining_budget);
    let payload: ChunkPayload = self
      .call_stage(Stage::StepsChunk, instruction, schema, None, model, max_tokens, timeout)
      .await?;

    let check = verify_steps(
      &payload.steps,
      VerifyOptions { skip_final_step_check: true, ..Default::default() },
    );
    if !check.ok {
      return Err(AiError::VerificationFailed { issues: check.issues });
    }
    Ok(payload.steps)
  }

  /// Bounded structural repairs on the assembled problem: one regeneration for
  /// a missing judgement step, one for near-duplicate steps. A second
  /// occurrence of either defect fails the attempt.
  async fn repair_structure(
    &self,
    problem: &mut Problem,
    problem_text: &str,
    difficulty: crate::domain::Difficulty,
    model: &str,
    max_tokens: u32,
    start: Instant,
    trace: &mut DebugTrace,
  ) -> Result<(), AiError> {
    let mut check = verify_steps(&problem.steps, VerifyOptions::default());
    trace.verify_issues.extend(check.issues.iter().cloned());

    if check.has_issue(ISSUE_MISSING_JUDGEMENT_STEP) {
      self.ensure_within_budget(start, "judgement_repair")?;
      let titles = vec![JUDGEMENT_STEP_TITLE.to_string()];
      let mut judgement = self
        .call_chunk(
          problem_text,
          difficulty,
          &titles,
          problem.steps.len(),
          true,
          model,
          max_tokens,
          self.policy.chunk_timeout(),
        )
        .await?;
      problem.steps.append(&mut judgement);
      normalize_step_orders(&mut problem.steps);
      check = verify_steps(&problem.steps, VerifyOptions::default());
      trace.verify_issues.extend(check.issues.iter().cloned());
    }

    if check.has_issue(ISSUE_DUPLICATE_SIMILARITY) {
      // One full regeneration; the re-verify ignores the similarity class so
      // the same defect cannot loop.
      self.ensure_within_budget(start, "duplicate_repair")?;
      let titles: Vec<String> = problem.steps.iter().map(|s| s.hint.clone()).collect();
      let regenerated = self
        .call_chunk(problem_text, difficulty, &titles, 0, false, model, max_tokens, self.policy.chunk_timeout())
        .await?;
      problem.steps = regenerated;
      normalize_step_orders(&mut problem.steps);
      check = verify_steps(
        &problem.steps,
        VerifyOptions { ignore_duplicate_similarity: true, ..Default::default() },
      );
      trace.verify_issues.extend(check.issues.iter().cloned());
    }

    if check.ok {
      Ok(())
    } else {
      Err(AiError::VerificationFailed { issues: check.issues })
    }
  }

  // ---- single-shot fallback -------------------------------------------------

  #[allow(clippy::too_many_arguments)]
  async fn single_shot_attempt(
    &self,
    problem_text: &str,
    difficulty: crate::domain::Difficulty,
    model: &str,
    max_tokens: u32,
    image: Option<&ImagePart>,
    corrective: Option<&str>,
    trace: &mut DebugTrace,
  ) -> Result<Vec<Problem>, AiError> {
    let (instruction, schema) =
      prompts::build_single_shot(&self.prompts, problem_text, difficulty, corrective);
    let payload: SingleShotPayload = self
      .call_stage(
        Stage::SingleShot,
        instruction,
        schema,
        image.cloned(),
        model,
        max_tokens,
        self.policy.single_shot_timeout(),
      )
      .await?;

    let mut problems = payload.problems;
    for problem in &mut problems {
      if problem.id.trim().is_empty() {
        problem.id = new_problem_id();
      }
      if problem.problem_text.trim().is_empty() {
        problem.problem_text = problem_text.to_string();
      }
      normalize_step_orders(&mut problem.steps);
    }

    // The model reports its own status; anything but success is verified as a
    // failed analysis so the attempt retries instead of returning it.
    let status = if payload.status.trim() == "success" {
      AnalysisStatus::Success
    } else {
      AnalysisStatus::Error
    };
    let candidate = AnalysisResult { status, problems, meta: None, debug: None };
    let check = verify_analysis(&candidate, VerifyOptions::default());
    trace.verify_issues.extend(check.issues.iter().cloned());
    if !check.ok {
      return Err(AiError::VerificationFailed { issues: check.issues });
    }
    Ok(candidate.problems)
  }

  // ---- quality gate ---------------------------------------------------------

  /// Normalize expressions, gate the raw calculations, and only then run the
  /// auto-repair on an accepted result. Repairing first would silently delete
  /// the malformed expressions the gate exists to catch. One rejection buys a
  /// corrective single-shot regeneration; a second rejection fails the attempt.
  #[allow(clippy::too_many_arguments)]
  async fn gate_with_retry(
    &self,
    mut problems: Vec<Problem>,
    problem_text: &str,
    difficulty: crate::domain::Difficulty,
    model: &str,
    max_tokens: u32,
    image: Option<&ImagePart>,
    trace: &mut DebugTrace,
  ) -> Result<Vec<Problem>, AiError> {
    normalize_calc_expressions(&mut problems);
    match validate_calculations(&problems) {
      GateOutcome::Ok => {
        trace.gate_attempts.push("ok".into());
        repair_calculations(&mut problems);
        return Ok(problems);
      }
      GateOutcome::Rejected { reason } => {
        warn!(%reason, "quality gate rejected candidate, one corrective retry");
        trace.gate_attempts.push(reason);
      }
    }

    let corrective = self.prompts.corrective_instruction.clone();
    let mut retried = self
      .single_shot_attempt(problem_text, difficulty, model, max_tokens, image, Some(&corrective), trace)
      .await?;
    normalize_calc_expressions(&mut retried);
    match validate_calculations(&retried) {
      GateOutcome::Ok => {
        trace.gate_attempts.push("ok_after_retry".into());
        repair_calculations(&mut retried);
        Ok(retried)
      }
      GateOutcome::Rejected { reason } => {
        trace.gate_attempts.push(reason.clone());
        Err(AiError::QualityGate { reason })
      }
    }
  }
}
