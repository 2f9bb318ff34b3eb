//! Structural verification of generated steps, problems, and full results.
//!
//! This is the first of two acceptance passes (the arithmetic quality gate in
//! `gate.rs` is the second). Issues are plain namespaced strings so the
//! pipeline can match on specific classes ("missing_judgement_step",
//! "duplicate_step_similarity") and suppress them on bounded retries.

use std::collections::HashSet;

use crate::domain::{AnalysisResult, AnalysisStatus, Problem, Step};

pub const ISSUE_MISSING_JUDGEMENT_STEP: &str = "missing_judgement_step";
pub const ISSUE_DUPLICATE_SIMILARITY: &str = "duplicate_step_similarity";

const SIMILARITY_THRESHOLD: f64 = 0.75;
const REPETITION_RUN: usize = 3;

#[derive(Clone, Debug)]
pub struct Verification {
  pub ok: bool,
  pub issues: Vec<String>,
}

impl Verification {
  fn from_issues(issues: Vec<String>) -> Self {
    Verification { ok: issues.is_empty(), issues }
  }

  pub fn has_issue(&self, issue: &str) -> bool {
    self.issues.iter().any(|i| i == issue)
  }
}

#[derive(Clone, Copy, Debug, Default)]
pub struct VerifyOptions {
  /// Skip the terminal judgement-step requirement (used on partial chunks,
  /// where the last step of the chunk is not the last step of the plan).
  pub skip_final_step_check: bool,
  /// Drop duplicate-similarity issues (used on the bounded retry pass so the
  /// same defect cannot loop the pipeline forever).
  pub ignore_duplicate_similarity: bool,
}

fn is_blank(value: &str) -> bool {
  value.trim().is_empty()
}

fn has_repeating_run(items: &[String], min_run: usize) -> bool {
  let mut run = 1;
  for pair in items.windows(2) {
    if pair[0] == pair[1] {
      run += 1;
      if run >= min_run {
        return true;
      }
    } else {
      run = 1;
    }
  }
  false
}

fn normalize_for_similarity(text: &str) -> String {
  text
    .chars()
    .filter(|c| !c.is_whitespace())
    .filter(|c| {
      !matches!(
        c,
        '.' | ',' | '!' | '?' | '。' | '、' | '！' | '？' | '「' | '」' | '『' | '』'
          | '（' | '）' | '(' | ')'
      )
    })
    .flat_map(|c| c.to_lowercase())
    .collect()
}

fn bigrams(text: &str) -> HashSet<(char, char)> {
  let chars: Vec<char> = text.chars().collect();
  chars.windows(2).map(|w| (w[0], w[1])).collect()
}

fn jaccard(a: &HashSet<(char, char)>, b: &HashSet<(char, char)>) -> f64 {
  if a.is_empty() && b.is_empty() {
    return 1.0;
  }
  let intersection = a.intersection(b).count();
  let union = a.len() + b.len() - intersection;
  if union == 0 {
    0.0
  } else {
    intersection as f64 / union as f64
  }
}

/// Bigram-set Jaccard similarity on normalized text. Short strings (fewer than
/// 4 normalized chars) never count as near-duplicates.
pub fn has_high_similarity(a: &str, b: &str) -> bool {
  let na = normalize_for_similarity(a);
  let nb = normalize_for_similarity(b);
  if na.chars().count() < 4 || nb.chars().count() < 4 {
    return false;
  }
  jaccard(&bigrams(&na), &bigrams(&nb)) >= SIMILARITY_THRESHOLD
}

/// Verify a candidate step list. Issue strings carry the step index so a
/// failing chunk can be located in logs.
pub fn verify_steps(steps: &[Step], options: VerifyOptions) -> Verification {
  if steps.is_empty() {
    return Verification::from_issues(vec!["steps_empty".into()]);
  }

  let mut issues = Vec::new();
  let mut hints = Vec::new();
  let mut solutions = Vec::new();
  let mut calculation_count = 0usize;

  for (index, step) in steps.iter().enumerate() {
    if step.order == 0 {
      issues.push(format!("step_{index}_order_missing"));
    }
    if is_blank(&step.hint) {
      issues.push(format!("step_{index}_hint_missing"));
    } else {
      hints.push(step.hint.trim().to_string());
    }
    if is_blank(&step.solution) {
      issues.push(format!("step_{index}_solution_missing"));
    } else {
      solutions.push(step.solution.trim().to_string());
    }
    if let Some(calc) = &step.calculation {
      calculation_count += 1;
      if is_blank(&calc.expression) {
        issues.push(format!("step_{index}_calc_expression_missing"));
      }
    }
  }

  if has_repeating_run(&hints, REPETITION_RUN) {
    issues.push("repetition_hint".into());
  }
  if has_repeating_run(&solutions, REPETITION_RUN) {
    issues.push("repetition_solution".into());
  }

  for i in 1..hints.len().min(solutions.len()) {
    if has_high_similarity(&hints[i - 1], &hints[i])
      || has_high_similarity(&solutions[i - 1], &solutions[i])
    {
      issues.push(ISSUE_DUPLICATE_SIMILARITY.into());
      break;
    }
  }

  // When several numeric results must be compared, the last step must be a
  // calculation-free judgement step.
  if !options.skip_final_step_check
    && steps.len() >= 2
    && calculation_count >= 2
    && steps.last().map_or(false, |s| s.calculation.is_some())
  {
    issues.push(ISSUE_MISSING_JUDGEMENT_STEP.into());
  }

  if options.ignore_duplicate_similarity {
    issues.retain(|issue| issue != ISSUE_DUPLICATE_SIMILARITY);
  }

  Verification::from_issues(issues)
}

pub fn verify_problems(problems: &[Problem], options: VerifyOptions) -> Verification {
  if problems.is_empty() {
    return Verification::from_issues(vec!["problems_empty".into()]);
  }

  let mut issues = Vec::new();
  for (index, problem) in problems.iter().enumerate() {
    if is_blank(&problem.id) {
      issues.push(format!("problem_{index}_id_missing"));
    }
    if is_blank(&problem.problem_text) {
      issues.push(format!("problem_{index}_text_missing"));
    }
    if is_blank(&problem.final_answer) {
      issues.push(format!("problem_{index}_final_answer_missing"));
    }
    let step_check = verify_steps(&problem.steps, options);
    issues.extend(
      step_check
        .issues
        .into_iter()
        .map(|issue| format!("problem_{index}_{issue}")),
    );
  }

  Verification::from_issues(issues)
}

pub fn verify_analysis(result: &AnalysisResult, options: VerifyOptions) -> Verification {
  let mut issues = Vec::new();
  if result.status != AnalysisStatus::Success {
    issues.push("status_not_success".into());
  }
  let problems_check = verify_problems(&result.problems, options);
  issues.extend(problems_check.issues);
  Verification::from_issues(issues)
}

/// Renumber `order` fields to a contiguous 1..N sequence after chunk assembly.
pub fn normalize_step_orders(steps: &mut [Step]) {
  for (index, step) in steps.iter_mut().enumerate() {
    step.order = index as u32 + 1;
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::domain::CalculationRecord;

  fn step(order: u32, hint: &str, solution: &str) -> Step {
    Step { order, hint: hint.into(), solution: solution.into(), calculation: None }
  }

  fn step_with_calc(order: u32, hint: &str, solution: &str, expr: &str) -> Step {
    Step {
      order,
      hint: hint.into(),
      solution: solution.into(),
      calculation: Some(CalculationRecord {
        expression: expr.into(),
        result: 1.0,
        unit: None,
        note: None,
      }),
    }
  }

  #[test]
  fn empty_steps_fail() {
    let v = verify_steps(&[], VerifyOptions::default());
    assert!(!v.ok);
    assert!(v.has_issue("steps_empty"));
  }

  #[test]
  fn three_identical_hints_trip_repetition() {
    let steps = vec![
      step(1, "同じヒント", "いいね、ここまで大丈夫かな？"),
      step(2, "同じヒント", "次は別のことを考えよう。どうかな？"),
      step(3, "同じヒント", "最後に見比べてみよう。できたかな？"),
    ];
    let v = verify_steps(&steps, VerifyOptions::default());
    assert!(v.has_issue("repetition_hint"));
  }

  #[test]
  fn two_identical_hints_do_not_trip_repetition() {
    let steps = vec![
      step(1, "同じヒント", "まず整理してみよう。どうかな？"),
      step(2, "同じヒント", "数をそろえて比べてみよう。できそうかな？"),
    ];
    let v = verify_steps(&steps, VerifyOptions::default());
    assert!(!v.has_issue("repetition_hint"));
  }

  #[test]
  fn near_duplicate_adjacent_steps_are_flagged() {
    let steps = vec![
      step(1, "1組の人数とメダルの数を確認してみよう", "整理できたね。ここまで大丈夫かな？"),
      step(2, "1組の人数とメダルの数を確認してみようね", "次も同じように考えよう。どうかな？"),
    ];
    let v = verify_steps(&steps, VerifyOptions::default());
    assert!(v.has_issue(ISSUE_DUPLICATE_SIMILARITY));

    let ignored = verify_steps(
      &steps,
      VerifyOptions { ignore_duplicate_similarity: true, ..Default::default() },
    );
    assert!(!ignored.has_issue(ISSUE_DUPLICATE_SIMILARITY));
  }

  #[test]
  fn distinct_steps_pass() {
    let steps = vec![
      step(1, "まず単位をそろえることを考えよう", "単位の意味が分かったね。ここまで大丈夫かな？"),
      step(2, "どの数を使えば1つ分が分かるかな", "使う数が見えてきたね。進めてみようか？"),
    ];
    let v = verify_steps(&steps, VerifyOptions::default());
    assert!(v.ok, "issues: {:?}", v.issues);
  }

  #[test]
  fn trailing_calculation_requires_judgement_step() {
    let steps = vec![
      step_with_calc(1, "1組の1人あたりを考えよう", "そろえられたね。どうかな？", "10 ÷ 4"),
      step_with_calc(2, "2組も同じ考え方でいこう", "こちらも出せたね。できたかな？", "16 ÷ 5"),
    ];
    let v = verify_steps(&steps, VerifyOptions::default());
    assert!(v.has_issue(ISSUE_MISSING_JUDGEMENT_STEP));

    // the same list with a closing judgement step passes
    let mut with_judgement = steps.clone();
    with_judgement.push(step(3, "2つの数を見比べてみよう", "意味を整理できたね。どちらが大きいかな？"));
    let v2 = verify_steps(&with_judgement, VerifyOptions::default());
    assert!(!v2.has_issue(ISSUE_MISSING_JUDGEMENT_STEP));

    // partial chunks skip the check
    let partial = verify_steps(
      &steps,
      VerifyOptions { skip_final_step_check: true, ..Default::default() },
    );
    assert!(!partial.has_issue(ISSUE_MISSING_JUDGEMENT_STEP));
  }

  #[test]
  fn problem_requires_id_text_and_final_answer() {
    let problem = Problem {
      id: String::new(),
      problem_text: "  ".into(),
      steps: vec![step(1, "考えてみよう、何をそろえたいかな", "整理できたね。ここまで大丈夫かな？")],
      final_answer: String::new(),
      method_hint: None,
    };
    let v = verify_problems(std::slice::from_ref(&problem), VerifyOptions::default());
    assert!(v.has_issue("problem_0_id_missing"));
    assert!(v.has_issue("problem_0_text_missing"));
    assert!(v.has_issue("problem_0_final_answer_missing"));
  }

  #[test]
  fn analysis_status_must_be_success() {
    let result = AnalysisResult {
      status: AnalysisStatus::Error,
      problems: vec![Problem {
        id: "p1".into(),
        problem_text: "りんごが3こあります".into(),
        steps: vec![step(1, "数を整理してみよう", "整理できたね。ここまで大丈夫かな？")],
        final_answer: "答え：3こ".into(),
        method_hint: None,
      }],
      meta: None,
      debug: None,
    };
    let v = verify_analysis(&result, VerifyOptions::default());
    assert!(v.has_issue("status_not_success"));
  }

  #[test]
  fn order_normalization_is_contiguous() {
    let mut steps = vec![
      step(7, "a まず整理してみよう", "整理できたね。どうかな？"),
      step(9, "b 数をそろえてみよう", "そろえられたね。できたかな？"),
      step(2, "c 見比べてみよう", "ちがいが見えたね。どちらかな？"),
    ];
    normalize_step_orders(&mut steps);
    let orders: Vec<u32> = steps.iter().map(|s| s.order).collect();
    assert_eq!(orders, vec![1, 2, 3]);
  }
}
