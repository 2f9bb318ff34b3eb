//! Arithmetic quality gate and best-effort auto-repair.
//!
//! Runs on the merged result before it is accepted for return:
//! 1) `normalize_calc_expressions`: canonicalize operator glyphs and
//!    whitespace so the gate sees one spelling of each expression.
//! 2) `validate_calculations`: reason-coded validation of every
//!    `calculation`, including exact divisibility/boundedness invariants for
//!    the natural-language LCM/GCD expression forms.
//! 3) `repair_calculations`: on an accepted result only, drop calculation
//!    blocks that cannot be trusted and recompute results via the evaluator.
//!    Running it earlier would erase the defects the gate must report.
//!
//! A gate failure is a signal for one bounded regeneration with a corrective
//! instruction, never an unbounded loop.

use std::sync::OnceLock;

use regex::Regex;
use tracing::debug;

use crate::domain::Problem;
use crate::expr;
use crate::util::format_number;

const LCM_PHRASE: &str = "最小公倍数";
const GCD_PHRASE: &str = "最大公約数";

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum GateOutcome {
  Ok,
  Rejected { reason: String },
}

impl GateOutcome {
  pub fn is_ok(&self) -> bool {
    matches!(self, GateOutcome::Ok)
  }

  pub fn reason(&self) -> Option<&str> {
    match self {
      GateOutcome::Ok => None,
      GateOutcome::Rejected { reason } => Some(reason),
    }
  }
}

fn allowed_expression_regex() -> &'static Regex {
  static RE: OnceLock<Regex> = OnceLock::new();
  // digits, four-function glyphs, parens, whitespace, and the characters of
  // the two fixed Japanese phrases plus the connecting particle と
  RE.get_or_init(|| Regex::new(r"^[0-9+\-×÷().\s最小公倍数大約と]+$").unwrap())
}

fn plain_formula_regex() -> &'static Regex {
  static RE: OnceLock<Regex> = OnceLock::new();
  RE.get_or_init(|| Regex::new(r"^[0-9+\-×÷().\s]+$").unwrap())
}

fn lcm_gcd_regex() -> &'static Regex {
  static RE: OnceLock<Regex> = OnceLock::new();
  RE.get_or_init(|| {
    Regex::new(r"^(最小公倍数|最大公約数)\s*[(（]\s*(\d+)\s*と\s*(\d+)\s*[)）]\s*$").unwrap()
  })
}

fn digit_only_regex() -> &'static Regex {
  static RE: OnceLock<Regex> = OnceLock::new();
  RE.get_or_init(|| Regex::new(r"^[0-9.\s]+$").unwrap())
}

/// The two special natural-language forms the evaluator refuses to touch.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SpecialForm {
  Lcm { a: u64, b: u64 },
  Gcd { a: u64, b: u64 },
}

/// Parse `最小公倍数(AとB)` / `最大公約数(AとB)`. Returns `None` for anything
/// else, including forms with non-integer or missing operands.
pub fn parse_special_form(expression: &str) -> Option<SpecialForm> {
  let captures = lcm_gcd_regex().captures(expression.trim())?;
  let a: u64 = captures.get(2)?.as_str().parse().ok()?;
  let b: u64 = captures.get(3)?.as_str().parse().ok()?;
  match captures.get(1)?.as_str() {
    LCM_PHRASE => Some(SpecialForm::Lcm { a, b }),
    GCD_PHRASE => Some(SpecialForm::Gcd { a, b }),
    _ => None,
  }
}

fn result_as_positive_integer(result: f64) -> Option<u64> {
  if !result.is_finite() || result <= 0.0 || result.fract() != 0.0 {
    return None;
  }
  Some(result as u64)
}

fn check_special_form(form: SpecialForm, result: f64, at: &str) -> GateOutcome {
  match form {
    SpecialForm::Lcm { a, b } => {
      if a == 0 || b == 0 {
        return GateOutcome::Rejected { reason: format!("lcm_operand_not_positive@{at}") };
      }
      let Some(r) = result_as_positive_integer(result) else {
        return GateOutcome::Rejected { reason: format!("lcm_result_not_positive_integer@{at}") };
      };
      if r % a != 0 || r % b != 0 {
        return GateOutcome::Rejected { reason: format!("lcm_result_not_divisible@{at}") };
      }
      // the true LCM never exceeds the product of the operands
      if r > a.saturating_mul(b) {
        return GateOutcome::Rejected { reason: format!("lcm_result_exceeds_product@{at}") };
      }
      GateOutcome::Ok
    }
    SpecialForm::Gcd { a, b } => {
      if a == 0 || b == 0 {
        return GateOutcome::Rejected { reason: format!("gcd_operand_not_positive@{at}") };
      }
      let Some(r) = result_as_positive_integer(result) else {
        return GateOutcome::Rejected { reason: format!("gcd_result_not_positive_integer@{at}") };
      };
      if a % r != 0 || b % r != 0 {
        return GateOutcome::Rejected { reason: format!("gcd_result_not_divisor@{at}") };
      }
      if r > a.min(b) {
        return GateOutcome::Rejected { reason: format!("gcd_result_exceeds_min_operand@{at}") };
      }
      GateOutcome::Ok
    }
  }
}

/// Validate every `calculation` in the result. The first violation wins; its
/// reason code carries the problem/step coordinates.
pub fn validate_calculations(problems: &[Problem]) -> GateOutcome {
  for (problem_index, problem) in problems.iter().enumerate() {
    for (step_index, step) in problem.steps.iter().enumerate() {
      let Some(calc) = &step.calculation else { continue };
      let at = format!("{problem_index}:{step_index}");

      if !calc.result.is_finite() {
        return GateOutcome::Rejected { reason: format!("result_not_number@{at}") };
      }

      let expression = calc.expression.trim();
      if let Some(form) = parse_special_form(expression) {
        // the special forms may legitimately contain parens and と, so they
        // bypass the comma/equals and charset checks below
        let outcome = check_special_form(form, calc.result, &at);
        if !outcome.is_ok() {
          return outcome;
        }
        continue;
      }

      // a comma or equals sign means the model wrote a judgement or a list
      // instead of a single formula
      if expression.contains(',') || expression.contains('=') {
        return GateOutcome::Rejected { reason: format!("expression_invalid_token@{at}") };
      }
      if !allowed_expression_regex().is_match(expression) {
        return GateOutcome::Rejected { reason: format!("expression_invalid_chars@{at}") };
      }
    }
  }
  GateOutcome::Ok
}

/// Canonicalize `*`/`/` glyphs and collapse whitespace, in place.
pub fn normalize_calc_expressions(problems: &mut [Problem]) {
  for problem in problems.iter_mut() {
    for step in problem.steps.iter_mut() {
      if let Some(calc) = step.calculation.as_mut() {
        let collapsed: Vec<&str> = calc.expression.trim().split_whitespace().collect();
        calc.expression = collapsed.join(" ").replace('*', "×").replace('/', "÷");
      }
    }
  }
}

/// Best-effort repair, run only after the gate has accepted the result:
/// - leave the LCM/GCD forms alone (the evaluator cannot check them),
/// - drop a calculation whose expression is a bare number or unevaluable,
/// - recompute `result` for plain four-function formulas, overriding the
///   model-provided value.
pub fn repair_calculations(problems: &mut [Problem]) {
  for problem in problems.iter_mut() {
    for step in problem.steps.iter_mut() {
      let Some(calc) = step.calculation.as_ref() else { continue };
      let expression = calc.expression.trim().to_string();

      if expression.contains(LCM_PHRASE) || expression.contains(GCD_PHRASE) {
        continue;
      }
      if digit_only_regex().is_match(&expression) {
        // a bare number is not a calculation
        debug!(target: "quality_gate", %expression, "dropping operator-free calculation");
        step.calculation = None;
        continue;
      }
      if !plain_formula_regex().is_match(&expression) {
        step.calculation = None;
        continue;
      }
      match expr::evaluate(&expression) {
        Some(computed) => {
          let Some(calc) = step.calculation.as_mut() else { continue };
          if (calc.result - computed).abs() > f64::EPSILON {
            debug!(
              target: "quality_gate",
              %expression,
              claimed = %format_number(calc.result),
              computed = %format_number(computed),
              "overriding model-provided result"
            );
          }
          calc.result = computed;
        }
        None => {
          step.calculation = None;
        }
      }
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::domain::{CalculationRecord, Step};

  fn problem_with_calc(expression: &str, result: f64) -> Problem {
    Problem {
      id: "p1".into(),
      problem_text: "text".into(),
      steps: vec![Step {
        order: 1,
        hint: "h".into(),
        solution: "s".into(),
        calculation: Some(CalculationRecord {
          expression: expression.into(),
          result,
          unit: None,
          note: None,
        }),
      }],
      final_answer: "answer".into(),
      method_hint: None,
    }
  }

  #[test]
  fn plain_formula_passes() {
    let p = problem_with_calc("3600 ÷ 15", 240.0);
    assert!(validate_calculations(std::slice::from_ref(&p)).is_ok());
  }

  #[test]
  fn equals_sign_is_rejected_as_token() {
    let p = problem_with_calc("12 = 12", 12.0);
    let outcome = validate_calculations(std::slice::from_ref(&p));
    assert_eq!(outcome.reason(), Some("expression_invalid_token@0:0"));
  }

  #[test]
  fn comma_list_is_rejected_as_token() {
    let p = problem_with_calc("3,4", 34.0);
    let outcome = validate_calculations(std::slice::from_ref(&p));
    assert_eq!(outcome.reason(), Some("expression_invalid_token@0:0"));
  }

  #[test]
  fn function_notation_is_rejected_by_charset() {
    let p = problem_with_calc("LCM(4 6)", 12.0);
    let outcome = validate_calculations(std::slice::from_ref(&p));
    assert_eq!(outcome.reason(), Some("expression_invalid_chars@0:0"));
  }

  #[test]
  fn lcm_form_parses() {
    assert_eq!(parse_special_form("最小公倍数(4と6)"), Some(SpecialForm::Lcm { a: 4, b: 6 }));
    assert_eq!(parse_special_form("最大公約数（24と40）"), Some(SpecialForm::Gcd { a: 24, b: 40 }));
    assert_eq!(parse_special_form("最小公倍数(4, 6)"), None);
    assert_eq!(parse_special_form("3600 ÷ 15"), None);
  }

  #[test]
  fn lcm_invariants() {
    // 12 is divisible by 4 and 6 and <= 24
    let ok = problem_with_calc("最小公倍数(4と6)", 12.0);
    assert!(validate_calculations(std::slice::from_ref(&ok)).is_ok());

    // 46 looks like digit concatenation; it is not divisible by 6 evenly? 46 % 6 != 0
    let concat = problem_with_calc("最小公倍数(4と6)", 46.0);
    assert_eq!(
      validate_calculations(std::slice::from_ref(&concat)).reason(),
      Some("lcm_result_not_divisible@0:0")
    );

    // divisible by both but above the product bound
    let too_big = problem_with_calc("最小公倍数(4と6)", 48.0);
    assert_eq!(
      validate_calculations(std::slice::from_ref(&too_big)).reason(),
      Some("lcm_result_exceeds_product@0:0")
    );

    let not_integer = problem_with_calc("最小公倍数(4と6)", 11.5);
    assert_eq!(
      validate_calculations(std::slice::from_ref(&not_integer)).reason(),
      Some("lcm_result_not_positive_integer@0:0")
    );
  }

  #[test]
  fn gcd_invariants() {
    let ok = problem_with_calc("最大公約数(24と40)", 8.0);
    assert!(validate_calculations(std::slice::from_ref(&ok)).is_ok());

    let not_divisor = problem_with_calc("最大公約数(24と40)", 6.0);
    assert_eq!(
      validate_calculations(std::slice::from_ref(&not_divisor)).reason(),
      Some("gcd_result_not_divisor@0:0")
    );

    let above_min = problem_with_calc("最大公約数(24と40)", 48.0);
    assert_eq!(
      validate_calculations(std::slice::from_ref(&above_min)).reason(),
      Some("gcd_result_not_divisor@0:0")
    );

    let zero = problem_with_calc("最大公約数(24と40)", 0.0);
    assert_eq!(
      validate_calculations(std::slice::from_ref(&zero)).reason(),
      Some("gcd_result_not_positive_integer@0:0")
    );
  }

  #[test]
  fn normalize_rewrites_ascii_operators() {
    let mut p = vec![problem_with_calc("  10 * 4  ", 40.0)];
    normalize_calc_expressions(&mut p);
    assert_eq!(p[0].steps[0].calculation.as_ref().unwrap().expression, "10 × 4");
  }

  #[test]
  fn repair_overrides_wrong_result() {
    let mut p = vec![problem_with_calc("10 ÷ 4", 3.0)];
    repair_calculations(&mut p);
    let calc = p[0].steps[0].calculation.as_ref().unwrap();
    assert_eq!(calc.result, 2.5);
  }

  #[test]
  fn repair_drops_bare_number_and_unevaluable() {
    let mut bare = vec![problem_with_calc("240", 240.0)];
    repair_calculations(&mut bare);
    assert!(bare[0].steps[0].calculation.is_none());

    let mut broken = vec![problem_with_calc("10 ÷ 0", 0.0)];
    repair_calculations(&mut broken);
    assert!(broken[0].steps[0].calculation.is_none());
  }

  #[test]
  fn repair_leaves_special_forms_alone() {
    let mut p = vec![problem_with_calc("最小公倍数(4と6)", 12.0)];
    repair_calculations(&mut p);
    let calc = p[0].steps[0].calculation.as_ref().unwrap();
    assert_eq!(calc.expression, "最小公倍数(4と6)");
    assert_eq!(calc.result, 12.0);
  }
}
