//! Keyword-heuristic difficulty estimator.
//!
//! Pure and deterministic: scans the problem text for signal families
//! (fractions, ratios, percentages, area, per-unit phrasing, GCD/LCM
//! phrasing, geometry, tables/graphs) and counts conditional connectives.
//! A single hard signal outranks any number of normal signals.

use std::sync::OnceLock;

use regex::Regex;

use crate::domain::{Difficulty, DifficultyProfile, LevelSignals};

const CONDITION_KEYWORDS: &[&str] = &["ただし", "もし", "場合", "とき"];

const PERCENTAGE_KEYWORDS: &[&str] = &["%", "パーセント", "百分率", "割合"];
const FRACTION_KEYWORDS: &[&str] = &["分の", "分数"];
const RATIO_KEYWORDS: &[&str] = &["比", "比例", "反比例"];
const AREA_KEYWORDS: &[&str] = &[
  "面積", "平方", "cm2", "cm²", "cm^2", "m2", "m²", "m^2", "㎠", "㎡",
];
const UNIT_RATE_KEYWORDS: &[&str] = &["あたり", "1人あたり", "一人あたり", "こんでいる", "みっしり"];

// GCD fires either on a direct keyword, or on the conjunction of the
// "no remainder" phrase with an "equal share / maximum grouping" phrase.
const GCD_COMBO_BASE: &str = "あまりなく";
const GCD_COMBO_PAIR: &[&str] = &["同じ数ずつ", "できるだけ多く"];
const GCD_DIRECT_KEYWORDS: &[&str] = &[
  "最大公約数", "公約数", "あまりなく配る", "あまりなく分ける", "同じ数ずつ配る",
  "花束", "配りたい", "分けたい",
];

const LCM_KEYWORDS: &[&str] = &["最小公倍数", "公倍数", "何回目で", "周期", "そろって"];
const GEOMETRY_KEYWORDS: &[&str] = &[
  "三角形", "長方形", "円", "角度", "周りの長さ", "周囲の長さ", "直角", "底辺", "高さ",
];
const GRAPH_KEYWORDS: &[&str] = &["グラフ", "表", "棒グラフ", "折れ線"];

fn ratio_regex() -> &'static Regex {
  static RE: OnceLock<Regex> = OnceLock::new();
  RE.get_or_init(|| Regex::new(r"\d+倍").unwrap())
}

fn fraction_regex() -> &'static Regex {
  static RE: OnceLock<Regex> = OnceLock::new();
  RE.get_or_init(|| Regex::new(r"\d+/\d+").unwrap())
}

fn percentage_regex() -> &'static Regex {
  static RE: OnceLock<Regex> = OnceLock::new();
  RE.get_or_init(|| Regex::new(r"\d+%").unwrap())
}

fn area_regex() -> &'static Regex {
  static RE: OnceLock<Regex> = OnceLock::new();
  RE.get_or_init(|| Regex::new(r"(?i)(cm\s*\^?\s*2|m\s*\^?\s*2|cm²|m²)").unwrap())
}

fn contains_any(text: &str, keywords: &[&str]) -> bool {
  keywords.iter().any(|k| text.contains(k))
}

fn count_occurrences(text: &str, keyword: &str) -> u32 {
  if keyword.is_empty() {
    return 0;
  }
  let mut count = 0;
  let mut rest = text;
  while let Some(found) = rest.find(keyword) {
    count += 1;
    rest = &rest[found + keyword.len()..];
  }
  count
}

fn fallback_profile() -> DifficultyProfile {
  DifficultyProfile {
    difficulty: Difficulty::Normal,
    tags: Vec::new(),
    confidence: 0.3,
    signals: LevelSignals::default(),
  }
}

/// Derive a `DifficultyProfile` from raw problem text. No I/O, no randomness.
pub fn estimate(problem_text: &str) -> DifficultyProfile {
  let normalized = problem_text.trim().to_lowercase();
  if normalized.is_empty() {
    return fallback_profile();
  }

  let has_gcd = {
    let has_base = normalized.contains(GCD_COMBO_BASE);
    let has_pair = GCD_COMBO_PAIR.iter().any(|k| normalized.contains(k));
    (has_base && has_pair) || contains_any(&normalized, GCD_DIRECT_KEYWORDS)
  };

  let signals = LevelSignals {
    has_fraction: contains_any(&normalized, FRACTION_KEYWORDS)
      || fraction_regex().is_match(&normalized),
    has_ratio: contains_any(&normalized, RATIO_KEYWORDS) || ratio_regex().is_match(&normalized),
    has_percentage: contains_any(&normalized, PERCENTAGE_KEYWORDS)
      || percentage_regex().is_match(&normalized),
    has_area: contains_any(&normalized, AREA_KEYWORDS) || area_regex().is_match(&normalized),
    has_unit_rate: contains_any(&normalized, UNIT_RATE_KEYWORDS),
    has_gcd,
    has_lcm: contains_any(&normalized, LCM_KEYWORDS),
    has_geometry: contains_any(&normalized, GEOMETRY_KEYWORDS),
    has_graph: contains_any(&normalized, GRAPH_KEYWORDS),
    num_conditions: CONDITION_KEYWORDS
      .iter()
      .map(|k| count_occurrences(&normalized, k))
      .sum(),
  };

  let tag_map: [(bool, &str); 9] = [
    (signals.has_fraction, "fraction"),
    (signals.has_ratio, "ratio"),
    (signals.has_percentage, "percentage"),
    (signals.has_area, "area"),
    (signals.has_unit_rate, "unit_rate"),
    (signals.has_gcd, "gcd"),
    (signals.has_lcm, "lcm"),
    (signals.has_geometry, "geometry"),
    (signals.has_graph, "graph"),
  ];
  let tags: Vec<String> = tag_map
    .iter()
    .filter(|(fired, _)| *fired)
    .map(|(_, tag)| tag.to_string())
    .collect();

  let fired = tags.len() as f64;
  let condition_bonus = 0.03 * (signals.num_conditions.min(5) as f64);
  let confidence = (0.35 + 0.12 * fired + condition_bonus).clamp(0.0, 1.0);

  let has_hard_signal =
    signals.has_ratio || signals.has_percentage || signals.has_fraction || signals.has_lcm;
  let has_normal_signal =
    signals.has_gcd || signals.has_area || signals.has_unit_rate || signals.has_geometry;

  // hard wins even when normal signals also fired
  let difficulty = if has_hard_signal {
    Difficulty::Hard
  } else if has_normal_signal {
    Difficulty::Normal
  } else {
    Difficulty::Easy
  };

  DifficultyProfile { difficulty, tags, confidence, signals }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn blank_input_falls_back() {
    let meta = estimate("   ");
    assert_eq!(meta.difficulty, Difficulty::Normal);
    assert!(meta.tags.is_empty());
    assert!((meta.confidence - 0.3).abs() < 1e-9);
  }

  #[test]
  fn area_problem_is_normal() {
    let meta = estimate("50m²の公園に15人います。どちらがこんでいるでしょう。");
    assert_eq!(meta.difficulty, Difficulty::Normal);
    assert!(meta.tags.iter().any(|t| t == "area"));
    assert!(meta.signals.has_area);
  }

  #[test]
  fn hard_signal_dominates_normal_signal() {
    // has both area (normal) and percentage (hard)
    let meta = estimate("面積の30%は何m²ですか");
    assert_eq!(meta.difficulty, Difficulty::Hard);
    assert!(meta.signals.has_area);
    assert!(meta.signals.has_percentage);
  }

  #[test]
  fn normal_signal_alone_never_yields_hard() {
    let meta = estimate("長方形の面積を考えます");
    assert_ne!(meta.difficulty, Difficulty::Hard);
  }

  #[test]
  fn gcd_combo_rule() {
    // "no remainder" alone does not fire
    let alone = estimate("あまりなくしたい");
    assert!(!alone.signals.has_gcd);

    // combo of "no remainder" + "equal share" fires
    let combo = estimate("あめをあまりなく同じ数ずつくばります");
    assert!(combo.signals.has_gcd);

    // direct keyword fires
    let direct = estimate("24と36の最大公約数を考えます");
    assert!(direct.signals.has_gcd);
  }

  #[test]
  fn lcm_keyword_forces_hard() {
    let meta = estimate("2つのバスがそろって発車するのは何分後ですか。最小公倍数で考えよう");
    assert_eq!(meta.difficulty, Difficulty::Hard);
    assert!(meta.tags.iter().any(|t| t == "lcm"));
  }

  #[test]
  fn condition_count_saturates() {
    let text = "もしもしもしもしもしもしもし"; // overlapping occurrences still count separately
    let meta = estimate(text);
    assert!(meta.signals.num_conditions >= 5);
    assert!(meta.confidence <= 1.0);
  }

  #[test]
  fn plain_text_is_easy() {
    let meta = estimate("りんごが3こ、みかんが5こあります。あわせて何こですか。");
    assert_eq!(meta.difficulty, Difficulty::Easy);
  }
}
