//! Prompt and JSON-schema builders, one per pipeline stage.
//!
//! Every builder is a pure function `(context) -> (instruction, schema)`; the
//! `Stage` enum keeps coverage exhaustive at the call sites. Vocabulary and
//! step-count rules are policy strings keyed by difficulty, overridable from
//! TOML, because these evolved across iterations of the product and are not
//! invariants.

use serde::Deserialize;
use serde_json::{json, Value};

use crate::domain::Difficulty;
use crate::util::fill_template;

/// One discrete call to the AI transport.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Stage {
  Extraction,
  Plan,
  StepsChunk,
  Header,
  SingleShot,
  Drill,
}

impl Stage {
  pub fn name(self) -> &'static str {
    match self {
      Stage::Extraction => "extraction",
      Stage::Plan => "plan",
      Stage::StepsChunk => "steps_chunk",
      Stage::Header => "header",
      Stage::SingleShot => "single_shot",
      Stage::Drill => "drill",
    }
  }
}

/// Tunable prompt policy. Defaults match the strictest observed iteration;
/// override via TOML when tuning tone or thresholds.
#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct PromptPolicy {
  pub step_count_easy: String,
  pub step_count_normal: String,
  pub step_count_hard: String,
  pub vocabulary_easy: String,
  pub vocabulary_normal: String,
  pub vocabulary_hard: String,
  /// Appended to the next generation attempt after a quality-gate failure.
  pub corrective_instruction: String,
}

impl Default for PromptPolicy {
  fn default() -> Self {
    Self {
      step_count_easy:
        "ステップ数は2〜3。1ステップは1つの着眼点/計算対象に集中し、途中で余計なノイズを入れない。".into(),
      step_count_normal:
        "ステップ数は3〜5で、前のステップを振り返りながら丁寧に進める。".into(),
      step_count_hard:
        "ステップ数は5〜7。難しさに応じて細かく分割し、1ステップ1つの計算対象を扱う。".into(),
      vocabulary_easy:
        "語彙はやさしく短く。以下の単語は使わない: 最大公約数, 最小公倍数, 比, 割合, 分数, 分母, 分子, 連立, 文字式。".into(),
      vocabulary_normal:
        "基本語（公約数, 面積, あたり, 角度など）は使ってOK。計算式のネタバレになる言い回しは避け、考え方を丁寧に説明する。".into(),
      vocabulary_hard:
        "専門用語は使ってよいが、初出で簡単な補足（例: 「最大公約数(共通の約数のうちいちばん大きな数)」）を添える。".into(),
      corrective_instruction:
        "前の出力で calculation が壊れていた。calculation を出すのは計算が必要なステップだけ。\
         expression は算数の計算式か「最小公倍数(4と6)」「最大公約数(24と40)」のような日本語だけ、\
         カンマや等号は使わない。最小公倍数/最大公約数の result は定義どおり必ず割り切れる値にする。\
         result は数値のみ。".into(),
    }
  }
}

impl PromptPolicy {
  pub fn step_count_rule(&self, difficulty: Difficulty) -> &str {
    match difficulty {
      Difficulty::Easy => &self.step_count_easy,
      Difficulty::Normal => &self.step_count_normal,
      Difficulty::Hard => &self.step_count_hard,
    }
  }

  pub fn vocabulary_rule(&self, difficulty: Difficulty) -> &str {
    match difficulty {
      Difficulty::Easy => &self.vocabulary_easy,
      Difficulty::Normal => &self.vocabulary_normal,
      Difficulty::Hard => &self.vocabulary_hard,
    }
  }
}

// ---- shared rule text -------------------------------------------------------

const ANALYSIS_RULES: &str = "\
あなたは小学生の「考える力」を育てる、一貫性と規律を持ったAIコーチです。
以下の厳格なルールに従ってJSONデータだけを作成してください。

【語り口】
- すべての文章は子供に話しかける「やさしい会話調」で書く。命令調は使わない。
- 文章中の数は半角アラビア数字のみ（漢数字・全角数字は禁止）。単位は数字の直後に続ける。

【役割分担】
- hint には「どこに注目するか」「なぜこの作戦を選ぶのか」だけを書き、計算結果や確定した式は書かない。
- solution には意味づけと短い問いかけだけを書き、式・イコール・計算結果の数値を書かない。
- 途中計算（式と結果）は steps[].calculation にのみ入れる。
- 最終的な答えは final_answer にのみ書く。steps の中で結論を断定してはいけない。

【calculation のルール】
- expression は「+ - × ÷ ( )」の計算式か、「最小公倍数(4と6)」「最大公約数(24と40)」のような日本語表現のみ。
- LCM, GCD, min, max, sqrt などの関数表記は禁止。カンマ区切りや「12 = 12」のような等号も禁止。
- result は必ず数値のみ。整理・比較・照合だけのステップでは calculation を出さない。

【最終判断ステップ】
- 複数の量を比べる問題では、計算がすべて終わったあとに、新しい計算をしない
  「結果を並べて比べ、意味を整理するステップ」を必ず1つ設ける。
- そのステップの solution は、子供が自分で結論にたどり着ける問いかけで締めくくる。";

fn calculation_schema() -> Value {
  json!({
    "type": "object",
    "additionalProperties": false,
    "properties": {
      "expression": { "type": "string" },
      "result": { "type": "number" },
      "unit": { "type": "string" },
      "note": { "type": "string" }
    },
    "required": ["expression", "result"]
  })
}

fn step_schema() -> Value {
  json!({
    "type": "object",
    "additionalProperties": false,
    "properties": {
      "order": { "type": "integer" },
      "hint": { "type": "string" },
      "solution": { "type": "string" },
      "calculation": calculation_schema()
    },
    "required": ["order", "hint", "solution"]
  })
}

pub fn analysis_response_schema() -> Value {
  json!({
    "type": "object",
    "additionalProperties": false,
    "properties": {
      "status": { "type": "string" },
      "problems": {
        "type": "array",
        "items": {
          "type": "object",
          "additionalProperties": false,
          "properties": {
            "id": { "type": "string" },
            "problem_text": { "type": "string" },
            "final_answer": { "type": "string" },
            "method_hint": {
              "type": "object",
              "additionalProperties": false,
              "properties": {
                "label": { "type": "string" },
                "pitch": { "type": "string" }
              },
              "required": ["label", "pitch"]
            },
            "steps": { "type": "array", "items": step_schema() }
          },
          "required": ["id", "problem_text", "steps", "final_answer"]
        }
      }
    },
    "required": ["status", "problems"]
  })
}

// ---- per-stage builders -----------------------------------------------------

/// Extraction: transcribe every problem in the image into clean, de-referenced
/// Japanese (no ①, no "see the figure"); the existence of tables/graphs must
/// stay mentioned in words.
pub fn build_extraction() -> (String, Value) {
  let instruction = "\
画像には算数の問題文が写っています。以下の厳格なルールで、問題文だけを抽出してください。

- 出力は JSON のみ。余計な説明を含めず、指定した構造だけを返す。
- 図中や文章中の数値・単位・割合・条件をすべて自然な日本語で記述し、
  指示語や番号（①など）は具体的な語に置き換える。
- 表・グラフ・図がある場合は、その存在と内容を言葉で問題文に統合する。
- 問題が複数ある場合は、1問ずつ分けて problems に入れる。
- 文章は客観的に説明する形にし、問いかけや命令口調を避ける。"
    .to_string();

  let schema = json!({
    "type": "object",
    "additionalProperties": false,
    "properties": {
      "problems": {
        "type": "array",
        "items": {
          "type": "object",
          "additionalProperties": false,
          "properties": {
            "id": { "type": "string" },
            "title": { "type": "string" },
            "problem_text": { "type": "string" }
          },
          "required": ["id", "problem_text"]
        }
      }
    },
    "required": ["problems"]
  });

  (instruction, schema)
}

/// Plan: step count + one short phrase per step, no formulas, no answers.
pub fn build_plan(policy: &PromptPolicy, problem_text: &str, difficulty: Difficulty) -> (String, Value) {
  let instruction = fill_template(
    "あなたは算数問題のステップ構成だけを考える役割です。\n\
     計算の式や答えは書かず、考え方の流れだけを短く整理してください。\n\n\
     【制御情報】\n\
     - 難易度: {difficulty}\n\
     - {step_rule}\n\
     - 1ステップ＝1つの着眼点の原則は厳守。\n\n\
     【問題文】\n{problem_text}",
    &[
      ("difficulty", &difficulty.to_string()),
      ("step_rule", policy.step_count_rule(difficulty)),
      ("problem_text", problem_text),
    ],
  );

  let schema = json!({
    "type": "object",
    "additionalProperties": false,
    "properties": {
      "step_count": { "type": "integer" },
      "step_titles": { "type": "array", "items": { "type": "string" } }
    },
    "required": ["step_count", "step_titles"]
  });

  (instruction, schema)
}

pub struct StepsChunkContext<'a> {
  pub problem_text: &'a str,
  pub difficulty: Difficulty,
  pub step_titles: &'a [String],
  pub start_order: u32,
  pub end_order: u32,
  /// Set on the bounded regeneration after a missing-judgement-step failure;
  /// only meaningful when this chunk contains the final step of the plan.
  pub force_judgement_step: bool,
}

/// Chunked steps: generate only the given contiguous slice of the plan.
pub fn build_steps_chunk(policy: &PromptPolicy, ctx: &StepsChunkContext<'_>) -> (String, Value) {
  let titles: Vec<String> = ctx
    .step_titles
    .iter()
    .enumerate()
    .map(|(idx, t)| format!("{}. {}", ctx.start_order + idx as u32, t))
    .collect();

  let judgement_clause = if ctx.force_judgement_step {
    "\n- この範囲の最後のステップは計算を行わない「結果を並べて比べるステップ」にすること。calculation は出力しない。"
  } else {
    ""
  };

  let instruction = format!(
    "{ANALYSIS_RULES}\n\n\
     指定された範囲のステップだけを作成してください。\n\n\
     【制御情報】\n\
     - 難易度: {difficulty}\n\
     - {vocab_rule}\n\
     - order は {start} から {end} の連番。{judgement_clause}\n\n\
     【この範囲のステップ要点】\n{titles}\n\n\
     【問題文】\n{problem_text}",
    difficulty = ctx.difficulty,
    vocab_rule = policy.vocabulary_rule(ctx.difficulty),
    start = ctx.start_order,
    end = ctx.end_order,
    judgement_clause = judgement_clause,
    titles = titles.join("\n"),
    problem_text = ctx.problem_text,
  );

  let schema = json!({
    "type": "object",
    "additionalProperties": false,
    "properties": {
      "steps": { "type": "array", "items": step_schema() }
    },
    "required": ["steps"]
  });

  (instruction, schema)
}

/// Header: method hint + two-paragraph final answer, no step re-derivation.
pub fn build_header(
  policy: &PromptPolicy,
  problem_text: &str,
  difficulty: Difficulty,
  step_titles: &[String],
) -> (String, Value) {
  let titles: Vec<String> = step_titles
    .iter()
    .enumerate()
    .map(|(idx, t)| format!("{}. {}", idx + 1, t))
    .collect();

  let instruction = format!(
    "あなたは算数問題の「考え方ヒント」と「最終回答」だけを作成します。\n\
     ステップの中身は作り直さないでください。\n\
     final_answer は「答え：…\\n\\n【理由】…」の形で、会話調で短くまとめてください。\n\n\
     【制御情報】\n\
     - 難易度: {difficulty}\n\
     - {vocab_rule}\n\n\
     【ステップの要点（短く）】\n{titles}\n\n\
     【問題文】\n{problem_text}",
    difficulty = difficulty,
    vocab_rule = policy.vocabulary_rule(difficulty),
    titles = titles.join("\n"),
    problem_text = problem_text,
  );

  let schema = json!({
    "type": "object",
    "additionalProperties": false,
    "properties": {
      "method_hint": {
        "type": "object",
        "additionalProperties": false,
        "properties": {
          "label": { "type": "string" },
          "pitch": { "type": "string" }
        },
        "required": ["label", "pitch"]
      },
      "final_answer": { "type": "string" }
    },
    "required": ["method_hint", "final_answer"]
  });

  (instruction, schema)
}

/// Single-shot: the entire rule set in one request returning the full
/// `Problem` shape. `extra_instruction` carries the corrective appendix after
/// a gate failure.
pub fn build_single_shot(
  policy: &PromptPolicy,
  problem_text: &str,
  difficulty: Difficulty,
  extra_instruction: Option<&str>,
) -> (String, Value) {
  let extra = extra_instruction
    .map(|text| format!("\n\n【追加ルール】\n{text}"))
    .unwrap_or_default();

  let instruction = format!(
    "{ANALYSIS_RULES}\n\n\
     【制御情報（以下を必ず守る）】\n\
     - 難易度: {difficulty}\n\
     - {step_rule}\n\
     - {vocab_rule}\n\
     - problem_text の数値・条件・図表を忠実になぞること。{extra}\n\n\
     【問題文】\n{problem_text}",
    difficulty = difficulty,
    step_rule = policy.step_count_rule(difficulty),
    vocab_rule = policy.vocabulary_rule(difficulty),
    extra = extra,
    problem_text = problem_text,
  );

  (instruction, analysis_response_schema())
}

/// Drill: three isomorphic practice problems for one solved problem.
pub fn build_drill(original_problem: &str) -> (String, Value) {
  let sanitized = original_problem.replace('"', "\\\"");
  let instruction = fill_template(
    "以下の算数の問題と「同じ解き方」で解ける、別の問題を3問作成してください。\n\n\
     元の問題: \"{original}\"\n\n\
     【ルール】\n\
     1. 小学生が理解できる内容にする。\n\
     2. 登場人物や数値、シチュエーションを変える。\n\
     3. 各問題に question（問題文）、answer（答え）、explanation（短い解説）を付ける。\n\
     4. 日本語で、JSON形式のみで返答する。",
    &[("original", sanitized.as_str())],
  );

  let schema = json!({
    "type": "object",
    "additionalProperties": false,
    "properties": {
      "problems": {
        "type": "array",
        "items": {
          "type": "object",
          "additionalProperties": false,
          "properties": {
            "question": { "type": "string" },
            "answer": { "type": "string" },
            "explanation": { "type": "string" }
          },
          "required": ["question", "answer", "explanation"]
        }
      }
    },
    "required": ["problems"]
  });

  (instruction, schema)
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn plan_prompt_carries_difficulty_policy() {
    let policy = PromptPolicy::default();
    let (easy, _) = build_plan(&policy, "問題文", Difficulty::Easy);
    let (hard, _) = build_plan(&policy, "問題文", Difficulty::Hard);
    assert!(easy.contains("2〜3"));
    assert!(hard.contains("5〜7"));
    assert!(easy.contains("問題文"));
  }

  #[test]
  fn chunk_prompt_numbers_titles_from_start_order() {
    let policy = PromptPolicy::default();
    let titles = vec!["単位をそろえる".to_string(), "1つ分を求める".to_string()];
    let ctx = StepsChunkContext {
      problem_text: "問題",
      difficulty: Difficulty::Normal,
      step_titles: &titles,
      start_order: 3,
      end_order: 4,
      force_judgement_step: false,
    };
    let (instruction, schema) = build_steps_chunk(&policy, &ctx);
    assert!(instruction.contains("3. 単位をそろえる"));
    assert!(instruction.contains("4. 1つ分を求める"));
    assert!(instruction.contains("order は 3 から 4"));
    assert_eq!(schema["required"][0], "steps");
  }

  #[test]
  fn judgement_clause_only_when_forced() {
    let policy = PromptPolicy::default();
    let titles = vec!["見比べる".to_string()];
    let mut ctx = StepsChunkContext {
      problem_text: "問題",
      difficulty: Difficulty::Normal,
      step_titles: &titles,
      start_order: 5,
      end_order: 5,
      force_judgement_step: false,
    };
    let (plain, _) = build_steps_chunk(&policy, &ctx);
    assert!(!plain.contains("結果を並べて比べるステップ"));

    ctx.force_judgement_step = true;
    let (forced, _) = build_steps_chunk(&policy, &ctx);
    assert!(forced.contains("結果を並べて比べるステップ"));
  }

  #[test]
  fn schemas_forbid_additional_properties() {
    let (_, extraction) = build_extraction();
    assert_eq!(extraction["additionalProperties"], false);
    let analysis = analysis_response_schema();
    assert_eq!(analysis["additionalProperties"], false);
    assert_eq!(
      analysis["properties"]["problems"]["items"]["additionalProperties"],
      false
    );
  }

  #[test]
  fn single_shot_appends_corrective_instruction() {
    let policy = PromptPolicy::default();
    let (without, _) = build_single_shot(&policy, "問題", Difficulty::Easy, None);
    assert!(!without.contains("追加ルール"));
    let (with, _) = build_single_shot(
      &policy,
      "問題",
      Difficulty::Easy,
      Some(&policy.corrective_instruction),
    );
    assert!(with.contains("追加ルール"));
    assert!(with.contains("カンマや等号は使わない"));
  }
}
