//! Arithmetic expression evaluator used to independently recompute results
//! claimed by generated content.
//!
//! Flow: normalize glyphs -> tokenize -> shunting-yard (with unary minus) ->
//! RPN evaluation. Anything suspicious (division by zero, dangling operators,
//! non-finite values) yields `None` instead of panicking; the caller decides
//! whether to repair or drop the calculation.

#[derive(Clone, Copy, Debug, PartialEq)]
enum Token {
  Number(f64),
  Op(Op),
  ParenOpen,
  ParenClose,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Op {
  Add,
  Sub,
  Mul,
  Div,
  Neg, // unary minus
}

impl Op {
  fn precedence(self) -> u8 {
    match self {
      Op::Neg => 3,
      Op::Mul | Op::Div => 2,
      Op::Add | Op::Sub => 1,
    }
  }

  fn right_assoc(self) -> bool {
    self == Op::Neg
  }
}

/// Canonicalize visually-equivalent operator glyphs and drop everything
/// outside the arithmetic alphabet. Idempotent on already-canonical input.
pub fn normalize_expression(expression: &str) -> String {
  expression
    .chars()
    .filter_map(|ch| match ch {
      '×' | '✕' | '＊' => Some('*'),
      '÷' | '／' => Some('/'),
      '−' | '–' | '—' => Some('-'),
      '＋' => Some('+'),
      c if c.is_whitespace() => None,
      c @ ('0'..='9' | '+' | '-' | '*' | '/' | '(' | ')' | '.') => Some(c),
      _ => None,
    })
    .collect()
}

fn tokenize(expression: &str) -> Option<Vec<Token>> {
  let chars: Vec<char> = expression.chars().collect();
  let mut tokens = Vec::new();
  let mut i = 0;
  while i < chars.len() {
    let ch = chars[i];
    if ch.is_ascii_digit() || ch == '.' {
      let mut j = i + 1;
      while j < chars.len() && (chars[j].is_ascii_digit() || chars[j] == '.') {
        j += 1;
      }
      let literal: String = chars[i..j].iter().collect();
      let value: f64 = literal.parse().ok()?;
      if !value.is_finite() {
        return None;
      }
      tokens.push(Token::Number(value));
      i = j;
      continue;
    }

    match ch {
      '(' => tokens.push(Token::ParenOpen),
      ')' => tokens.push(Token::ParenClose),
      '+' => tokens.push(Token::Op(Op::Add)),
      '-' => tokens.push(Token::Op(Op::Sub)),
      '*' => tokens.push(Token::Op(Op::Mul)),
      '/' => tokens.push(Token::Op(Op::Div)),
      // normalize already removed everything else
      _ => {}
    }
    i += 1;
  }
  Some(tokens)
}

#[derive(Clone, Copy, PartialEq)]
enum PrevToken {
  None,
  Number,
  Operator,
  ParenOpen,
}

fn to_rpn(tokens: &[Token]) -> Option<Vec<Token>> {
  let mut output = Vec::with_capacity(tokens.len());
  let mut ops: Vec<Token> = Vec::new();
  let mut prev = PrevToken::None;

  for &token in tokens {
    match token {
      Token::Number(_) => {
        output.push(token);
        prev = PrevToken::Number;
      }
      Token::ParenOpen => {
        ops.push(token);
        prev = PrevToken::ParenOpen;
      }
      Token::ParenClose => {
        loop {
          match ops.pop() {
            Some(Token::ParenOpen) => break,
            Some(op) => output.push(op),
            None => return None, // unbalanced
          }
        }
        prev = PrevToken::Number;
      }
      Token::Op(mut op) => {
        // A minus after nothing, an operator, or "(" is a sign, not a subtraction.
        if op == Op::Sub && prev != PrevToken::Number {
          op = Op::Neg;
        }
        while let Some(&Token::Op(top)) = ops.last() {
          let should_pop = top.precedence() > op.precedence()
            || (top.precedence() == op.precedence() && !op.right_assoc());
          if !should_pop {
            break;
          }
          output.push(ops.pop()?);
        }
        ops.push(Token::Op(op));
        prev = PrevToken::Operator;
      }
    }
  }

  while let Some(op) = ops.pop() {
    if op == Token::ParenOpen {
      return None;
    }
    output.push(op);
  }
  Some(output)
}

fn eval_rpn(tokens: &[Token]) -> Option<f64> {
  let mut stack: Vec<f64> = Vec::new();
  for &token in tokens {
    match token {
      Token::Number(v) => stack.push(v),
      Token::Op(Op::Neg) => {
        let a = stack.pop()?;
        stack.push(-a);
      }
      Token::Op(op) => {
        let b = stack.pop()?;
        let a = stack.pop()?;
        let result = match op {
          Op::Add => a + b,
          Op::Sub => a - b,
          Op::Mul => a * b,
          Op::Div => {
            if b == 0.0 {
              return None;
            }
            a / b
          }
          Op::Neg => unreachable!(),
        };
        if !result.is_finite() {
          return None;
        }
        stack.push(result);
      }
      Token::ParenOpen | Token::ParenClose => return None,
    }
  }

  if stack.len() != 1 {
    return None;
  }
  let value = stack[0];
  value.is_finite().then_some(value)
}

/// Evaluate a four-function expression. `None` means "cannot be trusted" and
/// the caller must not use a recomputed result. Non-arithmetic characters are
/// stripped first, so natural-language forms (LCM/GCD phrases) must be
/// filtered out by the caller before evaluation.
pub fn evaluate(expression: &str) -> Option<f64> {
  let normalized = normalize_expression(expression);
  if normalized.is_empty() {
    return None;
  }
  let tokens = tokenize(&normalized)?;
  if tokens.is_empty() {
    return None;
  }
  let rpn = to_rpn(&tokens)?;
  if rpn.is_empty() {
    return None;
  }
  eval_rpn(&rpn)
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn precedence_and_parentheses() {
    assert_eq!(evaluate("10 * (2 + 3)"), Some(50.0));
    assert_eq!(evaluate("2 + 3 * 4"), Some(14.0));
    assert_eq!(evaluate("1/2 + 1/4"), Some(0.75));
    assert_eq!(evaluate("(1 + 2) * (3 + 4)"), Some(21.0));
  }

  #[test]
  fn division_by_zero_is_none() {
    assert_eq!(evaluate("5/0"), None);
    assert_eq!(evaluate("1 / (2 - 2)"), None);
  }

  #[test]
  fn glyph_variants_evaluate() {
    assert_eq!(evaluate("3600 ÷ 15"), Some(240.0));
    assert_eq!(evaluate("12 × 3"), Some(36.0));
    assert_eq!(evaluate("１＋２"), None); // fullwidth digits are not supported
  }

  #[test]
  fn noise_characters_are_stripped() {
    // units written into the formula are discarded before evaluation
    assert_eq!(evaluate("100円 ÷ 4人"), Some(25.0));
  }

  #[test]
  fn unary_minus() {
    assert_eq!(evaluate("-3 + 5"), Some(2.0));
    assert_eq!(evaluate("2 * -3"), Some(-6.0));
    assert_eq!(evaluate("-(2 + 3)"), Some(-5.0));
    assert_eq!(evaluate("--4"), Some(4.0));
  }

  #[test]
  fn malformed_shapes_are_none() {
    assert_eq!(evaluate("1 +"), None);
    assert_eq!(evaluate("(1 + 2"), None);
    assert_eq!(evaluate(""), None);
    assert_eq!(evaluate("こたえ"), None);
  }

  #[test]
  fn whitespace_is_stripped_before_tokenizing() {
    // "1 2" becomes the single number 12; whitespace is never a separator
    assert_eq!(evaluate("1 2"), Some(12.0));
    assert_eq!(evaluate("1 0 0 ÷ 4"), Some(25.0));
  }

  #[test]
  fn special_forms_must_be_filtered_by_the_caller() {
    // stripping the phrase leaves "(46)"; the gate never sends these here
    assert_eq!(evaluate("最小公倍数(4と6)"), Some(46.0));
  }

  #[test]
  fn normalization_is_idempotent() {
    let canonical = normalize_expression("3600÷15");
    assert_eq!(canonical, "3600/15");
    assert_eq!(normalize_expression(&canonical), canonical);
  }
}
