//! Sandboxed expression language for `conditional` steps.
//!
//! Arithmetic, comparison and boolean operators over JSON values, plus
//! dotted paths into the execution context. There are no function calls,
//! assignments or loops, so evaluation always terminates and never has side
//! effects.
//!
//! ```text
//! step_0.output.category == "invoice" and input.amount > 50
//! not (step_1.output.status starts_with "err") || input.force
//! (input.total - input.paid) % 2 == 0
//! input.email matches "@example\\.com$"
//! ```
//!
//! Grammar:
//! ```text
//! expr    = or
//! or      = and (("or" | "||") and)*
//! and     = not (("and" | "&&") not)*
//! not     = ("not" | "!") not | cmp
//! cmp     = sum (CMP_OP sum)?
//! sum     = product (("+" | "-") product)*
//! product = unary (("*" | "/" | "%") unary)*
//! unary   = "-" unary | primary
//! primary = NUMBER | STRING | "true" | "false" | "null" | PATH | "(" expr ")"
//! ```
//!
//! Missing paths evaluate to `null`. Type mismatches, division by zero,
//! invalid regexes and non-boolean results are errors.

use regex_lite::Regex;
use serde_json::{Number, Value};
use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Error)]
pub enum ExprError {
    #[error("parse error: {0}")]
    Parse(String),

    #[error("type mismatch: '{op}' cannot apply to {left} and {right}")]
    TypeMismatch {
        op: &'static str,
        left: &'static str,
        right: &'static str,
    },

    #[error("division by zero")]
    DivisionByZero,

    #[error("invalid regex '{pattern}': {reason}")]
    InvalidRegex { pattern: String, reason: String },

    #[error("expression produced {0}, expected a boolean")]
    NotBoolean(&'static str),

    #[error("arithmetic result is not a finite number")]
    NotFinite,
}

/// Binary operators, in the order they appear in the grammar.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BinOp {
    Eq,
    Ne,
    Gt,
    Lt,
    Ge,
    Le,
    Contains,
    StartsWith,
    EndsWith,
    Matches,
    Add,
    Sub,
    Mul,
    Div,
    Rem,
}

impl BinOp {
    fn symbol(self) -> &'static str {
        match self {
            Self::Eq => "==",
            Self::Ne => "!=",
            Self::Gt => ">",
            Self::Lt => "<",
            Self::Ge => ">=",
            Self::Le => "<=",
            Self::Contains => "contains",
            Self::StartsWith => "starts_with",
            Self::EndsWith => "ends_with",
            Self::Matches => "matches",
            Self::Add => "+",
            Self::Sub => "-",
            Self::Mul => "*",
            Self::Div => "/",
            Self::Rem => "%",
        }
    }

    pub fn is_comparison(self) -> bool {
        !matches!(self, Self::Add | Self::Sub | Self::Mul | Self::Div | Self::Rem)
    }
}

/// A parsed expression tree.
#[derive(Debug, Clone, PartialEq)]
pub enum Expr {
    Literal(Value),
    /// Dotted path, already split into segments
    Path(Vec<String>),
    Not(Box<Expr>),
    Neg(Box<Expr>),
    And(Box<Expr>, Box<Expr>),
    Or(Box<Expr>, Box<Expr>),
    Binary(BinOp, Box<Expr>, Box<Expr>),
}

fn type_name(v: &Value) -> &'static str {
    match v {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

fn mismatch(op: BinOp, left: &Value, right: &Value) -> ExprError {
    ExprError::TypeMismatch {
        op: op.symbol(),
        left: type_name(left),
        right: type_name(right),
    }
}

/// Equality with numbers compared by value (`1 == 1.0`).
fn loose_eq(a: &Value, b: &Value) -> bool {
    match (a, b) {
        (Value::Number(x), Value::Number(y)) => x.as_f64() == y.as_f64(),
        _ => a == b,
    }
}

fn number(n: f64) -> Result<Value, ExprError> {
    Number::from_f64(n).map(Value::Number).ok_or(ExprError::NotFinite)
}

fn as_bool(v: Value) -> Result<bool, ExprError> {
    match v {
        Value::Bool(b) => Ok(b),
        other => Err(ExprError::NotBoolean(type_name(&other))),
    }
}

impl Expr {
    /// Evaluate against a path resolver. The resolver returns `Null` for
    /// paths it cannot find.
    pub fn evaluate<F>(&self, resolve: &F) -> Result<Value, ExprError>
    where
        F: Fn(&[String]) -> Value,
    {
        match self {
            Expr::Literal(v) => Ok(v.clone()),
            Expr::Path(segments) => Ok(resolve(segments)),
            Expr::Not(inner) => Ok(Value::Bool(!as_bool(inner.evaluate(resolve)?)?)),
            Expr::Neg(inner) => match inner.evaluate(resolve)? {
                Value::Number(n) => number(-n.as_f64().unwrap_or_default()),
                other => Err(ExprError::TypeMismatch {
                    op: "-",
                    left: "nothing",
                    right: type_name(&other),
                }),
            },
            Expr::And(a, b) => {
                if !as_bool(a.evaluate(resolve)?)? {
                    return Ok(Value::Bool(false));
                }
                Ok(Value::Bool(as_bool(b.evaluate(resolve)?)?))
            }
            Expr::Or(a, b) => {
                if as_bool(a.evaluate(resolve)?)? {
                    return Ok(Value::Bool(true));
                }
                Ok(Value::Bool(as_bool(b.evaluate(resolve)?)?))
            }
            Expr::Binary(op, a, b) => {
                let left = a.evaluate(resolve)?;
                let right = b.evaluate(resolve)?;
                apply(*op, &left, &right)
            }
        }
    }

    /// Evaluate and require a boolean result.
    pub fn evaluate_bool<F>(&self, resolve: &F) -> Result<bool, ExprError>
    where
        F: Fn(&[String]) -> Value,
    {
        as_bool(self.evaluate(resolve)?)
    }

    /// Number of comparison atoms; feeds the condition-count factor.
    pub fn comparison_count(&self) -> usize {
        match self {
            Expr::Literal(_) | Expr::Path(_) => 0,
            Expr::Not(inner) | Expr::Neg(inner) => inner.comparison_count(),
            Expr::And(a, b) | Expr::Or(a, b) => a.comparison_count() + b.comparison_count(),
            Expr::Binary(op, a, b) => {
                usize::from(op.is_comparison()) + a.comparison_count() + b.comparison_count()
            }
        }
    }

    /// Every path referenced by the expression.
    pub fn paths(&self) -> Vec<&[String]> {
        let mut out = Vec::new();
        self.collect_paths(&mut out);
        out
    }

    fn collect_paths<'a>(&'a self, out: &mut Vec<&'a [String]>) {
        match self {
            Expr::Literal(_) => {}
            Expr::Path(segments) => out.push(segments),
            Expr::Not(inner) | Expr::Neg(inner) => inner.collect_paths(out),
            Expr::And(a, b) | Expr::Or(a, b) | Expr::Binary(_, a, b) => {
                a.collect_paths(out);
                b.collect_paths(out);
            }
        }
    }
}

fn apply(op: BinOp, left: &Value, right: &Value) -> Result<Value, ExprError> {
    match op {
        BinOp::Eq => Ok(Value::Bool(loose_eq(left, right))),
        BinOp::Ne => Ok(Value::Bool(!loose_eq(left, right))),
        BinOp::Gt | BinOp::Lt | BinOp::Ge | BinOp::Le => {
            let ordering = match (left, right) {
                (Value::Number(x), Value::Number(y)) => x
                    .as_f64()
                    .zip(y.as_f64())
                    .and_then(|(x, y)| x.partial_cmp(&y)),
                (Value::String(x), Value::String(y)) => Some(x.cmp(y)),
                _ => None,
            }
            .ok_or_else(|| mismatch(op, left, right))?;
            let result = match op {
                BinOp::Gt => ordering.is_gt(),
                BinOp::Lt => ordering.is_lt(),
                BinOp::Ge => ordering.is_ge(),
                _ => ordering.is_le(),
            };
            Ok(Value::Bool(result))
        }
        BinOp::Contains => match (left, right) {
            (Value::String(haystack), Value::String(needle)) => Ok(Value::Bool(haystack.contains(needle.as_str()))),
            (Value::Array(items), needle) => Ok(Value::Bool(items.iter().any(|item| loose_eq(item, needle)))),
            (Value::Object(map), Value::String(key)) => Ok(Value::Bool(map.contains_key(key))),
            _ => Err(mismatch(op, left, right)),
        },
        BinOp::StartsWith | BinOp::EndsWith => match (left, right) {
            (Value::String(s), Value::String(affix)) => Ok(Value::Bool(if op == BinOp::StartsWith {
                s.starts_with(affix.as_str())
            } else {
                s.ends_with(affix.as_str())
            })),
            _ => Err(mismatch(op, left, right)),
        },
        BinOp::Matches => match (left, right) {
            (Value::String(s), Value::String(pattern)) => {
                let re = Regex::new(pattern).map_err(|e| ExprError::InvalidRegex {
                    pattern: pattern.clone(),
                    reason: e.to_string(),
                })?;
                Ok(Value::Bool(re.is_match(s)))
            }
            _ => Err(mismatch(op, left, right)),
        },
        BinOp::Add => match (left, right) {
            (Value::String(a), Value::String(b)) => Ok(Value::String(format!("{a}{b}"))),
            _ => arithmetic(op, left, right),
        },
        BinOp::Sub | BinOp::Mul | BinOp::Div | BinOp::Rem => arithmetic(op, left, right),
    }
}

fn arithmetic(op: BinOp, left: &Value, right: &Value) -> Result<Value, ExprError> {
    let (Some(a), Some(b)) = (left.as_f64(), right.as_f64()) else {
        return Err(mismatch(op, left, right));
    };
    let result = match op {
        BinOp::Add => a + b,
        BinOp::Sub => a - b,
        BinOp::Mul => a * b,
        BinOp::Div | BinOp::Rem if b == 0.0 => return Err(ExprError::DivisionByZero),
        BinOp::Div => a / b,
        _ => a % b,
    };
    number(result)
}

// ─── Parser ──────────────────────────────────────────────────────────

/// Parse an expression string.
pub fn parse(input: &str) -> Result<Expr, ExprError> {
    let input = input.trim();
    if input.is_empty() {
        return Err(ExprError::Parse("empty expression".into()));
    }
    let tokens = tokenize(input)?;
    if tokens.len() > MAX_TOKENS {
        return Err(ExprError::Parse(format!("expression too long ({} tokens, limit {MAX_TOKENS})", tokens.len())));
    }
    let (expr, rest) = parse_or(&tokens, 0)?;
    if !rest.is_empty() {
        return Err(ExprError::Parse(format!("unexpected tokens after expression: {rest:?}")));
    }
    Ok(expr)
}

#[derive(Debug, Clone, PartialEq)]
enum Token {
    Ident(String),
    Str(String),
    Num(f64),
    True,
    False,
    Null,
    And,
    Or,
    Not,
    Op(BinOp),
    LParen,
    RParen,
}

fn tokenize(input: &str) -> Result<Vec<Token>, ExprError> {
    let mut tokens = Vec::new();
    let mut chars = input.chars().peekable();

    while let Some(&c) = chars.peek() {
        match c {
            ' ' | '\t' | '\n' | '\r' => {
                chars.next();
            }
            '(' => {
                chars.next();
                tokens.push(Token::LParen);
            }
            ')' => {
                chars.next();
                tokens.push(Token::RParen);
            }
            '+' | '-' | '*' | '/' | '%' => {
                chars.next();
                tokens.push(Token::Op(match c {
                    '+' => BinOp::Add,
                    '-' => BinOp::Sub,
                    '*' => BinOp::Mul,
                    '/' => BinOp::Div,
                    _ => BinOp::Rem,
                }));
            }
            '"' | '\'' => {
                let quote = c;
                chars.next();
                let mut s = String::new();
                loop {
                    match chars.next() {
                        Some('\\') => match chars.next() {
                            Some('n') => s.push('\n'),
                            Some('t') => s.push('\t'),
                            Some(escaped) => s.push(escaped),
                            None => return Err(ExprError::Parse("unterminated string literal".into())),
                        },
                        Some(ch) if ch == quote => break,
                        Some(ch) => s.push(ch),
                        None => return Err(ExprError::Parse("unterminated string literal".into())),
                    }
                }
                tokens.push(Token::Str(s));
            }
            '>' | '<' => {
                chars.next();
                let or_equal = chars.peek() == Some(&'=');
                if or_equal {
                    chars.next();
                }
                tokens.push(Token::Op(match (c, or_equal) {
                    ('>', true) => BinOp::Ge,
                    ('>', false) => BinOp::Gt,
                    (_, true) => BinOp::Le,
                    (_, false) => BinOp::Lt,
                }));
            }
            '=' => {
                chars.next();
                if chars.next() != Some('=') {
                    return Err(ExprError::Parse("expected '==' (assignment is not supported)".into()));
                }
                tokens.push(Token::Op(BinOp::Eq));
            }
            '!' => {
                chars.next();
                if chars.peek() == Some(&'=') {
                    chars.next();
                    tokens.push(Token::Op(BinOp::Ne));
                } else {
                    tokens.push(Token::Not);
                }
            }
            '&' | '|' => {
                chars.next();
                if chars.next() != Some(c) {
                    return Err(ExprError::Parse(format!("expected '{c}{c}'")));
                }
                tokens.push(if c == '&' { Token::And } else { Token::Or });
            }
            _ if c.is_ascii_digit() => {
                let mut num_str = String::new();
                while let Some(&nc) = chars.peek() {
                    if nc.is_ascii_digit() || nc == '.' {
                        num_str.push(nc);
                        chars.next();
                    } else {
                        break;
                    }
                }
                match num_str.parse::<f64>() {
                    Ok(n) => tokens.push(Token::Num(n)),
                    Err(_) => return Err(ExprError::Parse(format!("invalid number: {num_str}"))),
                }
            }
            _ if c.is_alphabetic() || c == '_' => {
                let mut word = String::new();
                while let Some(&wc) = chars.peek() {
                    if wc.is_alphanumeric() || wc == '_' || wc == '.' {
                        word.push(wc);
                        chars.next();
                    } else {
                        break;
                    }
                }
                let token = match word.as_str() {
                    "and" | "AND" => Token::And,
                    "or" | "OR" => Token::Or,
                    "not" | "NOT" => Token::Not,
                    "true" => Token::True,
                    "false" => Token::False,
                    "null" => Token::Null,
                    "contains" | "CONTAINS" => Token::Op(BinOp::Contains),
                    "starts_with" | "STARTS_WITH" => Token::Op(BinOp::StartsWith),
                    "ends_with" | "ENDS_WITH" => Token::Op(BinOp::EndsWith),
                    "matches" | "MATCHES" => Token::Op(BinOp::Matches),
                    _ => Token::Ident(word),
                };
                tokens.push(token);
            }
            _ => return Err(ExprError::Parse(format!("unexpected character: {c}"))),
        }
    }

    Ok(tokens)
}

type Parsed<'a> = Result<(Expr, &'a [Token]), ExprError>;

/// Deepest nesting of parentheses, `not` and unary minus accepted.
const MAX_DEPTH: usize = 64;

/// Longest expression accepted, in tokens. Operator chains build trees as
/// deep as they are long, and evaluation recurses over them.
const MAX_TOKENS: usize = 1024;

fn nested(depth: usize) -> Result<usize, ExprError> {
    if depth >= MAX_DEPTH {
        return Err(ExprError::Parse("expression nested too deeply".into()));
    }
    Ok(depth + 1)
}

fn parse_or(tokens: &[Token], depth: usize) -> Parsed<'_> {
    let (mut left, mut rest) = parse_and(tokens, depth)?;
    while rest.first() == Some(&Token::Or) {
        let (right, remaining) = parse_and(&rest[1..], depth)?;
        left = Expr::Or(Box::new(left), Box::new(right));
        rest = remaining;
    }
    Ok((left, rest))
}

fn parse_and(tokens: &[Token], depth: usize) -> Parsed<'_> {
    let (mut left, mut rest) = parse_not(tokens, depth)?;
    while rest.first() == Some(&Token::And) {
        let (right, remaining) = parse_not(&rest[1..], depth)?;
        left = Expr::And(Box::new(left), Box::new(right));
        rest = remaining;
    }
    Ok((left, rest))
}

fn parse_not(tokens: &[Token], depth: usize) -> Parsed<'_> {
    if tokens.first() == Some(&Token::Not) {
        let (inner, rest) = parse_not(&tokens[1..], nested(depth)?)?;
        return Ok((Expr::Not(Box::new(inner)), rest));
    }
    parse_cmp(tokens, depth)
}

fn parse_cmp(tokens: &[Token], depth: usize) -> Parsed<'_> {
    let (left, rest) = parse_sum(tokens, depth)?;
    match rest.first() {
        Some(Token::Op(op)) if op.is_comparison() => {
            let (right, remaining) = parse_sum(&rest[1..], depth)?;
            Ok((Expr::Binary(*op, Box::new(left), Box::new(right)), remaining))
        }
        _ => Ok((left, rest)),
    }
}

fn parse_sum(tokens: &[Token], depth: usize) -> Parsed<'_> {
    let (mut left, mut rest) = parse_product(tokens, depth)?;
    while let Some(Token::Op(op @ (BinOp::Add | BinOp::Sub))) = rest.first() {
        let (right, remaining) = parse_product(&rest[1..], depth)?;
        left = Expr::Binary(*op, Box::new(left), Box::new(right));
        rest = remaining;
    }
    Ok((left, rest))
}

fn parse_product(tokens: &[Token], depth: usize) -> Parsed<'_> {
    let (mut left, mut rest) = parse_unary(tokens, depth)?;
    while let Some(Token::Op(op @ (BinOp::Mul | BinOp::Div | BinOp::Rem))) = rest.first() {
        let (right, remaining) = parse_unary(&rest[1..], depth)?;
        left = Expr::Binary(*op, Box::new(left), Box::new(right));
        rest = remaining;
    }
    Ok((left, rest))
}

fn parse_unary(tokens: &[Token], depth: usize) -> Parsed<'_> {
    if tokens.first() == Some(&Token::Op(BinOp::Sub)) {
        let (inner, rest) = parse_unary(&tokens[1..], nested(depth)?)?;
        return Ok((Expr::Neg(Box::new(inner)), rest));
    }
    parse_primary(tokens, depth)
}

fn parse_primary(tokens: &[Token], depth: usize) -> Parsed<'_> {
    let Some((first, rest)) = tokens.split_first() else {
        return Err(ExprError::Parse("unexpected end of expression".into()));
    };
    let expr = match first {
        Token::LParen => {
            let (inner, rest) = parse_or(rest, nested(depth)?)?;
            if rest.first() != Some(&Token::RParen) {
                return Err(ExprError::Parse("expected closing parenthesis".into()));
            }
            return Ok((inner, &rest[1..]));
        }
        Token::Num(n) => Expr::Literal(number(*n)?),
        Token::Str(s) => Expr::Literal(Value::String(s.clone())),
        Token::True => Expr::Literal(Value::Bool(true)),
        Token::False => Expr::Literal(Value::Bool(false)),
        Token::Null => Expr::Literal(Value::Null),
        Token::Ident(path) => {
            let segments: Vec<String> = path.split('.').map(String::from).collect();
            if segments.iter().any(String::is_empty) {
                return Err(ExprError::Parse(format!("malformed path '{path}'")));
            }
            Expr::Path(segments)
        }
        other => return Err(ExprError::Parse(format!("unexpected token {other:?}"))),
    };
    Ok((expr, rest))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn context() -> Value {
        json!({
            "input": {"amount": 120, "email": "ap@example.com", "tags": ["urgent", "vip"], "paid": 20},
            "step_0": {"output": {"category": "invoice", "score": 0.8}}
        })
    }

    fn eval(src: &str) -> Result<Value, ExprError> {
        let ctx = context();
        let resolve = |segments: &[String]| {
            segments
                .iter()
                .try_fold(&ctx, |v, s| v.get(s.as_str()))
                .cloned()
                .unwrap_or(Value::Null)
        };
        parse(src)?.evaluate(&resolve)
    }

    fn truthy(src: &str) -> bool {
        eval(src).unwrap() == Value::Bool(true)
    }

    #[test]
    fn comparisons_on_paths() {
        assert!(truthy(r#"step_0.output.category == "invoice""#));
        assert!(truthy("input.amount > 100"));
        assert!(truthy("input.amount >= 120 and input.amount <= 120"));
        assert!(truthy("step_0.output.score != 1"));
        assert!(truthy("120 == 120.0"));
    }

    #[test]
    fn boolean_operators_and_precedence() {
        assert!(truthy("input.amount > 500 or input.amount > 100"));
        assert!(truthy("not input.amount > 500"));
        assert!(truthy("!(input.amount > 500) && true"));
        assert!(truthy("false || true and true"));
        assert!(!truthy("(false || true) and false"));
    }

    #[test]
    fn arithmetic_follows_precedence() {
        assert_eq!(eval("2 + 3 * 4").unwrap().as_f64(), Some(14.0));
        assert_eq!(eval("(2 + 3) * 4").unwrap().as_f64(), Some(20.0));
        assert_eq!(eval("-input.paid + 5").unwrap().as_f64(), Some(-15.0));
        assert!(truthy("(input.amount - input.paid) % 2 == 0"));
        assert!(truthy(r#""ab" + "c" == "abc""#));
    }

    #[test]
    fn string_and_collection_operators() {
        assert!(truthy(r#"input.email ends_with "@example.com""#));
        assert!(truthy(r#"input.email starts_with "ap""#));
        assert!(truthy(r#"input.tags contains "vip""#));
        assert!(truthy(r#"input contains "email""#));
        assert!(truthy(r#"input.email matches "^[a-z]+@example\\.com$""#));
    }

    #[test]
    fn missing_paths_are_null() {
        assert!(truthy("input.nope == null"));
        assert!(truthy("step_9.output.x == null"));
    }

    #[test]
    fn type_mismatches_are_errors() {
        assert!(matches!(eval("input.nope > 5"), Err(ExprError::TypeMismatch { .. })));
        assert!(matches!(eval(r#"input.amount contains "1""#), Err(ExprError::TypeMismatch { .. })));
        assert!(matches!(eval("1 and true"), Err(ExprError::NotBoolean("number"))));
    }

    #[test]
    fn division_by_zero_and_bad_regex() {
        assert_eq!(eval("1 / 0"), Err(ExprError::DivisionByZero));
        assert_eq!(eval("5 % 0"), Err(ExprError::DivisionByZero));
        assert!(matches!(eval(r#"input.email matches "(""#), Err(ExprError::InvalidRegex { .. })));
    }

    #[test]
    fn non_boolean_result_is_rejected_by_evaluate_bool() {
        let expr = parse("input.amount + 1").unwrap();
        let err = expr.evaluate_bool(&|_: &[String]| json!(1)).unwrap_err();
        assert_eq!(err, ExprError::NotBoolean("number"));
    }

    #[test]
    fn parse_errors() {
        assert!(parse("").is_err());
        assert!(parse("a = 1").is_err());
        assert!(parse("(a > 1").is_err());
        assert!(parse("a > ").is_err());
        assert!(parse("a > 1 b").is_err());
        assert!(parse(r#""unterminated"#).is_err());
        assert!(parse("a & b").is_err());
        assert!(parse("step_0..x == 1").is_err());
        assert!(parse("a ; b").is_err());
    }

    #[test]
    fn deep_nesting_is_rejected_not_overflowed() {
        let deep = format!("{}true{}", "(".repeat(200), ")".repeat(200));
        assert_eq!(parse(&deep), Err(ExprError::Parse("expression nested too deeply".into())));

        let nots = format!("{}true", "not ".repeat(100));
        assert!(parse(&nots).is_err());
        let negs = format!("{}1 > 0", "-".repeat(100));
        assert!(parse(&negs).is_err());

        let huge = format!("{}true{}", "(".repeat(50_000), ")".repeat(50_000));
        assert!(parse(&huge).is_err());

        let ok = format!("{}true{}", "(".repeat(MAX_DEPTH - 1), ")".repeat(MAX_DEPTH - 1));
        assert!(parse(&ok).is_ok());
    }

    #[test]
    fn overlong_operator_chains_are_rejected() {
        let chain = vec!["true"; 2_000].join(" and ");
        assert!(matches!(parse(&chain), Err(ExprError::Parse(m)) if m.contains("too long")));
        let short = vec!["true"; 10].join(" and ");
        assert!(parse(&short).unwrap().evaluate_bool(&|_: &[String]| Value::Null).unwrap());
    }

    #[test]
    fn comparison_count_and_paths() {
        let expr = parse(r#"step_0.output.category == "invoice" and (input.amount > 5 or input.x contains "a")"#).unwrap();
        assert_eq!(expr.comparison_count(), 3);
        let paths: Vec<String> = expr.paths().iter().map(|p| p.join(".")).collect();
        assert_eq!(paths, vec!["step_0.output.category", "input.amount", "input.x"]);
        assert_eq!(parse("1 + 2").unwrap().comparison_count(), 0);
    }
}
