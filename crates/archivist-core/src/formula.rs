//! Formula compiler and evaluator for derived attributes.
//!
//! A formula is plain arithmetic (`+ - * /`, parentheses, unary minus,
//! numeric literals) over `$N` tokens, where `N` is the numeric id of a source
//! attribute:
//!
//! ```text
//! ($7 + $8) / 2
//! $12 * 1.8 + 32
//! ```
//!
//! Pipeline:
//!   &str
//!     └─ lex()           → Vec<Token>
//!          └─ Parser      → Expr
//!               └─ Formula { expr, sources }
//!
//! Parsing is pure. Checking that the referenced ids exist is the store's job
//! since it needs the attribute table.

use std::{
  collections::{BTreeSet, HashMap},
  fmt,
};

use serde::{Deserialize, Serialize};

use crate::{
  error::{Error, Result},
  hierarchy::AttributeId,
};

/// Deepest parenthesis/unary nesting the parser accepts.
const MAX_DEPTH: usize = 128;

// ─── Expression tree ─────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BinaryOp {
  Add,
  Sub,
  Mul,
  Div,
}

impl BinaryOp {
  fn precedence(self) -> u8 {
    match self {
      BinaryOp::Add | BinaryOp::Sub => 1,
      BinaryOp::Mul | BinaryOp::Div => 2,
    }
  }

  fn symbol(self) -> char {
    match self {
      BinaryOp::Add => '+',
      BinaryOp::Sub => '-',
      BinaryOp::Mul => '*',
      BinaryOp::Div => '/',
    }
  }

  fn apply(self, lhs: f64, rhs: f64) -> f64 {
    match self {
      BinaryOp::Add => lhs + rhs,
      BinaryOp::Sub => lhs - rhs,
      BinaryOp::Mul => lhs * rhs,
      BinaryOp::Div => lhs / rhs,
    }
  }
}

/// The parameterized expression template: sources are slots filled per
/// timestamp at evaluation time.
#[derive(Debug, Clone, PartialEq)]
pub enum Expr {
  Literal(f64),
  Source(AttributeId),
  Neg(Box<Expr>),
  Binary {
    op:  BinaryOp,
    lhs: Box<Expr>,
    rhs: Box<Expr>,
  },
}

const UNARY_PRECEDENCE: u8 = 3;
const ATOM_PRECEDENCE: u8 = 4;

impl Expr {
  fn precedence(&self) -> u8 {
    match self {
      Expr::Literal(_) | Expr::Source(_) => ATOM_PRECEDENCE,
      Expr::Neg(_) => UNARY_PRECEDENCE,
      Expr::Binary { op, .. } => op.precedence(),
    }
  }

  fn collect_sources(&self, out: &mut BTreeSet<AttributeId>) {
    match self {
      Expr::Literal(_) => {}
      Expr::Source(id) => {
        out.insert(*id);
      }
      Expr::Neg(inner) => inner.collect_sources(out),
      Expr::Binary { lhs, rhs, .. } => {
        lhs.collect_sources(out);
        rhs.collect_sources(out);
      }
    }
  }

  /// Any missing source or non-finite intermediate yields `None`.
  fn eval(&self, lookup: &impl Fn(AttributeId) -> Option<f64>) -> Option<f64> {
    let v = match self {
      Expr::Literal(v) => *v,
      Expr::Source(id) => lookup(*id)?,
      Expr::Neg(inner) => -inner.eval(lookup)?,
      Expr::Binary { op, lhs, rhs } => op.apply(lhs.eval(lookup)?, rhs.eval(lookup)?),
    };
    v.is_finite().then_some(v)
  }

  fn map_sources(&self, f: &mut impl FnMut(AttributeId) -> AttributeId) -> Expr {
    match self {
      Expr::Literal(v) => Expr::Literal(*v),
      Expr::Source(id) => Expr::Source(f(*id)),
      Expr::Neg(inner) => Expr::Neg(Box::new(inner.map_sources(f))),
      Expr::Binary { op, lhs, rhs } => Expr::Binary {
        op:  *op,
        lhs: Box::new(lhs.map_sources(f)),
        rhs: Box::new(rhs.map_sources(f)),
      },
    }
  }
}

impl fmt::Display for Expr {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    match self {
      Expr::Literal(v) => write!(f, "{v}"),
      Expr::Source(id) => write!(f, "${id}"),
      Expr::Neg(inner) => {
        if inner.precedence() < UNARY_PRECEDENCE {
          write!(f, "-({inner})")
        } else {
          write!(f, "-{inner}")
        }
      }
      Expr::Binary { op, lhs, rhs } => {
        let prec = op.precedence();
        if lhs.precedence() < prec {
          write!(f, "({lhs})")?;
        } else {
          write!(f, "{lhs}")?;
        }
        write!(f, " {} ", op.symbol())?;
        // Right operands of equal precedence need parentheses: a - (b - c).
        if rhs.precedence() <= prec {
          write!(f, "({rhs})")
        } else {
          write!(f, "{rhs}")
        }
      }
    }
  }
}

// ─── Formula ─────────────────────────────────────────────────────────────────

/// A compiled formula: the expression template plus the distinct set of
/// attribute ids it reads. Serializes as its text.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Formula {
  text:    String,
  expr:    Expr,
  sources: BTreeSet<AttributeId>,
}

impl Formula {
  /// Parse `text`. Fails with [`Error::InvalidFormula`] on a syntax error or
  /// when no `$N` token is present.
  pub fn parse(text: &str) -> Result<Self> {
    let tokens = lex(text)?;
    if tokens.is_empty() {
      return Err(Error::invalid_formula(text, "formula is empty"));
    }
    if !tokens.iter().any(|t| matches!(t.kind, TokenKind::Source(_))) {
      return Err(Error::invalid_formula(
        text,
        "formula must reference at least one attribute using $N",
      ));
    }

    let mut parser = Parser { text, tokens: &tokens, pos: 0, depth: 0 };
    let expr = parser.expression()?;
    if let Some(extra) = parser.peek() {
      return Err(Error::invalid_formula(
        text,
        format!("unexpected {} at offset {}", extra.kind, extra.offset),
      ));
    }

    Ok(Self::from_expr(text.trim().to_owned(), expr))
  }

  fn from_expr(text: String, expr: Expr) -> Self {
    let mut sources = BTreeSet::new();
    expr.collect_sources(&mut sources);
    Self { text, expr, sources }
  }

  /// The formula text as supplied (or as rendered after a remap).
  pub fn text(&self) -> &str { &self.text }

  pub fn expr(&self) -> &Expr { &self.expr }

  pub fn sources(&self) -> &BTreeSet<AttributeId> { &self.sources }

  /// Evaluate with `lookup` supplying the value of each source at one
  /// timestamp. Strict-AND: any absent source yields `None`, as does a
  /// non-finite result.
  pub fn evaluate(&self, lookup: impl Fn(AttributeId) -> Option<f64>) -> Option<f64> {
    self.expr.eval(&lookup)
  }

  /// Rewrite every source id through `mapping`.
  ///
  /// Fails with the ids that have no entry; the formula is then unusable.
  pub fn remap(
    &self,
    mapping: &HashMap<AttributeId, AttributeId>,
  ) -> Result<Self, Vec<AttributeId>> {
    let missing: Vec<AttributeId> = self
      .sources
      .iter()
      .filter(|id| !mapping.contains_key(id))
      .copied()
      .collect();
    if !missing.is_empty() {
      return Err(missing);
    }
    let expr = self
      .expr
      .map_sources(&mut |id| mapping.get(&id).copied().unwrap_or(id));
    Ok(Self::from_expr(expr.to_string(), expr))
  }
}

impl fmt::Display for Formula {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result { f.write_str(&self.text) }
}

impl TryFrom<String> for Formula {
  type Error = Error;

  fn try_from(text: String) -> Result<Self> { Formula::parse(&text) }
}

impl From<Formula> for String {
  fn from(f: Formula) -> Self { f.text }
}

// ─── Lexer ───────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq)]
enum TokenKind {
  Number(f64),
  Source(AttributeId),
  Op(BinaryOp),
  LParen,
  RParen,
}

impl fmt::Display for TokenKind {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    match self {
      TokenKind::Number(v) => write!(f, "number {v}"),
      TokenKind::Source(id) => write!(f, "`${id}`"),
      TokenKind::Op(op) => write!(f, "`{}`", op.symbol()),
      TokenKind::LParen => f.write_str("`(`"),
      TokenKind::RParen => f.write_str("`)`"),
    }
  }
}

#[derive(Debug, Clone, Copy)]
struct Token {
  kind:   TokenKind,
  offset: usize,
}

fn lex(text: &str) -> Result<Vec<Token>> {
  let bytes = text.as_bytes();
  let mut tokens = Vec::new();
  let mut i = 0usize;

  while i < bytes.len() {
    let c = bytes[i];
    let offset = i;
    let kind = match c {
      b' ' | b'\t' | b'\r' | b'\n' => {
        i += 1;
        continue;
      }
      b'+' => TokenKind::Op(BinaryOp::Add),
      b'-' => TokenKind::Op(BinaryOp::Sub),
      b'*' => TokenKind::Op(BinaryOp::Mul),
      b'/' => TokenKind::Op(BinaryOp::Div),
      b'(' => TokenKind::LParen,
      b')' => TokenKind::RParen,
      b'$' => {
        let start = i + 1;
        let end = scan_digits(bytes, start);
        if end == start {
          return Err(Error::invalid_formula(
            text,
            format!("expected attribute id after `$` at offset {offset}"),
          ));
        }
        let id: i64 = text[start..end].parse().map_err(|_| {
          Error::invalid_formula(text, format!("attribute id out of range at offset {offset}"))
        })?;
        tokens.push(Token { kind: TokenKind::Source(AttributeId(id)), offset });
        i = end;
        continue;
      }
      b'0'..=b'9' | b'.' => {
        let end = scan_number(bytes, i);
        let value: f64 = text[i..end].parse().map_err(|_| {
          Error::invalid_formula(
            text,
            format!("malformed number {:?} at offset {offset}", &text[i..end]),
          )
        })?;
        tokens.push(Token { kind: TokenKind::Number(value), offset });
        i = end;
        continue;
      }
      _ => {
        let ch = text[i..].chars().next().unwrap_or('?');
        return Err(Error::invalid_formula(
          text,
          format!("unexpected character {ch:?} at offset {offset}"),
        ));
      }
    };
    tokens.push(Token { kind, offset });
    i += 1;
  }

  Ok(tokens)
}

fn scan_digits(bytes: &[u8], mut i: usize) -> usize {
  while i < bytes.len() && bytes[i].is_ascii_digit() {
    i += 1;
  }
  i
}

/// `digits [. digits] [e [+-] digits]`, also `.5`.
fn scan_number(bytes: &[u8], start: usize) -> usize {
  let mut i = scan_digits(bytes, start);
  if i < bytes.len() && bytes[i] == b'.' {
    i = scan_digits(bytes, i + 1);
  }
  if i < bytes.len() && (bytes[i] == b'e' || bytes[i] == b'E') {
    let mut j = i + 1;
    if j < bytes.len() && (bytes[j] == b'+' || bytes[j] == b'-') {
      j += 1;
    }
    let end = scan_digits(bytes, j);
    if end > j {
      i = end;
    }
  }
  i
}

// ─── Parser ──────────────────────────────────────────────────────────────────

struct Parser<'a> {
  text:   &'a str,
  tokens: &'a [Token],
  pos:    usize,
  depth:  usize,
}

impl Parser<'_> {
  fn peek(&self) -> Option<Token> { self.tokens.get(self.pos).copied() }

  fn error(&self, reason: impl Into<String>) -> Error {
    Error::invalid_formula(self.text, reason)
  }

  fn descend(&mut self) -> Result<()> {
    self.depth += 1;
    if self.depth > MAX_DEPTH {
      return Err(self.error("formula is nested too deeply"));
    }
    Ok(())
  }

  /// expression := term (('+' | '-') term)*
  fn expression(&mut self) -> Result<Expr> {
    let mut lhs = self.term()?;
    while let Some(Token { kind: TokenKind::Op(op @ (BinaryOp::Add | BinaryOp::Sub)), .. }) =
      self.peek()
    {
      self.pos += 1;
      let rhs = self.term()?;
      lhs = Expr::Binary { op, lhs: Box::new(lhs), rhs: Box::new(rhs) };
    }
    Ok(lhs)
  }

  /// term := unary (('*' | '/') unary)*
  fn term(&mut self) -> Result<Expr> {
    let mut lhs = self.unary()?;
    while let Some(Token { kind: TokenKind::Op(op @ (BinaryOp::Mul | BinaryOp::Div)), .. }) =
      self.peek()
    {
      self.pos += 1;
      let rhs = self.unary()?;
      lhs = Expr::Binary { op, lhs: Box::new(lhs), rhs: Box::new(rhs) };
    }
    Ok(lhs)
  }

  /// unary := ('-' | '+') unary | primary
  fn unary(&mut self) -> Result<Expr> {
    match self.peek().map(|t| t.kind) {
      Some(TokenKind::Op(BinaryOp::Sub)) => {
        self.pos += 1;
        self.descend()?;
        let inner = self.unary()?;
        self.depth -= 1;
        Ok(Expr::Neg(Box::new(inner)))
      }
      Some(TokenKind::Op(BinaryOp::Add)) => {
        self.pos += 1;
        self.descend()?;
        let inner = self.unary()?;
        self.depth -= 1;
        Ok(inner)
      }
      _ => self.primary(),
    }
  }

  /// primary := number | '$' id | '(' expression ')'
  fn primary(&mut self) -> Result<Expr> {
    let Some(token) = self.peek() else {
      return Err(self.error("unexpected end of formula"));
    };
    self.pos += 1;
    match token.kind {
      TokenKind::Number(v) => Ok(Expr::Literal(v)),
      TokenKind::Source(id) => Ok(Expr::Source(id)),
      TokenKind::LParen => {
        self.descend()?;
        let inner = self.expression()?;
        self.depth -= 1;
        match self.peek() {
          Some(Token { kind: TokenKind::RParen, .. }) => {
            self.pos += 1;
            Ok(inner)
          }
          _ => Err(self.error(format!(
            "unclosed `(` at offset {}",
            token.offset
          ))),
        }
      }
      other => Err(self.error(format!(
        "unexpected {other} at offset {}",
        token.offset
      ))),
    }
  }
}
