//! Boolean dependency-expression parsing and evaluation.
//!
//! Expressions combine identifier and quoted-string atoms with `&&`, `||`,
//! unary `!`, and parentheses. An atom is satisfied iff its (unquoted) text
//! is present in a [`CapabilitySet`].

use std::collections::BTreeSet;
use std::sync::Arc;

use crate::error::DependError;

/// The set of capability tokens available on a device under test: USE
/// flags, autodetected tags, and board/kernel tags (`board:<name>`,
/// `kernel-<version>`).
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CapabilitySet {
    tokens: BTreeSet<String>,
}

impl CapabilitySet {
    /// Creates an empty capability set.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Builds a capability set from an iterator of tokens.
    pub fn from_tokens<I, S>(tokens: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            tokens: tokens.into_iter().map(Into::into).collect(),
        }
    }

    /// Inserts a token.
    pub fn insert(&mut self, token: impl Into<String>) {
        self.tokens.insert(token.into());
    }

    /// Merges `other`'s tokens into `self`.
    pub fn extend(&mut self, other: &Self) {
        self.tokens.extend(other.tokens.iter().cloned());
    }

    /// Whether `token` is present.
    #[must_use]
    pub fn contains(&self, token: &str) -> bool {
        self.tokens.contains(token)
    }

    /// Parses USE-flag file content: one token per line, `#` to end of
    /// line is a comment, blank lines are ignored.
    #[must_use]
    pub fn parse_flag_file(content: &str) -> Self {
        let mut set = Self::new();
        for line in content.lines() {
            let without_comment = line.split('#').next().unwrap_or("");
            let token = without_comment.trim();
            if !token.is_empty() {
                set.insert(token);
            }
        }
        set
    }
}

/// A parsed boolean dependency expression.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Expr {
    /// A bare identifier or quoted-string atom.
    Atom(String),
    /// Logical negation.
    Not(Box<Expr>),
    /// Logical conjunction.
    And(Box<Expr>, Box<Expr>),
    /// Logical disjunction.
    Or(Box<Expr>, Box<Expr>),
}

impl Expr {
    /// Evaluates the expression against a capability set.
    #[must_use]
    pub fn eval(&self, caps: &CapabilitySet) -> bool {
        match self {
            Self::Atom(name) => caps.contains(name),
            Self::Not(inner) => !inner.eval(caps),
            Self::And(lhs, rhs) => lhs.eval(caps) && rhs.eval(caps),
            Self::Or(lhs, rhs) => lhs.eval(caps) || rhs.eval(caps),
        }
    }

    /// Parses a dependency expression.
    ///
    /// # Errors
    ///
    /// Returns [`DependError::ParseError`] if `text` is not a well-formed
    /// expression.
    pub fn parse(text: &str) -> Result<Self, DependError> {
        let tokens = tokenize(text).map_err(|reason| DependError::ParseError {
            expr: text.to_owned(),
            reason,
        })?;
        let mut parser = Parser {
            tokens: &tokens,
            pos: 0,
        };
        let expr = parser.parse_or().map_err(|reason| DependError::ParseError {
            expr: text.to_owned(),
            reason,
        })?;
        if parser.pos != parser.tokens.len() {
            return Err(DependError::ParseError {
                expr: text.to_owned(),
                reason: "trailing input after expression".to_owned(),
            });
        }
        Ok(expr)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Token {
    And,
    Or,
    Not,
    LParen,
    RParen,
    Atom(String),
}

fn tokenize(text: &str) -> Result<Vec<Token>, String> {
    let mut tokens = Vec::new();
    let chars: Vec<char> = text.chars().collect();
    let mut i = 0;
    while i < chars.len() {
        let c = chars[i];
        match c {
            ' ' | '\t' | '\n' | '\r' => i += 1,
            '(' => {
                tokens.push(Token::LParen);
                i += 1;
            }
            ')' => {
                tokens.push(Token::RParen);
                i += 1;
            }
            '!' => {
                tokens.push(Token::Not);
                i += 1;
            }
            '&' => {
                if chars.get(i + 1) == Some(&'&') {
                    tokens.push(Token::And);
                    i += 2;
                } else {
                    return Err("expected '&&'".to_owned());
                }
            }
            '|' => {
                if chars.get(i + 1) == Some(&'|') {
                    tokens.push(Token::Or);
                    i += 2;
                } else {
                    return Err("expected '||'".to_owned());
                }
            }
            '"' => {
                let mut value = String::new();
                i += 1;
                let mut closed = false;
                while i < chars.len() {
                    if chars[i] == '"' {
                        closed = true;
                        i += 1;
                        break;
                    }
                    value.push(chars[i]);
                    i += 1;
                }
                if !closed {
                    return Err("unterminated quoted string".to_owned());
                }
                tokens.push(Token::Atom(value));
            }
            _ if c.is_alphanumeric() || c == '_' || c == ':' || c == '-' || c == '.' => {
                let mut value = String::new();
                while i < chars.len()
                    && (chars[i].is_alphanumeric()
                        || chars[i] == '_'
                        || chars[i] == ':'
                        || chars[i] == '-'
                        || chars[i] == '.')
                {
                    value.push(chars[i]);
                    i += 1;
                }
                tokens.push(Token::Atom(value));
            }
            other => return Err(format!("unexpected character '{other}'")),
        }
    }
    Ok(tokens)
}

struct Parser<'a> {
    tokens: &'a [Token],
    pos: usize,
}

impl Parser<'_> {
    fn peek(&self) -> Option<&Token> {
        self.tokens.get(self.pos)
    }

    fn advance(&mut self) -> Option<&Token> {
        let tok = self.tokens.get(self.pos);
        if tok.is_some() {
            self.pos += 1;
        }
        tok
    }

    fn parse_or(&mut self) -> Result<Expr, String> {
        let mut lhs = self.parse_and()?;
        while matches!(self.peek(), Some(Token::Or)) {
            self.advance();
            let rhs = self.parse_and()?;
            lhs = Expr::Or(Box::new(lhs), Box::new(rhs));
        }
        Ok(lhs)
    }

    fn parse_and(&mut self) -> Result<Expr, String> {
        let mut lhs = self.parse_unary()?;
        while matches!(self.peek(), Some(Token::And)) {
            self.advance();
            let rhs = self.parse_unary()?;
            lhs = Expr::And(Box::new(lhs), Box::new(rhs));
        }
        Ok(lhs)
    }

    fn parse_unary(&mut self) -> Result<Expr, String> {
        if matches!(self.peek(), Some(Token::Not)) {
            self.advance();
            let inner = self.parse_unary()?;
            return Ok(Expr::Not(Box::new(inner)));
        }
        self.parse_primary()
    }

    fn parse_primary(&mut self) -> Result<Expr, String> {
        match self.advance() {
            Some(Token::Atom(name)) => Ok(Expr::Atom(name.clone())),
            Some(Token::LParen) => {
                let inner = self.parse_or()?;
                match self.advance() {
                    Some(Token::RParen) => Ok(inner),
                    _ => Err("expected ')'".to_owned()),
                }
            }
            Some(_) => Err("unexpected token".to_owned()),
            None => Err("unexpected end of expression".to_owned()),
        }
    }
}

/// A named feature gate: a high-level capability name mapped to a parsed
/// expression evaluated once per run.
#[derive(Debug, Clone)]
pub struct FeatureGate {
    /// The feature's public name (e.g. `"vm_host"`).
    pub name: String,
    /// The parsed expression backing this feature.
    pub expr: Arc<Expr>,
}

/// Evaluates a map of feature-gate expressions against a capability set and
/// folds the results back into an extended capability set so that
/// subsequent dependency checks can reference feature names directly.
#[must_use]
pub fn evaluate_feature_gates(gates: &[FeatureGate], caps: &CapabilitySet) -> CapabilitySet {
    let mut extended = caps.clone();
    for gate in gates {
        if gate.expr.eval(caps) {
            extended.insert(gate.name.clone());
        }
    }
    extended
}
