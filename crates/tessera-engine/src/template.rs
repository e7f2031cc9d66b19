//! `${expr}` prompt templates.
//!
//! Text outside `${...}` is copied as-is. Expressions support literals,
//! identifier lookup in the context object, `.field` and `[index]` access,
//! `! -` prefixes, arithmetic, comparison, equality, `&& || ??` and the
//! `cond ? a : b` ternary. `null` renders as the empty string, arrays and
//! objects as compact JSON. Any evaluation error fails the render with the
//! template line and column of the offending token.

use serde_json::Value;

use tessera_core::error::{Result, TesseraError};

/// Render a template against a context object.
pub fn render(template: &str, ctx: &Value) -> Result<String> {
    let bytes = template.as_bytes();
    let mut out = String::with_capacity(template.len());
    let mut literal_start = 0;
    let mut i = 0;

    while i < bytes.len() {
        if bytes[i] == b'$' && bytes.get(i + 1) == Some(&b'{') {
            out.push_str(&template[literal_start..i]);
            let start = i + 2;
            let end = find_close(template, start)
                .ok_or_else(|| error_at(template, i, "unterminated expression"))?;
            let value = Evaluator { template, ctx }.eval_source(start, &template[start..end])?;
            out.push_str(&stringify(&value));
            i = end + 1;
            literal_start = i;
        } else {
            i += 1;
        }
    }
    out.push_str(&template[literal_start..]);
    Ok(out)
}

/// JavaScript-style truthiness.
pub fn is_truthy(value: &Value) -> bool {
    match value {
        Value::Null => false,
        Value::Bool(b) => *b,
        Value::Number(n) => n.as_f64().map(|f| f != 0.0 && !f.is_nan()).unwrap_or(true),
        Value::String(s) => !s.is_empty(),
        Value::Array(_) | Value::Object(_) => true,
    }
}

/// Text form of a value inside rendered output.
pub fn stringify(value: &Value) -> String {
    match value {
        Value::Null => String::new(),
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

/// Byte index of the `}` closing an expression that starts at `start`.
fn find_close(template: &str, start: usize) -> Option<usize> {
    let mut quote: Option<char> = None;
    let mut escaped = false;
    for (offset, c) in template[start..].char_indices() {
        match quote {
            Some(q) => {
                if escaped {
                    escaped = false;
                } else if c == '\\' {
                    escaped = true;
                } else if c == q {
                    quote = None;
                }
            }
            None => match c {
                '\'' | '"' | '`' => quote = Some(c),
                '}' => return Some(start + offset),
                _ => {}
            },
        }
    }
    None
}

fn error_at(template: &str, offset: usize, message: impl Into<String>) -> TesseraError {
    let offset = offset.min(template.len());
    let before = &template[..offset];
    let line = before.matches('\n').count() + 1;
    let line_start = before.rfind('\n').map(|i| i + 1).unwrap_or(0);
    let column = template[line_start..offset].chars().count() + 1;
    let line_end = template[offset..]
        .find('\n')
        .map(|i| offset + i)
        .unwrap_or(template.len());
    TesseraError::Template {
        message: message.into(),
        line,
        column,
        pointer: format!(
            "{}\n{}^",
            &template[line_start..line_end],
            " ".repeat(column - 1)
        ),
    }
}

// ── Lexer ─────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq)]
enum Tok {
    Num(f64),
    Str(String),
    Ident(String),
    Punct(&'static str),
    End,
}

const PUNCT3: [(&str, &str); 2] = [("===", "=="), ("!==", "!=")];
const PUNCT2: [&str; 7] = ["??", "||", "&&", "==", "!=", "<=", ">="];
const PUNCT1: [&str; 16] = [
    ".", "[", "]", "(", ")", "?", ":", "<", ">", "+", "-", "*", "/", "%", "!", ",",
];

/// Tokens with their byte offsets into the expression source.
fn lex(src: &str) -> std::result::Result<Vec<(Tok, usize)>, (usize, String)> {
    let mut tokens = Vec::new();
    let mut chars = src.char_indices().peekable();

    while let Some(&(pos, c)) = chars.peek() {
        if c.is_whitespace() {
            chars.next();
            continue;
        }

        if c.is_ascii_digit() {
            let mut end = pos;
            while let Some(&(i, d)) = chars.peek() {
                if d.is_ascii_digit() || d == '.' {
                    end = i + d.len_utf8();
                    chars.next();
                } else {
                    break;
                }
            }
            let text = &src[pos..end];
            let n: f64 = text
                .parse()
                .map_err(|_| (pos, format!("invalid number '{}'", text)))?;
            tokens.push((Tok::Num(n), pos));
            continue;
        }

        if c.is_alphabetic() || c == '_' || c == '$' {
            let mut end = pos;
            while let Some(&(i, d)) = chars.peek() {
                if d.is_alphanumeric() || d == '_' || d == '$' {
                    end = i + d.len_utf8();
                    chars.next();
                } else {
                    break;
                }
            }
            tokens.push((Tok::Ident(src[pos..end].to_string()), pos));
            continue;
        }

        if c == '\'' || c == '"' || c == '`' {
            chars.next();
            let mut text = String::new();
            let mut closed = false;
            while let Some((_, d)) = chars.next() {
                match d {
                    '\\' => match chars.next() {
                        Some((_, 'n')) => text.push('\n'),
                        Some((_, 't')) => text.push('\t'),
                        Some((_, other)) => text.push(other),
                        None => break,
                    },
                    d if d == c => {
                        closed = true;
                        break;
                    }
                    d => text.push(d),
                }
            }
            if !closed {
                return Err((pos, "unterminated string".to_string()));
            }
            tokens.push((Tok::Str(text), pos));
            continue;
        }

        let rest = &src[pos..];
        let punct = PUNCT3
            .iter()
            .find(|(p, _)| rest.starts_with(p))
            .map(|(p, canon)| (p.len(), *canon))
            .or_else(|| {
                PUNCT2
                    .iter()
                    .find(|p| rest.starts_with(*p))
                    .map(|p| (p.len(), *p))
            })
            .or_else(|| {
                PUNCT1
                    .iter()
                    .find(|p| rest.starts_with(*p))
                    .map(|p| (p.len(), *p))
            });
        match punct {
            Some((len, p)) => {
                tokens.push((Tok::Punct(p), pos));
                for _ in 0..len {
                    chars.next();
                }
            }
            None => return Err((pos, format!("unexpected character '{}'", c))),
        }
    }

    tokens.push((Tok::End, src.len()));
    Ok(tokens)
}

// ── Parser ────────────────────────────────────────────────────

#[derive(Debug, Clone)]
enum Expr {
    Lit(Value),
    Ident(String, usize),
    Member(Box<Expr>, String, usize),
    Index(Box<Expr>, Box<Expr>, usize),
    Unary(&'static str, Box<Expr>, usize),
    Binary(&'static str, Box<Expr>, Box<Expr>, usize),
    Cond(Box<Expr>, Box<Expr>, Box<Expr>),
}

/// Deepest expression tree the parser builds; evaluation recurses per level.
const MAX_DEPTH: usize = 64;

struct Parser {
    tokens: Vec<(Tok, usize)>,
    pos: usize,
    depth: usize,
}

type ParseResult<T> = std::result::Result<T, (usize, String)>;

impl Parser {
    fn peek(&self) -> &Tok {
        &self.tokens[self.pos.min(self.tokens.len() - 1)].0
    }

    fn offset(&self) -> usize {
        self.tokens[self.pos.min(self.tokens.len() - 1)].1
    }

    fn advance(&mut self) -> (Tok, usize) {
        let tok = self.tokens[self.pos.min(self.tokens.len() - 1)].clone();
        if self.pos < self.tokens.len() - 1 {
            self.pos += 1;
        }
        tok
    }

    fn eat(&mut self, punct: &str) -> bool {
        if matches!(self.peek(), Tok::Punct(p) if *p == punct) {
            self.pos += 1;
            true
        } else {
            false
        }
    }

    fn expect(&mut self, punct: &str) -> ParseResult<()> {
        if self.eat(punct) {
            Ok(())
        } else {
            Err((self.offset(), format!("expected '{}'", punct)))
        }
    }

    fn descend(&mut self) -> ParseResult<()> {
        if self.depth >= MAX_DEPTH {
            return Err((self.offset(), "expression nested too deeply".to_string()));
        }
        self.depth += 1;
        Ok(())
    }

    fn nested<T>(&mut self, f: impl FnOnce(&mut Self) -> ParseResult<T>) -> ParseResult<T> {
        self.descend()?;
        let result = f(self);
        self.depth -= 1;
        result
    }

    fn parse(mut self) -> ParseResult<Expr> {
        let expr = self.conditional()?;
        match self.peek() {
            Tok::End => Ok(expr),
            tok => Err((self.offset(), format!("unexpected {}", describe(tok)))),
        }
    }

    fn conditional(&mut self) -> ParseResult<Expr> {
        self.nested(|p| {
            let cond = p.binary(0)?;
            if p.eat("?") {
                let then = p.conditional()?;
                p.expect(":")?;
                let otherwise = p.conditional()?;
                return Ok(Expr::Cond(Box::new(cond), Box::new(then), Box::new(otherwise)));
            }
            Ok(cond)
        })
    }

    /// Binary operators by precedence level, loosest first.
    fn binary(&mut self, level: usize) -> ParseResult<Expr> {
        const LEVELS: [&[&str]; 7] = [
            &["??"],
            &["||"],
            &["&&"],
            &["==", "!="],
            &["<", "<=", ">", ">="],
            &["+", "-"],
            &["*", "/", "%"],
        ];
        if level == LEVELS.len() {
            return self.unary();
        }
        let base = self.depth;
        let mut left = self.binary(level + 1)?;
        loop {
            let op = match self.peek() {
                Tok::Punct(p) => LEVELS[level].iter().find(|op| **op == *p).copied(),
                _ => None,
            };
            let Some(op) = op else { break };
            // Each chained operator deepens the left-leaning tree.
            self.descend()?;
            let offset = self.offset();
            self.pos += 1;
            let right = self.binary(level + 1)?;
            left = Expr::Binary(op, Box::new(left), Box::new(right), offset);
        }
        self.depth = base;
        Ok(left)
    }

    fn unary(&mut self) -> ParseResult<Expr> {
        let offset = self.offset();
        for op in ["!", "-"] {
            if self.eat(op) {
                let operand = self.nested(Self::unary)?;
                return Ok(Expr::Unary(op, Box::new(operand), offset));
            }
        }
        self.postfix()
    }

    fn postfix(&mut self) -> ParseResult<Expr> {
        let base = self.depth;
        let mut expr = self.primary()?;
        loop {
            let offset = self.offset();
            if matches!(self.peek(), Tok::Punct(".") | Tok::Punct("[")) {
                self.descend()?;
            }
            if self.eat(".") {
                match self.advance() {
                    (Tok::Ident(name), _) => {
                        expr = Expr::Member(Box::new(expr), name, offset);
                    }
                    (tok, at) => {
                        return Err((at, format!("expected property name, found {}", describe(&tok))))
                    }
                }
            } else if self.eat("[") {
                let index = self.conditional()?;
                self.expect("]")?;
                expr = Expr::Index(Box::new(expr), Box::new(index), offset);
            } else {
                self.depth = base;
                return Ok(expr);
            }
        }
    }

    fn primary(&mut self) -> ParseResult<Expr> {
        let (tok, offset) = self.advance();
        match tok {
            Tok::Num(n) => Ok(Expr::Lit(number(n))),
            Tok::Str(s) => Ok(Expr::Lit(Value::String(s))),
            Tok::Ident(name) => Ok(match name.as_str() {
                "true" => Expr::Lit(Value::Bool(true)),
                "false" => Expr::Lit(Value::Bool(false)),
                "null" | "undefined" => Expr::Lit(Value::Null),
                _ => Expr::Ident(name, offset),
            }),
            Tok::Punct("(") => {
                let expr = self.conditional()?;
                self.expect(")")?;
                Ok(expr)
            }
            tok => Err((offset, format!("unexpected {}", describe(&tok)))),
        }
    }
}

fn describe(tok: &Tok) -> String {
    match tok {
        Tok::Num(n) => format!("number {}", n),
        Tok::Str(_) => "string".to_string(),
        Tok::Ident(name) => format!("'{}'", name),
        Tok::Punct(p) => format!("'{}'", p),
        Tok::End => "end of expression".to_string(),
    }
}

// ── Evaluator ─────────────────────────────────────────────────

struct Evaluator<'a> {
    template: &'a str,
    ctx: &'a Value,
}

impl Evaluator<'_> {
    fn eval_source(&self, base: usize, src: &str) -> Result<Value> {
        let tokens = lex(src).map_err(|(at, msg)| error_at(self.template, base + at, msg))?;
        let expr = Parser {
            tokens,
            pos: 0,
            depth: 0,
        }
        .parse()
        .map_err(|(at, msg)| error_at(self.template, base + at, msg))?;
        self.eval(&expr)
            .map_err(|(at, msg)| error_at(self.template, base + at, msg))
    }

    fn eval(&self, expr: &Expr) -> ParseResult<Value> {
        match expr {
            Expr::Lit(v) => Ok(v.clone()),
            Expr::Ident(name, at) => self
                .ctx
                .get(name)
                .cloned()
                .ok_or_else(|| (*at, format!("{} is not defined", name))),
            Expr::Member(target, name, at) => {
                let target = self.eval(target)?;
                member(&target, name).map_err(|msg| (*at, msg))
            }
            Expr::Index(target, index, at) => {
                let target = self.eval(target)?;
                let index = self.eval(index)?;
                match &index {
                    Value::String(key) => member(&target, key).map_err(|msg| (*at, msg)),
                    Value::Number(n) => {
                        if target.is_null() {
                            return Err((*at, format!("cannot read index {} of null", n)));
                        }
                        let Some(i) = n.as_u64() else {
                            return Ok(Value::Null);
                        };
                        Ok(match &target {
                            Value::Array(items) => items.get(i as usize).cloned().unwrap_or(Value::Null),
                            Value::String(s) => s
                                .chars()
                                .nth(i as usize)
                                .map(|c| Value::String(c.to_string()))
                                .unwrap_or(Value::Null),
                            _ => Value::Null,
                        })
                    }
                    other => Err((*at, format!("cannot index with {}", type_name(other)))),
                }
            }
            Expr::Unary(op, operand, at) => {
                let value = self.eval(operand)?;
                match *op {
                    "!" => Ok(Value::Bool(!is_truthy(&value))),
                    _ => as_number(&value)
                        .map(|n| number(-n))
                        .ok_or_else(|| (*at, format!("cannot negate {}", type_name(&value)))),
                }
            }
            Expr::Binary(op, left, right, at) => {
                let left = self.eval(left)?;
                // Short-circuit operators only evaluate the right side when needed.
                match *op {
                    "??" => {
                        return if left.is_null() { self.eval(right) } else { Ok(left) };
                    }
                    "||" => {
                        return if is_truthy(&left) { Ok(left) } else { self.eval(right) };
                    }
                    "&&" => {
                        return if is_truthy(&left) { self.eval(right) } else { Ok(left) };
                    }
                    _ => {}
                }
                let right = self.eval(right)?;
                binary(op, &left, &right).map_err(|msg| (*at, msg))
            }
            Expr::Cond(cond, then, otherwise) => {
                if is_truthy(&self.eval(cond)?) {
                    self.eval(then)
                } else {
                    self.eval(otherwise)
                }
            }
        }
    }
}

fn member(target: &Value, name: &str) -> std::result::Result<Value, String> {
    match target {
        Value::Null => Err(format!("cannot read property '{}' of null", name)),
        Value::Object(map) => Ok(map.get(name).cloned().unwrap_or(Value::Null)),
        Value::Array(items) if name == "length" => Ok(Value::from(items.len())),
        Value::String(s) if name == "length" => Ok(Value::from(s.chars().count())),
        _ => Ok(Value::Null),
    }
}

fn binary(op: &str, left: &Value, right: &Value) -> std::result::Result<Value, String> {
    match op {
        "==" => Ok(Value::Bool(loose_eq(left, right))),
        "!=" => Ok(Value::Bool(!loose_eq(left, right))),
        "+" => match (left, right) {
            (Value::String(_), _) | (_, Value::String(_)) => {
                Ok(Value::String(format!("{}{}", stringify(left), stringify(right))))
            }
            _ => match (as_number(left), as_number(right)) {
                (Some(a), Some(b)) => Ok(number(a + b)),
                _ => Err(format!("cannot add {} and {}", type_name(left), type_name(right))),
            },
        },
        "<" | "<=" | ">" | ">=" => {
            let ordering = match (left, right) {
                (Value::String(a), Value::String(b)) => a.partial_cmp(b),
                _ => match (as_number(left), as_number(right)) {
                    (Some(a), Some(b)) => a.partial_cmp(&b),
                    _ => {
                        return Err(format!(
                            "cannot compare {} and {}",
                            type_name(left),
                            type_name(right)
                        ))
                    }
                },
            };
            let Some(ordering) = ordering else {
                return Ok(Value::Bool(false));
            };
            Ok(Value::Bool(match op {
                "<" => ordering.is_lt(),
                "<=" => ordering.is_le(),
                ">" => ordering.is_gt(),
                _ => ordering.is_ge(),
            }))
        }
        _ => {
            let (Some(a), Some(b)) = (as_number(left), as_number(right)) else {
                return Err(format!(
                    "cannot apply '{}' to {} and {}",
                    op,
                    type_name(left),
                    type_name(right)
                ));
            };
            if (op == "/" || op == "%") && b == 0.0 {
                return Err("division by zero".to_string());
            }
            Ok(number(match op {
                "-" => a - b,
                "*" => a * b,
                "/" => a / b,
                _ => a % b,
            }))
        }
    }
}

fn loose_eq(left: &Value, right: &Value) -> bool {
    match (as_number(left), as_number(right)) {
        (Some(a), Some(b)) => a == b,
        _ => left == right,
    }
}

fn as_number(value: &Value) -> Option<f64> {
    match value {
        Value::Number(n) => n.as_f64(),
        _ => None,
    }
}

/// Whole numbers become integers so they render without a fraction.
fn number(n: f64) -> Value {
    if n.fract() == 0.0 && n.abs() < 9.0e15 {
        Value::from(n as i64)
    } else {
        serde_json::Number::from_f64(n)
            .map(Value::Number)
            .unwrap_or(Value::Null)
    }
}

fn type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}
