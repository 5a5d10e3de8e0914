//! Row predicates and derived-value expressions.
//!
//! Predicates appear in plans as a bare keyword (`empty`) or a single-key
//! mapping (`{max_populated: 2}`). The same JSON shape is used in script
//! operations, so both directions go through [`serde_json::Value`].

use super::table::{format_float, Cell};
use indexmap::IndexMap;
use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::cmp::Ordering;
use std::fmt;

// ============================================================================
// Pattern
// ============================================================================

/// A compiled regex that serializes as its source text.
#[derive(Clone)]
pub struct Pattern(Regex);

impl Pattern {
    pub fn new(source: &str) -> Result<Self, String> {
        Regex::new(source)
            .map(Self)
            .map_err(|e| format!("invalid regex '{}': {}", source, e))
    }

    pub fn as_str(&self) -> &str {
        self.0.as_str()
    }

    pub fn is_match(&self, text: &str) -> bool {
        self.0.is_match(text)
    }
}

impl fmt::Debug for Pattern {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Pattern({:?})", self.as_str())
    }
}

impl PartialEq for Pattern {
    fn eq(&self, other: &Self) -> bool {
        self.as_str() == other.as_str()
    }
}

impl Serialize for Pattern {
    fn serialize<S: serde::Serializer>(&self, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_str(self.as_str())
    }
}

impl<'de> Deserialize<'de> for Pattern {
    fn deserialize<D: serde::Deserializer<'de>>(d: D) -> Result<Self, D::Error> {
        let source = String::deserialize(d)?;
        Pattern::new(&source).map_err(serde::de::Error::custom)
    }
}

// ============================================================================
// Comparison
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompareOp {
    Eq,
    Ne,
    Gt,
    Ge,
    Lt,
    Le,
    Contains,
}

impl CompareOp {
    pub fn parse(s: &str) -> Result<Self, String> {
        match s {
            "eq" | "==" | "=" => Ok(Self::Eq),
            "ne" | "!=" => Ok(Self::Ne),
            "gt" | ">" => Ok(Self::Gt),
            "ge" | ">=" => Ok(Self::Ge),
            "lt" | "<" => Ok(Self::Lt),
            "le" | "<=" => Ok(Self::Le),
            "contains" => Ok(Self::Contains),
            other => Err(format!(
                "unknown comparison operator '{}' (expected eq, ne, gt, ge, lt, le, contains)",
                other
            )),
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Eq => "eq",
            Self::Ne => "ne",
            Self::Gt => "gt",
            Self::Ge => "ge",
            Self::Lt => "lt",
            Self::Le => "le",
            Self::Contains => "contains",
        }
    }

    fn holds(&self, left: &Cell, right: &Cell) -> bool {
        if *self == Self::Contains {
            return left.canonical().contains(&right.canonical());
        }
        let ordering = match (left.as_f64(), right.as_f64()) {
            (Some(l), Some(r)) => l.partial_cmp(&r),
            _ => Some(left.canonical().trim().cmp(right.canonical().trim())),
        };
        let Some(ord) = ordering else {
            return *self == Self::Ne;
        };
        match self {
            Self::Eq => ord == Ordering::Equal,
            Self::Ne => ord != Ordering::Equal,
            Self::Gt => ord == Ordering::Greater,
            Self::Ge => ord != Ordering::Less,
            Self::Lt => ord == Ordering::Less,
            Self::Le => ord != Ordering::Greater,
            Self::Contains => false,
        }
    }
}

// ============================================================================
// Row predicates
// ============================================================================

/// A test over one row. Column references resolve against the current
/// column names at evaluation time.
#[derive(Debug, Clone, PartialEq)]
pub enum RowPredicate {
    /// Every cell blank.
    Empty,
    /// First cell populated, all others blank.
    OnlyFirstPopulated,
    /// Row repeats the current column names.
    RepeatedHeader,
    /// Between 1 and `n` populated cells.
    MaxPopulated(usize),
    Literal(String),
    Contains(String),
    FirstCellMatches(Pattern),
    StartsWith(String),
    ColumnEmpty(String),
    ColumnMatches { column: String, pattern: Pattern },
    Compare {
        column: String,
        op: CompareOp,
        value: Value,
    },
    IsNull(String),
    NotNull(String),
    All(Vec<RowPredicate>),
    Any(Vec<RowPredicate>),
    Not(Box<RowPredicate>),
}

fn first_populated(row: &[Cell]) -> Option<&Cell> {
    row.iter().find(|c| !c.is_blank())
}

fn column_cell<'a>(row: &'a [Cell], columns: &[String], name: &str) -> Result<&'a Cell, String> {
    columns
        .iter()
        .position(|c| c == name)
        .and_then(|i| row.get(i))
        .ok_or_else(|| format!("column '{}' not found", name))
}

impl RowPredicate {
    pub fn eval(&self, row: &[Cell], columns: &[String]) -> Result<bool, String> {
        Ok(match self {
            Self::Empty => row.iter().all(Cell::is_blank),
            Self::OnlyFirstPopulated => match row.split_first() {
                Some((first, rest)) => !first.is_blank() && rest.iter().all(Cell::is_blank),
                None => false,
            },
            Self::RepeatedHeader => {
                !row.is_empty()
                    && row
                        .iter()
                        .zip(columns)
                        .all(|(cell, name)| cell.canonical().trim() == name.trim())
            }
            Self::MaxPopulated(n) => {
                let populated = row.iter().filter(|c| !c.is_blank()).count();
                populated >= 1 && populated <= *n
            }
            Self::Literal(text) => row.iter().any(|c| c.canonical().trim() == text.trim()),
            Self::Contains(text) => row.iter().any(|c| c.canonical().contains(text.as_str())),
            Self::FirstCellMatches(p) => {
                first_populated(row).is_some_and(|c| p.is_match(c.canonical().trim()))
            }
            Self::StartsWith(text) => first_populated(row)
                .is_some_and(|c| c.canonical().trim_start().starts_with(text.as_str())),
            Self::ColumnEmpty(col) | Self::IsNull(col) => {
                column_cell(row, columns, col)?.is_blank()
            }
            Self::NotNull(col) => !column_cell(row, columns, col)?.is_blank(),
            Self::ColumnMatches { column, pattern } => {
                let cell = column_cell(row, columns, column)?;
                !cell.is_null() && pattern.is_match(&cell.canonical())
            }
            Self::Compare { column, op, value } => {
                let cell = column_cell(row, columns, column)?;
                if cell.is_null() {
                    *op == CompareOp::Ne && !value.is_null()
                } else {
                    op.holds(cell, &Cell::from_json(value))
                }
            }
            Self::All(preds) => {
                for p in preds {
                    if !p.eval(row, columns)? {
                        return Ok(false);
                    }
                }
                true
            }
            Self::Any(preds) => {
                for p in preds {
                    if p.eval(row, columns)? {
                        return Ok(true);
                    }
                }
                false
            }
            Self::Not(p) => !p.eval(row, columns)?,
        })
    }

    /// Column names the predicate reads.
    pub fn columns(&self) -> Vec<String> {
        let mut out = Vec::new();
        self.collect_columns(&mut out);
        out
    }

    fn collect_columns(&self, out: &mut Vec<String>) {
        match self {
            Self::ColumnEmpty(c) | Self::IsNull(c) | Self::NotNull(c) => out.push(c.clone()),
            Self::ColumnMatches { column, .. } | Self::Compare { column, .. } => {
                out.push(column.clone())
            }
            Self::All(ps) | Self::Any(ps) => ps.iter().for_each(|p| p.collect_columns(out)),
            Self::Not(p) => p.collect_columns(out),
            _ => {}
        }
    }

    /// Parse a predicate from its plan form.
    pub fn parse(value: &Value) -> Result<Self, String> {
        match value {
            Value::String(keyword) => match keyword.as_str() {
                "empty" | "empty_row" => Ok(Self::Empty),
                "only_first_populated" => Ok(Self::OnlyFirstPopulated),
                "repeated_header" => Ok(Self::RepeatedHeader),
                other => Err(format!("unknown row rule '{}'", other)),
            },
            Value::Object(map) if map.len() == 1 => {
                let (key, arg) = map
                    .iter()
                    .next()
                    .ok_or_else(|| "empty row rule".to_string())?;
                Self::parse_keyed(key, arg)
            }
            Value::Object(map) if map.contains_key("column") && map.contains_key("op") => {
                Self::parse_shorthand(value)
            }
            other => Err(format!(
                "row rule must be a keyword or a single-key mapping, got {}",
                other
            )),
        }
    }

    /// Parse a filter condition; also accepts `{column, op, value}` directly.
    pub fn parse_condition(value: &Value) -> Result<Self, String> {
        match value {
            Value::Object(map) if map.contains_key("column") && map.contains_key("op") => {
                Self::parse_shorthand(value)
            }
            _ => Self::parse(value),
        }
    }

    fn parse_shorthand(value: &Value) -> Result<Self, String> {
        let column = str_field(value, "column")?;
        let op = CompareOp::parse(&str_field(value, "op")?)?;
        let value = value.get("value").cloned().unwrap_or(Value::Null);
        Ok(Self::Compare { column, op, value })
    }

    fn parse_keyed(key: &str, arg: &Value) -> Result<Self, String> {
        let text = |what: &str| -> Result<String, String> {
            scalar_text(arg).ok_or_else(|| format!("'{}' expects a text value", what))
        };
        match key {
            "max_populated" => arg
                .as_u64()
                .map(|n| Self::MaxPopulated(n as usize))
                .ok_or_else(|| "'max_populated' expects a non-negative integer".to_string()),
            "literal" | "equals" => Ok(Self::Literal(text(key)?)),
            "contains" => Ok(Self::Contains(text(key)?)),
            "first_cell_matches" => Ok(Self::FirstCellMatches(Pattern::new(&text(key)?)?)),
            "starts_with" => Ok(Self::StartsWith(text(key)?)),
            "column_empty" => Ok(Self::ColumnEmpty(text(key)?)),
            "is_null" => Ok(Self::IsNull(text(key)?)),
            "not_null" => Ok(Self::NotNull(text(key)?)),
            "column_matches" => Ok(Self::ColumnMatches {
                column: str_field(arg, "column")?,
                pattern: Pattern::new(&str_field(arg, "pattern")?)?,
            }),
            "compare" => Self::parse_shorthand(arg),
            "all" | "any" => {
                let items = arg
                    .as_array()
                    .ok_or_else(|| format!("'{}' expects a list of rules", key))?;
                let preds = items.iter().map(Self::parse).collect::<Result<Vec<_>, _>>()?;
                Ok(if key == "all" {
                    Self::All(preds)
                } else {
                    Self::Any(preds)
                })
            }
            "not" => Ok(Self::Not(Box::new(Self::parse(arg)?))),
            other => Err(format!("unknown row rule '{}'", other)),
        }
    }

    /// The plan form of this predicate.
    pub fn to_value(&self) -> Value {
        match self {
            Self::Empty => json!("empty"),
            Self::OnlyFirstPopulated => json!("only_first_populated"),
            Self::RepeatedHeader => json!("repeated_header"),
            Self::MaxPopulated(n) => json!({ "max_populated": n }),
            Self::Literal(t) => json!({ "literal": t }),
            Self::Contains(t) => json!({ "contains": t }),
            Self::FirstCellMatches(p) => json!({ "first_cell_matches": p.as_str() }),
            Self::StartsWith(t) => json!({ "starts_with": t }),
            Self::ColumnEmpty(c) => json!({ "column_empty": c }),
            Self::IsNull(c) => json!({ "is_null": c }),
            Self::NotNull(c) => json!({ "not_null": c }),
            Self::ColumnMatches { column, pattern } => {
                json!({ "column_matches": { "column": column, "pattern": pattern.as_str() } })
            }
            Self::Compare { column, op, value } => {
                json!({ "compare": { "column": column, "op": op.as_str(), "value": value } })
            }
            Self::All(ps) => json!({ "all": ps.iter().map(Self::to_value).collect::<Vec<_>>() }),
            Self::Any(ps) => json!({ "any": ps.iter().map(Self::to_value).collect::<Vec<_>>() }),
            Self::Not(p) => json!({ "not": p.to_value() }),
        }
    }
}

impl Serialize for RowPredicate {
    fn serialize<S: serde::Serializer>(&self, s: S) -> Result<S::Ok, S::Error> {
        self.to_value().serialize(s)
    }
}

impl<'de> Deserialize<'de> for RowPredicate {
    fn deserialize<D: serde::Deserializer<'de>>(d: D) -> Result<Self, D::Error> {
        let value = Value::deserialize(d)?;
        Self::parse_condition(&value).map_err(serde::de::Error::custom)
    }
}

fn scalar_text(v: &Value) -> Option<String> {
    match v {
        Value::String(s) => Some(s.clone()),
        Value::Number(n) => Some(match n.as_f64() {
            Some(f) if n.is_f64() => format_float(f),
            _ => n.to_string(),
        }),
        Value::Bool(b) => Some(b.to_string()),
        _ => None,
    }
}

fn str_field(v: &Value, key: &str) -> Result<String, String> {
    v.get(key)
        .and_then(scalar_text)
        .ok_or_else(|| format!("missing text field '{}'", key))
}

// ============================================================================
// Value expressions (add_column)
// ============================================================================

/// How `add_column` computes its value for each row.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ValueExpr {
    Constant { value: Value },
    /// `{column}` placeholders replaced by canonical cell text.
    Template { template: String },
    Arithmetic { expression: Arith },
    /// Map another column's text through a table; unmapped values get `default`.
    Lookup {
        source: String,
        map: IndexMap<String, Value>,
        #[serde(default)]
        default: Value,
    },
}

impl ValueExpr {
    pub fn eval(&self, row: &[Cell], columns: &[String]) -> Result<Cell, String> {
        match self {
            Self::Constant { value } => Ok(Cell::from_json(value)),
            Self::Template { template } => render_template(template, row, columns).map(|s| Cell::text(&s)),
            Self::Arithmetic { expression } => expression.eval(row, columns),
            Self::Lookup {
                source,
                map,
                default,
            } => {
                let key = column_cell(row, columns, source)?.canonical();
                let hit = map.get(key.trim()).unwrap_or(default);
                Ok(Cell::from_json(hit))
            }
        }
    }

    pub fn columns(&self) -> Vec<String> {
        match self {
            Self::Constant { .. } => Vec::new(),
            Self::Template { template } => template_columns(template),
            Self::Arithmetic { expression } => expression.columns(),
            Self::Lookup { source, .. } => vec![source.clone()],
        }
    }
}

/// Column names referenced as `{name}` in a template.
pub fn template_columns(template: &str) -> Vec<String> {
    let mut out = Vec::new();
    let mut rest = template;
    while let Some(start) = rest.find('{') {
        let after = &rest[start + 1..];
        match after.find('}') {
            Some(end) => {
                out.push(after[..end].to_string());
                rest = &after[end + 1..];
            }
            None => break,
        }
    }
    out
}

fn render_template(template: &str, row: &[Cell], columns: &[String]) -> Result<String, String> {
    let mut out = String::with_capacity(template.len());
    let mut rest = template;
    while let Some(start) = rest.find('{') {
        out.push_str(&rest[..start]);
        let after = &rest[start + 1..];
        match after.find('}') {
            Some(end) => {
                out.push_str(&column_cell(row, columns, &after[..end])?.canonical());
                rest = &after[end + 1..];
            }
            None => {
                out.push_str(&rest[start..]);
                rest = "";
            }
        }
    }
    out.push_str(rest);
    Ok(out)
}

// ============================================================================
// Arithmetic
// ============================================================================

#[derive(Debug, Clone, PartialEq)]
enum Node {
    Num(f64),
    Col(String),
    Neg(Box<Node>),
    Bin(char, Box<Node>, Box<Node>),
}

/// Arithmetic over `{column}` references: `+ - * /`, parentheses, numeric
/// literals. A null or non-numeric operand yields null, as does division by
/// zero.
#[derive(Debug, Clone, PartialEq)]
pub struct Arith {
    source: String,
    root: Node,
}

impl Arith {
    pub fn parse(source: &str) -> Result<Self, String> {
        let tokens = tokenize(source)?;
        let mut parser = ArithParser { tokens, pos: 0 };
        let root = parser.expr()?;
        if parser.pos != parser.tokens.len() {
            return Err(format!("unexpected trailing input in expression '{}'", source));
        }
        Ok(Self {
            source: source.to_string(),
            root,
        })
    }

    pub fn source(&self) -> &str {
        &self.source
    }

    pub fn eval(&self, row: &[Cell], columns: &[String]) -> Result<Cell, String> {
        Ok(match eval_node(&self.root, row, columns)? {
            Some(v) if v.is_finite() => Cell::Float(v),
            _ => Cell::Null,
        })
    }

    pub fn columns(&self) -> Vec<String> {
        let mut out = Vec::new();
        collect_node_columns(&self.root, &mut out);
        out
    }
}

impl Serialize for Arith {
    fn serialize<S: serde::Serializer>(&self, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_str(&self.source)
    }
}

impl<'de> Deserialize<'de> for Arith {
    fn deserialize<D: serde::Deserializer<'de>>(d: D) -> Result<Self, D::Error> {
        let source = String::deserialize(d)?;
        Arith::parse(&source).map_err(serde::de::Error::custom)
    }
}

fn collect_node_columns(node: &Node, out: &mut Vec<String>) {
    match node {
        Node::Num(_) => {}
        Node::Col(c) => out.push(c.clone()),
        Node::Neg(n) => collect_node_columns(n, out),
        Node::Bin(_, l, r) => {
            collect_node_columns(l, out);
            collect_node_columns(r, out);
        }
    }
}

fn eval_node(node: &Node, row: &[Cell], columns: &[String]) -> Result<Option<f64>, String> {
    Ok(match node {
        Node::Num(n) => Some(*n),
        Node::Col(c) => column_cell(row, columns, c)?.as_f64(),
        Node::Neg(n) => eval_node(n, row, columns)?.map(|v| -v),
        Node::Bin(op, l, r) => {
            let (Some(l), Some(r)) = (eval_node(l, row, columns)?, eval_node(r, row, columns)?)
            else {
                return Ok(None);
            };
            match op {
                '+' => Some(l + r),
                '-' => Some(l - r),
                '*' => Some(l * r),
                '/' if r == 0.0 => None,
                _ => Some(l / r),
            }
        }
    })
}

#[derive(Debug, Clone, PartialEq)]
enum Token {
    Num(f64),
    Col(String),
    Op(char),
    Open,
    Close,
}

fn tokenize(source: &str) -> Result<Vec<Token>, String> {
    let chars: Vec<char> = source.chars().collect();
    let mut tokens = Vec::new();
    let mut i = 0;
    while i < chars.len() {
        let c = chars[i];
        match c {
            ' ' | '\t' => i += 1,
            '+' | '-' | '*' | '/' => {
                tokens.push(Token::Op(c));
                i += 1;
            }
            '(' => {
                tokens.push(Token::Open);
                i += 1;
            }
            ')' => {
                tokens.push(Token::Close);
                i += 1;
            }
            '{' => {
                let end = chars[i + 1..]
                    .iter()
                    .position(|&ch| ch == '}')
                    .ok_or_else(|| format!("unclosed '{{' in expression '{}'", source))?;
                let name: String = chars[i + 1..i + 1 + end].iter().collect();
                if name.trim().is_empty() {
                    return Err(format!("empty column reference in expression '{}'", source));
                }
                tokens.push(Token::Col(name));
                i += end + 2;
            }
            d if d.is_ascii_digit() || d == '.' => {
                let start = i;
                while i < chars.len() && (chars[i].is_ascii_digit() || chars[i] == '.') {
                    i += 1;
                }
                let text: String = chars[start..i].iter().collect();
                let n = text
                    .parse::<f64>()
                    .map_err(|_| format!("invalid number '{}' in expression '{}'", text, source))?;
                tokens.push(Token::Num(n));
            }
            other => {
                return Err(format!(
                    "unexpected character '{}' in expression '{}'",
                    other, source
                ))
            }
        }
    }
    if tokens.is_empty() {
        return Err("empty expression".to_string());
    }
    Ok(tokens)
}

struct ArithParser {
    tokens: Vec<Token>,
    pos: usize,
}

impl ArithParser {
    fn peek(&self) -> Option<&Token> {
        self.tokens.get(self.pos)
    }

    fn expr(&mut self) -> Result<Node, String> {
        let mut left = self.term()?;
        while let Some(Token::Op(op @ ('+' | '-'))) = self.peek().cloned() {
            self.pos += 1;
            let right = self.term()?;
            left = Node::Bin(op, Box::new(left), Box::new(right));
        }
        Ok(left)
    }

    fn term(&mut self) -> Result<Node, String> {
        let mut left = self.factor()?;
        while let Some(Token::Op(op @ ('*' | '/'))) = self.peek().cloned() {
            self.pos += 1;
            let right = self.factor()?;
            left = Node::Bin(op, Box::new(left), Box::new(right));
        }
        Ok(left)
    }

    fn factor(&mut self) -> Result<Node, String> {
        let token = self
            .peek()
            .cloned()
            .ok_or_else(|| "unexpected end of expression".to_string())?;
        self.pos += 1;
        match token {
            Token::Num(n) => Ok(Node::Num(n)),
            Token::Col(c) => Ok(Node::Col(c)),
            Token::Op('-') => Ok(Node::Neg(Box::new(self.factor()?))),
            Token::Open => {
                let inner = self.expr()?;
                match self.peek() {
                    Some(Token::Close) => {
                        self.pos += 1;
                        Ok(inner)
                    }
                    _ => Err("missing ')'".to_string()),
                }
            }
            other => Err(format!("unexpected token {:?}", other)),
        }
    }
}
