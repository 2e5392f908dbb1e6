// Query Language Parser
// Hand-written tokenizer plus recursive descent over the surface
// syntax:
//
//   find <tag>|* [where <cond> (and <cond>|<group>)*] [order by [-]<field>]
//                [limit N] [offset N] [select <fields>|*]
//   cond  := [not] <field> <op> <value> | <field> exists | <field> is (empty|null)
//   group := "(" <cond> (or <cond>)* ")"
//   op    := = | != | > | < | >= | <= | ~ | contains
//
// Errors carry the byte position of the offending token so surfaces can
// point at it. Keywords are case-insensitive; bare identifiers are
// accepted as right-hand-side values.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Parsed query AST. Also constructible programmatically through
/// [`crate::builders::QueryBuilder`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Query {
    pub find: String,
    pub where_clauses: Vec<WhereEntry>,
    pub order_by: Option<OrderBy>,
    pub limit: Option<usize>,
    pub offset: Option<usize>,
    pub select: Option<Vec<String>>,
}

impl Query {
    /// `find *` with no conditions.
    pub fn find_all() -> Self {
        Self {
            find: "*".to_string(),
            where_clauses: Vec::new(),
            order_by: None,
            limit: None,
            offset: None,
            select: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum WhereEntry {
    Clause(Clause),
    Or(OrGroup),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OrGroup {
    pub clauses: Vec<Clause>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Clause {
    pub field: String,
    pub operator: Operator,
    #[serde(default, skip_serializing_if = "QueryValue::is_none")]
    pub value: QueryValue,
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub negated: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Operator {
    Eq,
    Ne,
    Gt,
    Lt,
    Ge,
    Le,
    Contains,
    Exists,
    IsEmpty,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(untagged)]
pub enum QueryValue {
    #[default]
    None,
    Bool(bool),
    Number(f64),
    Text(String),
    Relative(RelativeDate),
    List(Vec<QueryValue>),
}

impl QueryValue {
    pub fn is_none(&self) -> bool {
        matches!(self, QueryValue::None)
    }
}

/// Relative date tokens resolved at execution time against the
/// injected clock.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RelativeDate {
    Today,
    Yesterday,
    Ago { n: u32, unit: DateUnit },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DateUnit {
    Days,
    Weeks,
    Months,
    Years,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OrderBy {
    pub field: String,
    pub descending: bool,
}

/// Parse failure with the byte position of the offending token.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("parse error at byte {position}: {message}")]
pub struct ParseError {
    pub position: usize,
    pub message: String,
}

#[derive(Debug, Clone, PartialEq)]
enum Tok {
    Ident(String),
    Text(String),
    Number(f64),
    Star,
    Minus,
    LParen,
    RParen,
    Comma,
    Eq,
    Ne,
    Gt,
    Lt,
    Ge,
    Le,
    Tilde,
    Eof,
}

#[derive(Debug, Clone)]
struct Spanned {
    tok: Tok,
    pos: usize,
}

fn tokenize(input: &str) -> Result<Vec<Spanned>, ParseError> {
    let bytes = input.as_bytes();
    let mut out = Vec::new();
    let mut i = 0usize;

    while i < bytes.len() {
        let c = bytes[i] as char;
        if c.is_ascii_whitespace() {
            i += 1;
            continue;
        }
        let pos = i;
        match c {
            '(' => {
                out.push(Spanned { tok: Tok::LParen, pos });
                i += 1;
            }
            ')' => {
                out.push(Spanned { tok: Tok::RParen, pos });
                i += 1;
            }
            ',' => {
                out.push(Spanned { tok: Tok::Comma, pos });
                i += 1;
            }
            '*' => {
                out.push(Spanned { tok: Tok::Star, pos });
                i += 1;
            }
            '-' => {
                out.push(Spanned { tok: Tok::Minus, pos });
                i += 1;
            }
            '~' => {
                out.push(Spanned { tok: Tok::Tilde, pos });
                i += 1;
            }
            '=' => {
                out.push(Spanned { tok: Tok::Eq, pos });
                i += 1;
            }
            '!' => {
                if bytes.get(i + 1) == Some(&b'=') {
                    out.push(Spanned { tok: Tok::Ne, pos });
                    i += 2;
                } else {
                    return Err(ParseError {
                        position: pos,
                        message: "expected '=' after '!'".into(),
                    });
                }
            }
            '>' => {
                if bytes.get(i + 1) == Some(&b'=') {
                    out.push(Spanned { tok: Tok::Ge, pos });
                    i += 2;
                } else {
                    out.push(Spanned { tok: Tok::Gt, pos });
                    i += 1;
                }
            }
            '<' => {
                if bytes.get(i + 1) == Some(&b'=') {
                    out.push(Spanned { tok: Tok::Le, pos });
                    i += 2;
                } else {
                    out.push(Spanned { tok: Tok::Lt, pos });
                    i += 1;
                }
            }
            '"' | '\'' => {
                let quote = c;
                let mut value = String::new();
                let mut j = i + 1;
                let mut closed = false;
                while j < bytes.len() {
                    let d = bytes[j] as char;
                    if d == '\\' && j + 1 < bytes.len() {
                        value.push(bytes[j + 1] as char);
                        j += 2;
                        continue;
                    }
                    if d == quote {
                        closed = true;
                        j += 1;
                        break;
                    }
                    value.push(d);
                    j += 1;
                }
                if !closed {
                    return Err(ParseError {
                        position: pos,
                        message: "unterminated string".into(),
                    });
                }
                out.push(Spanned {
                    tok: Tok::Text(value),
                    pos,
                });
                i = j;
            }
            _ if c.is_ascii_digit() => {
                let mut j = i;
                let mut is_number = true;
                while j < bytes.len() {
                    let d = bytes[j] as char;
                    if d.is_ascii_digit() || d == '.' {
                        j += 1;
                    } else if d.is_ascii_alphabetic() || d == '_' || d == '-' {
                        // Something like 7d or 2025-12-31: identifier-ish.
                        is_number = false;
                        j += 1;
                    } else {
                        break;
                    }
                }
                let text = &input[i..j];
                if is_number {
                    let value: f64 = text.parse().map_err(|_| ParseError {
                        position: pos,
                        message: format!("invalid number '{text}'"),
                    })?;
                    out.push(Spanned {
                        tok: Tok::Number(value),
                        pos,
                    });
                } else {
                    out.push(Spanned {
                        tok: Tok::Ident(text.to_string()),
                        pos,
                    });
                }
                i = j;
            }
            _ if c.is_alphanumeric() || c == '_' => {
                let mut j = i;
                while j < bytes.len() {
                    let d = bytes[j] as char;
                    if d.is_alphanumeric() || d == '_' || d == '.' || d == '-' {
                        j += 1;
                    } else {
                        break;
                    }
                }
                out.push(Spanned {
                    tok: Tok::Ident(input[i..j].to_string()),
                    pos,
                });
                i = j;
            }
            other => {
                return Err(ParseError {
                    position: pos,
                    message: format!("unexpected character '{other}'"),
                });
            }
        }
    }
    out.push(Spanned {
        tok: Tok::Eof,
        pos: input.len(),
    });
    Ok(out)
}

/// Parse the string form of the query language.
pub fn parse(input: &str) -> Result<Query, ParseError> {
    let tokens = tokenize(input)?;
    let mut parser = Parser { tokens, index: 0 };
    let query = parser.query()?;
    parser.expect_eof()?;
    Ok(query)
}

struct Parser {
    tokens: Vec<Spanned>,
    index: usize,
}

impl Parser {
    fn peek(&self) -> &Spanned {
        &self.tokens[self.index.min(self.tokens.len() - 1)]
    }

    fn bump(&mut self) -> Spanned {
        let t = self.tokens[self.index.min(self.tokens.len() - 1)].clone();
        if self.index < self.tokens.len() - 1 {
            self.index += 1;
        }
        t
    }

    fn error(&self, message: impl Into<String>) -> ParseError {
        ParseError {
            position: self.peek().pos,
            message: message.into(),
        }
    }

    fn keyword(&self) -> Option<String> {
        match &self.peek().tok {
            Tok::Ident(word) => Some(word.to_lowercase()),
            _ => None,
        }
    }

    fn eat_keyword(&mut self, word: &str) -> bool {
        if self.keyword().as_deref() == Some(word) {
            self.bump();
            true
        } else {
            false
        }
    }

    fn expect_keyword(&mut self, word: &str) -> Result<(), ParseError> {
        if self.eat_keyword(word) {
            Ok(())
        } else {
            Err(self.error(format!("expected '{word}'")))
        }
    }

    fn expect_eof(&self) -> Result<(), ParseError> {
        if matches!(self.peek().tok, Tok::Eof) {
            Ok(())
        } else {
            Err(self.error("unexpected trailing input"))
        }
    }

    fn query(&mut self) -> Result<Query, ParseError> {
        self.expect_keyword("find")?;

        let find = match self.bump().tok {
            Tok::Star => "*".to_string(),
            Tok::Ident(name) => name,
            Tok::Text(name) => name,
            _ => return Err(self.error("expected a supertag name or '*' after 'find'")),
        };

        let mut query = Query {
            find,
            where_clauses: Vec::new(),
            order_by: None,
            limit: None,
            offset: None,
            select: None,
        };

        if self.eat_keyword("where") {
            query.where_clauses.push(self.where_entry()?);
            while self.eat_keyword("and") {
                query.where_clauses.push(self.where_entry()?);
            }
        }

        if self.eat_keyword("order") {
            self.expect_keyword("by")?;
            let descending = matches!(self.peek().tok, Tok::Minus) && {
                self.bump();
                true
            };
            let field = self.field_name()?;
            query.order_by = Some(OrderBy { field, descending });
        }

        if self.eat_keyword("limit") {
            query.limit = Some(self.non_negative_integer("limit")?);
        }
        if self.eat_keyword("offset") {
            query.offset = Some(self.non_negative_integer("offset")?);
        }

        if self.eat_keyword("select") {
            query.select = Some(self.select_list()?);
        }

        Ok(query)
    }

    fn non_negative_integer(&mut self, what: &str) -> Result<usize, ParseError> {
        match self.bump().tok {
            Tok::Number(n) if n >= 0.0 && n.fract() == 0.0 => Ok(n as usize),
            _ => Err(self.error(format!("expected a non-negative integer after '{what}'"))),
        }
    }

    fn field_name(&mut self) -> Result<String, ParseError> {
        match self.bump().tok {
            Tok::Ident(name) => Ok(name),
            Tok::Text(name) => Ok(name),
            _ => Err(self.error("expected a field name")),
        }
    }

    fn where_entry(&mut self) -> Result<WhereEntry, ParseError> {
        if matches!(self.peek().tok, Tok::LParen) {
            self.bump();
            let mut clauses = vec![self.clause()?];
            while self.eat_keyword("or") {
                clauses.push(self.clause()?);
            }
            if !matches!(self.bump().tok, Tok::RParen) {
                return Err(self.error("expected ')' to close the group"));
            }
            Ok(WhereEntry::Or(OrGroup { clauses }))
        } else {
            Ok(WhereEntry::Clause(self.clause()?))
        }
    }

    fn clause(&mut self) -> Result<Clause, ParseError> {
        let negated = self.eat_keyword("not");
        let field = self.field_name()?;

        // field exists | field is empty|null
        if self.keyword().as_deref() == Some("exists") {
            self.bump();
            return Ok(Clause {
                field,
                operator: Operator::Exists,
                value: QueryValue::None,
                negated,
            });
        }
        if self.keyword().as_deref() == Some("is") {
            self.bump();
            let word = self.keyword().ok_or_else(|| {
                self.error("expected 'empty' or 'null' after 'is'")
            })?;
            if word == "empty" || word == "null" {
                self.bump();
                return Ok(Clause {
                    field,
                    operator: Operator::IsEmpty,
                    value: QueryValue::None,
                    negated,
                });
            }
            return Err(self.error("expected 'empty' or 'null' after 'is'"));
        }

        let operator = if self.eat_keyword("contains") {
            Operator::Contains
        } else {
            match self.bump().tok {
                Tok::Eq => Operator::Eq,
                Tok::Ne => Operator::Ne,
                Tok::Gt => Operator::Gt,
                Tok::Lt => Operator::Lt,
                Tok::Ge => Operator::Ge,
                Tok::Le => Operator::Le,
                Tok::Tilde => Operator::Contains,
                _ => return Err(self.error("expected a comparison operator")),
            }
        };

        let value = self.value()?;
        Ok(Clause {
            field,
            operator,
            value,
            negated,
        })
    }

    fn value(&mut self) -> Result<QueryValue, ParseError> {
        match self.bump().tok {
            Tok::Number(n) => Ok(QueryValue::Number(n)),
            Tok::Text(s) => Ok(QueryValue::Text(s)),
            Tok::Ident(word) => Ok(classify_bare_value(&word)),
            Tok::Minus => match self.bump().tok {
                Tok::Number(n) => Ok(QueryValue::Number(-n)),
                _ => Err(self.error("expected a number after '-'")),
            },
            _ => Err(self.error("expected a value")),
        }
    }

    fn select_list(&mut self) -> Result<Vec<String>, ParseError> {
        if matches!(self.peek().tok, Tok::Star) {
            self.bump();
            return Ok(vec!["*".to_string()]);
        }

        let mut fields = Vec::new();
        loop {
            match self.bump().tok {
                Tok::Ident(name) => fields.push(name),
                Tok::Text(name) => {
                    // Back-compat: a single quoted "a,b,c" is a list.
                    if fields.is_empty()
                        && !matches!(self.peek().tok, Tok::Comma)
                        && name.contains(',')
                    {
                        return Ok(name
                            .split(',')
                            .map(str::trim)
                            .filter(|s| !s.is_empty())
                            .map(str::to_string)
                            .collect());
                    }
                    fields.push(name);
                }
                _ => return Err(self.error("expected a field name in select")),
            }
            if matches!(self.peek().tok, Tok::Comma) {
                self.bump();
            } else {
                break;
            }
        }
        Ok(fields)
    }
}

/// Bare identifier on the right-hand side: may be a bool, a relative
/// date, or an unquoted text value.
fn classify_bare_value(word: &str) -> QueryValue {
    match word.to_lowercase().as_str() {
        "true" => return QueryValue::Bool(true),
        "false" => return QueryValue::Bool(false),
        "today" => return QueryValue::Relative(RelativeDate::Today),
        "yesterday" => return QueryValue::Relative(RelativeDate::Yesterday),
        _ => {}
    }
    if let Some(relative) = parse_relative_span(word) {
        return QueryValue::Relative(relative);
    }
    QueryValue::Text(word.to_string())
}

fn parse_relative_span(word: &str) -> Option<RelativeDate> {
    if word.len() < 2 {
        return None;
    }
    let (digits, suffix) = word.split_at(word.len() - 1);
    let n: u32 = digits.parse().ok()?;
    let unit = match suffix {
        "d" => DateUnit::Days,
        "w" => DateUnit::Weeks,
        "m" => DateUnit::Months,
        "y" => DateUnit::Years,
        _ => return None,
    };
    Some(RelativeDate::Ago { n, unit })
}
