//! Command line tokenizer and value expressions.

use chrono::{NaiveDate, NaiveDateTime};
use modelgraph_core::{AttributeType, ModelError, Value};

const DATETIME_FORMATS: [&str; 2] = ["%Y-%m-%dT%H:%M:%S", "%Y-%m-%d %H:%M:%S"];

/// A value as written on the command line, before it is bound to a member.
#[derive(Debug, Clone, PartialEq)]
pub(crate) enum Expr {
    /// `@Class.key`
    Object { class: String, key: String },
    /// `$name`
    Variable(String),
    /// `[a, b, ...]`
    List(Vec<Expr>),
    /// `"text"` or `'text'`
    Quoted(String),
    Bare(String),
}

fn invalid(message: impl Into<String>) -> ModelError {
    ModelError::InvalidCommand(message.into())
}

/// Split a command line on whitespace. Quotes, brackets and parentheses
/// group their content into one token.
pub(crate) fn tokenize(line: &str) -> Result<Vec<String>, ModelError> {
    let mut tokens = Vec::new();
    let mut current = String::new();
    let mut quote: Option<char> = None;
    let mut depth = 0usize;

    for c in line.chars() {
        match quote {
            Some(q) => {
                current.push(c);
                if c == q {
                    quote = None;
                }
            }
            None => match c {
                '"' | '\'' => {
                    quote = Some(c);
                    current.push(c);
                }
                '[' | '(' => {
                    depth += 1;
                    current.push(c);
                }
                ']' | ')' => {
                    depth = depth
                        .checked_sub(1)
                        .ok_or_else(|| invalid(format!("Unbalanced '{c}' in command")))?;
                    current.push(c);
                }
                c if c.is_whitespace() && depth == 0 => {
                    if !current.is_empty() {
                        tokens.push(std::mem::take(&mut current));
                    }
                }
                c => current.push(c),
            },
        }
    }

    if quote.is_some() {
        return Err(invalid("Unterminated quote in command"));
    }
    if depth > 0 {
        return Err(invalid("Unclosed bracket in command"));
    }
    if !current.is_empty() {
        tokens.push(current);
    }
    Ok(tokens)
}

/// Split `member=value`. The member must be non-empty.
pub(crate) fn split_assignment(token: &str) -> Result<(&str, &str), ModelError> {
    match token.split_once('=') {
        Some((member, value)) if !member.is_empty() => Ok((member, value)),
        _ => Err(invalid(format!("Expected member=value, got '{token}'"))),
    }
}

pub(crate) fn parse_expr(text: &str) -> Result<Expr, ModelError> {
    let text = text.trim();
    if let Some(inner) = text.strip_prefix('[') {
        let inner = inner
            .strip_suffix(']')
            .ok_or_else(|| invalid(format!("Unclosed list '{text}'")))?;
        return split_list(inner)?
            .into_iter()
            .map(parse_expr)
            .collect::<Result<Vec<_>, _>>()
            .map(Expr::List);
    }
    if let Some(path) = text.strip_prefix('@') {
        return match path.split_once('.') {
            Some((class, key)) if !class.is_empty() && !key.is_empty() => Ok(Expr::Object {
                class: class.to_string(),
                key: key.to_string(),
            }),
            _ => Err(invalid(format!("Expected @Class.key, got '{text}'"))),
        };
    }
    if let Some(name) = text.strip_prefix('$') {
        if name.is_empty() {
            return Err(invalid("Expected a variable name after '$'"));
        }
        return Ok(Expr::Variable(name.to_string()));
    }
    for q in ['"', '\''] {
        if text.len() >= 2 && text.starts_with(q) && text.ends_with(q) {
            return Ok(Expr::Quoted(text[1..text.len() - 1].to_string()));
        }
    }
    Ok(Expr::Bare(text.to_string()))
}

/// Items of a list body, split on top-level commas.
fn split_list(inner: &str) -> Result<Vec<&str>, ModelError> {
    if inner.trim().is_empty() {
        return Ok(Vec::new());
    }
    let mut items = Vec::new();
    let mut start = 0;
    let mut depth = 0usize;
    let mut quote: Option<char> = None;
    for (i, c) in inner.char_indices() {
        match (quote, c) {
            (Some(q), c) if c == q => quote = None,
            (Some(_), _) => {}
            (None, '"' | '\'') => quote = Some(c),
            (None, '[' | '(') => depth += 1,
            (None, ']' | ')') => depth = depth.saturating_sub(1),
            (None, ',') if depth == 0 => {
                items.push(&inner[start..i]);
                start = i + 1;
            }
            _ => {}
        }
    }
    items.push(&inner[start..]);
    if items.iter().any(|item| item.trim().is_empty()) {
        return Err(invalid(format!("Empty list item in '[{inner}]'")));
    }
    Ok(items)
}

/// Parse a scalar according to the declared attribute type.
pub(crate) fn parse_scalar(attr_type: AttributeType, text: &str) -> Result<Value, ModelError> {
    let mismatch = || invalid(format!("'{}' is not a valid {} value", text, attr_type.name()));
    match attr_type {
        AttributeType::Text => Ok(Value::Text(text.to_string())),
        AttributeType::Int => text.parse().map(Value::Int).map_err(|_| mismatch()),
        AttributeType::Float => text.parse().map(Value::Float).map_err(|_| mismatch()),
        AttributeType::Boolean => match text.to_ascii_lowercase().as_str() {
            "true" | "1" | "yes" => Ok(Value::Boolean(true)),
            "false" | "0" | "no" => Ok(Value::Boolean(false)),
            _ => Err(mismatch()),
        },
        AttributeType::DateTime => parse_datetime(text).map(Value::DateTime).ok_or_else(mismatch),
        AttributeType::GeoPosition => {
            let inner = text
                .strip_prefix('(')
                .and_then(|t| t.strip_suffix(')'))
                .unwrap_or(text);
            let (lat, lon) = inner.split_once(',').ok_or_else(mismatch)?;
            let lat = lat.trim().parse().map_err(|_| mismatch())?;
            let lon = lon.trim().parse().map_err(|_| mismatch())?;
            Ok(Value::Geo(lat, lon))
        }
    }
}

fn parse_datetime(text: &str) -> Option<NaiveDateTime> {
    DATETIME_FORMATS
        .iter()
        .find_map(|format| NaiveDateTime::parse_from_str(text, format).ok())
        .or_else(|| {
            NaiveDate::parse_from_str(text, "%Y-%m-%d")
                .ok()
                .and_then(|date| date.and_hms_opt(0, 0, 0))
        })
}
