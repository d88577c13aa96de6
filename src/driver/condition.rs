//! # Filter Conditions
//!
//! Parser and evaluator for the filter strings accepted by the memory
//! driver, e.g. `name like 'a%' and (age >= 18 or vip = true)`.
//! `:name` placeholders are bound from the request's `params`.

use serde_json::{Map, Value};

use crate::table::access::FilterOperator;
use crate::table::errors::{ResourceError, ResourceResult};
use crate::table::ids::scalar_string;
use crate::table::Record;

/// Parsed filter expression
#[derive(Debug, Clone, PartialEq)]
pub enum Condition {
    All(Vec<Condition>),
    Any(Vec<Condition>),
    Compare {
        field: String,
        operator: FilterOperator,
        value: Value,
    },
    /// SQL-style `%`/`_` pattern, case-insensitive
    Like {
        field: String,
        pattern: String,
        negated: bool,
    },
}

impl Condition {
    /// Parse a filter string; blank filters yield `None`
    pub fn parse(filter: &str, params: &Map<String, Value>) -> ResourceResult<Option<Self>> {
        let tokens = tokenize(filter)?;
        if tokens.is_empty() {
            return Ok(None);
        }

        let mut parser = Parser {
            tokens,
            pos: 0,
            params,
            source: filter,
        };
        let condition = parser.parse_or()?;
        if parser.pos < parser.tokens.len() {
            return Err(parser.error("unexpected trailing input"));
        }
        Ok(Some(condition))
    }

    pub fn matches(&self, record: &Record) -> bool {
        match self {
            Condition::All(items) => items.iter().all(|c| c.matches(record)),
            Condition::Any(items) => items.iter().any(|c| c.matches(record)),
            Condition::Compare {
                field,
                operator,
                value,
            } => operator.evaluate(record.get(field), value),
            Condition::Like {
                field,
                pattern,
                negated,
            } => match record.get(field) {
                None | Some(Value::Null) => false,
                Some(v) => like(&scalar_string(v), pattern) != *negated,
            },
        }
    }
}

fn like(value: &str, pattern: &str) -> bool {
    let value: Vec<char> = value.to_lowercase().chars().collect();
    let pattern: Vec<char> = pattern.to_lowercase().chars().collect();
    like_chars(&value, &pattern)
}

/// Wildcard match with backtracking only to the last `%`
fn like_chars(value: &[char], pattern: &[char]) -> bool {
    let (mut v, mut p) = (0, 0);
    let mut star: Option<usize> = None;
    let mut resume = 0;

    while v < value.len() {
        match pattern.get(p) {
            Some('%') => {
                star = Some(p);
                resume = v;
                p += 1;
            }
            Some(&c) if c == '_' || c == value[v] => {
                v += 1;
                p += 1;
            }
            _ => match star {
                Some(s) => {
                    p = s + 1;
                    resume += 1;
                    v = resume;
                }
                None => return false,
            },
        }
    }

    pattern[p..].iter().all(|&c| c == '%')
}

#[derive(Debug, Clone, PartialEq)]
enum Token {
    Word(String),
    Str(String),
    Num(Value),
    Op(&'static str),
    Param(String),
    LParen,
    RParen,
    Comma,
}

const SYMBOLS: &[&str] = &["<=", ">=", "<>", "!=", "==", "=", "<", ">"];

fn tokenize(input: &str) -> ResourceResult<Vec<Token>> {
    let chars: Vec<char> = input.chars().collect();
    let mut tokens = Vec::new();
    let mut i = 0;

    while i < chars.len() {
        let c = chars[i];
        match c {
            c if c.is_whitespace() => i += 1,
            '(' => {
                tokens.push(Token::LParen);
                i += 1;
            }
            ')' => {
                tokens.push(Token::RParen);
                i += 1;
            }
            ',' => {
                tokens.push(Token::Comma);
                i += 1;
            }
            '\'' | '"' => {
                let quote = c;
                let mut text = String::new();
                i += 1;
                loop {
                    match chars.get(i) {
                        None => {
                            return Err(ResourceError::bad_request(format!(
                                "Invalid filter '{}': unterminated string.",
                                input
                            )))
                        }
                        // doubled quote is an escaped quote
                        Some(&q) if q == quote && chars.get(i + 1) == Some(&quote) => {
                            text.push(quote);
                            i += 2;
                        }
                        Some(&q) if q == quote => {
                            i += 1;
                            break;
                        }
                        Some(&other) => {
                            text.push(other);
                            i += 1;
                        }
                    }
                }
                tokens.push(Token::Str(text));
            }
            ':' => {
                let start = i + 1;
                i = start;
                while i < chars.len() && is_word_char(chars[i]) {
                    i += 1;
                }
                if i == start {
                    return Err(ResourceError::bad_request(format!(
                        "Invalid filter '{}': empty parameter name.",
                        input
                    )));
                }
                tokens.push(Token::Param(chars[start..i].iter().collect()));
            }
            c if c.is_ascii_digit()
                || (c == '-' && chars.get(i + 1).map_or(false, |n| n.is_ascii_digit())) =>
            {
                let start = i;
                i += 1;
                while i < chars.len() && (chars[i].is_ascii_digit() || chars[i] == '.') {
                    i += 1;
                }
                let text: String = chars[start..i].iter().collect();
                tokens.push(Token::Num(parse_number(&text, input)?));
            }
            c if is_word_char(c) => {
                let start = i;
                while i < chars.len() && (is_word_char(chars[i]) || chars[i] == '.') {
                    i += 1;
                }
                tokens.push(Token::Word(chars[start..i].iter().collect()));
            }
            _ => {
                let rest: String = chars[i..].iter().take(2).collect();
                match SYMBOLS.iter().find(|s| rest.starts_with(**s)) {
                    Some(sym) => {
                        tokens.push(Token::Op(*sym));
                        i += sym.chars().count();
                    }
                    None => {
                        return Err(ResourceError::bad_request(format!(
                            "Invalid filter '{}': unexpected character '{}'.",
                            input, c
                        )))
                    }
                }
            }
        }
    }

    Ok(tokens)
}

fn is_word_char(c: char) -> bool {
    c.is_alphanumeric() || c == '_'
}

fn parse_number(text: &str, input: &str) -> ResourceResult<Value> {
    if let Ok(n) = text.parse::<i64>() {
        return Ok(Value::from(n));
    }
    text.parse::<f64>()
        .ok()
        .and_then(serde_json::Number::from_f64)
        .map(Value::Number)
        .ok_or_else(|| {
            ResourceError::bad_request(format!("Invalid filter '{}': bad number {}.", input, text))
        })
}

struct Parser<'a> {
    tokens: Vec<Token>,
    pos: usize,
    params: &'a Map<String, Value>,
    source: &'a str,
}

impl<'a> Parser<'a> {
    fn error(&self, detail: &str) -> ResourceError {
        ResourceError::bad_request(format!("Invalid filter '{}': {}.", self.source, detail))
    }

    fn peek(&self) -> Option<&Token> {
        self.tokens.get(self.pos)
    }

    fn next(&mut self) -> Option<Token> {
        let token = self.tokens.get(self.pos).cloned();
        if token.is_some() {
            self.pos += 1;
        }
        token
    }

    fn peek_keyword(&self, keyword: &str) -> bool {
        matches!(self.peek(), Some(Token::Word(w)) if w.eq_ignore_ascii_case(keyword))
    }

    fn eat_keyword(&mut self, keyword: &str) -> bool {
        if self.peek_keyword(keyword) {
            self.pos += 1;
            true
        } else {
            false
        }
    }

    fn expect_keyword(&mut self, keyword: &str) -> ResourceResult<()> {
        if self.eat_keyword(keyword) {
            Ok(())
        } else {
            Err(self.error(&format!("expected '{}'", keyword)))
        }
    }

    fn parse_or(&mut self) -> ResourceResult<Condition> {
        let mut items = vec![self.parse_and()?];
        while self.eat_keyword("or") {
            items.push(self.parse_and()?);
        }
        Ok(collapse(items, Condition::Any))
    }

    fn parse_and(&mut self) -> ResourceResult<Condition> {
        let mut items = vec![self.parse_primary()?];
        while self.eat_keyword("and") {
            items.push(self.parse_primary()?);
        }
        Ok(collapse(items, Condition::All))
    }

    fn parse_primary(&mut self) -> ResourceResult<Condition> {
        if self.peek() == Some(&Token::LParen) {
            self.pos += 1;
            let inner = self.parse_or()?;
            return match self.next() {
                Some(Token::RParen) => Ok(inner),
                _ => Err(self.error("missing ')'")),
            };
        }
        self.parse_comparison()
    }

    fn parse_comparison(&mut self) -> ResourceResult<Condition> {
        let field = match self.next() {
            Some(Token::Word(w)) => w,
            _ => return Err(self.error("expected a field name")),
        };

        let operator = match self.next() {
            Some(Token::Op(sym)) => {
                FilterOperator::parse(sym).ok_or_else(|| self.error("unknown operator"))?
            }
            Some(Token::Word(w)) => match w.to_ascii_lowercase().as_str() {
                "like" => return self.parse_like(field, false),
                "not" => {
                    if self.eat_keyword("like") {
                        return self.parse_like(field, true);
                    }
                    self.expect_keyword("in")?;
                    FilterOperator::NotIn
                }
                "in" => FilterOperator::In,
                "contains" => FilterOperator::Contains,
                "starts" => {
                    self.expect_keyword("with")?;
                    FilterOperator::StartsWith
                }
                "ends" => {
                    self.expect_keyword("with")?;
                    FilterOperator::EndsWith
                }
                "is" => {
                    let negated = self.eat_keyword("not");
                    self.expect_keyword("null")?;
                    if negated {
                        FilterOperator::IsNotNull
                    } else {
                        FilterOperator::IsNull
                    }
                }
                "does" => {
                    let negated = self.eat_keyword("not");
                    self.expect_keyword("exist")?;
                    if negated {
                        FilterOperator::DoesNotExist
                    } else {
                        FilterOperator::DoesExist
                    }
                }
                _ => return Err(self.error(&format!("unknown operator '{}'", w))),
            },
            _ => return Err(self.error("expected an operator")),
        };

        let value = if operator.is_unary() {
            Value::Null
        } else if matches!(operator, FilterOperator::In | FilterOperator::NotIn) {
            self.parse_list()?
        } else {
            self.parse_value()?
        };

        Ok(Condition::Compare {
            field,
            operator,
            value,
        })
    }

    fn parse_like(&mut self, field: String, negated: bool) -> ResourceResult<Condition> {
        let pattern = scalar_string(&self.parse_value()?);
        Ok(Condition::Like {
            field,
            pattern,
            negated,
        })
    }

    fn parse_list(&mut self) -> ResourceResult<Value> {
        if self.peek() != Some(&Token::LParen) {
            // a bound parameter may carry the whole list
            return self.parse_value();
        }
        self.pos += 1;

        let mut items = Vec::new();
        loop {
            items.push(self.parse_value()?);
            match self.next() {
                Some(Token::Comma) => continue,
                Some(Token::RParen) => break,
                _ => return Err(self.error("malformed value list")),
            }
        }
        Ok(Value::Array(items))
    }

    fn parse_value(&mut self) -> ResourceResult<Value> {
        match self.next() {
            Some(Token::Str(s)) => Ok(Value::String(s)),
            Some(Token::Num(n)) => Ok(n),
            Some(Token::Param(name)) => self
                .params
                .get(&name)
                .or_else(|| self.params.get(&format!(":{}", name)))
                .cloned()
                .ok_or_else(|| {
                    ResourceError::bad_request(format!(
                        "Filter parameter ':{}' has no value in 'params'.",
                        name
                    ))
                }),
            Some(Token::Word(w)) => Ok(match w.to_ascii_lowercase().as_str() {
                "true" => Value::Bool(true),
                "false" => Value::Bool(false),
                "null" => Value::Null,
                _ => Value::String(w),
            }),
            _ => Err(self.error("expected a value")),
        }
    }
}

fn collapse(mut items: Vec<Condition>, wrap: fn(Vec<Condition>) -> Condition) -> Condition {
    if items.len() == 1 {
        if let Some(only) = items.pop() {
            return only;
        }
    }
    wrap(items)
}
