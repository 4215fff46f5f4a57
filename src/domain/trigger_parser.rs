//! Trigger condition parser.
//!
//! Recursive descent over the condition grammar:
//!
//! ```text
//! conditions := condition ( "AND" condition )*
//! condition  := field operator number
//! operator   := ">=" | "<=" | "==" | "!=" | ">" | "<"
//! ```
//!
//! Errors carry the character offset of the offending token.

use crate::domain::error::ParseError;
use crate::domain::trigger::{Condition, MetricField, Operator};

struct Parser<'a> {
    input: &'a str,
    pos: usize,
}

impl<'a> Parser<'a> {
    fn new(input: &'a str) -> Self {
        Self { input, pos: 0 }
    }

    fn remaining(&self) -> &'a str {
        &self.input[self.pos..]
    }

    fn peek(&self) -> Option<char> {
        self.remaining().chars().next()
    }

    fn advance(&mut self) -> Option<char> {
        let ch = self.peek()?;
        self.pos += ch.len_utf8();
        Some(ch)
    }

    fn skip_whitespace(&mut self) {
        while let Some(ch) = self.peek() {
            if ch.is_whitespace() {
                self.advance();
            } else {
                break;
            }
        }
    }

    fn peek_keyword(&self, keyword: &str) -> bool {
        let remaining = self.remaining();
        remaining.starts_with(keyword)
            && !remaining[keyword.len()..]
                .chars()
                .next()
                .is_some_and(|c| c.is_alphanumeric() || c == '_')
    }

    fn consume_keyword(&mut self, keyword: &str) -> bool {
        if self.peek_keyword(keyword) {
            self.pos += keyword.len();
            true
        } else {
            false
        }
    }

    fn peek_word(&self) -> String {
        let word: String = self
            .remaining()
            .chars()
            .take_while(|ch| ch.is_alphanumeric() || *ch == '_')
            .collect();
        if word.is_empty() {
            self.peek()
                .map(|c| c.to_string())
                .unwrap_or_else(|| "end of input".to_string())
        } else {
            word
        }
    }

    fn parse_number(&mut self) -> Result<f64, ParseError> {
        self.skip_whitespace();
        let start = self.pos;
        let mut has_dot = false;
        let mut digits = 0;

        if matches!(self.peek(), Some('-') | Some('+')) {
            self.advance();
        }

        while let Some(ch) = self.peek() {
            if ch.is_ascii_digit() {
                digits += 1;
                self.advance();
            } else if ch == '.' && !has_dot {
                has_dot = true;
                self.advance();
            } else {
                break;
            }
        }

        if digits == 0 {
            self.pos = start;
            return Err(ParseError {
                message: format!("expected number, found '{}'", self.peek_word()),
                position: start,
            });
        }

        let num_str = &self.input[start..self.pos];
        num_str.parse::<f64>().map_err(|_| ParseError {
            message: format!("invalid number: {}", num_str),
            position: start,
        })
    }

    fn parse_field(&mut self) -> Result<MetricField, ParseError> {
        self.skip_whitespace();
        let start = self.pos;
        let word = self.peek_word();
        if !word.starts_with(|c: char| c.is_alphabetic()) {
            return Err(ParseError {
                message: format!("expected field name, found '{}'", word),
                position: start,
            });
        }
        let field = word.parse::<MetricField>().map_err(|message| ParseError {
            message,
            position: start,
        })?;
        self.pos += word.len();
        Ok(field)
    }

    fn parse_operator(&mut self) -> Result<Operator, ParseError> {
        self.skip_whitespace();
        // two-character operators first so ">=" is not read as ">"
        for (text, op) in [
            (">=", Operator::Ge),
            ("<=", Operator::Le),
            ("==", Operator::Eq),
            ("!=", Operator::Ne),
            (">", Operator::Gt),
            ("<", Operator::Lt),
        ] {
            if self.remaining().starts_with(text) {
                self.pos += text.len();
                return Ok(op);
            }
        }
        Err(ParseError {
            message: format!(
                "expected operator (>, <, >=, <=, ==, !=), found '{}'",
                self.peek_word()
            ),
            position: self.pos,
        })
    }

    fn parse_condition(&mut self) -> Result<Condition, ParseError> {
        let field = self.parse_field()?;
        let operator = self.parse_operator()?;
        let threshold = self.parse_number()?;
        Ok(Condition {
            field,
            operator,
            threshold,
        })
    }

    fn parse(&mut self) -> Result<Vec<Condition>, ParseError> {
        self.skip_whitespace();
        if self.peek().is_none() {
            return Err(ParseError {
                message: "expected at least one condition".to_string(),
                position: self.pos,
            });
        }

        let mut conditions = vec![self.parse_condition()?];
        loop {
            self.skip_whitespace();
            if self.peek().is_none() {
                break;
            }
            if !self.consume_keyword("AND") {
                return Err(ParseError {
                    message: format!("expected 'AND', found '{}'", self.peek_word()),
                    position: self.pos,
                });
            }
            conditions.push(self.parse_condition()?);
        }
        Ok(conditions)
    }
}

pub fn parse_conditions(input: &str) -> Result<Vec<Condition>, ParseError> {
    Parser::new(input).parse()
}
