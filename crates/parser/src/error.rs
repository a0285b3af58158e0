//! Lexical and syntax errors (spec §4.2 "Errors", §4.3 "Error recovery").
//!
//! These carry enough information (`lineno`, `offset`, offending text) for
//! the VM to materialize a real `SyntaxError`/`IndentationError` instance,
//! matching spec §3 "Exception instance" (`lineno`/`offset`/`text` fields).

use protopython_common::Location;
use thiserror::Error;

#[derive(Clone, Debug, PartialEq, Error)]
pub enum LexErrorType {
    #[error("invalid character {0:?}")]
    IllegalCharacter(char),
    #[error("EOF in multi-line string")]
    UnterminatedString,
    #[error("unindent does not match any outer indentation level")]
    InconsistentDedent,
    #[error("EOF while scanning triple-quoted string literal")]
    Eof,
    #[error("{0}")]
    Other(String),
}

#[derive(Clone, Debug, PartialEq, Error)]
#[error("{error} ({location})")]
pub struct LexError {
    pub error: LexErrorType,
    pub location: Location,
}

#[derive(Clone, Debug, PartialEq, Error)]
pub enum ParseErrorType {
    #[error(transparent)]
    Lexical(#[from] LexErrorType),
    #[error("unexpected token {0}")]
    UnexpectedToken(String),
    #[error("unexpected end of file")]
    Eof,
    #[error("invalid syntax: {0}")]
    InvalidSyntax(String),
}

/// A syntax error, carrying the fields the VM needs to build a `SyntaxError`
/// guest exception: `lineno`, `offset` and the offending source line text.
#[derive(Clone, Debug, PartialEq, Error)]
#[error("{error} at {location}")]
pub struct ParseError {
    pub error: ParseErrorType,
    pub location: Location,
    pub text: String,
}

impl ParseError {
    pub fn new(error: ParseErrorType, location: Location, text: impl Into<String>) -> Self {
        ParseError {
            error,
            location,
            text: text.into(),
        }
    }
}

impl From<LexError> for ParseError {
    fn from(e: LexError) -> Self {
        ParseError {
            error: ParseErrorType::Lexical(e.error),
            location: e.location,
            text: String::new(),
        }
    }
}
