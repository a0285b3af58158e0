//! Host-level compiler errors (SPEC_FULL.md §B.2), distinct from the
//! guest-level pending-exception `Value` the VM raises at run time.

use protopython_common::Location;
use protopython_parser::ParseError;
use thiserror::Error;

#[derive(Clone, Debug, PartialEq, Error)]
pub enum CompileErrorType {
    #[error(transparent)]
    Parse(#[from] protopython_parser::ParseErrorType),
    #[error("'return' outside function")]
    ReturnOutsideFunction,
    #[error("'yield' outside function")]
    YieldOutsideFunction,
    #[error("'break' outside loop")]
    BreakOutsideLoop,
    #[error("'continue' outside loop")]
    ContinueOutsideLoop,
    #[error("name '{0}' is assigned to before nonlocal declaration")]
    NonlocalBeforeAssignment(String),
    #[error("no binding for nonlocal '{0}' found in enclosing scopes")]
    NoBindingForNonlocal(String),
    #[error("'{0}' can appear only once in a with-item target list")]
    DuplicateTarget(String),
}

#[derive(Clone, Debug, PartialEq, Error)]
#[error("{error} at {location}")]
pub struct CompileError {
    pub error: CompileErrorType,
    pub location: Location,
    pub text: String,
}

impl CompileError {
    pub fn new(error: CompileErrorType, location: Location, text: impl Into<String>) -> Self {
        CompileError { error, location, text: text.into() }
    }
}

impl From<ParseError> for CompileError {
    fn from(e: ParseError) -> Self {
        CompileError {
            error: CompileErrorType::Parse(e.error),
            location: e.location,
            text: e.text,
        }
    }
}
