//! Source-code locations, shared by the tokenizer, parser, compiler and the
//! `SyntaxError` presentation layer.

/// A 1-indexed row/column pair, as the teacher's bytecode crate defines it.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Location {
    row: u32,
    column: u32,
}

impl Location {
    pub fn new(row: u32, column: u32) -> Self {
        Location { row, column }
    }

    pub fn row(&self) -> u32 {
        self.row
    }

    pub fn column(&self) -> u32 {
        self.column
    }

    pub fn with_col(self, column: u32) -> Self {
        Location { column, ..self }
    }
}

impl std::fmt::Display for Location {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "line {}, column {}", self.row, self.column)
    }
}
