//! Shared utilities for the protopython runtime: lock wrappers, the
//! process-wide string interner, and source-location types. These are used by
//! every other crate in the workspace, the same way `rustpython_common` is
//! used by every RustPython crate.

pub mod intern;
pub mod lock;
pub mod source;

pub use intern::{InternedStr, StringPool};
pub use source::Location;
