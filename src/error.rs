//! Error types.
//!
//! Most of this crate's operations are either infallible (`Pipe`'s methods)
//! or programmer errors that panic (a type mismatch during composition is a
//! compile error; a malformed `MultiFilter` input is an `assert!`). `Error`
//! exists, in the same hand-rolled style used elsewhere in this codebase (a
//! plain enum with manual `Display`/`From` impls rather than a derive-macro
//! error crate), as the home for the one case that genuinely needs it: a
//! caught filter panic, surfaced through [`crate::Pipeline::health`].

use std::any::Any;
use std::error::Error as StdError;
use std::fmt::{self, Display};

/// Errors surfaced by the pipeline's diagnostics, as opposed to panics raised
/// directly at the call site for programmer errors.
#[derive(Debug)]
pub enum Error {
    /// A filter's `process_impl` panicked while its stage was running.
    FilterPanic {
        /// The name of the stage whose filter panicked.
        stage: String,
        /// The panic payload, as caught by `catch_unwind`.
        payload: Box<dyn Any + Send>,
    },
}

impl Error {
    /// A best-effort, human-readable description of the panic payload.
    pub fn message(&self) -> String {
        match self {
            Error::FilterPanic { payload, .. } => {
                if let Some(s) = payload.downcast_ref::<&str>() {
                    s.to_string()
                } else if let Some(s) = payload.downcast_ref::<String>() {
                    s.clone()
                } else {
                    "non-string panic payload".to_string()
                }
            }
        }
    }
}

impl Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::FilterPanic { stage, .. } => {
                write!(f, "filter in stage '{stage}' panicked: {}", self.message())
            }
        }
    }
}

impl StdError for Error {}
