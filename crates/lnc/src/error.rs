//! Compile-error taxonomy and rendering.
//!
//! Every failure the pipeline can produce is a [`CompileError`]. Errors carry
//! enough source context to print the primary message followed by the
//! offending excerpt and its `line:col`, which is the only user-visible error
//! format the compiler has.

use std::fmt;

use strum::{Display, IntoStaticStr};

/// Result alias used throughout the compiler.
pub type CompileResult<T> = Result<T, CompileError>;

/// Broad category of a [`CompileError`], used for exit-code mapping and tests.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Display, IntoStaticStr)]
pub enum ErrorKind {
    Syntax,
    Name,
    Type,
    Reachability,
    OpcodeMisuse,
    ModuleCycle,
    Io,
}

/// Source position attached to diagnostics.
///
/// `excerpt` is the offending source line (or fragment) reproduced verbatim
/// under the primary message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SourceLoc {
    pub file: String,
    pub line: u32,
    pub column: u32,
    pub excerpt: String,
}

impl SourceLoc {
    pub fn new(file: impl Into<String>, line: u32, column: u32, excerpt: impl Into<String>) -> Self {
        Self {
            file: file.into(),
            line,
            column,
            excerpt: excerpt.into(),
        }
    }
}

impl fmt::Display for SourceLoc {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.excerpt.is_empty() {
            write!(f, "{}:{}:{}", self.file, self.line, self.column)
        } else {
            write!(f, "{}\n{}:{}:{}", self.excerpt, self.file, self.line, self.column)
        }
    }
}

/// A failure from any phase of the compilation pipeline.
#[derive(Debug, Clone)]
pub enum CompileError {
    /// Deepest parse failure with the alternatives expected at that point.
    Syntax {
        loc: SourceLoc,
        expected: Vec<String>,
    },
    /// Referenced identifier not in scope or not exported.
    Name { message: String, loc: Option<SourceLoc> },
    /// Any type-level failure: field mismatches, operator resolution,
    /// ambiguity, assignment to const, overload selection, recursion.
    Type { message: String, loc: Option<SourceLoc> },
    /// Statements after a `return` in the same block.
    Reachability { message: String, loc: Option<SourceLoc> },
    /// An opcode named directly at the source level.
    OpcodeMisuse { message: String, loc: Option<SourceLoc> },
    /// Cycle in the module import graph; `cycle` is the path in load order.
    ModuleCycle { cycle: Vec<String> },
    /// File not found or unreadable.
    Io { path: String, message: String },
}

impl CompileError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Syntax { .. } => ErrorKind::Syntax,
            Self::Name { .. } => ErrorKind::Name,
            Self::Type { .. } => ErrorKind::Type,
            Self::Reachability { .. } => ErrorKind::Reachability,
            Self::OpcodeMisuse { .. } => ErrorKind::OpcodeMisuse,
            Self::ModuleCycle { .. } => ErrorKind::ModuleCycle,
            Self::Io { .. } => ErrorKind::Io,
        }
    }

    /// Process exit code for this error: 2 for I/O failures, 1 for
    /// everything the user can fix in source.
    pub fn exit_code(&self) -> u8 {
        match self {
            Self::Io { .. } => 2,
            _ => 1,
        }
    }

    pub(crate) fn name(message: impl Into<String>, loc: Option<SourceLoc>) -> Self {
        Self::Name {
            message: message.into(),
            loc,
        }
    }

    pub(crate) fn type_error(message: impl Into<String>, loc: Option<SourceLoc>) -> Self {
        Self::Type {
            message: message.into(),
            loc,
        }
    }

    /// The primary message without the source excerpt, for tests that match
    /// on exact wording.
    pub fn message(&self) -> String {
        match self {
            Self::Syntax { expected, .. } => {
                format!("Syntax error, expected one of: {}", expected.join(", "))
            }
            Self::Name { message, .. }
            | Self::Type { message, .. }
            | Self::Reachability { message, .. }
            | Self::OpcodeMisuse { message, .. } => message.clone(),
            Self::ModuleCycle { cycle } => {
                format!("Circular import detected: {}", cycle.join(" -> "))
            }
            Self::Io { path, message } => format!("Cannot read {path}: {message}"),
        }
    }
}

impl fmt::Display for CompileError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.message())?;
        let loc = match self {
            Self::Syntax { loc, .. } => Some(loc),
            Self::Name { loc, .. }
            | Self::Type { loc, .. }
            | Self::Reachability { loc, .. }
            | Self::OpcodeMisuse { loc, .. } => loc.as_ref(),
            _ => None,
        };
        if let Some(loc) = loc {
            write!(f, "\n{loc}")?;
        }
        Ok(())
    }
}

impl std::error::Error for CompileError {}

impl From<std::io::Error> for CompileError {
    fn from(err: std::io::Error) -> Self {
        Self::Io {
            path: String::new(),
            message: err.to_string(),
        }
    }
}
