//! Error types and the diagnostics sink for the text front-end.
//!
//! Lexing and S-expression reading fail fast; the assembler instead
//! accumulates diagnostics into a [`Diagnostics`] sink and keeps going where
//! it can, so one pass surfaces as many problems as possible.

use super::token::Span;
use std::fmt;
use thiserror::Error;

/// An error encountered during lexical analysis.
#[derive(Debug, Clone, Error)]
#[error("{span}: {message}")]
pub struct LexError {
    pub message: String,
    pub span: Span,
}

impl LexError {
    pub fn new(message: impl Into<String>, span: Span) -> Self {
        Self {
            message: message.into(),
            span,
        }
    }
}

/// An error encountered while assembling text into a module.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{message} at line {}, column {}", .span.line, .span.column)]
pub struct ParseError {
    pub message: String,
    pub span: Span,
}

impl ParseError {
    pub fn new(message: impl Into<String>, span: Span) -> Self {
        Self {
            message: message.into(),
            span,
        }
    }

    /// "expected X, found Y"
    pub fn expected(expected: &str, found: &str, span: Span) -> Self {
        Self::new(format!("expected {expected}, found {found}"), span)
    }

    /// An identifier use with no matching definition, with an optional
    /// closest-match suggestion from the namespace's defined names.
    pub fn undefined(kind: &str, name: &str, suggestion: Option<&str>, span: Span) -> Self {
        match suggestion {
            Some(s) => Self::new(format!("undefined {kind}: ${name} (did you mean ${s}?)"), span),
            None => Self::new(format!("undefined {kind}: ${name}"), span),
        }
    }

    /// An identifier defined twice in the same index space.
    pub fn duplicate(kind: &str, name: &str, span: Span) -> Self {
        Self::new(format!("duplicate {kind} ${name}"), span)
    }
}

impl From<LexError> for ParseError {
    fn from(e: LexError) -> Self {
        Self {
            message: e.message,
            span: e.span,
        }
    }
}

/// Severity of a diagnostic. Only `Error` sets the failure flag.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Severity {
    Warning,
    Error,
}

/// One reported problem.
#[derive(Debug, Clone)]
pub struct Diagnostic {
    pub severity: Severity,
    pub message: String,
    pub span: Span,
}

impl fmt::Display for Diagnostic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let tag = match self.severity {
            Severity::Warning => "warning",
            Severity::Error => "error",
        };
        write!(
            f,
            "{tag}: {} at line {}, column {}",
            self.message, self.span.line, self.span.column
        )
    }
}

/// Accumulates diagnostics during assembly.
#[derive(Debug, Default)]
pub struct Diagnostics {
    entries: Vec<Diagnostic>,
}

impl Diagnostics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn error(&mut self, error: ParseError) {
        self.entries.push(Diagnostic {
            severity: Severity::Error,
            message: error.message,
            span: error.span,
        });
    }

    pub fn warning(&mut self, message: impl Into<String>, span: Span) {
        self.entries.push(Diagnostic {
            severity: Severity::Warning,
            message: message.into(),
            span,
        });
    }

    /// True when any error-severity diagnostic was reported.
    pub fn has_errors(&self) -> bool {
        self.entries.iter().any(|d| d.severity == Severity::Error)
    }

    pub fn entries(&self) -> &[Diagnostic] {
        &self.entries
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// The first error-severity diagnostic, as a [`ParseError`].
    pub fn first_error(&self) -> Option<ParseError> {
        self.entries
            .iter()
            .find(|d| d.severity == Severity::Error)
            .map(|d| ParseError::new(d.message.clone(), d.span))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_formats() {
        let err = LexError::new("unexpected character", Span::new(10, 11, 3, 5));
        assert_eq!(format!("{err}"), "3:5: unexpected character");

        let err = ParseError::new("unknown instruction: i32.bad", Span::new(0, 5, 2, 7));
        assert_eq!(format!("{err}"), "unknown instruction: i32.bad at line 2, column 7");
    }

    #[test]
    fn undefined_with_suggestion() {
        let err = ParseError::undefined("function", "fbo", Some("foo"), Span::ZERO);
        assert_eq!(err.message, "undefined function: $fbo (did you mean $foo?)");
        let err = ParseError::undefined("label", "x", None, Span::ZERO);
        assert_eq!(err.message, "undefined label: $x");
    }

    #[test]
    fn failure_flag_tracks_errors_only() {
        let mut diagnostics = Diagnostics::new();
        assert!(!diagnostics.has_errors());

        diagnostics.warning("unused name", Span::ZERO);
        assert!(!diagnostics.has_errors());
        assert!(!diagnostics.is_empty());

        diagnostics.error(ParseError::new("bad", Span::ZERO));
        assert!(diagnostics.has_errors());
        assert_eq!(diagnostics.first_error().unwrap().message, "bad");
    }
}
