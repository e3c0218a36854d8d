//! Diagnostic reporting infrastructure.
//!
//! Static effect errors are batched per compilation unit and carry a stable
//! code and a source span. Rendering goes through `ariadne`.
//!
//! # Error Codes
//!
//! Effect and handler errors occupy **E0400-E0499**. Every code also has a
//! stable kebab-case slug used by tooling and tests:
//!
//! | Code  | Slug                        | Raised by |
//! |-------|-----------------------------|-----------|
//! | E0400 | `unhandled-effects`         | handler checker |
//! | E0401 | `effect-handler-overload`   | handler checker |
//! | E0402 | `effect-generic-mismatch`   | handler checker |
//! | E0403 | `tail-resume-count`         | usage analyzer |
//! | E0404 | `tail-resume-escape`        | usage analyzer |
//! | E0405 | `effect-handler-annotation` | handler checker |
//! | E0406 | `effect-unknown-operation`  | handler checker |
//! | E0407 | `undeclared-effects`        | row inference |
//! | E0408 | `structural-unsupported`    | structural backend |
//! | E0499 | `internal-error`            | any pass |

use std::fmt;
use std::io;

use ariadne::{Color, Label, Report, ReportKind, Source};
use serde::Serialize;

use crate::span::Span;

/// Compiler error codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[repr(u16)]
pub enum ErrorCode {
    // ============================================================
    // Effect/handler errors (E0400-E0499)
    // ============================================================
    /// Operations left in a handler's row that no clause re-raises.
    UnhandledEffects = 400,
    /// Zero or several overloads match a clause's annotations.
    EffectHandlerOverload = 401,
    /// A generic operation is performed at inconsistent instantiations.
    EffectGenericMismatch = 402,
    /// A tail continuation is provably resumed the wrong number of times.
    TailResumeCount = 403,
    /// A tail continuation leaves its clause as a value.
    TailResumeEscape = 404,
    /// Clause parameters disagree with the operation.
    EffectHandlerAnnotation = 405,
    /// A clause names an operation its effect does not declare.
    EffectUnknownOperation = 406,
    /// A function performs operations outside its declared row.
    UndeclaredEffects = 407,
    /// A construct the structural backend cannot lower.
    StructuralUnsupported = 408,
    /// Internal compiler error.
    Internal = 499,
}

impl ErrorCode {
    /// The numeric code string (e.g., "E0403").
    pub fn as_str(&self) -> String {
        format!("E{:04}", *self as u16)
    }

    /// The stable slug (e.g., "tail-resume-count").
    pub fn slug(&self) -> &'static str {
        match self {
            ErrorCode::UnhandledEffects => "unhandled-effects",
            ErrorCode::EffectHandlerOverload => "effect-handler-overload",
            ErrorCode::EffectGenericMismatch => "effect-generic-mismatch",
            ErrorCode::TailResumeCount => "tail-resume-count",
            ErrorCode::TailResumeEscape => "tail-resume-escape",
            ErrorCode::EffectHandlerAnnotation => "effect-handler-annotation",
            ErrorCode::EffectUnknownOperation => "effect-unknown-operation",
            ErrorCode::UndeclaredEffects => "undeclared-effects",
            ErrorCode::StructuralUnsupported => "structural-unsupported",
            ErrorCode::Internal => "internal-error",
        }
    }

    /// A help message suggesting how to fix the error.
    pub fn help(&self) -> Option<&'static str> {
        match self {
            ErrorCode::UnhandledEffects => {
                Some("add a clause for the operation, re-raise it from a clause, or make the row open")
            }
            ErrorCode::EffectHandlerOverload => {
                Some("annotate the clause parameters with the exact types of one overload")
            }
            ErrorCode::TailResumeCount => {
                Some("a tail-resumptive clause must call its continuation exactly once on every path")
            }
            ErrorCode::TailResumeEscape => Some("call the continuation directly instead of passing it on"),
            ErrorCode::UndeclaredEffects => Some("add the operation to the function's effect row"),
            _ => None,
        }
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}[{}]", self.as_str(), self.slug())
    }
}

/// The kind of diagnostic.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum DiagnosticKind {
    Error,
    Warning,
    Note,
}

impl DiagnosticKind {
    fn to_report_kind(self) -> ReportKind<'static> {
        match self {
            DiagnosticKind::Error => ReportKind::Error,
            DiagnosticKind::Warning => ReportKind::Warning,
            DiagnosticKind::Note => ReportKind::Advice,
        }
    }

    fn color(self) -> Color {
        match self {
            DiagnosticKind::Error => Color::Red,
            DiagnosticKind::Warning => Color::Yellow,
            DiagnosticKind::Note => Color::Cyan,
        }
    }
}

/// A compiler diagnostic.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Diagnostic {
    pub kind: DiagnosticKind,
    pub code: Option<ErrorCode>,
    pub message: String,
    /// The primary span where the error occurred.
    pub span: Span,
    /// Additional labels pointing to relevant code.
    pub labels: Vec<DiagnosticLabel>,
    pub suggestions: Vec<String>,
}

impl Diagnostic {
    /// Create a new error diagnostic.
    pub fn error(message: impl Into<String>, span: Span) -> Self {
        Self {
            kind: DiagnosticKind::Error,
            code: None,
            message: message.into(),
            span,
            labels: Vec::new(),
            suggestions: Vec::new(),
        }
    }

    /// Create a new warning diagnostic.
    pub fn warning(message: impl Into<String>, span: Span) -> Self {
        Self {
            kind: DiagnosticKind::Warning,
            ..Self::error(message, span)
        }
    }

    /// An error carrying `code`, with the code's help attached.
    pub fn coded(code: ErrorCode, message: impl Into<String>, span: Span) -> Self {
        let mut diag = Self::error(message, span);
        diag.code = Some(code);
        if let Some(help) = code.help() {
            diag.suggestions.push(help.to_string());
        }
        diag
    }

    pub fn is_error(&self) -> bool {
        self.kind == DiagnosticKind::Error
    }

    /// The stable slug of this diagnostic's code, if any.
    pub fn slug(&self) -> Option<&'static str> {
        self.code.map(|c| c.slug())
    }

    /// Add a secondary label.
    pub fn with_note(mut self, span: Span, message: impl Into<String>) -> Self {
        self.labels.push(DiagnosticLabel::secondary(span, message));
        self
    }

    pub fn with_suggestion(mut self, suggestion: impl Into<String>) -> Self {
        self.suggestions.push(suggestion.into());
        self
    }
}

impl fmt::Display for Diagnostic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.code {
            Some(code) => write!(f, "{code}: {}", self.message),
            None => f.write_str(&self.message),
        }
    }
}

/// A secondary label in a diagnostic.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DiagnosticLabel {
    pub span: Span,
    pub message: String,
    pub primary: bool,
}

impl DiagnosticLabel {
    pub fn primary(span: Span, message: impl Into<String>) -> Self {
        Self {
            span,
            message: message.into(),
            primary: true,
        }
    }

    pub fn secondary(span: Span, message: impl Into<String>) -> Self {
        Self {
            span,
            message: message.into(),
            primary: false,
        }
    }
}

/// Whether any diagnostic in the batch is an error.
pub fn has_errors(diagnostics: &[Diagnostic]) -> bool {
    diagnostics.iter().any(Diagnostic::is_error)
}

/// Renders diagnostics against a source file.
pub struct DiagnosticEmitter<'a> {
    filename: &'a str,
    source: &'a str,
}

impl<'a> DiagnosticEmitter<'a> {
    pub fn new(filename: &'a str, source: &'a str) -> Self {
        Self { filename, source }
    }

    /// Render a diagnostic into `out`.
    pub fn write(&self, diagnostic: &Diagnostic, out: impl io::Write) -> io::Result<()> {
        let end = self.source.len();
        let clamp = |s: Span| s.start.min(end)..s.end.min(end).max(s.start.min(end));
        let mut builder = Report::build(
            diagnostic.kind.to_report_kind(),
            self.filename,
            diagnostic.span.start.min(end),
        );

        let message = match diagnostic.code {
            Some(code) => format!("[{}] {}", code.as_str(), diagnostic.message),
            None => diagnostic.message.clone(),
        };
        builder = builder.with_message(&message);
        if let Some(code) = diagnostic.code {
            builder = builder.with_code(code.slug());
        }

        builder = builder.with_label(
            Label::new((self.filename, clamp(diagnostic.span)))
                .with_color(diagnostic.kind.color())
                .with_message(&diagnostic.message),
        );

        for label in &diagnostic.labels {
            let color = if label.primary {
                diagnostic.kind.color()
            } else {
                Color::Blue
            };
            builder = builder.with_label(
                Label::new((self.filename, clamp(label.span)))
                    .with_color(color)
                    .with_message(&label.message),
            );
        }

        if !diagnostic.suggestions.is_empty() {
            builder = builder.with_help(diagnostic.suggestions.join("\n"));
        }

        builder
            .finish()
            .write((self.filename, Source::from(self.source)), out)
    }

    /// Emit a diagnostic to stderr.
    pub fn emit(&self, diagnostic: &Diagnostic) -> io::Result<()> {
        self.write(diagnostic, io::stderr())
    }
}

/// Log an internal compiler error with key/value context.
///
/// The caller still returns its own error value; this only records the
/// broken invariant.
#[macro_export]
macro_rules! ice {
    ($msg:expr $(; $($key:expr => $val:expr),* $(,)?)?) => {{
        #[allow(unused_mut)]
        let mut context = String::new();
        $($(
            context.push_str(&format!(" {}={:?}", $key, $val));
        )*)?
        tracing::error!(target: "rillc::ice", "internal compiler error: {}{}", $msg, context);
    }};
}

/// Build an internal-error diagnostic.
#[macro_export]
macro_rules! ice_err {
    ($span:expr, $($arg:tt)*) => {
        $crate::diagnostics::Diagnostic::coded(
            $crate::diagnostics::ErrorCode::Internal,
            format!($($arg)*),
            $span,
        )
    };
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_codes_and_slugs() {
        assert_eq!(ErrorCode::UnhandledEffects.as_str(), "E0400");
        assert_eq!(ErrorCode::TailResumeEscape.as_str(), "E0404");
        assert_eq!(ErrorCode::TailResumeCount.slug(), "tail-resume-count");
        assert_eq!(ErrorCode::StructuralUnsupported.to_string(), "E0408[structural-unsupported]");
    }

    #[test]
    fn test_coded_diagnostic_carries_help() {
        let diag = Diagnostic::coded(ErrorCode::TailResumeCount, "resumed 0 times", Span::new(3, 4));
        assert_eq!(diag.slug(), Some("tail-resume-count"));
        assert_eq!(diag.suggestions.len(), 1);
        assert!(diag.is_error());
        assert!(has_errors(&[diag]));
        assert!(!has_errors(&[Diagnostic::warning("w", Span::dummy())]));
    }

    #[test]
    fn test_render_to_buffer() {
        let source = "fn f() { k }";
        let emitter = DiagnosticEmitter::new("f.rill", source);
        let diag = Diagnostic::coded(ErrorCode::TailResumeEscape, "continuation escapes", Span::new(9, 10));
        let mut out = Vec::new();
        emitter.write(&diag, &mut out).unwrap();
        let text = String::from_utf8_lossy(&out);
        assert!(text.contains("E0404"));
        assert!(text.contains("continuation escapes"));
    }

    #[test]
    fn test_ice_err_macro() {
        let diag = crate::ice_err!(Span::dummy(), "lost site {}", 3);
        assert_eq!(diag.code, Some(ErrorCode::Internal));
        assert_eq!(diag.message, "lost site 3");
    }
}
