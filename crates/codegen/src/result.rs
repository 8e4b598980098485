//! Result and error types for the code generator.

use ailang_ast::Span;
use std::fmt;

/// A diagnostic collected during semantic analysis or raised at an
/// offending node during emission.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Diagnostic {
    /// Human-readable description of the problem.
    pub message: String,
    /// Source position, when the node carried one.
    pub span: Span,
}

impl Diagnostic {
    /// Create a diagnostic at the given span.
    pub fn new(message: impl Into<String>, span: Span) -> Self {
        Self {
            message: message.into(),
            span,
        }
    }
}

impl fmt::Display for Diagnostic {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        if self.span.line != 0 {
            write!(
                f,
                "{} (line {}, column {})",
                self.message, self.span.line, self.span.column
            )
        } else {
            write!(f, "{}", self.message)
        }
    }
}

/// An error from the code generator.
///
/// Every error aborts the compilation; nothing is recovered locally and no
/// partial output is ever produced.
#[derive(Debug)]
pub enum CodegenError {
    /// One or more problems found by the semantic analyzer. Emission
    /// refuses to start while this list is non-empty.
    Semantic(Vec<Diagnostic>),
    /// A malformed node shape: wrong operator arity, member access on a
    /// non-pool, assignment to a constant.
    Shape(Diagnostic),
    /// An implementation limit was exceeded (e.g. the data section would
    /// pass 2 GiB).
    Resource(String),
    /// A label or function was still unresolved after the relocation pass.
    UnresolvedLabel(String),
    /// An internal invariant failed (register-depth or stack-depth
    /// accounting).
    Internal(String),
    /// The embedder's frontend failed to provide a library AST.
    Frontend(String),
}

impl fmt::Display for CodegenError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            CodegenError::Semantic(diags) => {
                write!(f, "semantic analysis failed with {} error(s)", diags.len())?;
                for d in diags {
                    write!(f, "\n  {d}")?;
                }
                Ok(())
            }
            CodegenError::Shape(d) => write!(f, "{d}"),
            CodegenError::Resource(msg) => write!(f, "resource limit exceeded: {msg}"),
            CodegenError::UnresolvedLabel(name) => {
                write!(f, "unresolved reference to label {name}")
            }
            CodegenError::Internal(msg) => write!(f, "internal error: {msg}"),
            CodegenError::Frontend(msg) => write!(f, "frontend error: {msg}"),
        }
    }
}

impl std::error::Error for CodegenError {}

/// A convenient alias for `Result` with `CodegenError`.
pub type CodegenResult<T> = Result<T, CodegenError>;

/// Build a `Shape` error at the given span.
pub(crate) fn shape_error<T>(message: impl Into<String>, span: Span) -> CodegenResult<T> {
    Err(CodegenError::Shape(Diagnostic::new(message, span)))
}
