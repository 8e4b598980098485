//! Abstract syntax tree for AILANG programs.
//!
//! The backend consumes a tree of tagged nodes and depends only on the kind
//! tag of each node and a small set of fields per kind. The parser that
//! produces these trees is an external collaborator; the types here are the
//! contract between the two, and they serialize with `serde` so a pre-parsed
//! program can cross a process boundary (the CLI reads the JSON form).

#![deny(missing_docs)]

use serde_derive::{Deserialize, Serialize};

/// A source position attached to nodes that can report diagnostics.
///
/// `0` means "unknown"; the parser numbers lines and columns from 1.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Span {
    /// 1-based source line, or 0 when unknown.
    #[serde(default)]
    pub line: u32,
    /// 1-based source column, or 0 when unknown.
    #[serde(default)]
    pub column: u32,
}

impl Span {
    /// A span with no position information.
    pub const NONE: Span = Span { line: 0, column: 0 };
}

/// The root of a parsed compilation unit.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Program {
    /// Top-level declarations and statements, in source order.
    pub declarations: Vec<Node>,
}

/// A function parameter: a name and an optional declared type.
///
/// The only types the backend interprets are `LinkagePool.<Name>` bindings;
/// everything else is an untyped 64-bit word.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Parameter {
    /// Parameter name.
    pub name: String,
    /// Declared type, e.g. `LinkagePool.Point`.
    #[serde(default)]
    pub ty: Option<String>,
    #[serde(default)]
    #[allow(missing_docs)]
    pub span: Span,
}

/// One `value => body` arm of a `Branch`.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Case {
    /// The case value expression; integer literals enable the binary-search
    /// lowering.
    pub value: Node,
    /// Statements to run when the discriminant matches.
    pub body: Vec<Node>,
}

/// A `Catch` clause: an error-type name and a handler body.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct CatchClause {
    /// Declared error type. Only generic clauses are dispatched today.
    #[serde(default)]
    pub error_type: Option<String>,
    /// Handler statements.
    pub body: Vec<Node>,
}

/// A `key = value` entry in a pool body, with optional attributes
/// (`Initialize`, `Direction`).
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct PoolItem {
    /// Member name.
    pub key: String,
    /// Initializer expression, if any.
    #[serde(default)]
    pub value: Option<Node>,
    /// Attribute list; the backend reads `Initialize` and `Direction`.
    #[serde(default)]
    pub attributes: Vec<(String, Node)>,
}

/// A tagged AST node.
///
/// The serialized form carries the tag in a `"kind"` field, matching the
/// dynamic node-kind strings the frontend emits.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind")]
pub enum Node {
    /// Integer literal. The frontend folds hex/binary/float spellings.
    Number {
        /// The literal value.
        value: i64,
        #[serde(default)]
        #[allow(missing_docs)]
        span: Span,
    },
    /// String literal, stored NUL-terminated in the data segment.
    String {
        /// The literal bytes (no terminator).
        value: std::string::String,
        #[serde(default)]
        #[allow(missing_docs)]
        span: Span,
    },
    /// Boolean literal; lowered to 1/0.
    Boolean {
        #[allow(missing_docs)]
        value: bool,
        #[serde(default)]
        #[allow(missing_docs)]
        span: Span,
    },
    /// A name reference. Dotted names reach pool members and linkage-pool
    /// fields.
    Identifier {
        /// The (possibly dotted) name.
        name: std::string::String,
        #[serde(default)]
        #[allow(missing_docs)]
        span: Span,
    },
    /// `target = value`.
    Assignment {
        /// Assigned name; dotted targets select pool members or
        /// linkage-pool fields.
        target: std::string::String,
        /// Value expression.
        value: Box<Node>,
        #[serde(default)]
        #[allow(missing_docs)]
        span: Span,
    },
    /// A call to a built-in operation or a user-defined function.
    FunctionCall {
        /// Operation or function name.
        function: std::string::String,
        /// Argument expressions.
        #[serde(default)]
        arguments: Vec<Node>,
        #[serde(default)]
        #[allow(missing_docs)]
        span: Span,
    },
    /// A user-defined function.
    Function {
        #[allow(missing_docs)]
        name: std::string::String,
        #[serde(default)]
        #[allow(missing_docs)]
        parameters: Vec<Parameter>,
        #[allow(missing_docs)]
        body: Vec<Node>,
    },
    /// Early return with an optional value.
    ReturnValue {
        /// The returned expression, or `None` for a bare return.
        #[serde(default)]
        value: Option<Box<Node>>,
    },
    /// A parameterless callable block running in the caller's frame.
    SubRoutine {
        #[allow(missing_docs)]
        name: std::string::String,
        #[allow(missing_docs)]
        body: Vec<Node>,
    },
    /// Invoke a subroutine by name.
    RunTask {
        /// Subroutine name.
        name: std::string::String,
        #[serde(default)]
        #[allow(missing_docs)]
        span: Span,
    },
    /// Conditional execution.
    If {
        #[allow(missing_docs)]
        condition: Box<Node>,
        #[allow(missing_docs)]
        then_body: Vec<Node>,
        #[serde(default)]
        #[allow(missing_docs)]
        else_body: Vec<Node>,
    },
    /// Pre-tested loop.
    While {
        #[allow(missing_docs)]
        condition: Box<Node>,
        #[allow(missing_docs)]
        body: Vec<Node>,
    },
    /// Jump to the innermost loop's end label.
    BreakLoop {
        #[serde(default)]
        #[allow(missing_docs)]
        span: Span,
    },
    /// Jump to the innermost loop's start label.
    ContinueLoop {
        #[serde(default)]
        #[allow(missing_docs)]
        span: Span,
    },
    /// Multi-way dispatch on a discriminant expression.
    Branch {
        /// The discriminant.
        expression: Box<Node>,
        /// Case arms in source order.
        cases: Vec<Case>,
        /// Statements to run when no case matches.
        #[serde(default)]
        default: Vec<Node>,
    },
    /// Structured `Try`/`Catch`/`Finally`.
    Try {
        #[allow(missing_docs)]
        body: Vec<Node>,
        #[serde(default)]
        #[allow(missing_docs)]
        catch_clauses: Vec<CatchClause>,
        #[serde(default)]
        #[allow(missing_docs)]
        finally_body: Vec<Node>,
    },
    /// A pool declaration (`FixedPool` or `DynamicPool`).
    Pool {
        /// `"FixedPool"` or `"DynamicPool"`.
        pool_type: std::string::String,
        #[allow(missing_docs)]
        name: std::string::String,
        #[allow(missing_docs)]
        body: Vec<PoolItem>,
    },
    /// A linkage-pool type declaration.
    LinkagePoolDecl {
        #[allow(missing_docs)]
        name: std::string::String,
        #[allow(missing_docs)]
        body: Vec<PoolItem>,
    },
    /// An actor body; compiled as a subroutine with a reserved ACB slot.
    LoopActor {
        #[allow(missing_docs)]
        name: std::string::String,
        #[allow(missing_docs)]
        body: Vec<Node>,
    },
    /// Store a value into an actor's mailbox word.
    SendMessage {
        /// Target actor index expression.
        target: Box<Node>,
        /// The value to deliver.
        value: Box<Node>,
    },
    /// Load the current actor's mailbox word.
    ReceiveMessage {
        #[serde(default)]
        #[allow(missing_docs)]
        span: Span,
    },
    /// Load and compile a standard-library file on demand.
    Library {
        /// Dotted library name, e.g. `Library.Text`.
        name: std::string::String,
        #[serde(default)]
        #[allow(missing_docs)]
        span: Span,
    },
    /// Compile-time assertion; emits a check only at debug level 1+.
    DebugAssert {
        #[allow(missing_docs)]
        condition: Box<Node>,
        /// Message written to stderr when the assertion fails.
        message: std::string::String,
    },
}

impl Node {
    /// The source span of this node, when it carries one.
    pub fn span(&self) -> Span {
        match self {
            Node::Number { span, .. }
            | Node::String { span, .. }
            | Node::Boolean { span, .. }
            | Node::Identifier { span, .. }
            | Node::Assignment { span, .. }
            | Node::FunctionCall { span, .. }
            | Node::RunTask { span, .. }
            | Node::BreakLoop { span }
            | Node::ContinueLoop { span }
            | Node::ReceiveMessage { span }
            | Node::Library { span, .. } => *span,
            _ => Span::NONE,
        }
    }

    /// The kind tag, as the frontend spells it.
    pub fn kind(&self) -> &'static str {
        match self {
            Node::Number { .. } => "Number",
            Node::String { .. } => "String",
            Node::Boolean { .. } => "Boolean",
            Node::Identifier { .. } => "Identifier",
            Node::Assignment { .. } => "Assignment",
            Node::FunctionCall { .. } => "FunctionCall",
            Node::Function { .. } => "Function",
            Node::ReturnValue { .. } => "ReturnValue",
            Node::SubRoutine { .. } => "SubRoutine",
            Node::RunTask { .. } => "RunTask",
            Node::If { .. } => "If",
            Node::While { .. } => "While",
            Node::BreakLoop { .. } => "BreakLoop",
            Node::ContinueLoop { .. } => "ContinueLoop",
            Node::Branch { .. } => "Branch",
            Node::Try { .. } => "Try",
            Node::Pool { .. } => "Pool",
            Node::LinkagePoolDecl { .. } => "LinkagePoolDecl",
            Node::LoopActor { .. } => "LoopActor",
            Node::SendMessage { .. } => "SendMessage",
            Node::ReceiveMessage { .. } => "ReceiveMessage",
            Node::Library { .. } => "Library",
            Node::DebugAssert { .. } => "DebugAssert",
        }
    }

    /// Convenience constructor for an integer literal with no position.
    pub fn number(value: i64) -> Node {
        Node::Number {
            value,
            span: Span::NONE,
        }
    }

    /// Convenience constructor for a string literal with no position.
    pub fn string(value: &str) -> Node {
        Node::String {
            value: value.to_string(),
            span: Span::NONE,
        }
    }

    /// Convenience constructor for a name reference with no position.
    pub fn ident(name: &str) -> Node {
        Node::Identifier {
            name: name.to_string(),
            span: Span::NONE,
        }
    }

    /// Convenience constructor for a call with no position.
    pub fn call(function: &str, arguments: Vec<Node>) -> Node {
        Node::FunctionCall {
            function: function.to_string(),
            arguments,
            span: Span::NONE,
        }
    }

    /// Convenience constructor for an assignment with no position.
    pub fn assign(target: &str, value: Node) -> Node {
        Node::Assignment {
            target: target.to_string(),
            value: Box::new(value),
            span: Span::NONE,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn roundtrip_tagged_json() {
        let program = Program {
            declarations: vec![
                Node::assign("x", Node::call("Add", vec![Node::number(2), Node::number(3)])),
                Node::While {
                    condition: Box::new(Node::call(
                        "GreaterThan",
                        vec![Node::ident("x"), Node::number(0)],
                    )),
                    body: vec![Node::assign(
                        "x",
                        Node::call("Subtract", vec![Node::ident("x"), Node::number(1)]),
                    )],
                },
            ],
        };
        let text = serde_json::to_string(&program).unwrap();
        assert!(text.contains("\"kind\":\"Assignment\""));
        let back: Program = serde_json::from_str(&text).unwrap();
        assert_eq!(program, back);
    }

    #[test]
    fn kind_tags_match_frontend_spelling() {
        assert_eq!(Node::number(1).kind(), "Number");
        assert_eq!(
            Node::Branch {
                expression: Box::new(Node::number(1)),
                cases: vec![],
                default: vec![],
            }
            .kind(),
            "Branch"
        );
    }

    #[test]
    fn spans_default_to_unknown() {
        let node: Node = serde_json::from_str(r#"{"kind":"Identifier","name":"x"}"#).unwrap();
        assert_eq!(node.span(), Span::NONE);
    }
}
