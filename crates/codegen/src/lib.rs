//! x86-64 machine-code backend for the AILANG ahead-of-time compiler.
//!
//! The backend consumes an already-parsed AST (see [`ailang_ast`]) and
//! emits a standalone, statically linked ELF executable for Linux/x86-64
//! that invokes the kernel directly via `syscall` — it links to no C
//! runtime.
//!
//! The pipeline is an orchestrator surrounded by per-concern modules: the
//! [`asm`] assembler owns the code/data buffers, labels and relocations;
//! [`sym`] holds the scoped symbol table the discovery pass fills in;
//! [`frame`] computes stack frames and the R15-based global pool table;
//! the lowering modules translate one family of node kinds each; and
//! [`elf`] lays out the two-segment executable. Everything mutable for one
//! compilation lives in a [`Context`] owned by the orchestrator — there
//! are no process-wide globals.
//!
//! ```no_run
//! use ailang_ast::{Node, Program};
//! use ailang_codegen::{compile_program, Options};
//!
//! let program = Program {
//!     declarations: vec![Node::call(
//!         "PrintNumber",
//!         vec![Node::call("Add", vec![Node::number(2), Node::number(12)])],
//!     )],
//! };
//! let image = compile_program(&program, Options::default(), None).unwrap();
//! std::fs::write("a.out", image).unwrap();
//! ```

#![deny(missing_docs)]

pub mod asm;
mod arith;
mod assign;
mod atomics;
mod builtins;
pub mod compile;
mod context;
mod debug;
pub mod divconst;
pub mod elf;
mod expr;
mod flow;
mod frame;
mod func;
mod fx;
mod hashops;
mod linkage;
mod lowlevel;
mod mathops;
mod pools;
mod process;
pub mod result;
mod sched;
mod sema;
mod simd;
mod strings;
pub mod sym;
mod sysio;
mod vmops;

pub use builtins::is_builtin;
pub use compile::{compile_program, compile_to_buffers, Frontend};
pub use context::{
    Context, Direction, DynamicPool, FuncInfo, LinkField, LinkFieldTy, LinkagePool, Options, VmSim,
};
pub use result::{CodegenError, CodegenResult, Diagnostic};
