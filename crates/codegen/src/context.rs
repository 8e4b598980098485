//! The per-compilation context.
//!
//! All of a compilation's mutable state — the assembler, the string table,
//! the symbol table, the pool layouts, the relocation list — lives here,
//! owned by the orchestrator. Modules receive a mutable borrow; nothing is
//! process-global.

use crate::asm::{Assembler, Label};
use crate::fx::{FxHashMap, FxHashSet};
use crate::result::Diagnostic;
use crate::sym::{ScopeId, SymbolTable};
use ailang_ast::Program;
use smallvec::SmallVec;
use std::path::Path;

/// Compile-time options, set by the CLI.
#[derive(Clone, Debug)]
pub struct Options {
    /// Debug verbosity 0..=4; levels 1+ make `DebugAssert` nodes emit a
    /// check-and-abort snippet.
    pub debug_level: u8,
    /// Bracket the program with RDTSC timers and print the cycle delta on
    /// exit.
    pub perf_timers: bool,
    /// Use the full try/catch lowering (per-frame error slot) instead of
    /// the simplified straight-line try/finally.
    pub full_try_catch: bool,
}

impl Default for Options {
    fn default() -> Self {
        Options {
            debug_level: 0,
            perf_timers: false,
            full_try_catch: false,
        }
    }
}

/// Supplies parsed ASTs for standard-library files loaded on demand.
///
/// The lexer/parser is an external collaborator; the backend only consumes
/// its output. Library loading resolves `Library.<name>.ailang` first in
/// the current directory, then under `Librarys/`, and hands the path here.
pub trait Frontend {
    /// Parse the file at `path` into a program.
    fn parse_file(&self, path: &Path) -> Result<Program, Box<dyn std::error::Error + Send + Sync>>;
}

/// Everything known about a user-defined function after discovery.
#[derive(Clone, Debug)]
pub struct FuncInfo {
    /// Entry label.
    pub label: Label,
    /// Per-function return label (epilogue site).
    pub return_label: Label,
    /// Parameter names in declaration order.
    pub params: Vec<String>,
    /// Declared parameter types, aligned with `params`.
    pub param_types: Vec<Option<String>>,
    /// The function's scope in the symbol table.
    pub scope: ScopeId,
}

/// Layout of one dynamic pool: a heap block with an 16-byte header and
/// 8-byte member slots.
#[derive(Clone, Debug)]
pub struct DynamicPool {
    /// Member name and byte offset from the block start, in declaration
    /// order. Offsets start at 16, after the `[capacity][size]` header.
    pub members: Vec<(String, u32)>,
    /// Global-frame displacement of the slot holding the block pointer.
    pub slot: u32,
}

impl DynamicPool {
    /// Byte offset of `member` within the block.
    pub fn member_offset(&self, member: &str) -> Option<u32> {
        self.members
            .iter()
            .find(|(name, _)| name == member)
            .map(|&(_, off)| off)
    }
}

/// Type of a linkage-pool field.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum LinkFieldTy {
    /// A 64-bit integer, default-initialized to zero.
    Integer,
    /// A string pointer, default-initialized to the empty-string address.
    Str,
}

/// Declared data-flow direction of a linkage-pool field.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Direction {
    /// Read-only for the callee.
    Input,
    /// Write-only for the callee.
    Output,
    /// Read-write (the default).
    InOut,
}

/// One typed field of a linkage pool.
#[derive(Clone, Debug)]
pub struct LinkField {
    /// Field name.
    pub name: String,
    /// Byte offset within the block.
    pub offset: u32,
    /// Declared direction.
    pub direction: Direction,
    /// Field type.
    pub ty: LinkFieldTy,
}

/// A linkage-pool type: its fields and total block size.
#[derive(Clone, Debug, Default)]
pub struct LinkagePool {
    /// Fields in declaration order.
    pub fields: Vec<LinkField>,
    /// Total block size in bytes.
    pub size: u32,
}

impl LinkagePool {
    /// Find a field by name.
    pub fn field(&self, name: &str) -> Option<&LinkField> {
        self.fields.iter().find(|f| f.name == name)
    }
}

/// Compile-time counters behind the user-mode VM simulation (see the
/// `vmops` module): page-table handles and simulated allocation addresses
/// are handed out statically, one per call site.
#[derive(Clone, Debug, Default)]
pub struct VmSim {
    /// Page tables created so far; handles are 1-based.
    pub page_tables: u64,
    /// Simulated virtual allocations handed out so far.
    pub allocations: u64,
}

/// The mutable state of one compilation.
pub struct Context<'a> {
    /// The machine-code assembler (code/data buffers, labels, relocations).
    pub asm: Assembler,
    /// Scoped symbol table.
    pub symbols: SymbolTable,
    /// Compile-time options.
    pub options: Options,
    /// Library loader, when the embedder provides one.
    pub frontend: Option<&'a dyn Frontend>,

    /// User-defined functions by (possibly library-prefixed) name.
    pub functions: FxHashMap<String, FuncInfo>,
    /// Subroutines and actor bodies by name (`Actor.<name>` for actors).
    pub subroutines: FxHashMap<String, Label>,
    /// Dynamic pools by `DynamicPool.<name>`.
    pub dynamic_pools: FxHashMap<String, DynamicPool>,
    /// Linkage-pool types by `LinkagePool.<name>`.
    pub linkage_pools: FxHashMap<String, LinkagePool>,
    /// Variables currently known to hold a linkage-pool pointer.
    pub pointer_types: FxHashMap<String, String>,
    /// Pool type produced by the most recent `AllocateLinkage`, consumed by
    /// the enclosing assignment to tag its target.
    pub pending_type: Option<String>,

    /// Actor spawn order, fixed at discovery.
    pub actor_order: Vec<String>,
    /// Actors queued by `LoopSpawn`, in queue order.
    pub spawn_queue: Vec<String>,
    /// Round-robin cursor over the spawn queue.
    pub next_yield: usize,

    /// Innermost-first stack of (start, end) labels for `BreakLoop` /
    /// `ContinueLoop`.
    pub loop_labels: SmallVec<[(Label, Label); 8]>,
    /// Nesting depth of binary-operator lowerings in progress.
    pub binop_depth: u32,
    /// Name of the function currently being emitted, if any.
    pub current_function: Option<String>,

    /// Total main-frame size (aligned), fixed before emission.
    pub main_frame_size: u32,
    /// Displacement of the ACB region base within the main frame.
    pub acb_table_offset: u32,
    /// Frame slot holding the ACB table pointer.
    pub acb_table_slot: u32,
    /// Frame slot holding the current actor index.
    pub current_actor_slot: u32,
    /// Frame slot holding the `-P` start timestamp, when timers are on.
    pub perf_start_slot: Option<u32>,
    /// Frame slot of the per-frame error flag for the full try/catch
    /// lowering.
    pub error_flag_slot: Option<u32>,

    /// Data offset of the process-wide empty string.
    pub empty_string_offset: u32,
    /// User-mode VM simulation counters.
    pub vm: VmSim,

    /// Problems collected by the semantic analyzer.
    pub diagnostics: Vec<Diagnostic>,
    /// Libraries already loaded, to break import cycles.
    pub loaded_libraries: FxHashSet<String>,
    /// Prefix applied to names while compiling a library.
    pub library_prefix: Option<String>,
}

impl<'a> Context<'a> {
    /// Create a fresh context. The empty string is interned immediately so
    /// linkage-pool string fields always have a default address.
    pub fn new(options: Options, frontend: Option<&'a dyn Frontend>) -> Self {
        let mut asm = Assembler::new();
        let empty_string_offset = asm.add_string("");
        Context {
            asm,
            symbols: SymbolTable::new(),
            options,
            frontend,
            functions: FxHashMap::default(),
            subroutines: FxHashMap::default(),
            dynamic_pools: FxHashMap::default(),
            linkage_pools: FxHashMap::default(),
            pointer_types: FxHashMap::default(),
            pending_type: None,
            actor_order: Vec::new(),
            spawn_queue: Vec::new(),
            next_yield: 0,
            loop_labels: SmallVec::new(),
            binop_depth: 0,
            current_function: None,
            main_frame_size: 0,
            acb_table_offset: 0,
            acb_table_slot: 0,
            current_actor_slot: 0,
            perf_start_slot: None,
            error_flag_slot: None,
            empty_string_offset,
            vm: VmSim::default(),
            diagnostics: Vec::new(),
            loaded_libraries: FxHashSet::default(),
            library_prefix: None,
        }
    }

    /// Resolve the linkage-pool type a variable or current-function
    /// parameter is known to carry.
    pub fn pointer_type_of(&self, name: &str) -> Option<&str> {
        if let Some(ty) = self.pointer_types.get(name) {
            return Some(ty);
        }
        let func = self.current_function.as_deref()?;
        let info = self.functions.get(func)?;
        let idx = info.params.iter().position(|p| p == name)?;
        info.param_types[idx]
            .as_deref()
            .filter(|t| t.starts_with("LinkagePool."))
    }
}
