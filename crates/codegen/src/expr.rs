//! Expression lowering.
//!
//! Contract: every expression leaves its result in RAX and may clobber
//! RAX, RCX, RDX and R11. RBX and R12..R15 are preserved across an
//! expression as a whole; binary operators save and restore what they
//! borrow (see the depth discipline in [`crate::arith`]).

use crate::asm::{Cond, Gpr, Mem};
use crate::context::Context;
use crate::result::{shape_error, CodegenResult};
use crate::{compile, frame};
use ailang_ast::{Node, Span};
use log::trace;

/// Compile `expr`, leaving its value in RAX.
pub(crate) fn compile_expression(ctx: &mut Context, expr: &Node) -> CodegenResult<()> {
    match expr {
        Node::Number { value, .. } => {
            ctx.asm.mov_ri(Gpr::Rax, *value);
            Ok(())
        }
        Node::Boolean { value, .. } => {
            ctx.asm.mov_ri(Gpr::Rax, *value as i64);
            Ok(())
        }
        Node::String { value, .. } => {
            let offset = ctx.asm.add_string(value);
            ctx.asm.load_data_address(Gpr::Rax, offset);
            Ok(())
        }
        Node::Identifier { name, span } => load_identifier(ctx, name, *span),
        Node::FunctionCall {
            function,
            arguments,
            span,
        } => compile::compile_call(ctx, function, arguments, *span),
        Node::ReceiveMessage { .. } => crate::sched::compile_receive_message(ctx),
        other => shape_error(
            format!("{} is not usable as an expression", other.kind()),
            other.span(),
        ),
    }
}

/// Resolve `name` and load its value into RAX.
///
/// Dotted names are tried against, in order: dynamic-pool members,
/// linkage-pool fields through a tracked pointer, and fixed-pool variables
/// under their full or `FixedPool.`-prefixed spelling. Plain names walk
/// the scope chain.
fn load_identifier(ctx: &mut Context, name: &str, span: Span) -> CodegenResult<()> {
    if name.contains('.') {
        if try_load_dynamic_pool_member(ctx, name) {
            return Ok(());
        }
        if try_load_linkage_field(ctx, name)? {
            return Ok(());
        }
        // FixedPool.Cfg.max spelled in full, or Cfg.max shorthand.
        let candidates = [name.to_string(), format!("FixedPool.{name}")];
        for candidate in &candidates {
            if let Some(sym) = ctx.symbols.lookup(candidate) {
                if sym.is_pool_var() {
                    let index = sym.pool_index();
                    trace!("load pool var {candidate} from pool[{index}]");
                    ctx.asm.load(Gpr::Rax, Mem::pool(index));
                    return Ok(());
                }
                let offset = sym.offset;
                ctx.asm.load(Gpr::Rax, Mem::local(offset));
                return Ok(());
            }
        }
        return shape_error(format!("undefined identifier {name}"), span);
    }

    match ctx.symbols.lookup(name) {
        Some(sym) if sym.is_pool_var() => {
            let index = sym.pool_index();
            ctx.asm.load(Gpr::Rax, Mem::pool(index));
            Ok(())
        }
        Some(sym) => {
            let offset = sym.offset;
            ctx.asm.load(Gpr::Rax, Mem::local(offset));
            Ok(())
        }
        None => shape_error(format!("undefined identifier {name}"), span),
    }
}

/// `Pool.member` or `DynamicPool.Pool.member`: load the block pointer from
/// its frame slot, then the member at its fixed offset.
fn try_load_dynamic_pool_member(ctx: &mut Context, name: &str) -> bool {
    let (pool_name, member) = match split_dynamic_pool_name(ctx, name) {
        Some(parts) => parts,
        None => return false,
    };
    let pool = &ctx.dynamic_pools[&pool_name];
    let slot = pool.slot;
    let offset = match pool.member_offset(&member) {
        Some(o) => o,
        None => return false,
    };
    trace!("load dynamic pool member {name} at block offset {offset}");
    ctx.asm.load(Gpr::Rax, Mem::local(slot));
    ctx.asm.load(Gpr::Rax, Mem::base_disp(Gpr::Rax, offset as i32));
    true
}

pub(crate) fn split_dynamic_pool_name(ctx: &Context, name: &str) -> Option<(String, String)> {
    let parts: Vec<&str> = name.split('.').collect();
    let (pool_name, member) = match parts.as_slice() {
        [pool, member] => (format!("DynamicPool.{pool}"), member.to_string()),
        ["DynamicPool", pool, member] => (format!("DynamicPool.{pool}"), member.to_string()),
        _ => return None,
    };
    if ctx.dynamic_pools.contains_key(&pool_name) {
        Some((pool_name, member))
    } else {
        None
    }
}

/// `ptr.field` where `ptr` is a linkage-pool pointer (parameter or tracked
/// local): dereference through the stored pointer with a null guard that
/// reads as 0.
fn try_load_linkage_field(ctx: &mut Context, name: &str) -> CodegenResult<bool> {
    let (base, field) = match name.split_once('.') {
        Some(pair) => pair,
        None => return Ok(false),
    };
    let pool_type = match ctx.pointer_type_of(base) {
        Some(ty) => ty.to_string(),
        None => return Ok(false),
    };
    let field_offset = match ctx
        .linkage_pools
        .get(&pool_type)
        .and_then(|pool| pool.field(field))
    {
        Some(f) => f.offset,
        None => return Ok(false),
    };
    let slot = match ctx.symbols.lookup(base) {
        Some(sym) => sym.offset,
        None => return Ok(false),
    };
    trace!("load linkage field {name} via [{base}]+{field_offset}");
    ctx.asm.load(Gpr::Rax, Mem::local(slot));
    let done = ctx.asm.create_label();
    ctx.asm.test_rr(Gpr::Rax, Gpr::Rax);
    ctx.asm.jcc(Cond::Z, done);
    ctx.asm
        .load(Gpr::Rax, Mem::base_disp(Gpr::Rax, field_offset as i32));
    ctx.asm.mark_label(done);
    Ok(true)
}

/// Compile a statement-position condition expression; the orchestrator's
/// `If`/`While` lowerings test RAX against zero afterwards.
pub(crate) fn compile_condition(ctx: &mut Context, condition: &Node) -> CodegenResult<()> {
    compile_expression(ctx, condition)
}

/// Resolve an assignment-target name to a store destination, JIT-registering
/// missed top-level names as a logged safety net.
pub(crate) fn store_slot_for(ctx: &mut Context, name: &str) -> Option<StoreDest> {
    if let Some(sym) = ctx.symbols.lookup(name) {
        return Some(if sym.is_pool_var() {
            StoreDest::Pool(sym.pool_index())
        } else {
            StoreDest::Frame(sym.offset)
        });
    }
    if name.contains('.') {
        if let Some(sym) = ctx.symbols.lookup(&format!("FixedPool.{name}")) {
            if sym.is_pool_var() {
                return Some(StoreDest::Pool(sym.pool_index()));
            }
        }
        return None;
    }
    if ctx.current_function.is_none() {
        return Some(StoreDest::Frame(frame::jit_register_global(ctx, name)));
    }
    None
}

/// Where an assignment stores.
pub(crate) enum StoreDest {
    /// `[RBP - offset]`
    Frame(u32),
    /// `[R15 + index*8]`
    Pool(u32),
}
