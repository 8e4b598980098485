//! Assignment lowering: frame locals, pool variables, dynamic-pool members
//! and linkage-pool fields, with pointer-type propagation.

use crate::asm::{Gpr, Mem};
use crate::context::Context;
use crate::expr::{self, compile_expression, StoreDest};
use crate::linkage;
use crate::result::{shape_error, CodegenResult};
use crate::sym::SymbolKind;
use ailang_ast::{Node, Span};
use log::trace;

pub(crate) fn compile_assignment(
    ctx: &mut Context,
    target: &str,
    value: &Node,
    span: Span,
) -> CodegenResult<()> {
    if let Some(sym) = ctx.symbols.lookup(target) {
        if sym.kind == SymbolKind::Constant {
            return shape_error(format!("cannot assign to constant {target}"), span);
        }
    }

    // A variable assigned from another linkage-pool pointer inherits its
    // type, so later member access on the copy still resolves.
    if let Node::Identifier { name, .. } = value {
        if let Some(ty) = ctx.pointer_type_of(name) {
            let ty = ty.to_string();
            trace!("propagating pointer type {ty} from {name} to {target}");
            ctx.pointer_types.insert(target.to_string(), ty);
        }
    }

    if let Node::FunctionCall { function, arguments, span } = value {
        if function == "AllocateLinkage" {
            linkage::compile_allocate_linkage(ctx, arguments, *span)?;
            if let Some(ty) = ctx.pending_type.take() {
                ctx.pointer_types.insert(target.to_string(), ty);
            }
            return store_value(ctx, target, span);
        }
    }

    compile_expression(ctx, value)?;
    store_value(ctx, target, &span)
}

/// Store RAX into the target's destination.
fn store_value(ctx: &mut Context, target: &str, span: &Span) -> CodegenResult<()> {
    if let Some((base, field)) = target.split_once('.') {
        if let Some(pool_type) = ctx.pointer_type_of(base).map(str::to_string) {
            return store_linkage_field(ctx, base, &pool_type, field, span);
        }
        if let Some((pool_name, member)) = expr::split_dynamic_pool_name(ctx, target) {
            return store_dynamic_pool_member(ctx, &pool_name, &member, span);
        }
    }

    match expr::store_slot_for(ctx, target) {
        Some(StoreDest::Frame(offset)) => {
            ctx.asm.store(Mem::local(offset), Gpr::Rax);
            Ok(())
        }
        Some(StoreDest::Pool(index)) => {
            trace!("store to pool var {target} at pool[{index}]");
            ctx.asm.store(Mem::pool(index), Gpr::Rax);
            Ok(())
        }
        None => shape_error(format!("cannot assign to {target}"), *span),
    }
}

/// Store through a linkage-pool pointer: the value rides the stack while
/// the pointer loads into RBX.
fn store_linkage_field(
    ctx: &mut Context,
    base: &str,
    pool_type: &str,
    field: &str,
    span: &Span,
) -> CodegenResult<()> {
    let field_offset = match ctx
        .linkage_pools
        .get(pool_type)
        .and_then(|pool| pool.field(field))
    {
        Some(f) => f.offset,
        None => {
            return shape_error(format!("{pool_type} has no field {field}"), *span);
        }
    };
    let slot = match ctx.symbols.lookup(base) {
        Some(sym) => sym.offset,
        None => return shape_error(format!("undefined linkage pointer {base}"), *span),
    };
    trace!("store linkage field {base}.{field} at +{field_offset}");
    ctx.asm.push(Gpr::Rax);
    ctx.asm.load(Gpr::Rbx, Mem::local(slot));
    ctx.asm.pop(Gpr::Rax);
    ctx.asm
        .store(Mem::base_disp(Gpr::Rbx, field_offset as i32), Gpr::Rax);
    Ok(())
}

/// Store into a dynamic-pool member through the block pointer in its frame
/// slot.
fn store_dynamic_pool_member(
    ctx: &mut Context,
    pool_name: &str,
    member: &str,
    span: &Span,
) -> CodegenResult<()> {
    let pool = &ctx.dynamic_pools[pool_name];
    let slot = pool.slot;
    let offset = match pool.member_offset(member) {
        Some(o) => o,
        None => {
            return shape_error(format!("{pool_name} has no member {member}"), *span);
        }
    };
    trace!("store dynamic pool member {pool_name}.{member} at +{offset}");
    ctx.asm.push(Gpr::Rax);
    ctx.asm.load(Gpr::Rbx, Mem::local(slot));
    ctx.asm.pop(Gpr::Rax);
    ctx.asm.store(Mem::base_disp(Gpr::Rbx, offset as i32), Gpr::Rax);
    Ok(())
}
