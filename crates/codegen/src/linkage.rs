//! Linkage pools: typed blocks shared across call boundaries.
//!
//! A linkage block is a heap record whose pointer is passed between
//! functions; members are accessed at fixed byte offsets through that
//! pointer. `AllocateLinkage` maps a fresh block and default-initializes
//! it: integer fields to zero (the anonymous mapping already is), string
//! fields to the process-wide empty-string address.

use crate::asm::{Gpr, Mem};
use crate::context::{Context, LinkFieldTy};
use crate::pools::emit_mmap_const;
use crate::result::{shape_error, CodegenResult};
use ailang_ast::{Node, Span};
use log::debug;

/// `AllocateLinkage(PoolName)`: block pointer in RAX. Sets the context's
/// pending type so the enclosing assignment can tag its target variable.
pub(crate) fn compile_allocate_linkage(
    ctx: &mut Context,
    args: &[Node],
    span: Span,
) -> CodegenResult<()> {
    let pool_name = match args {
        [Node::Identifier { name, .. }] => {
            if name.starts_with("LinkagePool.") {
                name.clone()
            } else {
                format!("LinkagePool.{name}")
            }
        }
        [Node::String { value, .. }] => format!("LinkagePool.{value}"),
        _ => return shape_error("AllocateLinkage requires a pool type name", span),
    };
    let pool = match ctx.linkage_pools.get(&pool_name) {
        Some(pool) => pool.clone(),
        None => return shape_error(format!("unknown linkage pool {pool_name}"), span),
    };
    debug!("allocating linkage block for {pool_name} ({} bytes)", pool.size);

    emit_mmap_const(ctx, pool.size.max(8) as i64);
    let string_fields: Vec<u32> = pool
        .fields
        .iter()
        .filter(|f| f.ty == LinkFieldTy::Str)
        .map(|f| f.offset)
        .collect();
    if !string_fields.is_empty() {
        ctx.asm.mov_rr(Gpr::Rbx, Gpr::Rax);
        ctx.asm.load_data_address(Gpr::Rcx, ctx.empty_string_offset);
        for offset in string_fields {
            ctx.asm
                .store(Mem::base_disp(Gpr::Rbx, offset as i32), Gpr::Rcx);
        }
        ctx.asm.mov_rr(Gpr::Rax, Gpr::Rbx);
    }
    ctx.pending_type = Some(pool_name);
    Ok(())
}
