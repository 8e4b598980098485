//! Pool code generation.
//!
//! Fixed pools are eight-byte slots in the process-global table addressed
//! through R15; their indices were assigned at discovery and only the
//! initializers are emitted here. Dynamic pools are heap blocks allocated
//! with `mmap` at program start, with a `[capacity][size]` header ahead of
//! the member slots and the block pointer parked in a frame slot.

use crate::asm::{Gpr, Mem};
use crate::context::Context;
use crate::expr::compile_expression;
use crate::result::{shape_error, CodegenResult};
use ailang_ast::{Node, PoolItem, Span};
use log::debug;

pub(crate) fn compile_pool(
    ctx: &mut Context,
    pool_type: &str,
    name: &str,
    body: &[PoolItem],
) -> CodegenResult<()> {
    if pool_type == "DynamicPool" {
        compile_dynamic_pool(ctx, name, body)
    } else {
        compile_fixed_pool(ctx, pool_type, name, body)
    }
}

fn compile_fixed_pool(
    ctx: &mut Context,
    pool_type: &str,
    name: &str,
    body: &[PoolItem],
) -> CodegenResult<()> {
    let pool_name = format!("{pool_type}.{name}");
    debug!("initializing fixed pool {pool_name}");
    for item in body {
        let var_name = format!("{pool_name}.{}", item.key);
        let index = match ctx.symbols.lookup(&var_name) {
            Some(sym) if sym.is_pool_var() => sym.pool_index(),
            _ => {
                return shape_error(
                    format!("pool variable {var_name} was never discovered"),
                    Span::NONE,
                )
            }
        };
        if let Some(value) = &item.value {
            compile_expression(ctx, value)?;
            ctx.asm.store(Mem::pool(index), Gpr::Rax);
        }
    }
    Ok(())
}

fn compile_dynamic_pool(ctx: &mut Context, name: &str, body: &[PoolItem]) -> CodegenResult<()> {
    let pool_name = format!("DynamicPool.{name}");
    let (slot, members) = match ctx.dynamic_pools.get(&pool_name) {
        Some(pool) => (pool.slot, pool.members.clone()),
        None => {
            return shape_error(
                format!("dynamic pool {pool_name} was never discovered"),
                Span::NONE,
            )
        }
    };
    let num_items = members.len() as i64;
    let capacity = if num_items > 0 { num_items * 2 } else { 16 };
    let mmap_size = 16 + capacity * 8;
    debug!("allocating dynamic pool {pool_name}: {mmap_size} bytes");

    emit_mmap_const(ctx, mmap_size);
    ctx.asm.store(Mem::local(slot), Gpr::Rax);

    // Header: capacity then current member count.
    ctx.asm.mov_ri(Gpr::Rbx, capacity);
    ctx.asm.store(Mem::base(Gpr::Rax), Gpr::Rbx);
    ctx.asm.mov_ri(Gpr::Rbx, num_items);
    ctx.asm.store(Mem::base_disp(Gpr::Rax, 8), Gpr::Rbx);

    // Member initializers.
    for item in body {
        let Some(value) = &item.value else { continue };
        let offset = members
            .iter()
            .find(|(member, _)| *member == item.key)
            .map(|&(_, off)| off)
            .expect("members mirror the declaration body");
        compile_expression(ctx, value)?;
        ctx.asm.load(Gpr::Rbx, Mem::local(slot));
        ctx.asm
            .store(Mem::base_disp(Gpr::Rbx, offset as i32), Gpr::Rax);
    }
    Ok(())
}

/// `mmap(NULL, size, PROT_READ|PROT_WRITE, MAP_PRIVATE|MAP_ANONYMOUS, -1, 0)`
/// with a compile-time-constant size; result in RAX.
pub(crate) fn emit_mmap_const(ctx: &mut Context, size: i64) {
    ctx.asm.mov_ri(Gpr::Rax, 9);
    ctx.asm.mov_ri(Gpr::Rdi, 0);
    ctx.asm.mov_ri(Gpr::Rsi, size);
    ctx.asm.mov_ri(Gpr::Rdx, 3);
    ctx.asm.mov_ri(Gpr::R10, 0x22);
    ctx.asm.mov_ri(Gpr::R8, -1);
    ctx.asm.mov_ri(Gpr::R9, 0);
    ctx.asm.syscall();
}

/// Same, with the size already in RSI.
pub(crate) fn emit_mmap_rsi(ctx: &mut Context) {
    ctx.asm.mov_ri(Gpr::Rax, 9);
    ctx.asm.mov_ri(Gpr::Rdi, 0);
    ctx.asm.mov_ri(Gpr::Rdx, 3);
    ctx.asm.mov_ri(Gpr::R10, 0x22);
    ctx.asm.mov_ri(Gpr::R8, -1);
    ctx.asm.mov_ri(Gpr::R9, 0);
    ctx.asm.syscall();
}

/// `Allocate(size)`: anonymous mapping, pointer in RAX.
pub(crate) fn compile_allocate(ctx: &mut Context, args: &[Node], span: Span) -> CodegenResult<()> {
    let size = match args {
        [size] => size,
        _ => return shape_error("Allocate requires a size argument", span),
    };
    compile_expression(ctx, size)?;
    ctx.asm.mov_rr(Gpr::Rsi, Gpr::Rax);
    emit_mmap_rsi(ctx);
    Ok(())
}

/// `Deallocate(address, size)`: `munmap`, skipped entirely when the size is
/// zero (munmap would fail with EINVAL).
pub(crate) fn compile_deallocate(ctx: &mut Context, args: &[Node], span: Span) -> CodegenResult<()> {
    let (addr, size) = match args {
        [addr, size] => (addr, size),
        _ => return shape_error("Deallocate requires address and size", span),
    };
    compile_expression(ctx, addr)?;
    ctx.asm.push(Gpr::Rax);
    compile_expression(ctx, size)?;
    ctx.asm.mov_rr(Gpr::Rsi, Gpr::Rax);

    let skip = ctx.asm.create_label();
    let done = ctx.asm.create_label();
    ctx.asm.test_rr(Gpr::Rsi, Gpr::Rsi);
    ctx.asm.jcc(crate::asm::Cond::Z, skip);

    ctx.asm.pop(Gpr::Rax);
    ctx.asm.mov_rr(Gpr::Rdi, Gpr::Rax);
    ctx.asm.mov_ri(Gpr::Rax, 11); // munmap
    ctx.asm.syscall();
    ctx.asm.jmp(done);

    ctx.asm.mark_label(skip);
    ctx.asm.pop(Gpr::Rax);
    ctx.asm.xor_rr(Gpr::Rax, Gpr::Rax);
    ctx.asm.mark_label(done);
    Ok(())
}
