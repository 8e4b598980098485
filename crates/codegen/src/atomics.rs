//! Atomic read-modify-write lowerings.
//!
//! The generated program is cooperative and single-threaded, but the
//! atomics keep their hardware meaning so pool words shared with forked
//! children stay coherent. `AtomicAdd` is the one primitive the language
//! carries today.

use crate::asm::{Gpr, Mem};
use crate::context::Context;
use crate::expr::compile_expression;
use crate::result::{shape_error, CodegenResult};
use ailang_ast::{Node, Span};

/// Route an atomic operation; `Ok(false)` when the name is not ours.
pub(crate) fn compile_operation(
    ctx: &mut Context,
    function: &str,
    args: &[Node],
    span: Span,
) -> CodegenResult<bool> {
    match function {
        "AtomicAdd" => compile_atomic_add(ctx, args, span)?,
        _ => return Ok(false),
    }
    Ok(true)
}

/// `AtomicAdd(address, value)`: `LOCK ADD [address], value`. The address
/// stays in RAX afterwards.
fn compile_atomic_add(ctx: &mut Context, args: &[Node], span: Span) -> CodegenResult<()> {
    let (address, value) = match args {
        [address, value] => (address, value),
        _ => return shape_error("AtomicAdd requires an address and a value", span),
    };
    ctx.asm.push(Gpr::Rbx);
    compile_expression(ctx, address)?;
    ctx.asm.push(Gpr::Rax);
    compile_expression(ctx, value)?;
    ctx.asm.mov_rr(Gpr::Rbx, Gpr::Rax);
    ctx.asm.pop(Gpr::Rax);
    ctx.asm.lock_add_m(Mem::base(Gpr::Rax), Gpr::Rbx);
    ctx.asm.pop(Gpr::Rbx);
    Ok(())
}
