//! Compile-time-injected assert snippets.
//!
//! `DebugAssert` nodes emit nothing at debug level 0. At level 1 and
//! above they lower to a condition check that writes the message to
//! stderr and exits with code 1 when the assertion fails.

use crate::asm::{Cond, Gpr};
use crate::context::Context;
use crate::expr::compile_expression;
use crate::result::CodegenResult;
use ailang_ast::Node;
use log::trace;

pub(crate) fn compile_debug_assert(
    ctx: &mut Context,
    condition: &Node,
    message: &str,
) -> CodegenResult<()> {
    if ctx.options.debug_level == 0 {
        trace!("DebugAssert elided at debug level 0");
        return Ok(());
    }
    compile_expression(ctx, condition)?;
    let ok = ctx.asm.create_label();
    ctx.asm.test_rr(Gpr::Rax, Gpr::Rax);
    ctx.asm.jcc(Cond::Nz, ok);

    let text = format!("assertion failed: {message}\n");
    let offset = ctx.asm.add_string(&text);
    ctx.asm.mov_ri(Gpr::Rax, 1);
    ctx.asm.mov_ri(Gpr::Rdi, 2);
    ctx.asm.load_data_address(Gpr::Rsi, offset);
    ctx.asm.mov_ri(Gpr::Rdx, text.len() as i64);
    ctx.asm.syscall();
    ctx.asm.mov_ri(Gpr::Rax, 60);
    ctx.asm.mov_ri(Gpr::Rdi, 1);
    ctx.asm.syscall();
    ctx.asm.mark_label(ok);
    Ok(())
}
