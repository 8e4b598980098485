//! User-defined functions and subroutines.
//!
//! Functions follow the Sys-V convention on entry: the first six
//! integer/pointer parameters arrive in RDI, RSI, RDX, RCX, R8, R9 and are
//! spilled to consecutive frame slots; further parameters are copied from
//! the caller's stack. RBX and R12..R14 are callee-saved; R15 is the pool
//! base and deliberately not part of the per-call set. `ReturnValue`
//! computes into RAX and jumps to the per-function return label.
//!
//! Calls to functions whose bodies are not yet emitted record the same
//! label relocation as any forward jump; the resolve pass patches them
//! after every body exists.

use crate::asm::{Gpr, Mem};
use crate::compile::compile_node;
use crate::context::Context;
use crate::expr::compile_expression;
use crate::result::{shape_error, CodegenResult};
use crate::frame;
use ailang_ast::{Node, Span};
use log::debug;

/// Sys-V integer/pointer argument registers, in order.
pub(crate) const ARG_REGISTERS: [Gpr; 6] = [Gpr::Rdi, Gpr::Rsi, Gpr::Rdx, Gpr::Rcx, Gpr::R8, Gpr::R9];

/// Emit a function body, wrapped in a skip jump so it can sit anywhere in
/// straight-line code (bodies pass or mid-stream library loading alike).
pub(crate) fn emit_function_definition(
    ctx: &mut Context,
    name: &str,
    body: &[Node],
) -> CodegenResult<()> {
    let full_name = match &ctx.library_prefix {
        Some(prefix) if !name.contains('.') => format!("{prefix}.{name}"),
        _ => name.to_string(),
    };
    let info = match ctx.functions.get(&full_name) {
        Some(info) => info.clone(),
        None => return shape_error(format!("function {full_name} was never registered"), Span::NONE),
    };
    debug!("emitting function {full_name}");

    let skip_label = ctx.asm.create_label();
    ctx.asm.jmp(skip_label);

    ctx.asm.mark_label(info.label);
    let frame_size = frame::function_frame_size(ctx, info.scope);
    frame::emit_prologue(ctx, frame_size);
    ctx.asm.push(Gpr::Rbx);
    ctx.asm.push(Gpr::R12);
    ctx.asm.push(Gpr::R13);
    ctx.asm.push(Gpr::R14);

    // Spill parameters to their frame slots.
    ctx.symbols.reenter_scope(info.scope);
    for (i, param) in info.params.iter().enumerate() {
        let slot = ctx
            .symbols
            .lookup(param)
            .expect("parameters are registered at discovery")
            .offset;
        if i < ARG_REGISTERS.len() {
            ctx.asm.mov_rr(Gpr::Rax, ARG_REGISTERS[i]);
        } else {
            let stack_disp = 16 + 8 * (i - ARG_REGISTERS.len()) as i32;
            ctx.asm.load(Gpr::Rax, Mem::base_disp(Gpr::Rbp, stack_disp));
        }
        ctx.asm.store(Mem::local(slot), Gpr::Rax);
    }

    let saved_function = ctx.current_function.replace(full_name);
    let result = (|| {
        for stmt in body {
            compile_node(ctx, stmt)?;
        }
        Ok(())
    })();
    ctx.current_function = saved_function;
    ctx.symbols.exit_scope();
    result?;

    // Fall-through return value.
    ctx.asm.mov_ri(Gpr::Rax, 0);
    ctx.asm.mark_label(info.return_label);
    // A return may arrive with operands still staged on the stack (a
    // return inside a Branch case, say); re-anchor RSP at the saved
    // registers before popping them.
    ctx.asm.lea(Gpr::Rsp, Mem::local(frame_size + 32));
    ctx.asm.pop(Gpr::R14);
    ctx.asm.pop(Gpr::R13);
    ctx.asm.pop(Gpr::R12);
    ctx.asm.pop(Gpr::Rbx);
    frame::emit_epilogue(ctx);
    ctx.asm.ret();

    ctx.asm.mark_label(skip_label);
    Ok(())
}

/// Emit a subroutine body: no prologue, no parameters; it runs in the
/// caller's frame so it can reach the program's variables.
pub(crate) fn emit_subroutine_definition(
    ctx: &mut Context,
    name: &str,
    body: &[Node],
) -> CodegenResult<()> {
    let label = match ctx.subroutines.get(name) {
        Some(&label) => label,
        None => return shape_error(format!("subroutine {name} was never registered"), Span::NONE),
    };
    debug!("emitting subroutine {name}");
    let skip_label = ctx.asm.create_label();
    ctx.asm.jmp(skip_label);
    ctx.asm.mark_label(label);
    for stmt in body {
        compile_node(ctx, stmt)?;
    }
    ctx.asm.ret();
    ctx.asm.mark_label(skip_label);
    Ok(())
}

/// `ReturnValue(expr)`: result into RAX, jump to the return label.
pub(crate) fn compile_return(ctx: &mut Context, value: Option<&Node>) -> CodegenResult<()> {
    let return_label = match ctx
        .current_function
        .as_ref()
        .and_then(|name| ctx.functions.get(name))
    {
        Some(info) => info.return_label,
        None => return shape_error("ReturnValue outside of a function", Span::NONE),
    };
    match value {
        Some(expr) => compile_expression(ctx, expr)?,
        None => ctx.asm.mov_ri(Gpr::Rax, 0),
    }
    ctx.asm.jmp(return_label);
    Ok(())
}

/// Call a user-defined function with Sys-V argument placement.
///
/// Up to six arguments are evaluated left to right, staged on the stack so
/// nested calls cannot clobber earlier values, then popped into the
/// argument registers in reverse. With more than six, arguments are
/// evaluated right to left instead: after the register pops the extras are
/// already laid out with argument 7 on top of the stack, exactly where the
/// callee expects it; the caller reclaims that space after the call.
pub(crate) fn compile_user_call(ctx: &mut Context, name: &str, args: &[Node]) -> CodegenResult<()> {
    let info = match ctx.functions.get(name) {
        Some(info) => info.clone(),
        None => return shape_error(format!("call to unknown function {name}"), Span::NONE),
    };
    if info.params.len() != args.len() {
        return shape_error(
            format!(
                "{name} takes {} argument(s), got {}",
                info.params.len(),
                args.len()
            ),
            Span::NONE,
        );
    }

    let n = args.len();
    let reg_count = n.min(ARG_REGISTERS.len());
    if n <= ARG_REGISTERS.len() {
        for arg in args {
            compile_expression(ctx, arg)?;
            ctx.asm.push(Gpr::Rax);
        }
        for i in (0..reg_count).rev() {
            ctx.asm.pop(ARG_REGISTERS[i]);
        }
        ctx.asm.call_label(info.label);
    } else {
        for arg in args.iter().rev() {
            compile_expression(ctx, arg)?;
            ctx.asm.push(Gpr::Rax);
        }
        for reg in ARG_REGISTERS.iter().take(reg_count) {
            ctx.asm.pop(*reg);
        }
        ctx.asm.call_label(info.label);
        ctx.asm.add_ri(Gpr::Rsp, (8 * (n - ARG_REGISTERS.len())) as i32);
    }
    Ok(())
}

/// `RunTask`: invoke a subroutine by name.
pub(crate) fn compile_run_task(ctx: &mut Context, name: &str, span: Span) -> CodegenResult<()> {
    match ctx.subroutines.get(name) {
        Some(&label) => {
            ctx.asm.call_label(label);
            Ok(())
        }
        None => shape_error(format!("RunTask of unknown subroutine {name}"), span),
    }
}
