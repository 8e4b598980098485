//! Raw-memory primitives and the generic syscall escape hatch.

use crate::asm::{Cond, Gpr, Mem};
use crate::context::Context;
use crate::expr::compile_expression;
use crate::result::{shape_error, CodegenResult};
use ailang_ast::{Node, Span};

/// Syscall argument registers in the Sys-V syscall ABI order (arguments 4
/// to 6 differ from the function-call convention: R10 replaces RCX).
const SYSCALL_ARG_REGISTERS: [Gpr; 6] = [Gpr::Rdi, Gpr::Rsi, Gpr::Rdx, Gpr::R10, Gpr::R8, Gpr::R9];

/// Route a low-level operation; `Ok(false)` when the name is not ours.
pub(crate) fn compile_operation(
    ctx: &mut Context,
    function: &str,
    args: &[Node],
    span: Span,
) -> CodegenResult<bool> {
    match function {
        "MemCopy" => compile_memcopy(ctx, args, span)?,
        "MemSet" => compile_memset(ctx, args, span)?,
        "GetByte" => compile_get_byte(ctx, args, span)?,
        "SetByte" => compile_set_byte(ctx, args, span)?,
        "Dereference" => {
            let addr = match args {
                [a] => a,
                _ => return shape_error("Dereference requires an address", span),
            };
            compile_expression(ctx, addr)?;
            ctx.asm.load(Gpr::Rax, Mem::base(Gpr::Rax));
        }
        "AddressOf" => compile_address_of(ctx, args, span)?,
        "SizeOf" => {
            // Every value slot in the model is one 64-bit word.
            ctx.asm.mov_ri(Gpr::Rax, 8);
        }
        "SystemCall" => compile_system_call(ctx, args, span)?,
        _ => return Ok(false),
    }
    Ok(true)
}

fn compile_memcopy(ctx: &mut Context, args: &[Node], span: Span) -> CodegenResult<()> {
    let (dest, src, len) = match args {
        [d, s, l] => (d, s, l),
        _ => return shape_error("MemCopy requires dest, src and length", span),
    };
    compile_expression(ctx, len)?;
    ctx.asm.push(Gpr::Rax);
    compile_expression(ctx, src)?;
    ctx.asm.push(Gpr::Rax);
    compile_expression(ctx, dest)?;
    ctx.asm.mov_rr(Gpr::Rdi, Gpr::Rax);
    ctx.asm.pop(Gpr::Rsi);
    ctx.asm.pop(Gpr::Rcx);

    let copy = ctx.asm.create_label();
    let done = ctx.asm.create_label();
    ctx.asm.mark_label(copy);
    ctx.asm.test_rr(Gpr::Rcx, Gpr::Rcx);
    ctx.asm.jcc(Cond::Z, done);
    ctx.asm.load_u8(Gpr::Rdx, Mem::base(Gpr::Rsi));
    ctx.asm.store_u8(Mem::base(Gpr::Rdi), Gpr::Rdx);
    ctx.asm.inc(Gpr::Rsi);
    ctx.asm.inc(Gpr::Rdi);
    ctx.asm.dec(Gpr::Rcx);
    ctx.asm.jmp(copy);
    ctx.asm.mark_label(done);
    Ok(())
}

fn compile_memset(ctx: &mut Context, args: &[Node], span: Span) -> CodegenResult<()> {
    let (addr, value, len) = match args {
        [a, v, l] => (a, v, l),
        _ => return shape_error("MemSet requires address, value and length", span),
    };
    compile_expression(ctx, addr)?;
    ctx.asm.push(Gpr::Rax);
    compile_expression(ctx, value)?;
    ctx.asm.push(Gpr::Rax);
    compile_expression(ctx, len)?;
    ctx.asm.mov_rr(Gpr::Rcx, Gpr::Rax);
    ctx.asm.pop(Gpr::Rax);
    ctx.asm.pop(Gpr::Rdi);
    ctx.asm.push(Gpr::Rdi);
    ctx.asm.rep_stosb();
    ctx.asm.pop(Gpr::Rax);
    Ok(())
}

fn compile_get_byte(ctx: &mut Context, args: &[Node], span: Span) -> CodegenResult<()> {
    let (addr, offset) = match args {
        [a, o] => (a, o),
        _ => return shape_error("GetByte requires address and offset", span),
    };
    ctx.asm.push(Gpr::Rbx);
    compile_expression(ctx, addr)?;
    ctx.asm.push(Gpr::Rax);
    compile_expression(ctx, offset)?;
    ctx.asm.mov_rr(Gpr::Rbx, Gpr::Rax);
    ctx.asm.pop(Gpr::Rax);
    ctx.asm
        .load_u8(Gpr::Rax, Mem::base_index_disp(Gpr::Rax, Gpr::Rbx, 0));
    ctx.asm.pop(Gpr::Rbx);
    Ok(())
}

fn compile_set_byte(ctx: &mut Context, args: &[Node], span: Span) -> CodegenResult<()> {
    let (addr, offset, value) = match args {
        [a, o, v] => (a, o, v),
        _ => return shape_error("SetByte requires address, offset and value", span),
    };
    ctx.asm.push(Gpr::Rbx);
    compile_expression(ctx, addr)?;
    ctx.asm.push(Gpr::Rax);
    compile_expression(ctx, offset)?;
    ctx.asm.push(Gpr::Rax);
    compile_expression(ctx, value)?;
    ctx.asm.mov_rr(Gpr::Rdx, Gpr::Rax);
    ctx.asm.pop(Gpr::Rbx);
    ctx.asm.pop(Gpr::Rax);
    ctx.asm
        .store_u8(Mem::base_index_disp(Gpr::Rax, Gpr::Rbx, 0), Gpr::Rdx);
    ctx.asm.pop(Gpr::Rbx);
    Ok(())
}

/// `AddressOf(name)`: the frame or pool-table address of a variable.
fn compile_address_of(ctx: &mut Context, args: &[Node], span: Span) -> CodegenResult<()> {
    let name = match args {
        [Node::Identifier { name, .. }] => name,
        _ => return shape_error("AddressOf requires a variable name", span),
    };
    match ctx.symbols.lookup(name) {
        Some(sym) if sym.is_pool_var() => {
            let index = sym.pool_index();
            ctx.asm.lea(Gpr::Rax, Mem::pool(index));
            Ok(())
        }
        Some(sym) => {
            let offset = sym.offset;
            ctx.asm.lea(Gpr::Rax, Mem::local(offset));
            Ok(())
        }
        None => shape_error(format!("AddressOf of undefined variable {name}"), span),
    }
}

/// `SystemCall(number, args…)`: raw syscall with up to six arguments.
/// Arguments are staged through the stack and popped into registers in
/// reverse so nested calls cannot cross-clobber; the number loads last.
fn compile_system_call(ctx: &mut Context, args: &[Node], span: Span) -> CodegenResult<()> {
    let (number, rest) = match args.split_first() {
        Some(pair) => pair,
        None => return shape_error("SystemCall requires a syscall number", span),
    };
    if rest.len() > SYSCALL_ARG_REGISTERS.len() {
        return shape_error(
            format!(
                "SystemCall supports up to {} arguments, got {}",
                SYSCALL_ARG_REGISTERS.len(),
                rest.len()
            ),
            span,
        );
    }
    ctx.asm.zero_syscall_registers();
    for arg in rest {
        compile_expression(ctx, arg)?;
        ctx.asm.push(Gpr::Rax);
    }
    for i in (0..rest.len()).rev() {
        ctx.asm.pop(SYSCALL_ARG_REGISTERS[i]);
    }
    compile_expression(ctx, number)?;
    ctx.asm.syscall();
    Ok(())
}
