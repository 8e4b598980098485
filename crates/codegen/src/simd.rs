//! SSE2 memory-compare and memory-search lowerings.
//!
//! Both run a 16-bytes-at-a-time main loop (`MOVDQU`/`PCMPEQB`/
//! `PMOVMSKB`) with a byte-wise fallback for the residual tail.

use crate::asm::{Cond, Gpr, Mem, Xmm};
use crate::context::Context;
use crate::expr::compile_expression;
use crate::result::{shape_error, CodegenResult};
use ailang_ast::{Node, Span};

/// Route `MemCompare`/`MemChr`; `Ok(false)` when the name is not ours.
pub(crate) fn compile_operation(
    ctx: &mut Context,
    function: &str,
    args: &[Node],
    span: Span,
) -> CodegenResult<bool> {
    match function {
        "MemCompare" => compile_memcompare(ctx, args, span)?,
        "MemChr" => compile_memchr(ctx, args, span)?,
        _ => return Ok(false),
    }
    Ok(true)
}

/// `MemCompare(addr1, addr2, length)`: 0 when the regions match, 1 when
/// they differ. Zero or negative lengths compare equal.
fn compile_memcompare(ctx: &mut Context, args: &[Node], span: Span) -> CodegenResult<()> {
    let (addr1, addr2, length) = match args {
        [a, b, l] => (a, b, l),
        _ => return shape_error("MemCompare requires addr1, addr2 and length", span),
    };

    let sse2_loop = ctx.asm.create_label();
    let check_scalar = ctx.asm.create_label();
    let scalar_loop = ctx.asm.create_label();
    let equal = ctx.asm.create_label();
    let not_equal = ctx.asm.create_label();
    let done = ctx.asm.create_label();

    compile_expression(ctx, length)?;
    ctx.asm.push(Gpr::Rax);
    compile_expression(ctx, addr2)?;
    ctx.asm.push(Gpr::Rax);
    compile_expression(ctx, addr1)?;
    ctx.asm.mov_rr(Gpr::Rsi, Gpr::Rax);
    ctx.asm.pop(Gpr::Rdi);
    ctx.asm.pop(Gpr::Rcx);

    ctx.asm.test_rr(Gpr::Rcx, Gpr::Rcx);
    ctx.asm.jcc(Cond::Le, equal);

    ctx.asm.mark_label(sse2_loop);
    ctx.asm.cmp_ri(Gpr::Rcx, 16);
    ctx.asm.jcc(Cond::B, check_scalar);
    ctx.asm.movdqu_load(Xmm::Xmm0, Mem::base(Gpr::Rsi));
    ctx.asm.movdqu_load(Xmm::Xmm1, Mem::base(Gpr::Rdi));
    ctx.asm.pcmpeqb(Xmm::Xmm0, Xmm::Xmm1);
    ctx.asm.pmovmskb(Gpr::Rax, Xmm::Xmm0);
    ctx.asm.cmp_ri(Gpr::Rax, 0xFFFF);
    ctx.asm.jcc(Cond::Ne, not_equal);
    ctx.asm.add_ri(Gpr::Rsi, 16);
    ctx.asm.add_ri(Gpr::Rdi, 16);
    ctx.asm.sub_ri(Gpr::Rcx, 16);
    ctx.asm.jmp(sse2_loop);

    ctx.asm.mark_label(check_scalar);
    ctx.asm.test_rr(Gpr::Rcx, Gpr::Rcx);
    ctx.asm.jcc(Cond::Z, equal);
    ctx.asm.mark_label(scalar_loop);
    ctx.asm.load_u8(Gpr::Rax, Mem::base(Gpr::Rsi));
    ctx.asm.load_u8(Gpr::Rdx, Mem::base(Gpr::Rdi));
    ctx.asm.cmp_rr(Gpr::Rax, Gpr::Rdx);
    ctx.asm.jcc(Cond::Ne, not_equal);
    ctx.asm.inc(Gpr::Rsi);
    ctx.asm.inc(Gpr::Rdi);
    ctx.asm.dec(Gpr::Rcx);
    ctx.asm.jcc(Cond::Nz, scalar_loop);

    ctx.asm.mark_label(equal);
    ctx.asm.xor_rr(Gpr::Rax, Gpr::Rax);
    ctx.asm.jmp(done);
    ctx.asm.mark_label(not_equal);
    ctx.asm.mov_ri(Gpr::Rax, 1);
    ctx.asm.mark_label(done);
    Ok(())
}

/// `MemChr(addr, byte, length)`: byte offset of the first occurrence, or
/// -1. The search byte is broadcast into XMM0 for the wide loop.
fn compile_memchr(ctx: &mut Context, args: &[Node], span: Span) -> CodegenResult<()> {
    let (addr, byte, length) = match args {
        [a, b, l] => (a, b, l),
        _ => return shape_error("MemChr requires addr, byte and length", span),
    };

    let sse2_loop = ctx.asm.create_label();
    let found_sse2 = ctx.asm.create_label();
    let check_scalar = ctx.asm.create_label();
    let scalar_loop = ctx.asm.create_label();
    let found_scalar = ctx.asm.create_label();
    let not_found = ctx.asm.create_label();
    let done = ctx.asm.create_label();

    compile_expression(ctx, length)?;
    ctx.asm.push(Gpr::Rax);
    compile_expression(ctx, byte)?;
    ctx.asm.push(Gpr::Rax);
    compile_expression(ctx, addr)?;
    ctx.asm.mov_rr(Gpr::Rdi, Gpr::Rax);
    ctx.asm.pop(Gpr::Rax);
    ctx.asm.pop(Gpr::Rcx);

    ctx.asm.test_rr(Gpr::Rcx, Gpr::Rcx);
    ctx.asm.jcc(Cond::Le, not_found);

    ctx.asm.mov_rr(Gpr::R8, Gpr::Rdi); // original address
    ctx.asm.and_ri(Gpr::Rax, 0xFF);
    ctx.asm.mov_rr(Gpr::R9, Gpr::Rax); // scalar copy of the byte

    // Broadcast the byte across XMM0.
    ctx.asm.movd(Xmm::Xmm0, Gpr::Rax);
    ctx.asm.punpcklbw(Xmm::Xmm0, Xmm::Xmm0);
    ctx.asm.pshuflw(Xmm::Xmm0, Xmm::Xmm0, 0);
    ctx.asm.pshufd(Xmm::Xmm0, Xmm::Xmm0, 0);

    ctx.asm.mark_label(sse2_loop);
    ctx.asm.cmp_ri(Gpr::Rcx, 16);
    ctx.asm.jcc(Cond::B, check_scalar);
    ctx.asm.movdqu_load(Xmm::Xmm1, Mem::base(Gpr::Rdi));
    ctx.asm.pcmpeqb(Xmm::Xmm1, Xmm::Xmm0);
    ctx.asm.pmovmskb(Gpr::Rax, Xmm::Xmm1);
    ctx.asm.test_rr(Gpr::Rax, Gpr::Rax);
    ctx.asm.jcc(Cond::Nz, found_sse2);
    ctx.asm.add_ri(Gpr::Rdi, 16);
    ctx.asm.sub_ri(Gpr::Rcx, 16);
    ctx.asm.jmp(sse2_loop);

    ctx.asm.mark_label(found_sse2);
    ctx.asm.bsf(Gpr::Rax, Gpr::Rax);
    ctx.asm.add_rr(Gpr::Rax, Gpr::Rdi);
    ctx.asm.sub_rr(Gpr::Rax, Gpr::R8);
    ctx.asm.jmp(done);

    ctx.asm.mark_label(check_scalar);
    ctx.asm.test_rr(Gpr::Rcx, Gpr::Rcx);
    ctx.asm.jcc(Cond::Z, not_found);
    ctx.asm.mark_label(scalar_loop);
    ctx.asm.load_u8(Gpr::Rdx, Mem::base(Gpr::Rdi));
    ctx.asm.cmp_rr(Gpr::Rdx, Gpr::R9);
    ctx.asm.jcc(Cond::E, found_scalar);
    ctx.asm.inc(Gpr::Rdi);
    ctx.asm.dec(Gpr::Rcx);
    ctx.asm.jcc(Cond::Nz, scalar_loop);
    ctx.asm.jmp(not_found);

    ctx.asm.mark_label(found_scalar);
    ctx.asm.mov_rr(Gpr::Rax, Gpr::Rdi);
    ctx.asm.sub_rr(Gpr::Rax, Gpr::R8);
    ctx.asm.jmp(done);

    ctx.asm.mark_label(not_found);
    ctx.asm.mov_ri(Gpr::Rax, -1);
    ctx.asm.mark_label(done);
    Ok(())
}
