//! String operations and printing.
//!
//! Every primitive that produces a string allocates with `mmap` and
//! returns a pointer to a NUL-terminated byte sequence. Lengths are
//! null-safe: a null pointer counts as length 0. Values that must survive
//! argument evaluation are staged through the stack and only then popped
//! into registers — a call inside an argument expression is free to
//! clobber anything caller-saved, and has been seen to.

use crate::asm::{Cond, Gpr, Mem};
use crate::context::Context;
use crate::expr::compile_expression;
use crate::pools::{emit_mmap_const, emit_mmap_rsi};
use crate::result::{shape_error, CodegenResult};
use ailang_ast::{Node, Span};
use log::trace;

/// Route a string/printing operation; `Ok(false)` when the name is not
/// ours.
pub(crate) fn compile_operation(
    ctx: &mut Context,
    function: &str,
    args: &[Node],
    span: Span,
) -> CodegenResult<bool> {
    match function {
        "PrintNumber" => {
            let arg = one(args, span, "PrintNumber")?;
            compile_expression(ctx, arg)?;
            emit_print_rax_line(ctx);
        }
        "PrintString" => {
            let arg = one(args, span, "PrintString")?;
            compile_expression(ctx, arg)?;
            emit_print_string(ctx, false);
        }
        "PrintMessage" => {
            let arg = one(args, span, "PrintMessage")?;
            compile_expression(ctx, arg)?;
            emit_print_string(ctx, true);
        }
        "StringLength" => {
            let arg = one(args, span, "StringLength")?;
            compile_expression(ctx, arg)?;
            ctx.asm.mov_rr(Gpr::Rdi, Gpr::Rax);
            emit_strlen(ctx);
        }
        "StringConcat" => compile_concat(ctx, args, span)?,
        "StringCompare" => {
            compile_compare_core(ctx, args, span)?;
            // 0 when equal, 1 when different.
        }
        "StringEquals" => {
            compile_compare_core(ctx, args, span)?;
            ctx.asm.test_rr(Gpr::Rax, Gpr::Rax);
            ctx.asm.setcc_bool(Cond::Z);
        }
        "NumberToString" => compile_number_to_string(ctx, args, span)?,
        "StringToNumber" => compile_string_to_number(ctx, args, span)?,
        "StringToUpper" => compile_case_convert(ctx, args, span, CaseKind::Upper)?,
        "StringToLower" => compile_case_convert(ctx, args, span, CaseKind::Lower)?,
        "StringSubstring" => compile_substring(ctx, args, span)?,
        "StringCharAt" => compile_char_at(ctx, args, span)?,
        "StringIndexOf" => compile_index_of(ctx, args, span)?,
        "StringSplit" => compile_split(ctx, args, span)?,
        "StringReplace" => compile_replace(ctx, args, span)?,
        _ => return Ok(false),
    }
    Ok(true)
}

fn one<'n>(args: &'n [Node], span: Span, name: &str) -> CodegenResult<&'n Node> {
    match args {
        [a] => Ok(a),
        _ => shape_error(format!("{name} requires exactly 1 argument"), span),
    }
}

/// Length of the string at RDI into RAX; a null pointer reads as 0.
/// Clobbers nothing else.
pub(crate) fn emit_strlen(ctx: &mut Context) {
    let done = ctx.asm.create_label();
    let scan = ctx.asm.create_label();
    ctx.asm.xor_rr(Gpr::Rax, Gpr::Rax);
    ctx.asm.test_rr(Gpr::Rdi, Gpr::Rdi);
    ctx.asm.jcc(Cond::Z, done);
    ctx.asm.mark_label(scan);
    ctx.asm
        .cmp_m8_imm(Mem::base_index_disp(Gpr::Rdi, Gpr::Rax, 0), 0);
    ctx.asm.jcc(Cond::E, done);
    ctx.asm.inc(Gpr::Rax);
    ctx.asm.jmp(scan);
    ctx.asm.mark_label(done);
}

/// Copy the NUL-terminated string at RSI to RDI (terminator excluded),
/// leaving both pointers past the copied bytes. Clobbers RDX.
fn emit_copy_str(ctx: &mut Context) {
    let copy = ctx.asm.create_label();
    let done = ctx.asm.create_label();
    ctx.asm.mark_label(copy);
    ctx.asm.load_u8(Gpr::Rdx, Mem::base(Gpr::Rsi));
    ctx.asm.test_rr(Gpr::Rdx, Gpr::Rdx);
    ctx.asm.jcc(Cond::Z, done);
    ctx.asm.store_u8(Mem::base(Gpr::Rdi), Gpr::Rdx);
    ctx.asm.inc(Gpr::Rsi);
    ctx.asm.inc(Gpr::Rdi);
    ctx.asm.jmp(copy);
    ctx.asm.mark_label(done);
}

/// Naive substring search: haystack in RDI, needle in RSI; match pointer
/// (or 0) in RAX. An empty needle matches at the start. Clobbers RCX,
/// RDX, R8, R9.
fn emit_strstr(ctx: &mut Context) {
    let outer = ctx.asm.create_label();
    let inner = ctx.asm.create_label();
    let advance = ctx.asm.create_label();
    let found = ctx.asm.create_label();
    let nomatch = ctx.asm.create_label();
    let done = ctx.asm.create_label();

    ctx.asm.mark_label(outer);
    ctx.asm.mov_rr(Gpr::Rcx, Gpr::Rdi);
    ctx.asm.mov_rr(Gpr::Rdx, Gpr::Rsi);

    ctx.asm.mark_label(inner);
    ctx.asm.load_u8(Gpr::R8, Mem::base(Gpr::Rdx));
    ctx.asm.test_rr(Gpr::R8, Gpr::R8);
    ctx.asm.jcc(Cond::Z, found);
    ctx.asm.load_u8(Gpr::R9, Mem::base(Gpr::Rcx));
    ctx.asm.cmp_rr(Gpr::R9, Gpr::R8);
    ctx.asm.jcc(Cond::Ne, advance);
    ctx.asm.inc(Gpr::Rcx);
    ctx.asm.inc(Gpr::Rdx);
    ctx.asm.jmp(inner);

    ctx.asm.mark_label(advance);
    ctx.asm.cmp_m8_imm(Mem::base(Gpr::Rdi), 0);
    ctx.asm.jcc(Cond::E, nomatch);
    ctx.asm.inc(Gpr::Rdi);
    ctx.asm.jmp(outer);

    ctx.asm.mark_label(found);
    ctx.asm.mov_rr(Gpr::Rax, Gpr::Rdi);
    ctx.asm.jmp(done);
    ctx.asm.mark_label(nomatch);
    ctx.asm.xor_rr(Gpr::Rax, Gpr::Rax);
    ctx.asm.mark_label(done);
}

/// Print the signed number in RAX followed by a newline. Conversion runs
/// in a stack buffer; RBX is saved around the whole sequence.
pub(crate) fn emit_print_rax_line(ctx: &mut Context) {
    ctx.asm.push(Gpr::Rbx);
    ctx.asm.sub_ri(Gpr::Rsp, 32);
    ctx.asm.mov_rr(Gpr::Rbx, Gpr::Rax);
    ctx.asm.lea(Gpr::Rdi, Mem::base_disp(Gpr::Rsp, 32));
    ctx.asm.xor_rr(Gpr::Rcx, Gpr::Rcx);

    let abs_ok = ctx.asm.create_label();
    ctx.asm.test_rr(Gpr::Rax, Gpr::Rax);
    ctx.asm.jcc(Cond::Ns, abs_ok);
    ctx.asm.neg(Gpr::Rax);
    ctx.asm.mark_label(abs_ok);

    ctx.asm.mov_ri(Gpr::R11, 10);
    let digit = ctx.asm.create_label();
    ctx.asm.mark_label(digit);
    ctx.asm.xor_rr(Gpr::Rdx, Gpr::Rdx);
    ctx.asm.div(Gpr::R11);
    ctx.asm.add_ri(Gpr::Rdx, b'0' as i32);
    ctx.asm.dec(Gpr::Rdi);
    ctx.asm.store_u8(Mem::base(Gpr::Rdi), Gpr::Rdx);
    ctx.asm.inc(Gpr::Rcx);
    ctx.asm.test_rr(Gpr::Rax, Gpr::Rax);
    ctx.asm.jcc(Cond::Nz, digit);

    let no_sign = ctx.asm.create_label();
    ctx.asm.test_rr(Gpr::Rbx, Gpr::Rbx);
    ctx.asm.jcc(Cond::Ns, no_sign);
    ctx.asm.dec(Gpr::Rdi);
    ctx.asm.store_u8_imm(Mem::base(Gpr::Rdi), b'-');
    ctx.asm.inc(Gpr::Rcx);
    ctx.asm.mark_label(no_sign);

    // write(1, buffer, len)
    ctx.asm.mov_rr(Gpr::Rsi, Gpr::Rdi);
    ctx.asm.mov_rr(Gpr::Rdx, Gpr::Rcx);
    ctx.asm.mov_ri(Gpr::Rax, 1);
    ctx.asm.mov_ri(Gpr::Rdi, 1);
    ctx.asm.syscall();
    ctx.asm.add_ri(Gpr::Rsp, 32);

    emit_write_newline(ctx);
    ctx.asm.pop(Gpr::Rbx);
}

fn emit_write_newline(ctx: &mut Context) {
    let newline = ctx.asm.add_string("\n");
    ctx.asm.mov_ri(Gpr::Rax, 1);
    ctx.asm.mov_ri(Gpr::Rdi, 1);
    ctx.asm.load_data_address(Gpr::Rsi, newline);
    ctx.asm.mov_ri(Gpr::Rdx, 1);
    ctx.asm.syscall();
}

/// Write the NUL-terminated string at RAX to stdout.
fn emit_print_string(ctx: &mut Context, trailing_newline: bool) {
    ctx.asm.mov_rr(Gpr::Rdi, Gpr::Rax);
    ctx.asm.push(Gpr::Rdi);
    emit_strlen(ctx);
    ctx.asm.mov_rr(Gpr::Rdx, Gpr::Rax);
    ctx.asm.pop(Gpr::Rsi);
    ctx.asm.mov_ri(Gpr::Rax, 1);
    ctx.asm.mov_ri(Gpr::Rdi, 1);
    ctx.asm.syscall();
    if trailing_newline {
        emit_write_newline(ctx);
    }
}

/// `StringConcat(a, b)`: null-safe lengths, one allocation of
/// `len(a)+len(b)+1`, two byte copies, NUL terminator.
fn compile_concat(ctx: &mut Context, args: &[Node], span: Span) -> CodegenResult<()> {
    let (a, b) = match args {
        [a, b] => (a, b),
        _ => return shape_error("StringConcat requires 2 arguments", span),
    };
    trace!("StringConcat: stack-staged operands");
    ctx.asm.push(Gpr::Rbx);
    ctx.asm.push(Gpr::R12);
    ctx.asm.push(Gpr::R13);
    ctx.asm.push(Gpr::R14);

    // Both operands ride the stack across the second evaluation; only then
    // are they pinned in R13/R14.
    compile_expression(ctx, a)?;
    ctx.asm.push(Gpr::Rax);
    compile_expression(ctx, b)?;
    ctx.asm.push(Gpr::Rax);
    ctx.asm.pop(Gpr::R14);
    ctx.asm.pop(Gpr::R13);

    ctx.asm.mov_rr(Gpr::Rdi, Gpr::R13);
    emit_strlen(ctx);
    ctx.asm.mov_rr(Gpr::Rbx, Gpr::Rax);
    ctx.asm.mov_rr(Gpr::Rdi, Gpr::R14);
    emit_strlen(ctx);

    ctx.asm.mov_rr(Gpr::Rsi, Gpr::Rax);
    ctx.asm.add_rr(Gpr::Rsi, Gpr::Rbx);
    ctx.asm.inc(Gpr::Rsi);
    emit_mmap_rsi(ctx);
    ctx.asm.mov_rr(Gpr::R12, Gpr::Rax);
    ctx.asm.mov_rr(Gpr::Rdi, Gpr::Rax);

    let skip1 = ctx.asm.create_label();
    ctx.asm.mov_rr(Gpr::Rsi, Gpr::R13);
    ctx.asm.test_rr(Gpr::Rsi, Gpr::Rsi);
    ctx.asm.jcc(Cond::Z, skip1);
    emit_copy_str(ctx);
    ctx.asm.mark_label(skip1);

    let skip2 = ctx.asm.create_label();
    ctx.asm.mov_rr(Gpr::Rsi, Gpr::R14);
    ctx.asm.test_rr(Gpr::Rsi, Gpr::Rsi);
    ctx.asm.jcc(Cond::Z, skip2);
    emit_copy_str(ctx);
    ctx.asm.mark_label(skip2);

    ctx.asm.store_u8_imm(Mem::base(Gpr::Rdi), 0);
    ctx.asm.mov_rr(Gpr::Rax, Gpr::R12);

    ctx.asm.pop(Gpr::R14);
    ctx.asm.pop(Gpr::R13);
    ctx.asm.pop(Gpr::R12);
    ctx.asm.pop(Gpr::Rbx);
    Ok(())
}

/// Compare two strings byte by byte: RAX := 0 when equal, 1 otherwise.
/// Null pointers compare as empty strings.
fn compile_compare_core(ctx: &mut Context, args: &[Node], span: Span) -> CodegenResult<()> {
    let (a, b) = match args {
        [a, b] => (a, b),
        _ => return shape_error("string comparison requires 2 arguments", span),
    };
    compile_expression(ctx, a)?;
    ctx.asm.push(Gpr::Rax);
    compile_expression(ctx, b)?;
    ctx.asm.mov_rr(Gpr::Rdi, Gpr::Rax);
    ctx.asm.pop(Gpr::Rsi);

    let empty = ctx.empty_string_offset;
    for reg in [Gpr::Rsi, Gpr::Rdi] {
        let ok = ctx.asm.create_label();
        ctx.asm.test_rr(reg, reg);
        ctx.asm.jcc(Cond::Nz, ok);
        ctx.asm.load_data_address(reg, empty);
        ctx.asm.mark_label(ok);
    }

    let scan = ctx.asm.create_label();
    let differ = ctx.asm.create_label();
    let equal = ctx.asm.create_label();
    let done = ctx.asm.create_label();
    ctx.asm.mark_label(scan);
    ctx.asm.load_u8(Gpr::Rax, Mem::base(Gpr::Rsi));
    ctx.asm.load_u8(Gpr::Rdx, Mem::base(Gpr::Rdi));
    ctx.asm.cmp_rr(Gpr::Rax, Gpr::Rdx);
    ctx.asm.jcc(Cond::Ne, differ);
    ctx.asm.test_rr(Gpr::Rax, Gpr::Rax);
    ctx.asm.jcc(Cond::Z, equal);
    ctx.asm.inc(Gpr::Rsi);
    ctx.asm.inc(Gpr::Rdi);
    ctx.asm.jmp(scan);
    ctx.asm.mark_label(differ);
    ctx.asm.mov_ri(Gpr::Rax, 1);
    ctx.asm.jmp(done);
    ctx.asm.mark_label(equal);
    ctx.asm.xor_rr(Gpr::Rax, Gpr::Rax);
    ctx.asm.mark_label(done);
    Ok(())
}

/// `NumberToString(n)`: decimal conversion into a fresh allocation.
fn compile_number_to_string(ctx: &mut Context, args: &[Node], span: Span) -> CodegenResult<()> {
    let arg = one(args, span, "NumberToString")?;
    compile_expression(ctx, arg)?;
    ctx.asm.push(Gpr::Rbx);

    // Convert backwards into a stack buffer, exactly like the print path.
    ctx.asm.sub_ri(Gpr::Rsp, 32);
    ctx.asm.mov_rr(Gpr::Rbx, Gpr::Rax);
    ctx.asm.lea(Gpr::Rdi, Mem::base_disp(Gpr::Rsp, 32));
    ctx.asm.xor_rr(Gpr::Rcx, Gpr::Rcx);
    let abs_ok = ctx.asm.create_label();
    ctx.asm.test_rr(Gpr::Rax, Gpr::Rax);
    ctx.asm.jcc(Cond::Ns, abs_ok);
    ctx.asm.neg(Gpr::Rax);
    ctx.asm.mark_label(abs_ok);
    ctx.asm.mov_ri(Gpr::R11, 10);
    let digit = ctx.asm.create_label();
    ctx.asm.mark_label(digit);
    ctx.asm.xor_rr(Gpr::Rdx, Gpr::Rdx);
    ctx.asm.div(Gpr::R11);
    ctx.asm.add_ri(Gpr::Rdx, b'0' as i32);
    ctx.asm.dec(Gpr::Rdi);
    ctx.asm.store_u8(Mem::base(Gpr::Rdi), Gpr::Rdx);
    ctx.asm.inc(Gpr::Rcx);
    ctx.asm.test_rr(Gpr::Rax, Gpr::Rax);
    ctx.asm.jcc(Cond::Nz, digit);
    let no_sign = ctx.asm.create_label();
    ctx.asm.test_rr(Gpr::Rbx, Gpr::Rbx);
    ctx.asm.jcc(Cond::Ns, no_sign);
    ctx.asm.dec(Gpr::Rdi);
    ctx.asm.store_u8_imm(Mem::base(Gpr::Rdi), b'-');
    ctx.asm.inc(Gpr::Rcx);
    ctx.asm.mark_label(no_sign);

    // Allocate and copy the digits to the front of the new buffer.
    ctx.asm.push(Gpr::Rdi);
    ctx.asm.push(Gpr::Rcx);
    emit_mmap_const(ctx, 32);
    ctx.asm.pop(Gpr::Rcx);
    ctx.asm.pop(Gpr::Rsi);
    ctx.asm.mov_rr(Gpr::Rbx, Gpr::Rax);
    ctx.asm.mov_rr(Gpr::Rdi, Gpr::Rax);
    let copy = ctx.asm.create_label();
    let copy_done = ctx.asm.create_label();
    ctx.asm.mark_label(copy);
    ctx.asm.test_rr(Gpr::Rcx, Gpr::Rcx);
    ctx.asm.jcc(Cond::Z, copy_done);
    ctx.asm.load_u8(Gpr::Rdx, Mem::base(Gpr::Rsi));
    ctx.asm.store_u8(Mem::base(Gpr::Rdi), Gpr::Rdx);
    ctx.asm.inc(Gpr::Rsi);
    ctx.asm.inc(Gpr::Rdi);
    ctx.asm.dec(Gpr::Rcx);
    ctx.asm.jmp(copy);
    ctx.asm.mark_label(copy_done);
    ctx.asm.store_u8_imm(Mem::base(Gpr::Rdi), 0);
    ctx.asm.mov_rr(Gpr::Rax, Gpr::Rbx);

    ctx.asm.add_ri(Gpr::Rsp, 32);
    ctx.asm.pop(Gpr::Rbx);
    Ok(())
}

/// `StringToNumber(s)`: optional leading minus, then decimal digits; stops
/// at the first non-digit. Null reads as 0.
fn compile_string_to_number(ctx: &mut Context, args: &[Node], span: Span) -> CodegenResult<()> {
    let arg = one(args, span, "StringToNumber")?;
    compile_expression(ctx, arg)?;
    ctx.asm.push(Gpr::Rbx);
    ctx.asm.mov_rr(Gpr::Rsi, Gpr::Rax);
    ctx.asm.xor_rr(Gpr::Rax, Gpr::Rax);
    ctx.asm.xor_rr(Gpr::Rbx, Gpr::Rbx);

    let done = ctx.asm.create_label();
    let scan = ctx.asm.create_label();
    let positive = ctx.asm.create_label();
    ctx.asm.test_rr(Gpr::Rsi, Gpr::Rsi);
    ctx.asm.jcc(Cond::Z, done);

    ctx.asm.cmp_m8_imm(Mem::base(Gpr::Rsi), b'-');
    ctx.asm.jcc(Cond::Ne, scan);
    ctx.asm.mov_ri(Gpr::Rbx, 1);
    ctx.asm.inc(Gpr::Rsi);

    ctx.asm.mark_label(scan);
    ctx.asm.load_u8(Gpr::Rdx, Mem::base(Gpr::Rsi));
    ctx.asm.cmp_ri(Gpr::Rdx, b'0' as i32);
    ctx.asm.jcc(Cond::B, done);
    ctx.asm.cmp_ri(Gpr::Rdx, b'9' as i32);
    ctx.asm.jcc(Cond::A, done);
    ctx.asm.imul_rri(Gpr::Rax, Gpr::Rax, 10);
    ctx.asm.sub_ri(Gpr::Rdx, b'0' as i32);
    ctx.asm.add_rr(Gpr::Rax, Gpr::Rdx);
    ctx.asm.inc(Gpr::Rsi);
    ctx.asm.jmp(scan);

    ctx.asm.mark_label(done);
    ctx.asm.test_rr(Gpr::Rbx, Gpr::Rbx);
    ctx.asm.jcc(Cond::Z, positive);
    ctx.asm.neg(Gpr::Rax);
    ctx.asm.mark_label(positive);
    ctx.asm.pop(Gpr::Rbx);
    Ok(())
}

#[derive(Clone, Copy)]
enum CaseKind {
    Upper,
    Lower,
}

fn compile_case_convert(
    ctx: &mut Context,
    args: &[Node],
    span: Span,
    kind: CaseKind,
) -> CodegenResult<()> {
    let name = match kind {
        CaseKind::Upper => "StringToUpper",
        CaseKind::Lower => "StringToLower",
    };
    let arg = one(args, span, name)?;
    compile_expression(ctx, arg)?;
    ctx.asm.push(Gpr::Rbx);
    ctx.asm.push(Gpr::R12);
    ctx.asm.mov_rr(Gpr::R12, Gpr::Rax);

    ctx.asm.mov_rr(Gpr::Rdi, Gpr::R12);
    emit_strlen(ctx);
    ctx.asm.mov_rr(Gpr::Rsi, Gpr::Rax);
    ctx.asm.inc(Gpr::Rsi);
    emit_mmap_rsi(ctx);
    ctx.asm.mov_rr(Gpr::Rbx, Gpr::Rax);
    ctx.asm.mov_rr(Gpr::Rdi, Gpr::Rax);
    ctx.asm.mov_rr(Gpr::Rsi, Gpr::R12);

    let (lo, hi) = match kind {
        CaseKind::Upper => (b'a', b'z'),
        CaseKind::Lower => (b'A', b'Z'),
    };
    let scan = ctx.asm.create_label();
    let keep = ctx.asm.create_label();
    let done = ctx.asm.create_label();
    ctx.asm.test_rr(Gpr::Rsi, Gpr::Rsi);
    ctx.asm.jcc(Cond::Z, done);
    ctx.asm.mark_label(scan);
    ctx.asm.load_u8(Gpr::Rdx, Mem::base(Gpr::Rsi));
    ctx.asm.test_rr(Gpr::Rdx, Gpr::Rdx);
    ctx.asm.jcc(Cond::Z, done);
    ctx.asm.cmp_ri(Gpr::Rdx, lo as i32);
    ctx.asm.jcc(Cond::B, keep);
    ctx.asm.cmp_ri(Gpr::Rdx, hi as i32);
    ctx.asm.jcc(Cond::A, keep);
    match kind {
        CaseKind::Upper => ctx.asm.sub_ri(Gpr::Rdx, 32),
        CaseKind::Lower => ctx.asm.add_ri(Gpr::Rdx, 32),
    }
    ctx.asm.mark_label(keep);
    ctx.asm.store_u8(Mem::base(Gpr::Rdi), Gpr::Rdx);
    ctx.asm.inc(Gpr::Rsi);
    ctx.asm.inc(Gpr::Rdi);
    ctx.asm.jmp(scan);
    ctx.asm.mark_label(done);
    ctx.asm.store_u8_imm(Mem::base(Gpr::Rdi), 0);
    ctx.asm.mov_rr(Gpr::Rax, Gpr::Rbx);

    ctx.asm.pop(Gpr::R12);
    ctx.asm.pop(Gpr::Rbx);
    Ok(())
}

/// `StringSubstring(s, start, len)`: bounded copy, stops early at the
/// source terminator.
fn compile_substring(ctx: &mut Context, args: &[Node], span: Span) -> CodegenResult<()> {
    let (s, start, len) = match args {
        [s, start, len] => (s, start, len),
        _ => return shape_error("StringSubstring requires string, start and length", span),
    };
    ctx.asm.push(Gpr::Rbx);
    ctx.asm.push(Gpr::R12);
    ctx.asm.push(Gpr::R13);

    compile_expression(ctx, s)?;
    ctx.asm.push(Gpr::Rax);
    compile_expression(ctx, start)?;
    ctx.asm.push(Gpr::Rax);
    compile_expression(ctx, len)?;
    ctx.asm.mov_rr(Gpr::R13, Gpr::Rax);
    ctx.asm.pop(Gpr::Rbx);
    ctx.asm.pop(Gpr::R12);

    ctx.asm.mov_rr(Gpr::Rsi, Gpr::R13);
    ctx.asm.inc(Gpr::Rsi);
    emit_mmap_rsi(ctx);
    ctx.asm.push(Gpr::Rax);
    ctx.asm.mov_rr(Gpr::Rdi, Gpr::Rax);
    ctx.asm.mov_rr(Gpr::Rsi, Gpr::R12);
    ctx.asm.add_rr(Gpr::Rsi, Gpr::Rbx);
    ctx.asm.mov_rr(Gpr::Rcx, Gpr::R13);

    let scan = ctx.asm.create_label();
    let done = ctx.asm.create_label();
    ctx.asm.mark_label(scan);
    ctx.asm.test_rr(Gpr::Rcx, Gpr::Rcx);
    ctx.asm.jcc(Cond::Z, done);
    ctx.asm.load_u8(Gpr::Rdx, Mem::base(Gpr::Rsi));
    ctx.asm.test_rr(Gpr::Rdx, Gpr::Rdx);
    ctx.asm.jcc(Cond::Z, done);
    ctx.asm.store_u8(Mem::base(Gpr::Rdi), Gpr::Rdx);
    ctx.asm.inc(Gpr::Rsi);
    ctx.asm.inc(Gpr::Rdi);
    ctx.asm.dec(Gpr::Rcx);
    ctx.asm.jmp(scan);
    ctx.asm.mark_label(done);
    ctx.asm.store_u8_imm(Mem::base(Gpr::Rdi), 0);
    ctx.asm.pop(Gpr::Rax);

    ctx.asm.pop(Gpr::R13);
    ctx.asm.pop(Gpr::R12);
    ctx.asm.pop(Gpr::Rbx);
    Ok(())
}

/// `StringCharAt(s, index)`: the byte value, zero past the end only if the
/// caller stays in bounds (no check, matching the other byte primitives).
fn compile_char_at(ctx: &mut Context, args: &[Node], span: Span) -> CodegenResult<()> {
    let (s, index) = match args {
        [s, index] => (s, index),
        _ => return shape_error("StringCharAt requires string and index", span),
    };
    ctx.asm.push(Gpr::Rbx);
    compile_expression(ctx, s)?;
    ctx.asm.push(Gpr::Rax);
    compile_expression(ctx, index)?;
    ctx.asm.mov_rr(Gpr::Rbx, Gpr::Rax);
    ctx.asm.pop(Gpr::Rax);
    ctx.asm
        .load_u8(Gpr::Rax, Mem::base_index_disp(Gpr::Rax, Gpr::Rbx, 0));
    ctx.asm.pop(Gpr::Rbx);
    Ok(())
}

/// `StringIndexOf(haystack, needle)`: byte offset of the first match, or
/// -1.
fn compile_index_of(ctx: &mut Context, args: &[Node], span: Span) -> CodegenResult<()> {
    let (hay, needle) = match args {
        [hay, needle] => (hay, needle),
        _ => return shape_error("StringIndexOf requires haystack and needle", span),
    };
    ctx.asm.push(Gpr::Rbx);
    ctx.asm.push(Gpr::R12);
    compile_expression(ctx, hay)?;
    ctx.asm.push(Gpr::Rax);
    compile_expression(ctx, needle)?;
    ctx.asm.mov_rr(Gpr::Rsi, Gpr::Rax);
    ctx.asm.pop(Gpr::R12);
    ctx.asm.mov_rr(Gpr::Rdi, Gpr::R12);
    emit_strstr(ctx);

    let not_found = ctx.asm.create_label();
    let done = ctx.asm.create_label();
    ctx.asm.test_rr(Gpr::Rax, Gpr::Rax);
    ctx.asm.jcc(Cond::Z, not_found);
    ctx.asm.sub_rr(Gpr::Rax, Gpr::R12);
    ctx.asm.jmp(done);
    ctx.asm.mark_label(not_found);
    ctx.asm.mov_ri(Gpr::Rax, -1);
    ctx.asm.mark_label(done);
    ctx.asm.pop(Gpr::R12);
    ctx.asm.pop(Gpr::Rbx);
    Ok(())
}

/// `StringSplit(s, delimiter)`: a fresh `[capacity][count][ptr…]` array of
/// freshly allocated pieces. An empty delimiter yields one piece.
fn compile_split(ctx: &mut Context, args: &[Node], span: Span) -> CodegenResult<()> {
    let (hay, delim) = match args {
        [hay, delim] => (hay, delim),
        _ => return shape_error("StringSplit requires haystack and delimiter", span),
    };
    ctx.asm.push(Gpr::Rbx);
    ctx.asm.push(Gpr::R12);
    ctx.asm.push(Gpr::R13);
    ctx.asm.push(Gpr::R14);

    compile_expression(ctx, hay)?;
    ctx.asm.push(Gpr::Rax);
    compile_expression(ctx, delim)?;
    ctx.asm.mov_rr(Gpr::R13, Gpr::Rax);
    ctx.asm.pop(Gpr::R12);

    // Result array: 16-slot capacity, count, then piece pointers.
    emit_mmap_const(ctx, 144);
    ctx.asm.mov_rr(Gpr::R14, Gpr::Rax);
    ctx.asm.mov_ri(Gpr::Rax, 16);
    ctx.asm.store(Mem::base(Gpr::R14), Gpr::Rax);
    ctx.asm.mov_ri(Gpr::Rax, 0);
    ctx.asm.store(Mem::base_disp(Gpr::R14, 8), Gpr::Rax);

    // Cursor in RBX.
    ctx.asm.mov_rr(Gpr::Rbx, Gpr::R12);

    let loop_start = ctx.asm.create_label();
    let add_final = ctx.asm.create_label();

    // An empty delimiter would never advance; emit the whole string.
    ctx.asm.cmp_m8_imm(Mem::base(Gpr::R13), 0);
    ctx.asm.jcc(Cond::E, add_final);

    ctx.asm.mark_label(loop_start);
    ctx.asm.mov_rr(Gpr::Rdi, Gpr::Rbx);
    ctx.asm.mov_rr(Gpr::Rsi, Gpr::R13);
    emit_strstr(ctx);
    ctx.asm.test_rr(Gpr::Rax, Gpr::Rax);
    ctx.asm.jcc(Cond::Z, add_final);

    // Piece [RBX, match): allocate and copy.
    ctx.asm.push(Gpr::Rax);
    ctx.asm.mov_rr(Gpr::Rsi, Gpr::Rax);
    ctx.asm.sub_rr(Gpr::Rsi, Gpr::Rbx);
    ctx.asm.inc(Gpr::Rsi);
    emit_mmap_rsi(ctx);
    ctx.asm.pop(Gpr::Rdx); // match position
    ctx.asm.push(Gpr::Rdx);
    ctx.asm.push(Gpr::Rax); // piece base
    ctx.asm.mov_rr(Gpr::Rdi, Gpr::Rax);
    ctx.asm.mov_rr(Gpr::Rsi, Gpr::Rbx);
    let copy = ctx.asm.create_label();
    let copy_done = ctx.asm.create_label();
    ctx.asm.mark_label(copy);
    ctx.asm.cmp_rr(Gpr::Rsi, Gpr::Rdx);
    ctx.asm.jcc(Cond::E, copy_done);
    ctx.asm.load_u8(Gpr::Rcx, Mem::base(Gpr::Rsi));
    ctx.asm.store_u8(Mem::base(Gpr::Rdi), Gpr::Rcx);
    ctx.asm.inc(Gpr::Rsi);
    ctx.asm.inc(Gpr::Rdi);
    ctx.asm.jmp(copy);
    ctx.asm.mark_label(copy_done);
    ctx.asm.store_u8_imm(Mem::base(Gpr::Rdi), 0);

    // Append the piece and advance the cursor past the delimiter.
    ctx.asm.pop(Gpr::Rax); // piece base
    ctx.asm.load(Gpr::Rcx, Mem::base_disp(Gpr::R14, 8));
    ctx.asm.shl_ri(Gpr::Rcx, 3);
    ctx.asm
        .store(Mem::base_index_disp(Gpr::R14, Gpr::Rcx, 16), Gpr::Rax);
    ctx.asm.inc_m(Mem::base_disp(Gpr::R14, 8));
    ctx.asm.pop(Gpr::Rbx); // match position becomes the new cursor
    ctx.asm.mov_rr(Gpr::Rdi, Gpr::R13);
    emit_strlen(ctx);
    ctx.asm.add_rr(Gpr::Rbx, Gpr::Rax);
    ctx.asm.jmp(loop_start);

    // Final piece: from the cursor to the end of the string.
    ctx.asm.mark_label(add_final);
    ctx.asm.mov_rr(Gpr::Rdi, Gpr::Rbx);
    emit_strlen(ctx);
    ctx.asm.mov_rr(Gpr::Rsi, Gpr::Rax);
    ctx.asm.inc(Gpr::Rsi);
    emit_mmap_rsi(ctx);
    ctx.asm.push(Gpr::Rax);
    ctx.asm.mov_rr(Gpr::Rdi, Gpr::Rax);
    ctx.asm.mov_rr(Gpr::Rsi, Gpr::Rbx);
    emit_copy_str(ctx);
    ctx.asm.store_u8_imm(Mem::base(Gpr::Rdi), 0);
    ctx.asm.load(Gpr::Rcx, Mem::base_disp(Gpr::R14, 8));
    ctx.asm.shl_ri(Gpr::Rcx, 3);
    ctx.asm.pop(Gpr::Rax);
    ctx.asm
        .store(Mem::base_index_disp(Gpr::R14, Gpr::Rcx, 16), Gpr::Rax);
    ctx.asm.inc_m(Mem::base_disp(Gpr::R14, 8));

    ctx.asm.mov_rr(Gpr::Rax, Gpr::R14);
    ctx.asm.pop(Gpr::R14);
    ctx.asm.pop(Gpr::R13);
    ctx.asm.pop(Gpr::R12);
    ctx.asm.pop(Gpr::Rbx);
    Ok(())
}

/// `StringReplace(haystack, needle, replacement)`: first occurrence only;
/// the original haystack comes back untouched when the needle is absent.
fn compile_replace(ctx: &mut Context, args: &[Node], span: Span) -> CodegenResult<()> {
    let (hay, needle, repl) = match args {
        [hay, needle, repl] => (hay, needle, repl),
        _ => return shape_error("StringReplace requires haystack, needle and replacement", span),
    };
    ctx.asm.push(Gpr::Rbx);
    ctx.asm.push(Gpr::R12);
    ctx.asm.push(Gpr::R13);
    ctx.asm.push(Gpr::R14);

    compile_expression(ctx, hay)?;
    ctx.asm.push(Gpr::Rax);
    compile_expression(ctx, needle)?;
    ctx.asm.push(Gpr::Rax);
    compile_expression(ctx, repl)?;
    ctx.asm.mov_rr(Gpr::R14, Gpr::Rax);
    ctx.asm.pop(Gpr::R13);
    ctx.asm.pop(Gpr::R12);

    ctx.asm.mov_rr(Gpr::Rdi, Gpr::R12);
    ctx.asm.mov_rr(Gpr::Rsi, Gpr::R13);
    emit_strstr(ctx);

    let not_found = ctx.asm.create_label();
    let done = ctx.asm.create_label();
    ctx.asm.test_rr(Gpr::Rax, Gpr::Rax);
    ctx.asm.jcc(Cond::Z, not_found);
    ctx.asm.mov_rr(Gpr::Rbx, Gpr::Rax); // match position

    // size = len(hay) - len(needle) + len(repl) + 1
    ctx.asm.mov_rr(Gpr::Rdi, Gpr::R13);
    emit_strlen(ctx);
    ctx.asm.push(Gpr::Rax);
    ctx.asm.mov_rr(Gpr::Rdi, Gpr::R14);
    emit_strlen(ctx);
    ctx.asm.push(Gpr::Rax);
    ctx.asm.mov_rr(Gpr::Rdi, Gpr::R12);
    emit_strlen(ctx);
    ctx.asm.mov_rr(Gpr::Rsi, Gpr::Rax);
    ctx.asm.pop(Gpr::Rdx);
    ctx.asm.add_rr(Gpr::Rsi, Gpr::Rdx);
    ctx.asm.pop(Gpr::Rdx);
    ctx.asm.sub_rr(Gpr::Rsi, Gpr::Rdx);
    ctx.asm.inc(Gpr::Rsi);
    emit_mmap_rsi(ctx);
    ctx.asm.push(Gpr::Rax);
    ctx.asm.mov_rr(Gpr::Rdi, Gpr::Rax);

    // Prefix bytes up to the match.
    ctx.asm.mov_rr(Gpr::Rsi, Gpr::R12);
    let prefix = ctx.asm.create_label();
    let prefix_done = ctx.asm.create_label();
    ctx.asm.mark_label(prefix);
    ctx.asm.cmp_rr(Gpr::Rsi, Gpr::Rbx);
    ctx.asm.jcc(Cond::E, prefix_done);
    ctx.asm.load_u8(Gpr::Rdx, Mem::base(Gpr::Rsi));
    ctx.asm.store_u8(Mem::base(Gpr::Rdi), Gpr::Rdx);
    ctx.asm.inc(Gpr::Rsi);
    ctx.asm.inc(Gpr::Rdi);
    ctx.asm.jmp(prefix);
    ctx.asm.mark_label(prefix_done);

    // Replacement, then the suffix after the needle.
    ctx.asm.mov_rr(Gpr::Rsi, Gpr::R14);
    emit_copy_str(ctx);
    ctx.asm.push(Gpr::Rdi);
    ctx.asm.mov_rr(Gpr::Rdi, Gpr::R13);
    emit_strlen(ctx);
    ctx.asm.mov_rr(Gpr::Rdx, Gpr::Rax);
    ctx.asm.pop(Gpr::Rdi);
    ctx.asm.mov_rr(Gpr::Rsi, Gpr::Rbx);
    ctx.asm.add_rr(Gpr::Rsi, Gpr::Rdx);
    emit_copy_str(ctx);
    ctx.asm.store_u8_imm(Mem::base(Gpr::Rdi), 0);
    ctx.asm.pop(Gpr::Rax);
    ctx.asm.jmp(done);

    ctx.asm.mark_label(not_found);
    ctx.asm.mov_rr(Gpr::Rax, Gpr::R12);
    ctx.asm.mark_label(done);

    ctx.asm.pop(Gpr::R14);
    ctx.asm.pop(Gpr::R13);
    ctx.asm.pop(Gpr::R12);
    ctx.asm.pop(Gpr::Rbx);
    Ok(())
}
