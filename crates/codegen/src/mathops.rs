//! Math operation lowerings.
//!
//! Everything in the language is a 64-bit integer, so the float-flavored
//! names keep integer semantics: the rounding family is the identity,
//! `Frac` is zero, and the transcendental family works in ×10000
//! fixed-point through the x87 FPU (degrees in, scaled values out, per
//! the conventions of the scientific ops). `ISqrt` takes the SSE2
//! hardware square root below 2^53 and falls back to Newton's method
//! above it, where the double mantissa runs out of bits.
//!
//! None of these lowerings touch R15 or leave R12..R14 perturbed; the
//! two that need pinned values across an inner loop (`Pow`, the `ISqrt`
//! fallback) save and restore what they borrow.

use crate::asm::{Cond, Gpr, Mem, Xmm};
use crate::context::Context;
use crate::expr::compile_expression;
use crate::result::{shape_error, CodegenResult};
use ailang_ast::{Node, Span};
use log::trace;

/// Scale factor of the fixed-point transcendental ops.
const FIXED_POINT_SCALE: i32 = 10000;

/// Route a math operation; `Ok(false)` when the name is not ours.
pub(crate) fn compile_operation(
    ctx: &mut Context,
    function: &str,
    args: &[Node],
    span: Span,
) -> CodegenResult<bool> {
    match function {
        "Abs" => {
            compile_one(ctx, args, span, "Abs")?;
            emit_abs(ctx);
        }
        "Sign" => compile_sign(ctx, args, span)?,
        "Min" => compile_min_max(ctx, args, span, Cond::Le)?,
        "Max" => compile_min_max(ctx, args, span, Cond::Ge)?,
        "Clamp" => compile_clamp(ctx, args, span)?,
        "Saturate" => compile_saturate(ctx, args, span)?,
        "Pow" => compile_pow(ctx, args, span)?,
        "ISqrt" => compile_isqrt(ctx, args, span)?,
        // Integer values are already integral: the rounding family is the
        // identity and the fractional part is always zero.
        "Floor" | "Ceil" | "Round" | "RoundEven" | "Trunc" => {
            compile_one(ctx, args, span, function)?;
        }
        "Frac" => {
            compile_one(ctx, args, span, "Frac")?;
            ctx.asm.xor_rr(Gpr::Rax, Gpr::Rax);
        }
        "FloorDivide" => compile_floor_divide(ctx, args, span)?,
        "Remainder" => compile_remainder(ctx, args, span)?,
        "FusedMultiplyAdd" => compile_fma(ctx, args, span)?,
        "Hypotenuse" => compile_hypot(ctx, args, span)?,
        "Lerp" => compile_lerp(ctx, args, span)?,
        "PopCount" => {
            compile_one(ctx, args, span, "PopCount")?;
            ctx.asm.popcnt(Gpr::Rax, Gpr::Rax);
        }
        "CountLeadingZeros" => {
            compile_one(ctx, args, span, "CountLeadingZeros")?;
            ctx.asm.lzcnt(Gpr::Rax, Gpr::Rax);
        }
        "CountTrailingZeros" => {
            compile_one(ctx, args, span, "CountTrailingZeros")?;
            ctx.asm.tzcnt(Gpr::Rax, Gpr::Rax);
        }
        "RotateLeft" => compile_rotate(ctx, args, span, true)?,
        "RotateRight" => compile_rotate(ctx, args, span, false)?,
        "ByteSwap" => {
            compile_one(ctx, args, span, "ByteSwap")?;
            ctx.asm.bswap_r64(Gpr::Rax);
        }
        "AlignUp" => compile_align(ctx, args, span, true)?,
        "AlignDown" => compile_align(ctx, args, span, false)?,
        "IsPowerOfTwo" => compile_is_power_of_two(ctx, args, span)?,
        "NextPowerOfTwo" => compile_next_power_of_two(ctx, args, span)?,
        "FloorLog2" => compile_floor_log2(ctx, args, span)?,
        "DegToRad" => {
            compile_one(ctx, args, span, "DegToRad")?;
            fpu_enter(ctx);
            fpu_deg_to_rad(ctx);
            fpu_scale_up(ctx);
            fpu_leave(ctx);
        }
        "RadToDeg" => {
            compile_one(ctx, args, span, "RadToDeg")?;
            fpu_enter(ctx);
            fpu_scale_down(ctx);
            fpu_rad_to_deg(ctx);
            fpu_leave(ctx);
        }
        "Sin" => compile_trig(ctx, args, span, Trig::Sin)?,
        "Cos" => compile_trig(ctx, args, span, Trig::Cos)?,
        "Tan" => compile_trig(ctx, args, span, Trig::Tan)?,
        "Asin" => compile_arc(ctx, args, span, Arc::Asin)?,
        "Acos" => compile_arc(ctx, args, span, Arc::Acos)?,
        "Atan" => compile_atan(ctx, args, span)?,
        "Atan2" => compile_atan2(ctx, args, span)?,
        "Exp" => compile_exp(ctx, args, span, ExpKind::Natural)?,
        "Exp2" => compile_exp(ctx, args, span, ExpKind::Base2)?,
        "Expm1" => compile_exp(ctx, args, span, ExpKind::NaturalMinusOne)?,
        "Log" => compile_log(ctx, args, span, LogKind::Natural)?,
        "Log2" => compile_log(ctx, args, span, LogKind::Base2)?,
        "Log10" => compile_log(ctx, args, span, LogKind::Base10)?,
        "Log1p" => compile_log1p(ctx, args, span)?,
        _ => return Ok(false),
    }
    Ok(true)
}

fn compile_one(ctx: &mut Context, args: &[Node], span: Span, name: &str) -> CodegenResult<()> {
    match args {
        [a] => compile_expression(ctx, a),
        _ => shape_error(format!("{name} requires one argument"), span),
    }
}

/// Evaluate a two-argument operation with the first operand staged on the
/// stack: leaves the first in RCX and the second in RAX.
fn compile_two_rcx_rax(
    ctx: &mut Context,
    args: &[Node],
    span: Span,
    name: &str,
) -> CodegenResult<()> {
    let (a, b) = match args {
        [a, b] => (a, b),
        _ => return shape_error(format!("{name} requires two arguments"), span),
    };
    compile_expression(ctx, a)?;
    ctx.asm.push(Gpr::Rax);
    compile_expression(ctx, b)?;
    ctx.asm.pop(Gpr::Rcx);
    Ok(())
}

/// Branchless `|RAX|`: `(x ^ (x >> 63)) - (x >> 63)`.
fn emit_abs(ctx: &mut Context) {
    ctx.asm.mov_rr(Gpr::Rcx, Gpr::Rax);
    ctx.asm.sar_ri(Gpr::Rcx, 63);
    ctx.asm.xor_rr(Gpr::Rax, Gpr::Rcx);
    ctx.asm.sub_rr(Gpr::Rax, Gpr::Rcx);
}

fn compile_sign(ctx: &mut Context, args: &[Node], span: Span) -> CodegenResult<()> {
    compile_one(ctx, args, span, "Sign")?;
    let negative = ctx.asm.create_label();
    let done = ctx.asm.create_label();
    ctx.asm.test_rr(Gpr::Rax, Gpr::Rax);
    ctx.asm.jcc(Cond::Z, done);
    ctx.asm.jcc(Cond::S, negative);
    ctx.asm.mov_ri(Gpr::Rax, 1);
    ctx.asm.jmp(done);
    ctx.asm.mark_label(negative);
    ctx.asm.mov_ri(Gpr::Rax, -1);
    ctx.asm.mark_label(done);
    Ok(())
}

/// `Min`/`Max` by CMOV: the first operand sits in RCX, and the winning
/// value is conditionally moved into RAX.
fn compile_min_max(ctx: &mut Context, args: &[Node], span: Span, cc: Cond) -> CodegenResult<()> {
    let name = if cc == Cond::Le { "Min" } else { "Max" };
    compile_two_rcx_rax(ctx, args, span, name)?;
    ctx.asm.cmp_rr(Gpr::Rcx, Gpr::Rax);
    ctx.asm.cmovcc(cc, Gpr::Rax, Gpr::Rcx);
    Ok(())
}

fn compile_clamp(ctx: &mut Context, args: &[Node], span: Span) -> CodegenResult<()> {
    let (value, lo, hi) = match args {
        [v, lo, hi] => (v, lo, hi),
        _ => return shape_error("Clamp requires three arguments", span),
    };
    compile_expression(ctx, value)?;
    ctx.asm.push(Gpr::Rax);
    compile_expression(ctx, lo)?;
    ctx.asm.push(Gpr::Rax);
    compile_expression(ctx, hi)?;
    ctx.asm.mov_rr(Gpr::Rcx, Gpr::Rax);
    ctx.asm.pop(Gpr::Rdx);
    ctx.asm.pop(Gpr::Rax);
    emit_clamp_rcx_rdx(ctx);
    Ok(())
}

/// Clamp RAX into [RDX, RCX].
fn emit_clamp_rcx_rdx(ctx: &mut Context) {
    ctx.asm.cmp_rr(Gpr::Rax, Gpr::Rdx);
    ctx.asm.cmovcc(Cond::L, Gpr::Rax, Gpr::Rdx);
    ctx.asm.cmp_rr(Gpr::Rax, Gpr::Rcx);
    ctx.asm.cmovcc(Cond::G, Gpr::Rax, Gpr::Rcx);
}

/// `Saturate(x)`: clamp to the 0..=1 unit range.
fn compile_saturate(ctx: &mut Context, args: &[Node], span: Span) -> CodegenResult<()> {
    compile_one(ctx, args, span, "Saturate")?;
    ctx.asm.xor_rr(Gpr::Rdx, Gpr::Rdx);
    ctx.asm.mov_ri(Gpr::Rcx, 1);
    emit_clamp_rcx_rdx(ctx);
    Ok(())
}

/// `Pow(base, exp)`: exponentiation by squaring. Non-positive exponents
/// yield 1.
fn compile_pow(ctx: &mut Context, args: &[Node], span: Span) -> CodegenResult<()> {
    let (base, exp) = match args {
        [base, exp] => (base, exp),
        _ => return shape_error("Pow requires two arguments", span),
    };
    ctx.asm.push(Gpr::Rbx);
    ctx.asm.push(Gpr::R12);
    compile_expression(ctx, base)?;
    ctx.asm.push(Gpr::Rax);
    compile_expression(ctx, exp)?;
    ctx.asm.mov_rr(Gpr::Rbx, Gpr::Rax);
    ctx.asm.pop(Gpr::R12);
    ctx.asm.mov_ri(Gpr::Rax, 1);

    let loop_start = ctx.asm.create_label();
    let skip_mul = ctx.asm.create_label();
    let done = ctx.asm.create_label();
    ctx.asm.mark_label(loop_start);
    ctx.asm.test_rr(Gpr::Rbx, Gpr::Rbx);
    ctx.asm.jcc(Cond::Le, done);
    ctx.asm.test_ri(Gpr::Rbx, 1);
    ctx.asm.jcc(Cond::Z, skip_mul);
    ctx.asm.imul_rr(Gpr::Rax, Gpr::R12);
    ctx.asm.mark_label(skip_mul);
    ctx.asm.imul_rr(Gpr::R12, Gpr::R12);
    ctx.asm.sar_ri(Gpr::Rbx, 1);
    ctx.asm.jmp(loop_start);
    ctx.asm.mark_label(done);

    ctx.asm.pop(Gpr::R12);
    ctx.asm.pop(Gpr::Rbx);
    Ok(())
}

/// `ISqrt(n)`: hardware square root through a double for n < 2^53, where
/// the conversion is exact; Newton's method above that.
fn compile_isqrt(ctx: &mut Context, args: &[Node], span: Span) -> CodegenResult<()> {
    compile_one(ctx, args, span, "ISqrt")?;
    trace!("ISqrt: SSE2 fast path with Newton fallback");

    let non_positive = ctx.asm.create_label();
    let large = ctx.asm.create_label();
    let done = ctx.asm.create_label();

    ctx.asm.test_rr(Gpr::Rax, Gpr::Rax);
    ctx.asm.jcc(Cond::Le, non_positive);
    ctx.asm.mov_ri(Gpr::Rcx, 1 << 53);
    ctx.asm.cmp_rr(Gpr::Rax, Gpr::Rcx);
    ctx.asm.jcc(Cond::Ae, large);

    ctx.asm.cvtsi2sd(Xmm::Xmm0, Gpr::Rax);
    ctx.asm.sqrtsd(Xmm::Xmm0, Xmm::Xmm0);
    ctx.asm.cvttsd2si(Gpr::Rax, Xmm::Xmm0);
    ctx.asm.jmp(done);

    ctx.asm.mark_label(non_positive);
    ctx.asm.xor_rr(Gpr::Rax, Gpr::Rax);
    ctx.asm.jmp(done);

    // Newton's method: estimate from the bit length, iterate until the
    // estimate stops shrinking, then correct the final overestimate.
    ctx.asm.mark_label(large);
    ctx.asm.push(Gpr::R12);
    ctx.asm.push(Gpr::R13);
    ctx.asm.push(Gpr::R14);
    ctx.asm.mov_rr(Gpr::R14, Gpr::Rax);
    ctx.asm.bsr(Gpr::Rcx, Gpr::Rax);
    ctx.asm.inc(Gpr::Rcx);
    ctx.asm.shr_ri(Gpr::Rcx, 1);
    ctx.asm.mov_ri(Gpr::Rax, 1);
    ctx.asm.shl_cl(Gpr::Rax);
    ctx.asm.mov_rr(Gpr::R12, Gpr::Rax);
    ctx.asm.mov_ri(Gpr::R13, i64::MAX);

    let newton_loop = ctx.asm.create_label();
    let newton_done = ctx.asm.create_label();
    let no_dec = ctx.asm.create_label();
    ctx.asm.mark_label(newton_loop);
    ctx.asm.cmp_rr(Gpr::R12, Gpr::R13);
    ctx.asm.jcc(Cond::Ae, newton_done);
    ctx.asm.mov_rr(Gpr::R13, Gpr::R12);
    ctx.asm.mov_rr(Gpr::Rax, Gpr::R14);
    ctx.asm.xor_rr(Gpr::Rdx, Gpr::Rdx);
    ctx.asm.div(Gpr::R12);
    ctx.asm.add_rr(Gpr::Rax, Gpr::R12);
    ctx.asm.shr_ri(Gpr::Rax, 1);
    ctx.asm.mov_rr(Gpr::R12, Gpr::Rax);
    ctx.asm.jmp(newton_loop);

    ctx.asm.mark_label(newton_done);
    ctx.asm.mov_rr(Gpr::Rax, Gpr::R14);
    ctx.asm.xor_rr(Gpr::Rdx, Gpr::Rdx);
    ctx.asm.div(Gpr::R12);
    ctx.asm.cmp_rr(Gpr::R12, Gpr::Rax);
    ctx.asm.jcc(Cond::Be, no_dec);
    ctx.asm.dec(Gpr::R12);
    ctx.asm.mark_label(no_dec);
    ctx.asm.mov_rr(Gpr::Rax, Gpr::R12);
    ctx.asm.pop(Gpr::R14);
    ctx.asm.pop(Gpr::R13);
    ctx.asm.pop(Gpr::R12);

    ctx.asm.mark_label(done);
    Ok(())
}

/// Floor division: quotient rounded toward negative infinity.
fn compile_floor_divide(ctx: &mut Context, args: &[Node], span: Span) -> CodegenResult<()> {
    let (a, b) = match args {
        [a, b] => (a, b),
        _ => return shape_error("FloorDivide requires two arguments", span),
    };
    ctx.asm.push(Gpr::Rbx);
    compile_expression(ctx, b)?;
    ctx.asm.push(Gpr::Rax);
    compile_expression(ctx, a)?;
    ctx.asm.pop(Gpr::Rbx);
    ctx.asm.cqo();
    ctx.asm.idiv(Gpr::Rbx);
    // Truncation and floor differ exactly when the division was inexact
    // and the signs differ (remainder sign ^ divisor sign).
    let done = ctx.asm.create_label();
    ctx.asm.test_rr(Gpr::Rdx, Gpr::Rdx);
    ctx.asm.jcc(Cond::Z, done);
    ctx.asm.mov_rr(Gpr::Rcx, Gpr::Rdx);
    ctx.asm.xor_rr(Gpr::Rcx, Gpr::Rbx);
    ctx.asm.test_rr(Gpr::Rcx, Gpr::Rcx);
    ctx.asm.jcc(Cond::Ns, done);
    ctx.asm.dec(Gpr::Rax);
    ctx.asm.mark_label(done);
    ctx.asm.pop(Gpr::Rbx);
    Ok(())
}

/// Floor modulus: result has the divisor's sign.
fn compile_remainder(ctx: &mut Context, args: &[Node], span: Span) -> CodegenResult<()> {
    let (a, b) = match args {
        [a, b] => (a, b),
        _ => return shape_error("Remainder requires two arguments", span),
    };
    ctx.asm.push(Gpr::Rbx);
    compile_expression(ctx, b)?;
    ctx.asm.push(Gpr::Rax);
    compile_expression(ctx, a)?;
    ctx.asm.pop(Gpr::Rbx);
    ctx.asm.cqo();
    ctx.asm.idiv(Gpr::Rbx);
    ctx.asm.mov_rr(Gpr::Rax, Gpr::Rdx);
    let done = ctx.asm.create_label();
    ctx.asm.test_rr(Gpr::Rax, Gpr::Rax);
    ctx.asm.jcc(Cond::Z, done);
    ctx.asm.mov_rr(Gpr::Rcx, Gpr::Rax);
    ctx.asm.xor_rr(Gpr::Rcx, Gpr::Rbx);
    ctx.asm.test_rr(Gpr::Rcx, Gpr::Rcx);
    ctx.asm.jcc(Cond::Ns, done);
    ctx.asm.add_rr(Gpr::Rax, Gpr::Rbx);
    ctx.asm.mark_label(done);
    ctx.asm.pop(Gpr::Rbx);
    Ok(())
}

/// `FusedMultiplyAdd(a, b, c)` = `a*b + c` in one lowering.
fn compile_fma(ctx: &mut Context, args: &[Node], span: Span) -> CodegenResult<()> {
    let (a, b, c) = match args {
        [a, b, c] => (a, b, c),
        _ => return shape_error("FusedMultiplyAdd requires three arguments", span),
    };
    compile_expression(ctx, a)?;
    ctx.asm.push(Gpr::Rax);
    compile_expression(ctx, b)?;
    ctx.asm.push(Gpr::Rax);
    compile_expression(ctx, c)?;
    ctx.asm.mov_rr(Gpr::Rcx, Gpr::Rax);
    ctx.asm.pop(Gpr::Rdx);
    ctx.asm.pop(Gpr::Rax);
    ctx.asm.imul_rr(Gpr::Rax, Gpr::Rdx);
    ctx.asm.add_rr(Gpr::Rax, Gpr::Rcx);
    Ok(())
}

/// `Hypotenuse(a, b)` = `isqrt(a² + b²)` through the double fast path.
fn compile_hypot(ctx: &mut Context, args: &[Node], span: Span) -> CodegenResult<()> {
    compile_two_rcx_rax(ctx, args, span, "Hypotenuse")?;
    ctx.asm.imul_rr(Gpr::Rax, Gpr::Rax);
    ctx.asm.imul_rr(Gpr::Rcx, Gpr::Rcx);
    ctx.asm.add_rr(Gpr::Rax, Gpr::Rcx);
    ctx.asm.cvtsi2sd(Xmm::Xmm0, Gpr::Rax);
    ctx.asm.sqrtsd(Xmm::Xmm0, Xmm::Xmm0);
    ctx.asm.cvttsd2si(Gpr::Rax, Xmm::Xmm0);
    Ok(())
}

/// `Lerp(a, b, t)` with t in ×10000 fixed-point:
/// `a + (b - a) * t / 10000`.
fn compile_lerp(ctx: &mut Context, args: &[Node], span: Span) -> CodegenResult<()> {
    let (a, b, t) = match args {
        [a, b, t] => (a, b, t),
        _ => return shape_error("Lerp requires three arguments", span),
    };
    compile_expression(ctx, a)?;
    ctx.asm.push(Gpr::Rax);
    compile_expression(ctx, b)?;
    ctx.asm.push(Gpr::Rax);
    compile_expression(ctx, t)?;
    ctx.asm.mov_rr(Gpr::Rcx, Gpr::Rax);
    ctx.asm.pop(Gpr::Rdx); // b
    ctx.asm.pop(Gpr::Rax); // a
    ctx.asm.push(Gpr::Rax);
    ctx.asm.sub_rr(Gpr::Rdx, Gpr::Rax);
    ctx.asm.mov_rr(Gpr::Rax, Gpr::Rdx);
    ctx.asm.imul_rr(Gpr::Rax, Gpr::Rcx);
    ctx.asm.cqo();
    ctx.asm.mov_ri(Gpr::Rcx, FIXED_POINT_SCALE as i64);
    ctx.asm.idiv(Gpr::Rcx);
    ctx.asm.pop(Gpr::Rdx);
    ctx.asm.add_rr(Gpr::Rax, Gpr::Rdx);
    Ok(())
}

fn compile_rotate(ctx: &mut Context, args: &[Node], span: Span, left: bool) -> CodegenResult<()> {
    let name = if left { "RotateLeft" } else { "RotateRight" };
    let (value, count) = match args {
        [value, count] => (value, count),
        _ => return shape_error(format!("{name} requires two arguments"), span),
    };
    compile_expression(ctx, count)?;
    ctx.asm.push(Gpr::Rax);
    compile_expression(ctx, value)?;
    ctx.asm.pop(Gpr::Rcx);
    if left {
        ctx.asm.rol_cl(Gpr::Rax);
    } else {
        ctx.asm.ror_cl(Gpr::Rax);
    }
    Ok(())
}

/// `AlignUp(v, a)` = `(v + a - 1) & !(a - 1)`; `AlignDown(v, a)` =
/// `v & !(a - 1)`. Alignments are powers of two.
fn compile_align(ctx: &mut Context, args: &[Node], span: Span, up: bool) -> CodegenResult<()> {
    let name = if up { "AlignUp" } else { "AlignDown" };
    let (value, alignment) = match args {
        [value, alignment] => (value, alignment),
        _ => return shape_error(format!("{name} requires two arguments"), span),
    };
    compile_expression(ctx, alignment)?;
    ctx.asm.push(Gpr::Rax);
    compile_expression(ctx, value)?;
    ctx.asm.pop(Gpr::Rcx);
    ctx.asm.dec(Gpr::Rcx);
    if up {
        ctx.asm.add_rr(Gpr::Rax, Gpr::Rcx);
    }
    ctx.asm.not(Gpr::Rcx);
    ctx.asm.and_rr(Gpr::Rax, Gpr::Rcx);
    Ok(())
}

fn compile_is_power_of_two(ctx: &mut Context, args: &[Node], span: Span) -> CodegenResult<()> {
    compile_one(ctx, args, span, "IsPowerOfTwo")?;
    // Zero is not a power of two, and already holds the right answer.
    let done = ctx.asm.create_label();
    ctx.asm.test_rr(Gpr::Rax, Gpr::Rax);
    ctx.asm.jcc(Cond::Z, done);
    ctx.asm.mov_rr(Gpr::Rcx, Gpr::Rax);
    ctx.asm.dec(Gpr::Rcx);
    ctx.asm.and_rr(Gpr::Rax, Gpr::Rcx);
    ctx.asm.test_rr(Gpr::Rax, Gpr::Rax);
    ctx.asm.setcc_bool(Cond::Z);
    ctx.asm.mark_label(done);
    Ok(())
}

fn compile_next_power_of_two(ctx: &mut Context, args: &[Node], span: Span) -> CodegenResult<()> {
    compile_one(ctx, args, span, "NextPowerOfTwo")?;
    // Smear the highest set bit rightward, then step past it.
    ctx.asm.dec(Gpr::Rax);
    for shift in [1u8, 2, 4, 8, 16, 32] {
        ctx.asm.mov_rr(Gpr::Rcx, Gpr::Rax);
        ctx.asm.shr_ri(Gpr::Rcx, shift);
        ctx.asm.or_rr(Gpr::Rax, Gpr::Rcx);
    }
    ctx.asm.inc(Gpr::Rax);
    Ok(())
}

fn compile_floor_log2(ctx: &mut Context, args: &[Node], span: Span) -> CodegenResult<()> {
    compile_one(ctx, args, span, "FloorLog2")?;
    let done = ctx.asm.create_label();
    ctx.asm.test_rr(Gpr::Rax, Gpr::Rax);
    ctx.asm.jcc(Cond::Z, done);
    ctx.asm.bsr(Gpr::Rax, Gpr::Rax);
    ctx.asm.mark_label(done);
    Ok(())
}

// x87 fixed-point helpers. Each transcendental lowering brackets its FPU
// work with `fpu_enter`/`fpu_leave`: a 16-byte stack scratch area holds
// the integer operand on the way in and the result on the way out, plus
// the small constants pushed through `fild_const`.

/// Reserve scratch space and load RAX onto the FPU stack.
fn fpu_enter(ctx: &mut Context) {
    ctx.asm.sub_ri(Gpr::Rsp, 16);
    ctx.asm.store(Mem::base(Gpr::Rsp), Gpr::Rax);
    ctx.asm.fild64(Mem::base(Gpr::Rsp));
}

/// Pop the FPU result back into RAX and release the scratch space.
fn fpu_leave(ctx: &mut Context) {
    ctx.asm.fistp64(Mem::base(Gpr::Rsp));
    ctx.asm.load(Gpr::Rax, Mem::base(Gpr::Rsp));
    ctx.asm.add_ri(Gpr::Rsp, 16);
}

/// Push a small integer constant onto the FPU stack via the scratch slot.
fn fild_const(ctx: &mut Context, value: i32) {
    ctx.asm.store_imm32(Mem::base(Gpr::Rsp), value);
    ctx.asm.fild64(Mem::base(Gpr::Rsp));
}

/// ST(0) /= 10000 — fixed-point input to a real value.
fn fpu_scale_down(ctx: &mut Context) {
    fild_const(ctx, FIXED_POINT_SCALE);
    ctx.asm.fdivp();
}

/// ST(0) *= 10000 — real value to fixed-point output.
fn fpu_scale_up(ctx: &mut Context) {
    fild_const(ctx, FIXED_POINT_SCALE);
    ctx.asm.fmulp();
}

/// ST(0) = ST(0) * π / 180.
fn fpu_deg_to_rad(ctx: &mut Context) {
    ctx.asm.fldpi();
    fild_const(ctx, 180);
    ctx.asm.fdivp();
    ctx.asm.fmulp();
}

/// ST(0) = ST(0) * 180 / π.
fn fpu_rad_to_deg(ctx: &mut Context) {
    fild_const(ctx, 180);
    ctx.asm.fmulp();
    ctx.asm.fldpi();
    ctx.asm.fdivp();
}

#[derive(Clone, Copy)]
enum Trig {
    Sin,
    Cos,
    Tan,
}

/// `Sin`/`Cos`/`Tan`: degrees in, result ×10000 out.
fn compile_trig(ctx: &mut Context, args: &[Node], span: Span, kind: Trig) -> CodegenResult<()> {
    let name = match kind {
        Trig::Sin => "Sin",
        Trig::Cos => "Cos",
        Trig::Tan => "Tan",
    };
    compile_one(ctx, args, span, name)?;
    fpu_enter(ctx);
    fpu_deg_to_rad(ctx);
    match kind {
        Trig::Sin => ctx.asm.fsin(),
        Trig::Cos => ctx.asm.fcos(),
        Trig::Tan => {
            // FPTAN pushes tan(x) then 1.0; drop the 1.0.
            ctx.asm.fptan();
            ctx.asm.fstp_st0();
        }
    }
    fpu_scale_up(ctx);
    fpu_leave(ctx);
    Ok(())
}

#[derive(Clone, Copy)]
enum Arc {
    Asin,
    Acos,
}

/// `Asin`/`Acos` via `FPATAN`: input ×10000 in [-10000, 10000], degrees
/// out. `asin(x) = atan2(x, sqrt(1-x²))`, `acos(x)` with the operands
/// swapped.
fn compile_arc(ctx: &mut Context, args: &[Node], span: Span, kind: Arc) -> CodegenResult<()> {
    let name = match kind {
        Arc::Asin => "Asin",
        Arc::Acos => "Acos",
    };
    compile_one(ctx, args, span, name)?;
    fpu_enter(ctx);
    fpu_scale_down(ctx);
    // Build sqrt(1 - x²) above x.
    ctx.asm.fld_st0();
    ctx.asm.fmul_st0_st0();
    ctx.asm.fld1();
    ctx.asm.fsubrp();
    ctx.asm.fsqrt();
    if let Arc::Acos = kind {
        ctx.asm.fxch();
    }
    ctx.asm.fpatan();
    fpu_rad_to_deg(ctx);
    fpu_leave(ctx);
    Ok(())
}

/// `Atan`: input ×10000, degrees out. `atan(x) = atan2(x, 1)`.
fn compile_atan(ctx: &mut Context, args: &[Node], span: Span) -> CodegenResult<()> {
    compile_one(ctx, args, span, "Atan")?;
    fpu_enter(ctx);
    fpu_scale_down(ctx);
    ctx.asm.fld1();
    ctx.asm.fpatan();
    fpu_rad_to_deg(ctx);
    fpu_leave(ctx);
    Ok(())
}

/// `Atan2(y, x)`: plain integers in, degrees out.
fn compile_atan2(ctx: &mut Context, args: &[Node], span: Span) -> CodegenResult<()> {
    let (y, x) = match args {
        [y, x] => (y, x),
        _ => return shape_error("Atan2 requires two arguments", span),
    };
    compile_expression(ctx, y)?;
    ctx.asm.push(Gpr::Rax);
    compile_expression(ctx, x)?;
    ctx.asm.push(Gpr::Rax);
    ctx.asm.sub_ri(Gpr::Rsp, 16);
    ctx.asm.fild64(Mem::base_disp(Gpr::Rsp, 24)); // y
    ctx.asm.fild64(Mem::base_disp(Gpr::Rsp, 16)); // x
    ctx.asm.fpatan();
    fpu_rad_to_deg(ctx);
    ctx.asm.fistp64(Mem::base(Gpr::Rsp));
    ctx.asm.load(Gpr::Rax, Mem::base(Gpr::Rsp));
    ctx.asm.add_ri(Gpr::Rsp, 32);
    Ok(())
}

#[derive(Clone, Copy)]
enum ExpKind {
    Natural,
    Base2,
    NaturalMinusOne,
}

/// The exponential family: input and output both ×10000 fixed-point.
/// `2^y` comes from splitting y into integer and fractional halves so
/// `F2XM1` stays in its [-1, 1] domain, then rejoining with `FSCALE`.
fn compile_exp(ctx: &mut Context, args: &[Node], span: Span, kind: ExpKind) -> CodegenResult<()> {
    let name = match kind {
        ExpKind::Natural => "Exp",
        ExpKind::Base2 => "Exp2",
        ExpKind::NaturalMinusOne => "Expm1",
    };
    compile_one(ctx, args, span, name)?;
    fpu_enter(ctx);
    fpu_scale_down(ctx);
    if !matches!(kind, ExpKind::Base2) {
        // e^x = 2^(x * log2(e))
        ctx.asm.fldl2e();
        ctx.asm.fmulp();
    }
    ctx.asm.fld_st0();
    ctx.asm.frndint();
    ctx.asm.fxch();
    ctx.asm.fsub_st0_st1();
    ctx.asm.f2xm1();
    ctx.asm.fld1();
    ctx.asm.faddp();
    ctx.asm.fscale();
    ctx.asm.fstp_st1();
    if matches!(kind, ExpKind::NaturalMinusOne) {
        ctx.asm.fld1();
        ctx.asm.fsubp();
    }
    fpu_scale_up(ctx);
    fpu_leave(ctx);
    Ok(())
}

#[derive(Clone, Copy)]
enum LogKind {
    Natural,
    Base2,
    Base10,
}

/// The logarithm family by `FYL2X`: input ×10000 (positive), output
/// ×10000. The base conversion rides in as the Y operand: ln(2),
/// log10(2), or 1.
fn compile_log(ctx: &mut Context, args: &[Node], span: Span, kind: LogKind) -> CodegenResult<()> {
    let name = match kind {
        LogKind::Natural => "Log",
        LogKind::Base2 => "Log2",
        LogKind::Base10 => "Log10",
    };
    compile_one(ctx, args, span, name)?;
    fpu_enter(ctx);
    fpu_scale_down(ctx);
    match kind {
        LogKind::Natural => ctx.asm.fldln2(),
        LogKind::Base2 => ctx.asm.fld1(),
        LogKind::Base10 => ctx.asm.fldlg2(),
    }
    ctx.asm.fxch();
    ctx.asm.fyl2x();
    fpu_scale_up(ctx);
    fpu_leave(ctx);
    Ok(())
}

/// `Log1p(x)` by `FYL2XP1`, which keeps precision near zero.
fn compile_log1p(ctx: &mut Context, args: &[Node], span: Span) -> CodegenResult<()> {
    compile_one(ctx, args, span, "Log1p")?;
    fpu_enter(ctx);
    fpu_scale_down(ctx);
    ctx.asm.fldln2();
    ctx.asm.fxch();
    ctx.asm.fyl2xp1();
    fpu_scale_up(ctx);
    fpu_leave(ctx);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::Options;

    fn compile(function: &str, args: Vec<Node>) -> Vec<u8> {
        let mut ctx = Context::new(Options::default(), None);
        let handled = compile_operation(&mut ctx, function, &args, Span::NONE).unwrap();
        assert!(handled, "{function} not routed");
        ctx.asm.resolve_jumps().unwrap();
        ctx.asm.code
    }

    fn contains(haystack: &[u8], needle: &[u8]) -> bool {
        haystack.windows(needle.len()).any(|w| w == needle)
    }

    #[test]
    fn abs_is_branchless() {
        let code = compile("Abs", vec![Node::number(-5)]);
        // MOV RCX, RAX; SAR RCX, 63; XOR RAX, RCX; SUB RAX, RCX.
        let tail: [u8; 13] = [
            0x48, 0x89, 0xC1, 0x48, 0xC1, 0xF9, 0x3F, 0x48, 0x31, 0xC8, 0x48, 0x29, 0xC8,
        ];
        assert_eq!(&code[code.len() - 13..], &tail);
    }

    #[test]
    fn min_and_max_use_cmov() {
        let code = compile("Min", vec![Node::number(3), Node::number(9)]);
        assert!(contains(&code, &[0x48, 0x0F, 0x4E, 0xC1])); // CMOVLE RAX, RCX
        let code = compile("Max", vec![Node::number(3), Node::number(9)]);
        assert!(contains(&code, &[0x48, 0x0F, 0x4D, 0xC1])); // CMOVGE RAX, RCX
    }

    #[test]
    fn isqrt_has_both_paths() {
        let code = compile("ISqrt", vec![Node::number(144)]);
        assert!(contains(&code, &[0xF2, 0x0F, 0x51, 0xC0])); // SQRTSD
        assert!(contains(&code, &[0x49, 0xF7, 0xF4])); // DIV R12 (Newton)
    }

    #[test]
    fn sin_runs_on_the_fpu_in_fixed_point() {
        let code = compile("Sin", vec![Node::number(90)]);
        assert!(contains(&code, &[0xD9, 0xFE])); // FSIN
        assert!(contains(&code, &[0xD9, 0xEB])); // FLDPI (degree conversion)
        // The ×10000 scale constant is staged through the scratch slot.
        let mut scale = vec![0x48, 0xC7, 0x04, 0x24];
        scale.extend_from_slice(&10000i32.to_le_bytes());
        assert!(contains(&code, &scale));
    }

    #[test]
    fn log_families_share_fyl2x() {
        for op in ["Log", "Log2", "Log10"] {
            let code = compile(op, vec![Node::number(10000)]);
            assert!(contains(&code, &[0xD9, 0xF1]), "{op} missing FYL2X");
        }
        let code = compile("Log1p", vec![Node::number(1)]);
        assert!(contains(&code, &[0xD9, 0xF9])); // FYL2XP1
    }

    #[test]
    fn bit_counting_lowers_to_single_instructions() {
        assert!(contains(
            &compile("PopCount", vec![Node::number(7)]),
            &[0xF3, 0x48, 0x0F, 0xB8, 0xC0]
        ));
        assert!(contains(
            &compile("CountLeadingZeros", vec![Node::number(7)]),
            &[0xF3, 0x48, 0x0F, 0xBD, 0xC0]
        ));
        assert!(contains(
            &compile("CountTrailingZeros", vec![Node::number(8)]),
            &[0xF3, 0x48, 0x0F, 0xBC, 0xC0]
        ));
    }

    #[test]
    fn pow_balances_its_saved_registers() {
        let code = compile("Pow", vec![Node::number(3), Node::number(5)]);
        let count = |needle: &[u8]| code.windows(needle.len()).filter(|w| *w == needle).count();
        assert_eq!(count(&[0x41, 0x54]), count(&[0x41, 0x5C])); // PUSH/POP R12
        assert_eq!(count(&[0x53]), count(&[0x5B])); // PUSH/POP RBX
    }

    #[test]
    fn rounding_family_is_identity_on_integers() {
        let plain = {
            let mut ctx = Context::new(Options::default(), None);
            compile_expression(&mut ctx, &Node::number(41)).unwrap();
            ctx.asm.code
        };
        for op in ["Floor", "Ceil", "Round", "RoundEven", "Trunc"] {
            assert_eq!(compile(op, vec![Node::number(41)]), plain, "{op}");
        }
    }
}
