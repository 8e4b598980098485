//! Arithmetic, bitwise, comparison and logical operator lowerings.
//!
//! Every binary operator routes through one helper that implements the
//! depth-aware register discipline: at nesting depth 0 the right operand is
//! parked in R12 (saved around the use), at depth 1 in R13, and at depth 2
//! and beyond it spills to the stack. R14 and R15 are never scratch — R15
//! is the pool base and R14 stays callee-saved for the surrounding frame.
//! The operator itself then runs with the left operand in RAX and the right
//! in RBX.
//!
//! Division and modulo by compile-time constants are strength-reduced:
//! ±1 to identity/negate, powers of two to arithmetic shifts with the
//! negative-dividend adjustment, the fixed divisor table to a magic
//! multiply, and everything else to `CQO; IDIV`.

use crate::asm::{Cond, Gpr};
use crate::context::Context;
use crate::divconst::table_magic;
use crate::expr::compile_expression;
use crate::result::{shape_error, CodegenError, CodegenResult};
use ailang_ast::{Node, Span};
use log::trace;

/// Lower `function(arguments…)` if it is an arithmetic/bitwise/comparison/
/// logical operation. Returns `Ok(false)` when the name is not ours.
pub(crate) fn compile_operation(
    ctx: &mut Context,
    function: &str,
    args: &[Node],
    span: Span,
) -> CodegenResult<bool> {
    match function {
        "Add" => binary(ctx, args, span, |a| a.add_rr(Gpr::Rax, Gpr::Rbx))?,
        "Subtract" => binary(ctx, args, span, |a| a.sub_rr(Gpr::Rax, Gpr::Rbx))?,
        "Multiply" => binary(ctx, args, span, |a| a.imul_rr(Gpr::Rax, Gpr::Rbx))?,
        "Divide" => compile_divide(ctx, args, span)?,
        "Modulo" => compile_modulo(ctx, args, span)?,
        "Power" => compile_power(ctx, args, span)?,
        "BitwiseAnd" => binary(ctx, args, span, |a| a.and_rr(Gpr::Rax, Gpr::Rbx))?,
        "BitwiseOr" => binary(ctx, args, span, |a| a.or_rr(Gpr::Rax, Gpr::Rbx))?,
        "BitwiseXor" => binary(ctx, args, span, |a| a.xor_rr(Gpr::Rax, Gpr::Rbx))?,
        "BitwiseNot" => {
            let arg = one_arg(args, span, "BitwiseNot")?;
            compile_expression(ctx, arg)?;
            ctx.asm.not(Gpr::Rax);
        }
        "LeftShift" => compile_shift(ctx, args, span, ShiftKind::Left)?,
        "RightShift" => compile_shift(ctx, args, span, ShiftKind::Right)?,
        "LessThan" => compare(ctx, args, span, Cond::L)?,
        "GreaterThan" => compare(ctx, args, span, Cond::G)?,
        "LessEqual" => compare(ctx, args, span, Cond::Le)?,
        "GreaterEqual" => compare(ctx, args, span, Cond::Ge)?,
        "EqualTo" => compare(ctx, args, span, Cond::E)?,
        "NotEqual" => compare(ctx, args, span, Cond::Ne)?,
        "And" => compile_logical_and(ctx, args, span)?,
        "Or" => compile_logical_or(ctx, args, span)?,
        "Not" => {
            let arg = one_arg(args, span, "Not")?;
            compile_expression(ctx, arg)?;
            ctx.asm.test_rr(Gpr::Rax, Gpr::Rax);
            ctx.asm.setcc_bool(Cond::Z);
        }
        _ => return Ok(false),
    }
    Ok(true)
}

fn one_arg<'n>(args: &'n [Node], span: Span, name: &str) -> CodegenResult<&'n Node> {
    match args {
        [a] => Ok(a),
        _ => shape_error(format!("{name} expects exactly 1 argument"), span),
    }
}

fn two_args<'n>(args: &'n [Node], span: Span, name: &str) -> CodegenResult<(&'n Node, &'n Node)> {
    match args {
        [a, b] => Ok((a, b)),
        _ => shape_error(format!("{name} expects exactly 2 arguments"), span),
    }
}

#[derive(Clone, Copy, PartialEq)]
enum DepthReg {
    R12,
    R13,
    Stack,
}

fn depth_reg(depth: u32) -> DepthReg {
    match depth {
        0 => DepthReg::R12,
        1 => DepthReg::R13,
        _ => DepthReg::Stack,
    }
}

/// Evaluate a binary operator's operands into RAX (left) and RBX (right)
/// under the depth discipline, then let `op` emit the operation.
fn binary(
    ctx: &mut Context,
    args: &[Node],
    span: Span,
    op: impl FnOnce(&mut crate::asm::Assembler),
) -> CodegenResult<()> {
    let (lhs, rhs) = two_args(args, span, "binary operator")?;
    stage_operands(ctx, lhs, rhs)?;
    op(&mut ctx.asm);
    Ok(())
}

fn stage_operands(ctx: &mut Context, lhs: &Node, rhs: &Node) -> CodegenResult<()> {
    let reg = depth_reg(ctx.binop_depth);
    trace!("binary operands via {:?} at depth {}", reg_name(reg), ctx.binop_depth);
    ctx.binop_depth += 1;
    let result = stage_operands_inner(ctx, lhs, rhs, reg);
    if ctx.binop_depth == 0 {
        return Err(CodegenError::Internal(
            "binary-operator depth underflow".to_string(),
        ));
    }
    ctx.binop_depth -= 1;
    result
}

fn stage_operands_inner(
    ctx: &mut Context,
    lhs: &Node,
    rhs: &Node,
    reg: DepthReg,
) -> CodegenResult<()> {
    match reg {
        DepthReg::Stack => {
            compile_expression(ctx, rhs)?;
            ctx.asm.push(Gpr::Rax);
            compile_expression(ctx, lhs)?;
            ctx.asm.pop(Gpr::Rbx);
        }
        DepthReg::R12 | DepthReg::R13 => {
            let scratch = if reg == DepthReg::R12 { Gpr::R12 } else { Gpr::R13 };
            ctx.asm.push(scratch);
            compile_expression(ctx, rhs)?;
            ctx.asm.mov_rr(scratch, Gpr::Rax);
            compile_expression(ctx, lhs)?;
            ctx.asm.mov_rr(Gpr::Rbx, scratch);
            ctx.asm.pop(scratch);
        }
    }
    Ok(())
}

fn reg_name(reg: DepthReg) -> &'static str {
    match reg {
        DepthReg::R12 => "R12",
        DepthReg::R13 => "R13",
        DepthReg::Stack => "stack",
    }
}

fn compare(ctx: &mut Context, args: &[Node], span: Span, cc: Cond) -> CodegenResult<()> {
    binary(ctx, args, span, |a| {
        a.cmp_rr(Gpr::Rax, Gpr::Rbx);
        a.setcc_bool(cc);
    })
}

fn const_divisor(node: &Node) -> Option<i64> {
    match node {
        Node::Number { value, .. } => Some(*value),
        _ => None,
    }
}

fn compile_divide(ctx: &mut Context, args: &[Node], span: Span) -> CodegenResult<()> {
    let (dividend, divisor) = two_args(args, span, "Divide")?;
    if let Some(d) = const_divisor(divisor) {
        match d {
            0 => return shape_error("division by zero", span),
            1 => return compile_expression(ctx, dividend),
            -1 => {
                compile_expression(ctx, dividend)?;
                ctx.asm.neg(Gpr::Rax);
                return Ok(());
            }
            _ => {}
        }
        if d > 0 && (d & (d - 1)) == 0 {
            return compile_power_of_two_divide(ctx, dividend, d);
        }
        if table_magic(d).is_some() {
            return compile_magic_divide(ctx, dividend, d);
        }
    }
    trace!("Divide: generic IDIV");
    stage_operands(ctx, dividend, divisor)?;
    ctx.asm.cqo();
    ctx.asm.idiv(Gpr::Rbx);
    Ok(())
}

/// Signed division by a power of two: arithmetic shift with the standard
/// negative-dividend adjustment `x += (x >> 63) & (d - 1)`.
fn compile_power_of_two_divide(ctx: &mut Context, dividend: &Node, d: i64) -> CodegenResult<()> {
    let shift = d.trailing_zeros() as u8;
    trace!("Divide by {d}: arithmetic shift right {shift}");
    compile_expression(ctx, dividend)?;
    ctx.asm.mov_rr(Gpr::Rcx, Gpr::Rax);
    ctx.asm.sar_ri(Gpr::Rcx, 63);
    let adjust = d - 1;
    if let Ok(imm) = i32::try_from(adjust) {
        ctx.asm.and_ri(Gpr::Rcx, imm);
    } else {
        ctx.asm.mov_ri(Gpr::Rdx, adjust);
        ctx.asm.and_rr(Gpr::Rcx, Gpr::Rdx);
    }
    ctx.asm.add_rr(Gpr::Rax, Gpr::Rcx);
    ctx.asm.sar_ri(Gpr::Rax, shift);
    Ok(())
}

/// Emit the magic-multiply quotient for the dividend already scheduled:
/// dividend ends in RCX, quotient in RAX.
fn emit_magic_quotient(ctx: &mut Context, d: i64) {
    let m = table_magic(d).expect("divisor vetted by caller");
    ctx.asm.mov_rr(Gpr::Rcx, Gpr::Rax);
    ctx.asm.mov_ri(Gpr::R11, m.mul_by);
    ctx.asm.imul(Gpr::R11);
    if m.mul_by < 0 {
        ctx.asm.add_rr(Gpr::Rdx, Gpr::Rcx);
    }
    ctx.asm.mov_rr(Gpr::Rax, Gpr::Rdx);
    if m.shift_by > 0 {
        ctx.asm.sar_ri(Gpr::Rax, m.shift_by as u8);
    }
    // Truncate toward zero: add the dividend's sign bit.
    ctx.asm.mov_rr(Gpr::Rdx, Gpr::Rcx);
    ctx.asm.shr_ri(Gpr::Rdx, 63);
    ctx.asm.add_rr(Gpr::Rax, Gpr::Rdx);
    if d < 0 {
        ctx.asm.neg(Gpr::Rax);
    }
}

fn compile_magic_divide(ctx: &mut Context, dividend: &Node, d: i64) -> CodegenResult<()> {
    trace!("Divide by {d}: magic multiply");
    compile_expression(ctx, dividend)?;
    emit_magic_quotient(ctx, d);
    Ok(())
}

fn compile_modulo(ctx: &mut Context, args: &[Node], span: Span) -> CodegenResult<()> {
    let (dividend, divisor) = two_args(args, span, "Modulo")?;
    if let Some(d) = const_divisor(divisor) {
        match d {
            0 => return shape_error("modulo by zero", span),
            1 | -1 => {
                compile_expression(ctx, dividend)?;
                ctx.asm.xor_rr(Gpr::Rax, Gpr::Rax);
                return Ok(());
            }
            _ => {}
        }
        if d > 0 && (d & (d - 1)) == 0 {
            return compile_power_of_two_modulo(ctx, dividend, d);
        }
        if table_magic(d).is_some() {
            trace!("Modulo by {d}: magic multiply");
            compile_expression(ctx, dividend)?;
            emit_magic_quotient(ctx, d);
            // remainder = x - q*d; dividend is still in RCX.
            ctx.asm.imul_rri(Gpr::Rax, Gpr::Rax, d as i32);
            ctx.asm.sub_rr(Gpr::Rcx, Gpr::Rax);
            ctx.asm.mov_rr(Gpr::Rax, Gpr::Rcx);
            return Ok(());
        }
    }
    trace!("Modulo: generic IDIV");
    stage_operands(ctx, dividend, divisor)?;
    ctx.asm.cqo();
    ctx.asm.idiv(Gpr::Rbx);
    ctx.asm.mov_rr(Gpr::Rax, Gpr::Rdx);
    Ok(())
}

/// Modulo by a power of two with C sign semantics: take the absolute
/// value, mask, then restore the dividend's sign.
fn compile_power_of_two_modulo(ctx: &mut Context, dividend: &Node, d: i64) -> CodegenResult<()> {
    let mask = d - 1;
    trace!("Modulo by {d}: AND with {mask}");
    compile_expression(ctx, dividend)?;
    ctx.asm.mov_rr(Gpr::Rcx, Gpr::Rax);
    // abs(x) = (x ^ (x >> 63)) - (x >> 63)
    ctx.asm.mov_rr(Gpr::Rdx, Gpr::Rax);
    ctx.asm.sar_ri(Gpr::Rdx, 63);
    ctx.asm.xor_rr(Gpr::Rax, Gpr::Rdx);
    ctx.asm.sub_rr(Gpr::Rax, Gpr::Rdx);
    if let Ok(imm) = i32::try_from(mask) {
        ctx.asm.and_ri(Gpr::Rax, imm);
    } else {
        ctx.asm.mov_ri(Gpr::Rbx, mask);
        ctx.asm.and_rr(Gpr::Rax, Gpr::Rbx);
    }
    // Restore the dividend's sign: (r ^ s) - s with s = x >> 63.
    ctx.asm.sar_ri(Gpr::Rcx, 63);
    ctx.asm.xor_rr(Gpr::Rax, Gpr::Rcx);
    ctx.asm.sub_rr(Gpr::Rax, Gpr::Rcx);
    Ok(())
}

#[derive(Clone, Copy)]
enum ShiftKind {
    Left,
    Right,
}

/// Shifts put the amount in CL; the staging mirrors the depth discipline
/// with the scratch value routed into RCX instead of RBX.
fn compile_shift(ctx: &mut Context, args: &[Node], span: Span, kind: ShiftKind) -> CodegenResult<()> {
    let name = match kind {
        ShiftKind::Left => "LeftShift",
        ShiftKind::Right => "RightShift",
    };
    let (value, amount) = two_args(args, span, name)?;
    let reg = depth_reg(ctx.binop_depth);
    ctx.binop_depth += 1;
    let result = (|| {
        match reg {
            DepthReg::Stack => {
                compile_expression(ctx, amount)?;
                ctx.asm.push(Gpr::Rax);
                compile_expression(ctx, value)?;
                ctx.asm.pop(Gpr::Rcx);
            }
            DepthReg::R12 | DepthReg::R13 => {
                let scratch = if reg == DepthReg::R12 { Gpr::R12 } else { Gpr::R13 };
                ctx.asm.push(scratch);
                compile_expression(ctx, amount)?;
                ctx.asm.mov_rr(scratch, Gpr::Rax);
                compile_expression(ctx, value)?;
                ctx.asm.mov_rr(Gpr::Rcx, scratch);
                ctx.asm.pop(scratch);
            }
        }
        match kind {
            ShiftKind::Left => ctx.asm.shl_cl(Gpr::Rax),
            ShiftKind::Right => ctx.asm.sar_cl(Gpr::Rax),
        }
        Ok(())
    })();
    ctx.binop_depth -= 1;
    result
}

/// Exponentiation by a counted multiply loop; base and exponent hold R12
/// and R13 regardless of depth, saved around the whole lowering.
fn compile_power(ctx: &mut Context, args: &[Node], span: Span) -> CodegenResult<()> {
    let (base, exponent) = two_args(args, span, "Power")?;
    ctx.asm.push(Gpr::R12);
    ctx.asm.push(Gpr::R13);
    ctx.binop_depth += 1;
    let result = (|| {
        compile_expression(ctx, exponent)?;
        ctx.asm.mov_rr(Gpr::R13, Gpr::Rax);
        compile_expression(ctx, base)?;
        ctx.asm.mov_rr(Gpr::R12, Gpr::Rax);
        ctx.asm.mov_ri(Gpr::Rax, 1);

        let loop_start = ctx.asm.create_label();
        let loop_end = ctx.asm.create_label();
        ctx.asm.mark_label(loop_start);
        ctx.asm.test_rr(Gpr::R13, Gpr::R13);
        ctx.asm.jcc(Cond::Z, loop_end);
        ctx.asm.imul_rr(Gpr::Rax, Gpr::R12);
        ctx.asm.dec(Gpr::R13);
        ctx.asm.jmp(loop_start);
        ctx.asm.mark_label(loop_end);
        Ok(())
    })();
    ctx.binop_depth -= 1;
    ctx.asm.pop(Gpr::R13);
    ctx.asm.pop(Gpr::R12);
    result
}

fn compile_logical_and(ctx: &mut Context, args: &[Node], span: Span) -> CodegenResult<()> {
    let (lhs, rhs) = two_args(args, span, "And")?;
    let false_label = ctx.asm.create_label();
    let end_label = ctx.asm.create_label();
    ctx.binop_depth += 1;
    let result = (|| {
        compile_expression(ctx, lhs)?;
        ctx.asm.test_rr(Gpr::Rax, Gpr::Rax);
        ctx.asm.jcc(Cond::Z, false_label);
        compile_expression(ctx, rhs)?;
        ctx.asm.test_rr(Gpr::Rax, Gpr::Rax);
        ctx.asm.jcc(Cond::Z, false_label);
        ctx.asm.mov_ri(Gpr::Rax, 1);
        ctx.asm.jmp(end_label);
        ctx.asm.mark_label(false_label);
        ctx.asm.mov_ri(Gpr::Rax, 0);
        ctx.asm.mark_label(end_label);
        Ok(())
    })();
    ctx.binop_depth -= 1;
    result
}

fn compile_logical_or(ctx: &mut Context, args: &[Node], span: Span) -> CodegenResult<()> {
    let (lhs, rhs) = two_args(args, span, "Or")?;
    let true_label = ctx.asm.create_label();
    let end_label = ctx.asm.create_label();
    ctx.binop_depth += 1;
    let result = (|| {
        compile_expression(ctx, lhs)?;
        ctx.asm.test_rr(Gpr::Rax, Gpr::Rax);
        ctx.asm.jcc(Cond::Nz, true_label);
        compile_expression(ctx, rhs)?;
        ctx.asm.test_rr(Gpr::Rax, Gpr::Rax);
        ctx.asm.jcc(Cond::Nz, true_label);
        ctx.asm.mov_ri(Gpr::Rax, 0);
        ctx.asm.jmp(end_label);
        ctx.asm.mark_label(true_label);
        ctx.asm.mov_ri(Gpr::Rax, 1);
        ctx.asm.mark_label(end_label);
        Ok(())
    })();
    ctx.binop_depth -= 1;
    result
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::Options;

    fn ctx() -> Context<'static> {
        Context::new(Options::default(), None)
    }

    fn compile(ctx: &mut Context, function: &str, args: Vec<Node>) {
        let handled = compile_operation(ctx, function, &args, Span::NONE).unwrap();
        assert!(handled);
    }

    #[test]
    fn add_at_depth_zero_uses_r12() {
        let mut c = ctx();
        compile(&mut c, "Add", vec![Node::number(2), Node::number(3)]);
        let code = &c.asm.code;
        // PUSH R12; MOV RAX, 3; MOV R12, RAX; MOV RAX, 2; MOV RBX, R12;
        // POP R12; ADD RAX, RBX.
        let mut expected = vec![0x41, 0x54];
        expected.extend_from_slice(&[0x48, 0xB8, 3, 0, 0, 0, 0, 0, 0, 0]);
        expected.extend_from_slice(&[0x49, 0x89, 0xC4]);
        expected.extend_from_slice(&[0x48, 0xB8, 2, 0, 0, 0, 0, 0, 0, 0]);
        expected.extend_from_slice(&[0x4C, 0x89, 0xE3]);
        expected.extend_from_slice(&[0x41, 0x5C]);
        expected.extend_from_slice(&[0x48, 0x01, 0xD8]);
        assert_eq!(code, &expected);
        assert_eq!(c.binop_depth, 0);
    }

    #[test]
    fn nested_operators_step_through_r13_then_stack() {
        let mut c = ctx();
        let inner2 = Node::call("Add", vec![Node::number(1), Node::number(2)]);
        let inner1 = Node::call("Add", vec![inner2, Node::number(3)]);
        let outer = Node::call("Add", vec![inner1, Node::number(4)]);
        if let Node::FunctionCall {
            function,
            arguments,
            ..
        } = outer
        {
            compile(&mut c, &function, arguments);
        }
        let code = c.asm.code.clone();
        // Depth 0 borrows R12, depth 1 borrows R13, depth 2 spills: the
        // deepest Add staged through PUSH RAX … POP RBX.
        let has = |needle: &[u8]| code.windows(needle.len()).any(|w| w == needle);
        assert!(has(&[0x41, 0x54]), "expected PUSH R12");
        assert!(has(&[0x41, 0x55]), "expected PUSH R13");
        assert!(has(&[0x50]), "expected PUSH RAX spill");
        assert!(has(&[0x5B]), "expected POP RBX");
        assert_eq!(c.binop_depth, 0);
        // Pushes of each scratch register balance its pops.
        let count = |needle: &[u8]| code.windows(needle.len()).filter(|w| *w == needle).count();
        assert_eq!(count(&[0x41, 0x54]), count(&[0x41, 0x5C]));
        assert_eq!(count(&[0x41, 0x55]), count(&[0x41, 0x5D]));
    }

    #[test]
    fn divide_by_one_is_identity() {
        let mut c = ctx();
        compile(&mut c, "Divide", vec![Node::number(7), Node::number(1)]);
        assert_eq!(c.asm.code, vec![0x48, 0xB8, 7, 0, 0, 0, 0, 0, 0, 0]);
    }

    #[test]
    fn divide_by_minus_one_negates() {
        let mut c = ctx();
        compile(&mut c, "Divide", vec![Node::number(7), Node::number(-1)]);
        assert_eq!(&c.asm.code[10..], &[0x48, 0xF7, 0xD8]); // NEG RAX
    }

    #[test]
    fn divide_by_power_of_two_shifts() {
        let mut c = ctx();
        compile(&mut c, "Divide", vec![operand(), Node::number(8)]);
        let code = &c.asm.code;
        // Ends with SAR RAX, 3 and contains no IDIV.
        assert_eq!(&code[code.len() - 4..], &[0x48, 0xC1, 0xF8, 0x03]);
        assert!(!code.windows(3).any(|w| w == [0x48, 0xF7, 0xFB]));
    }

    #[test]
    fn divide_by_table_constant_multiplies() {
        let mut c = ctx();
        compile(&mut c, "Divide", vec![operand(), Node::number(10)]);
        let code = &c.asm.code;
        // MOVABS R11, 0x6666666666666667 appears; IDIV does not.
        let magic: [u8; 10] = [0x49, 0xBB, 0x67, 0x66, 0x66, 0x66, 0x66, 0x66, 0x66, 0x66];
        assert!(code.windows(10).any(|w| w == magic));
        assert!(!code.windows(3).any(|w| w == [0x48, 0xF7, 0xFB]));
    }

    #[test]
    fn divide_by_unknown_constant_uses_idiv() {
        let mut c = ctx();
        compile(&mut c, "Divide", vec![Node::number(7), Node::number(11)]);
        assert!(c.asm.code.windows(3).any(|w| w == [0x48, 0xF7, 0xFB]));
    }

    #[test]
    fn division_by_zero_is_rejected() {
        let mut c = ctx();
        let err =
            compile_operation(&mut c, "Divide", &[Node::number(1), Node::number(0)], Span::NONE)
                .unwrap_err();
        assert!(matches!(err, CodegenError::Shape(_)));
    }

    /// A dividend operand; specialization keys on the divisor only.
    fn operand() -> Node {
        Node::number(12345)
    }
}
