//! Control-flow lowerings: conditionals, loops, switch-style dispatch, and
//! structured exception blocks.

use crate::asm::{Cond, Gpr, Mem};
use crate::compile::compile_node;
use crate::context::Context;
use crate::expr::{compile_condition, compile_expression};
use crate::result::{shape_error, CodegenResult};
use ailang_ast::{Case, CatchClause, Node, Span};
use log::{debug, trace};

/// Number of cases at which `Branch` switches from the linear chain to the
/// balanced binary-search tree.
pub(crate) const BINARY_SEARCH_THRESHOLD: usize = 8;

pub(crate) fn compile_if(
    ctx: &mut Context,
    condition: &Node,
    then_body: &[Node],
    else_body: &[Node],
) -> CodegenResult<()> {
    let else_label = ctx.asm.create_label();
    let end_label = ctx.asm.create_label();

    compile_condition(ctx, condition)?;
    ctx.asm.cmp_ri(Gpr::Rax, 0);
    ctx.asm.jcc(Cond::E, else_label);

    for stmt in then_body {
        compile_node(ctx, stmt)?;
    }
    if !else_body.is_empty() {
        ctx.asm.jmp(end_label);
    }
    ctx.asm.mark_label(else_label);
    for stmt in else_body {
        compile_node(ctx, stmt)?;
    }
    ctx.asm.mark_label(end_label);
    Ok(())
}

pub(crate) fn compile_while(ctx: &mut Context, condition: &Node, body: &[Node]) -> CodegenResult<()> {
    let start_label = ctx.asm.create_label();
    let end_label = ctx.asm.create_label();
    ctx.loop_labels.push((start_label, end_label));

    ctx.asm.mark_label(start_label);
    compile_condition(ctx, condition)?;
    ctx.asm.cmp_ri(Gpr::Rax, 0);
    ctx.asm.jcc(Cond::E, end_label);

    let result = (|| {
        for stmt in body {
            compile_node(ctx, stmt)?;
        }
        Ok(())
    })();
    ctx.asm.jmp(start_label);
    ctx.asm.mark_label(end_label);
    ctx.loop_labels.pop();
    result
}

pub(crate) fn compile_break(ctx: &mut Context, span: Span) -> CodegenResult<()> {
    match ctx.loop_labels.last() {
        Some(&(_, end)) => {
            ctx.asm.jmp(end);
            Ok(())
        }
        None => shape_error("BreakLoop used outside of a loop", span),
    }
}

pub(crate) fn compile_continue(ctx: &mut Context, span: Span) -> CodegenResult<()> {
    match ctx.loop_labels.last() {
        Some(&(start, _)) => {
            ctx.asm.jmp(start);
            Ok(())
        }
        None => shape_error("ContinueLoop used outside of a loop", span),
    }
}

/// `Branch`: linear compare-and-branch below the threshold, a balanced
/// binary-search tree of comparisons at or above it. Binary search needs
/// every case value to be an integer literal; anything else forces the
/// linear form.
pub(crate) fn compile_branch(
    ctx: &mut Context,
    expression: &Node,
    cases: &[Case],
    default: &[Node],
) -> CodegenResult<()> {
    let all_integers = cases
        .iter()
        .all(|c| matches!(c.value, Node::Number { .. }));
    if cases.len() >= BINARY_SEARCH_THRESHOLD && all_integers {
        compile_branch_binary_search(ctx, expression, cases, default)
    } else {
        compile_branch_linear(ctx, expression, cases, default)
    }
}

fn compile_branch_linear(
    ctx: &mut Context,
    expression: &Node,
    cases: &[Case],
    default: &[Node],
) -> CodegenResult<()> {
    debug!("Branch: linear chain over {} cases", cases.len());
    compile_expression(ctx, expression)?;
    ctx.asm.push(Gpr::Rax);

    let end_label = ctx.asm.create_label();
    let case_labels: Vec<_> = cases.iter().map(|_| ctx.asm.create_label()).collect();

    for (case, &label) in cases.iter().zip(&case_labels) {
        compile_expression(ctx, &case.value)?;
        ctx.asm.mov_rr(Gpr::Rbx, Gpr::Rax);
        ctx.asm.load(Gpr::Rax, Mem::base(Gpr::Rsp));
        ctx.asm.cmp_rr(Gpr::Rax, Gpr::Rbx);
        ctx.asm.jcc(Cond::E, label);
    }

    for stmt in default {
        compile_node(ctx, stmt)?;
    }
    ctx.asm.jmp(end_label);

    for (case, &label) in cases.iter().zip(&case_labels) {
        ctx.asm.mark_label(label);
        for stmt in &case.body {
            compile_node(ctx, stmt)?;
        }
        ctx.asm.jmp(end_label);
    }

    ctx.asm.mark_label(end_label);
    ctx.asm.pop(Gpr::Rax);
    Ok(())
}

fn compile_branch_binary_search(
    ctx: &mut Context,
    expression: &Node,
    cases: &[Case],
    default: &[Node],
) -> CodegenResult<()> {
    debug!("Branch: binary search over {} cases", cases.len());
    compile_expression(ctx, expression)?;
    ctx.asm.mov_rr(Gpr::Rbx, Gpr::Rax);

    let mut sorted: Vec<(i64, &[Node])> = cases
        .iter()
        .map(|c| match &c.value {
            Node::Number { value, .. } => (*value, c.body.as_slice()),
            _ => unreachable!("caller checked all cases are integers"),
        })
        .collect();
    sorted.sort_by_key(|&(value, _)| value);

    let end_label = ctx.asm.create_label();
    let default_label = ctx.asm.create_label();

    emit_search(ctx, &sorted, end_label, default_label)?;

    ctx.asm.mark_label(default_label);
    for stmt in default {
        compile_node(ctx, stmt)?;
    }
    ctx.asm.mark_label(end_label);
    Ok(())
}

/// Emit one node of the comparison tree: compare the discriminant (in RBX)
/// with the median value, dispatch on equal, recurse left and right.
fn emit_search(
    ctx: &mut Context,
    cases: &[(i64, &[Node])],
    end_label: crate::asm::Label,
    default_label: crate::asm::Label,
) -> CodegenResult<()> {
    if cases.is_empty() {
        ctx.asm.jmp(default_label);
        return Ok(());
    }
    let mid = cases.len() / 2;
    let (mid_value, mid_body) = cases[mid];
    trace!("branch node: {mid_value}");

    let equal_label = ctx.asm.create_label();
    let left_label = ctx.asm.create_label();

    ctx.asm.mov_rr(Gpr::Rax, Gpr::Rbx);
    ctx.asm.mov_ri(Gpr::Rcx, mid_value);
    ctx.asm.cmp_rr(Gpr::Rax, Gpr::Rcx);
    ctx.asm.jcc(Cond::E, equal_label);
    ctx.asm.jcc(Cond::L, left_label);

    // Greater: the upper half falls through here.
    emit_search(ctx, &cases[mid + 1..], end_label, default_label)?;

    ctx.asm.mark_label(left_label);
    emit_search(ctx, &cases[..mid], end_label, default_label)?;

    ctx.asm.mark_label(equal_label);
    for stmt in mid_body {
        compile_node(ctx, stmt)?;
    }
    ctx.asm.jmp(end_label);
    Ok(())
}

/// `Try`/`Catch`/`Finally`.
///
/// The default lowering is straight-line: run the try block, then the
/// finally block; catch clauses are not dispatched because nothing sets an
/// error at runtime. With `Options::full_try_catch`, a per-frame error
/// slot is cleared before the try body, checked after it, and a set flag
/// branches into the first catch clause; the finally block always runs.
pub(crate) fn compile_try(
    ctx: &mut Context,
    body: &[Node],
    catch_clauses: &[CatchClause],
    finally_body: &[Node],
) -> CodegenResult<()> {
    if !ctx.options.full_try_catch {
        for stmt in body {
            compile_node(ctx, stmt)?;
        }
        for stmt in finally_body {
            compile_node(ctx, stmt)?;
        }
        return Ok(());
    }

    let slot = ctx
        .error_flag_slot
        .expect("full try/catch layout reserves the error slot");
    let catch_start = ctx.asm.create_label();
    let finally_label = ctx.asm.create_label();

    // Clear any previous error state.
    ctx.asm.mov_ri(Gpr::Rax, 0);
    ctx.asm.store(Mem::local(slot), Gpr::Rax);

    for stmt in body {
        compile_node(ctx, stmt)?;
    }

    ctx.asm.load(Gpr::Rax, Mem::local(slot));
    ctx.asm.cmp_ri(Gpr::Rax, 0);
    ctx.asm.jcc(Cond::Ne, catch_start);
    ctx.asm.jmp(finally_label);

    ctx.asm.mark_label(catch_start);
    if let Some(clause) = catch_clauses.first() {
        // Only generic dispatch today: the first clause handles the error.
        ctx.asm.mov_ri(Gpr::Rax, 0);
        ctx.asm.store(Mem::local(slot), Gpr::Rax);
        for stmt in &clause.body {
            compile_node(ctx, stmt)?;
        }
    }
    ctx.asm.jmp(finally_label);

    ctx.asm.mark_label(finally_label);
    for stmt in finally_body {
        compile_node(ctx, stmt)?;
    }
    Ok(())
}
