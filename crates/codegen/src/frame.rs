//! Stack frames, the global pool table, and the program entry/exit
//! sequences.
//!
//! The frame-size computation runs at discovery time so a single
//! `SUB RSP, size` covers everything: locals (16 bytes each), a 64-byte
//! print-scratch buffer, 128 bytes of temp space, a 128-byte red zone, the
//! compile-time-constant `Allocate` total, and the ACB table. The pool
//! table is a separate `mmap` region whose base lives in R15 for the whole
//! program.

use crate::asm::{Cond, Gpr, Mem};
use crate::context::Context;
use crate::result::CodegenResult;
use crate::sym::{ScopeId, SymbolKind};
use ailang_ast::{Node, Program};
use log::{debug, warn};

/// Per-actor control block size in bytes.
pub const ACB_SIZE: u32 = 128;
/// Offset of the mailbox word within an ACB.
pub const ACB_MAILBOX_OFFSET: u32 = 120;

const PRINT_SCRATCH: u32 = 64;
const TEMP_SPACE: u32 = 128;
const RED_ZONE: u32 = 128;

fn align16(n: u32) -> u32 {
    (n + 15) & !15
}

/// Register the runtime bookkeeping slots and compute the main frame size.
/// Must run after discovery (all globals known) and before emission.
pub(crate) fn layout_main_frame(ctx: &mut Context, program: &Program) {
    ctx.acb_table_slot = ctx.symbols.register_variable("system_acb_table").offset;
    ctx.current_actor_slot = ctx.symbols.register_variable("system_current_actor").offset;
    if ctx.options.perf_timers {
        ctx.perf_start_slot = Some(ctx.symbols.register_variable("system_perf_start").offset);
    }
    if ctx.options.full_try_catch {
        ctx.error_flag_slot = Some(ctx.symbols.register_variable("system_error_flag").offset);
    }

    let locals = ctx.symbols.frame_locals_bytes(ScopeId(0));
    let allocs = scan_allocate_sizes(&program.declarations);
    let acb_table = ctx.actor_order.len() as u32 * ACB_SIZE;
    let total = locals + PRINT_SCRATCH + TEMP_SPACE + RED_ZONE + allocs + acb_table;
    ctx.main_frame_size = align16(total);
    // The ACB region is the lowest part of the frame.
    ctx.acb_table_offset = ctx.main_frame_size;
    debug!(
        "main frame: {} locals bytes, {} allocate bytes, {} ACB bytes, {} total",
        locals, allocs, acb_table, ctx.main_frame_size
    );
}

/// Frame size for a user-defined function: its locals plus scratch and
/// temp space, 16-aligned.
pub(crate) fn function_frame_size(ctx: &Context, scope: ScopeId) -> u32 {
    align16(ctx.symbols.frame_locals_bytes(scope) + PRINT_SCRATCH + TEMP_SPACE)
}

/// Sum the sizes of `Allocate(n)` calls with compile-time-constant sizes;
/// unknown sizes contribute 1024 bytes of safety slack.
pub(crate) fn scan_allocate_sizes(nodes: &[Node]) -> u32 {
    let mut total = 0u32;
    for node in nodes {
        total = total.saturating_add(scan_node(node));
    }
    total
}

fn scan_node(node: &Node) -> u32 {
    let mut total = 0u32;
    let mut children: Vec<&Node> = Vec::new();
    match node {
        Node::FunctionCall {
            function,
            arguments,
            ..
        } => {
            if function == "Allocate" {
                total += match arguments.first() {
                    Some(Node::Number { value, .. }) => u32::try_from(*value).unwrap_or(1024),
                    _ => 1024,
                };
            }
            children.extend(arguments.iter());
        }
        Node::Assignment { value, .. } => children.push(value),
        Node::Function { body, .. }
        | Node::SubRoutine { body, .. }
        | Node::LoopActor { body, .. } => children.extend(body.iter()),
        Node::If {
            condition,
            then_body,
            else_body,
        } => {
            children.push(condition);
            children.extend(then_body.iter());
            children.extend(else_body.iter());
        }
        Node::While { condition, body } => {
            children.push(condition);
            children.extend(body.iter());
        }
        Node::Branch {
            expression,
            cases,
            default,
        } => {
            children.push(expression);
            for case in cases {
                children.push(&case.value);
                children.extend(case.body.iter());
            }
            children.extend(default.iter());
        }
        Node::Try {
            body,
            catch_clauses,
            finally_body,
        } => {
            children.extend(body.iter());
            for clause in catch_clauses {
                children.extend(clause.body.iter());
            }
            children.extend(finally_body.iter());
        }
        Node::ReturnValue { value: Some(value) } => children.push(value),
        Node::SendMessage { target, value } => {
            children.push(target);
            children.push(value);
        }
        Node::DebugAssert { condition, .. } => children.push(condition),
        _ => {}
    }
    for child in children {
        total = total.saturating_add(scan_node(child));
    }
    total
}

/// `PUSH RBP; MOV RBP, RSP; SUB RSP, size` (size already aligned).
pub(crate) fn emit_prologue(ctx: &mut Context, frame_size: u32) {
    ctx.asm.push(Gpr::Rbp);
    ctx.asm.mov_rr(Gpr::Rbp, Gpr::Rsp);
    if frame_size > 0 {
        ctx.asm.sub_ri(Gpr::Rsp, frame_size as i32);
    }
}

/// `MOV RSP, RBP; POP RBP`.
pub(crate) fn emit_epilogue(ctx: &mut Context) {
    ctx.asm.mov_rr(Gpr::Rsp, Gpr::Rbp);
    ctx.asm.pop(Gpr::Rbp);
}

/// Allocate and zero the global pool table, leaving its base in R15.
///
/// On mmap failure a fixed message goes to fd 2 and the process exits with
/// code 1. R15 is process-global from here on and never saved per call.
fn emit_pool_table_setup(ctx: &mut Context) {
    let num_pools = ctx.symbols.pool_count();
    let size = (num_pools as u64 * 8).div_ceil(4096) * 4096;
    ctx.asm.mov_ri(Gpr::Rax, 9); // mmap
    ctx.asm.mov_ri(Gpr::Rdi, 0);
    ctx.asm.mov_ri(Gpr::Rsi, size as i64);
    ctx.asm.mov_ri(Gpr::Rdx, 3); // PROT_READ | PROT_WRITE
    ctx.asm.mov_ri(Gpr::R10, 0x22); // MAP_PRIVATE | MAP_ANONYMOUS
    ctx.asm.mov_ri(Gpr::R8, -1);
    ctx.asm.mov_ri(Gpr::R9, 0);
    ctx.asm.syscall();

    let ok = ctx.asm.create_label();
    ctx.asm.test_rr(Gpr::Rax, Gpr::Rax);
    ctx.asm.jcc(Cond::Ns, ok);
    // write(2, msg, len); exit(1)
    let msg = "fatal: pool table allocation failed\n";
    let msg_off = ctx.asm.add_string(msg);
    ctx.asm.mov_ri(Gpr::Rax, 1);
    ctx.asm.mov_ri(Gpr::Rdi, 2);
    ctx.asm.load_data_address(Gpr::Rsi, msg_off);
    ctx.asm.mov_ri(Gpr::Rdx, msg.len() as i64);
    ctx.asm.syscall();
    ctx.asm.mov_ri(Gpr::Rax, 60);
    ctx.asm.mov_ri(Gpr::Rdi, 1);
    ctx.asm.syscall();
    ctx.asm.mark_label(ok);

    ctx.asm.mov_rr(Gpr::R15, Gpr::Rax);
    // Zero the table: REP STOSQ over the whole mapping.
    ctx.asm.mov_rr(Gpr::Rdi, Gpr::Rax);
    ctx.asm.mov_ri(Gpr::Rcx, (size / 8) as i64);
    ctx.asm.mov_ri(Gpr::Rax, 0);
    ctx.asm.rep_stosq();
}

/// Emit everything the program does before the first top-level statement.
pub(crate) fn emit_program_entry(ctx: &mut Context) -> CodegenResult<()> {
    if ctx.symbols.pool_count() > 0 {
        emit_pool_table_setup(ctx);
    }
    emit_prologue(ctx, ctx.main_frame_size);

    // Zero-initialize the frame slots of every global (stack variables
    // only; pool variables live behind R15 and were zeroed with the table).
    ctx.asm.mov_ri(Gpr::Rax, 0);
    let slots: Vec<u32> = ctx
        .symbols
        .symbols_in(ScopeId(0))
        .filter(|s| {
            matches!(s.kind, SymbolKind::Variable | SymbolKind::Parameter) && !s.is_pool_var()
        })
        .map(|s| s.offset)
        .collect();
    for offset in slots {
        ctx.asm.store(Mem::local(offset), Gpr::Rax);
    }

    // ACB table pointer and current-actor index.
    ctx.asm.lea(Gpr::Rax, Mem::local(ctx.acb_table_offset));
    ctx.asm.store(Mem::local(ctx.acb_table_slot), Gpr::Rax);
    ctx.asm.mov_ri(Gpr::Rax, 0);
    ctx.asm.store(Mem::local(ctx.current_actor_slot), Gpr::Rax);

    // Callee-saved set for the program body. R15 is process-global and is
    // deliberately not part of this set.
    ctx.asm.push(Gpr::Rbx);
    ctx.asm.push(Gpr::R12);
    ctx.asm.push(Gpr::R13);
    ctx.asm.push(Gpr::R14);

    if let Some(slot) = ctx.perf_start_slot {
        emit_read_tsc(ctx);
        ctx.asm.store(Mem::local(slot), Gpr::Rax);
    }
    Ok(())
}

/// Emit the program exit: timer report, register restore, epilogue, and
/// `exit(0)`.
pub(crate) fn emit_program_exit(ctx: &mut Context) -> CodegenResult<()> {
    if let Some(slot) = ctx.perf_start_slot {
        emit_read_tsc(ctx);
        ctx.asm.mov_rr(Gpr::Rbx, Gpr::Rax);
        ctx.asm.load(Gpr::Rax, Mem::local(slot));
        ctx.asm.sub_rr(Gpr::Rbx, Gpr::Rax);
        ctx.asm.mov_rr(Gpr::Rax, Gpr::Rbx);
        crate::strings::emit_print_rax_line(ctx);
    }

    // Loop exits may leave staged values behind; re-anchor RSP at the
    // saved registers before restoring them.
    ctx.asm.lea(Gpr::Rsp, Mem::local(ctx.main_frame_size + 32));
    ctx.asm.pop(Gpr::R14);
    ctx.asm.pop(Gpr::R13);
    ctx.asm.pop(Gpr::R12);
    ctx.asm.pop(Gpr::Rbx);
    emit_epilogue(ctx);
    ctx.asm.mov_ri(Gpr::Rax, 60);
    ctx.asm.mov_ri(Gpr::Rdi, 0);
    ctx.asm.syscall();
    Ok(())
}

/// `RDTSC` widened to a full 64-bit count in RAX.
fn emit_read_tsc(ctx: &mut Context) {
    ctx.asm.rdtsc();
    ctx.asm.shl_ri(Gpr::Rdx, 32);
    ctx.asm.or_rr(Gpr::Rax, Gpr::Rdx);
}

/// Safety-net registration of a top-level variable the discovery pass
/// missed. Draws on the frame's temp slack; logged because it means the
/// analyzer and the emitter disagreed about a name.
pub(crate) fn jit_register_global(ctx: &mut Context, name: &str) -> u32 {
    warn!("JIT-registering global {name} missed by discovery");
    ctx.symbols.reenter_scope(ScopeId(0));
    let offset = ctx.symbols.register_variable(name).offset;
    ctx.symbols.exit_scope();
    offset
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn allocate_scan_sums_constants_and_penalizes_unknowns() {
        let nodes = vec![
            Node::assign("a", Node::call("Allocate", vec![Node::number(64)])),
            Node::If {
                condition: Box::new(Node::number(1)),
                then_body: vec![Node::assign(
                    "b",
                    Node::call("Allocate", vec![Node::ident("n")]),
                )],
                else_body: vec![],
            },
        ];
        assert_eq!(scan_allocate_sizes(&nodes), 64 + 1024);
    }

    #[test]
    fn frame_sizes_are_16_aligned() {
        assert_eq!(align16(0), 0);
        assert_eq!(align16(1), 16);
        assert_eq!(align16(16), 16);
        assert_eq!(align16(321), 336);
    }
}
