//! Cooperative actors and the mailbox words.
//!
//! Actors are parameterless blocks with a reserved 128-byte ACB in the
//! in-frame ACB table. `LoopSpawn` appends an actor to the spawn queue and
//! `LoopYield` invokes the next queued actor round-robin, as a plain
//! subroutine call — cooperative, no preemption. A mailbox is the one word
//! at offset 120 of each ACB; delivery is last-writer-wins.

use crate::asm::{Gpr, Mem};
use crate::context::Context;
use crate::expr::compile_expression;
use crate::frame::{ACB_MAILBOX_OFFSET, ACB_SIZE};
use crate::func::emit_subroutine_definition;
use crate::result::{shape_error, CodegenResult};
use ailang_ast::{Node, Span};
use log::{debug, trace};

/// Emit an actor body: a subroutine under its `Actor.` key.
pub(crate) fn emit_actor_definition(ctx: &mut Context, name: &str, body: &[Node]) -> CodegenResult<()> {
    emit_subroutine_definition(ctx, &format!("Actor.{name}"), body)
}

/// `LoopSpawn(actor)`: queue the actor; its 1-based queue handle lands in
/// RAX, or 0 when the actor does not exist.
pub(crate) fn compile_loop_spawn(ctx: &mut Context, args: &[Node], span: Span) -> CodegenResult<()> {
    let actor = match args {
        [Node::String { value, .. }] => value.clone(),
        [Node::Identifier { name, .. }] => name.clone(),
        _ => return shape_error("LoopSpawn requires an actor name", span),
    };
    let key = format!("Actor.{actor}");
    if ctx.subroutines.contains_key(&key) {
        ctx.spawn_queue.push(key);
        let handle = ctx.spawn_queue.len() as i64;
        debug!("spawned {actor} with handle {handle}");
        ctx.asm.mov_ri(Gpr::Rax, handle);
    } else {
        debug!("LoopSpawn of unknown actor {actor}");
        ctx.asm.mov_ri(Gpr::Rax, 0);
    }
    Ok(())
}

/// `LoopYield`: invoke the next queued actor round-robin. With an empty
/// queue this is a no-op instruction.
pub(crate) fn compile_loop_yield(ctx: &mut Context) -> CodegenResult<()> {
    if ctx.spawn_queue.is_empty() {
        ctx.asm.nop();
        return Ok(());
    }
    let index = ctx.next_yield % ctx.spawn_queue.len();
    let key = ctx.spawn_queue[index].clone();
    ctx.next_yield += 1;
    trace!("yield to {key}");
    let label = *ctx
        .subroutines
        .get(&key)
        .expect("spawn queue only holds registered actors");
    ctx.asm.call_label(label);
    Ok(())
}

/// `LoopGetACB`: ACB table base address in RAX.
pub(crate) fn compile_get_acb(ctx: &mut Context) -> CodegenResult<()> {
    let slot = ctx.acb_table_slot;
    ctx.asm.load(Gpr::Rax, Mem::local(slot));
    Ok(())
}

/// `LoopGetCurrentActor`: the running actor's index in RAX.
pub(crate) fn compile_get_current_actor(ctx: &mut Context) -> CodegenResult<()> {
    let slot = ctx.current_actor_slot;
    ctx.asm.load(Gpr::Rax, Mem::local(slot));
    Ok(())
}

/// `LoopSetCurrentActor(index)`.
pub(crate) fn compile_set_current_actor(
    ctx: &mut Context,
    args: &[Node],
    span: Span,
) -> CodegenResult<()> {
    let index = match args {
        [index] => index,
        _ => return shape_error("LoopSetCurrentActor requires an index", span),
    };
    compile_expression(ctx, index)?;
    let slot = ctx.current_actor_slot;
    ctx.asm.store(Mem::local(slot), Gpr::Rax);
    Ok(())
}

/// `SendMessage(target, value)`: store the value word into the target
/// actor's mailbox at `acb_base + target*128 + 120`.
pub(crate) fn compile_send_message(ctx: &mut Context, target: &Node, value: &Node) -> CodegenResult<()> {
    compile_expression(ctx, value)?;
    ctx.asm.push(Gpr::Rax);
    compile_expression(ctx, target)?;
    ctx.asm.imul_rri(Gpr::Rax, Gpr::Rax, ACB_SIZE as i32);
    ctx.asm.add_ri(Gpr::Rax, ACB_MAILBOX_OFFSET as i32);
    let slot = ctx.acb_table_slot;
    ctx.asm.load(Gpr::Rbx, Mem::local(slot));
    ctx.asm.add_rr(Gpr::Rax, Gpr::Rbx);
    ctx.asm.pop(Gpr::Rbx);
    ctx.asm.store(Mem::base(Gpr::Rax), Gpr::Rbx);
    Ok(())
}

/// `ReceiveMessage()`: load the current actor's mailbox word into RAX.
pub(crate) fn compile_receive_message(ctx: &mut Context) -> CodegenResult<()> {
    let current = ctx.current_actor_slot;
    let table = ctx.acb_table_slot;
    ctx.asm.load(Gpr::Rax, Mem::local(current));
    ctx.asm.imul_rri(Gpr::Rax, Gpr::Rax, ACB_SIZE as i32);
    ctx.asm.add_ri(Gpr::Rax, ACB_MAILBOX_OFFSET as i32);
    ctx.asm.load(Gpr::Rbx, Mem::local(table));
    ctx.asm.add_rr(Gpr::Rax, Gpr::Rbx);
    ctx.asm.load(Gpr::Rax, Mem::base(Gpr::Rax));
    Ok(())
}
