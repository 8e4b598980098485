//! Hash-table code generation: open addressing with linear probing.
//!
//! Table layout: a 16-byte `[capacity][size]` header followed by 24-byte
//! slots `[hash][key_ptr][value]`. The hash is DJB2 over the key string. A
//! slot with hash 0 is empty. Keys match when the stored hash matches and
//! the stored key compares equal byte by byte — never by pointer. Delete
//! is not implemented (it would need tombstones).

use crate::asm::{Cond, Gpr, Mem};
use crate::context::Context;
use crate::expr::compile_expression;
use crate::pools::emit_mmap_const;
use crate::result::{shape_error, CodegenResult};
use ailang_ast::{Node, Span};
use log::{debug, warn};

const SLOT_SIZE: i32 = 24;
const HEADER_SIZE: i32 = 16;

/// Route a `Hash*` operation; `Ok(false)` when the name is not ours.
pub(crate) fn compile_operation(
    ctx: &mut Context,
    function: &str,
    args: &[Node],
    span: Span,
) -> CodegenResult<bool> {
    match function {
        "HashCreate" => compile_hash_create(ctx, args)?,
        "HashSet" => compile_hash_set(ctx, args, span)?,
        "HashGet" => compile_hash_get(ctx, args, span)?,
        "HashExists" => {
            compile_hash_get(ctx, args, span)?;
            ctx.asm.test_rr(Gpr::Rax, Gpr::Rax);
            ctx.asm.setcc_bool(Cond::Ne);
        }
        "HashDelete" => {
            warn!("HashDelete is not implemented; lowering to 0");
            ctx.asm.mov_ri(Gpr::Rax, 0);
        }
        _ => return Ok(false),
    }
    Ok(true)
}

/// `HashCreate(expected)`: capacity is the next power of two at or above
/// twice the expected size (16 when unspecified or non-constant).
fn compile_hash_create(ctx: &mut Context, args: &[Node]) -> CodegenResult<()> {
    let expected = match args.first() {
        Some(Node::Number { value, .. }) => (*value).max(2) as u64,
        _ => 8,
    };
    let capacity = (expected * 2).next_power_of_two() as i64;
    let total_size = HEADER_SIZE as i64 + capacity * SLOT_SIZE as i64;
    debug!("HashCreate: capacity {capacity}, {total_size} bytes");

    emit_mmap_const(ctx, total_size);
    ctx.asm.push(Gpr::Rax);

    // Zero the whole table so every slot starts empty.
    ctx.asm.mov_rr(Gpr::Rdi, Gpr::Rax);
    ctx.asm.mov_ri(Gpr::Rcx, total_size);
    ctx.asm.xor_rr(Gpr::Rax, Gpr::Rax);
    ctx.asm.rep_stosb();

    ctx.asm.pop(Gpr::Rbx);
    ctx.asm.mov_ri(Gpr::Rax, capacity);
    ctx.asm.store(Mem::base(Gpr::Rbx), Gpr::Rax);
    ctx.asm.mov_ri(Gpr::Rax, 0);
    ctx.asm.store(Mem::base_disp(Gpr::Rbx, 8), Gpr::Rax);
    ctx.asm.mov_rr(Gpr::Rax, Gpr::Rbx);
    Ok(())
}

/// DJB2 over the NUL-terminated string at R13, result in RAX. Clobbers
/// RBX and RDX.
fn emit_djb2(ctx: &mut Context) {
    ctx.asm.mov_rr(Gpr::Rbx, Gpr::R13);
    ctx.asm.mov_ri(Gpr::Rax, 5381);
    let hash_loop = ctx.asm.create_label();
    let hash_done = ctx.asm.create_label();
    ctx.asm.mark_label(hash_loop);
    ctx.asm.load_u8(Gpr::Rdx, Mem::base(Gpr::Rbx));
    ctx.asm.test_rr(Gpr::Rdx, Gpr::Rdx);
    ctx.asm.jcc(Cond::Z, hash_done);
    ctx.asm.imul_rri(Gpr::Rax, Gpr::Rax, 33);
    ctx.asm.add_rr(Gpr::Rax, Gpr::Rdx);
    ctx.asm.inc(Gpr::Rbx);
    ctx.asm.jmp(hash_loop);
    ctx.asm.mark_label(hash_done);
}

/// Compare the string at R13 with the key stored at `[RBX+8]`; leaves ZF
/// set when equal. Every register it touches is saved around the loop.
fn emit_key_compare(ctx: &mut Context) {
    ctx.asm.push(Gpr::Rsi);
    ctx.asm.push(Gpr::Rdi);
    ctx.asm.push(Gpr::Rax);
    ctx.asm.push(Gpr::Rcx);

    ctx.asm.mov_rr(Gpr::Rsi, Gpr::R13);
    ctx.asm.load(Gpr::Rdi, Mem::base_disp(Gpr::Rbx, 8));

    let compare_loop = ctx.asm.create_label();
    let strings_match = ctx.asm.create_label();
    let strings_differ = ctx.asm.create_label();
    let done = ctx.asm.create_label();

    ctx.asm.mark_label(compare_loop);
    ctx.asm.load_u8(Gpr::Rax, Mem::base(Gpr::Rsi));
    ctx.asm.load_u8(Gpr::Rcx, Mem::base(Gpr::Rdi));
    ctx.asm.cmp_rr(Gpr::Rax, Gpr::Rcx);
    ctx.asm.jcc(Cond::Ne, strings_differ);
    ctx.asm.test_rr(Gpr::Rax, Gpr::Rax);
    ctx.asm.jcc(Cond::Z, strings_match);
    ctx.asm.inc(Gpr::Rsi);
    ctx.asm.inc(Gpr::Rdi);
    ctx.asm.jmp(compare_loop);

    ctx.asm.mark_label(strings_match);
    ctx.asm.xor_rr(Gpr::Rax, Gpr::Rax);
    ctx.asm.test_rr(Gpr::Rax, Gpr::Rax); // ZF := 1
    ctx.asm.jmp(done);

    ctx.asm.mark_label(strings_differ);
    ctx.asm.mov_ri(Gpr::Rax, 1);
    ctx.asm.test_rr(Gpr::Rax, Gpr::Rax); // ZF := 0

    ctx.asm.mark_label(done);
    ctx.asm.pop(Gpr::Rcx);
    ctx.asm.pop(Gpr::Rax);
    ctx.asm.pop(Gpr::Rdi);
    ctx.asm.pop(Gpr::Rsi);
}

/// Advance RBX to the next slot, wrapping to the first slot past the
/// header when it runs off the end of the table (capacity at `[RDI]`).
fn emit_probe_advance(ctx: &mut Context, probe_loop: crate::asm::Label) {
    ctx.asm.add_ri(Gpr::Rbx, SLOT_SIZE);
    ctx.asm.load(Gpr::Rax, Mem::base(Gpr::Rdi));
    ctx.asm.imul_rri(Gpr::Rax, Gpr::Rax, SLOT_SIZE);
    ctx.asm
        .lea(Gpr::Rax, Mem::base_index_disp(Gpr::Rdi, Gpr::Rax, HEADER_SIZE));
    ctx.asm.cmp_rr(Gpr::Rbx, Gpr::Rax);
    ctx.asm.jcc(Cond::L, probe_loop);
    ctx.asm.lea(Gpr::Rbx, Mem::base_disp(Gpr::Rdi, HEADER_SIZE));
    ctx.asm.jmp(probe_loop);
}

/// Hash the key at R13 and point RBX at its home slot (table in RDI).
/// Leaves the hash on the stack.
fn emit_slot_address(ctx: &mut Context) {
    emit_djb2(ctx);
    ctx.asm.push(Gpr::Rax);
    ctx.asm.load(Gpr::Rcx, Mem::base(Gpr::Rdi));
    ctx.asm.xor_rr(Gpr::Rdx, Gpr::Rdx);
    ctx.asm.div(Gpr::Rcx);
    ctx.asm.imul_rri(Gpr::Rdx, Gpr::Rdx, SLOT_SIZE);
    ctx.asm
        .lea(Gpr::Rbx, Mem::base_index_disp(Gpr::Rdi, Gpr::Rdx, HEADER_SIZE));
}

fn compile_hash_set(ctx: &mut Context, args: &[Node], span: Span) -> CodegenResult<()> {
    let (table, key, value) = match args {
        [table, key, value] => (table, key, value),
        _ => return shape_error("HashSet requires table, key and value", span),
    };

    for reg in [Gpr::Rbx, Gpr::Rcx, Gpr::Rdx, Gpr::Rsi, Gpr::Rdi, Gpr::R12, Gpr::R13] {
        ctx.asm.push(reg);
    }

    compile_expression(ctx, value)?;
    ctx.asm.mov_rr(Gpr::R12, Gpr::Rax);
    compile_expression(ctx, key)?;
    ctx.asm.mov_rr(Gpr::R13, Gpr::Rax);
    compile_expression(ctx, table)?;
    ctx.asm.mov_rr(Gpr::Rdi, Gpr::Rax);

    emit_slot_address(ctx);

    let probe_loop = ctx.asm.create_label();
    let found_slot = ctx.asm.create_label();
    let check_key = ctx.asm.create_label();
    let next_slot = ctx.asm.create_label();

    ctx.asm.mark_label(probe_loop);
    ctx.asm.load(Gpr::Rax, Mem::base(Gpr::Rbx));
    ctx.asm.test_rr(Gpr::Rax, Gpr::Rax);
    ctx.asm.jcc(Cond::Z, found_slot);

    ctx.asm.pop(Gpr::Rax);
    ctx.asm.push(Gpr::Rax);
    ctx.asm.cmp_mr(Mem::base(Gpr::Rbx), Gpr::Rax);
    ctx.asm.jcc(Cond::E, check_key);
    ctx.asm.jmp(next_slot);

    ctx.asm.mark_label(check_key);
    emit_key_compare(ctx);
    ctx.asm.jcc(Cond::E, found_slot);

    ctx.asm.mark_label(next_slot);
    emit_probe_advance(ctx, probe_loop);

    ctx.asm.mark_label(found_slot);
    let not_new = ctx.asm.create_label();
    ctx.asm.load(Gpr::Rax, Mem::base(Gpr::Rbx));
    ctx.asm.test_rr(Gpr::Rax, Gpr::Rax);
    ctx.asm.jcc(Cond::Nz, not_new);
    ctx.asm.inc_m(Mem::base_disp(Gpr::Rdi, 8));
    ctx.asm.mark_label(not_new);

    ctx.asm.pop(Gpr::Rax);
    ctx.asm.store(Mem::base(Gpr::Rbx), Gpr::Rax);
    ctx.asm.store(Mem::base_disp(Gpr::Rbx, 8), Gpr::R13);
    ctx.asm.store(Mem::base_disp(Gpr::Rbx, 16), Gpr::R12);
    ctx.asm.mov_ri(Gpr::Rax, 1);

    for reg in [Gpr::R13, Gpr::R12, Gpr::Rdi, Gpr::Rsi, Gpr::Rdx, Gpr::Rcx, Gpr::Rbx] {
        ctx.asm.pop(reg);
    }
    Ok(())
}

fn compile_hash_get(ctx: &mut Context, args: &[Node], span: Span) -> CodegenResult<()> {
    let (table, key) = match args {
        [table, key] => (table, key),
        _ => return shape_error("HashGet requires table and key", span),
    };

    for reg in [Gpr::Rbx, Gpr::Rcx, Gpr::Rdx, Gpr::Rsi, Gpr::Rdi, Gpr::R13] {
        ctx.asm.push(reg);
    }

    compile_expression(ctx, key)?;
    ctx.asm.mov_rr(Gpr::R13, Gpr::Rax);
    compile_expression(ctx, table)?;
    ctx.asm.mov_rr(Gpr::Rdi, Gpr::Rax);

    emit_slot_address(ctx);

    let probe_loop = ctx.asm.create_label();
    let found_entry = ctx.asm.create_label();
    let not_found = ctx.asm.create_label();
    let check_key = ctx.asm.create_label();
    let next_slot = ctx.asm.create_label();
    let done = ctx.asm.create_label();

    ctx.asm.mark_label(probe_loop);
    ctx.asm.load(Gpr::Rax, Mem::base(Gpr::Rbx));
    ctx.asm.test_rr(Gpr::Rax, Gpr::Rax);
    ctx.asm.jcc(Cond::Z, not_found);

    ctx.asm.pop(Gpr::Rax);
    ctx.asm.push(Gpr::Rax);
    ctx.asm.cmp_mr(Mem::base(Gpr::Rbx), Gpr::Rax);
    ctx.asm.jcc(Cond::E, check_key);
    ctx.asm.jmp(next_slot);

    ctx.asm.mark_label(check_key);
    emit_key_compare(ctx);
    ctx.asm.jcc(Cond::E, found_entry);

    ctx.asm.mark_label(next_slot);
    emit_probe_advance(ctx, probe_loop);

    ctx.asm.mark_label(found_entry);
    ctx.asm.pop(Gpr::Rax);
    ctx.asm.load(Gpr::Rax, Mem::base_disp(Gpr::Rbx, 16));
    ctx.asm.jmp(done);

    ctx.asm.mark_label(not_found);
    ctx.asm.pop(Gpr::Rax);
    ctx.asm.mov_ri(Gpr::Rax, 0);

    ctx.asm.mark_label(done);
    for reg in [Gpr::R13, Gpr::Rdi, Gpr::Rsi, Gpr::Rdx, Gpr::Rcx, Gpr::Rbx] {
        ctx.asm.pop(reg);
    }
    Ok(())
}
