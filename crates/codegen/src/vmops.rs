//! User-mode renditions of the virtual-memory and cache operations.
//!
//! A user-mode process cannot touch CR3, INVLPG, or INVD, so the
//! `PageTable_*`, `VirtualMemory_*`, `Cache_*` and `TLB_*` families
//! compile to simulations: handles and addresses are assigned at compile
//! time from counters in the context, the privileged flushes degrade to
//! memory fences, and every operation reports success. Memory barriers
//! are genuinely user-mode safe and keep their hardware meaning. The
//! operations take `param, value` argument pairs; the simulation ignores
//! them, so none are evaluated.

use crate::asm::Gpr;
use crate::context::Context;
use crate::result::CodegenResult;
use ailang_ast::Node;
use log::debug;

/// Simulated page tables sit above this base, one page apart.
const PAGE_TABLE_BASE: u64 = 0x100000;
/// Simulated virtual allocations sit above this base, 64 KiB apart.
const VM_ALLOC_BASE: u64 = 0x4000_0000;

/// Route a VM operation by its family prefix; `Ok(false)` when the name
/// is not ours.
pub(crate) fn compile_operation(
    ctx: &mut Context,
    function: &str,
    _args: &[Node],
) -> CodegenResult<bool> {
    if let Some(op) = function.strip_prefix("PageTable_") {
        compile_page_table(ctx, op);
    } else if let Some(op) = function.strip_prefix("VirtualMemory_") {
        compile_virtual_memory(ctx, op);
    } else if let Some(op) = function.strip_prefix("Cache_") {
        compile_cache(ctx, op);
    } else if let Some(op) = function.strip_prefix("TLB_") {
        compile_tlb(ctx, op);
    } else if let Some(op) = function.strip_prefix("MemoryBarrier_") {
        compile_memory_barrier(ctx, op);
    } else {
        return Ok(false);
    }
    Ok(true)
}

fn compile_page_table(ctx: &mut Context, op: &str) {
    match op {
        "Create" => {
            ctx.vm.page_tables += 1;
            let id = ctx.vm.page_tables;
            debug!("simulated page table {id} at {:#x}", PAGE_TABLE_BASE + id * 0x1000);
            ctx.asm.mov_ri(Gpr::Rax, id as i64);
        }
        // Map/Unmap/Switch touch no real hardware in user mode; they
        // report success.
        _ => ctx.asm.mov_ri(Gpr::Rax, 1),
    }
}

fn compile_virtual_memory(ctx: &mut Context, op: &str) {
    match op {
        "Allocate" => {
            ctx.vm.allocations += 1;
            let addr = VM_ALLOC_BASE + ctx.vm.allocations * 0x10000;
            debug!("simulated virtual allocation at {addr:#x}");
            ctx.asm.mov_ri(Gpr::Rax, addr as i64);
        }
        _ => ctx.asm.mov_ri(Gpr::Rax, 1),
    }
}

fn compile_cache(ctx: &mut Context, op: &str) {
    match op {
        "Flush" | "Invalidate" | "Prefetch" => {
            // WBINVD/INVD are privileged; a full fence is the closest
            // user-mode ordering effect.
            ctx.asm.mfence();
            ctx.asm.mov_ri(Gpr::Rax, 1);
        }
        _ => ctx.asm.mov_ri(Gpr::Rax, 1),
    }
}

fn compile_tlb(ctx: &mut Context, op: &str) {
    match op {
        "Flush" | "FlushAll" | "Invalidate" => {
            // INVLPG and CR3 writes are privileged; fence instead.
            ctx.asm.mfence();
            ctx.asm.mov_ri(Gpr::Rax, 1);
        }
        _ => ctx.asm.mov_ri(Gpr::Rax, 1),
    }
}

fn compile_memory_barrier(ctx: &mut Context, op: &str) {
    match op {
        "Read" => ctx.asm.lfence(),
        "Write" => ctx.asm.sfence(),
        _ => ctx.asm.mfence(),
    }
    ctx.asm.mov_ri(Gpr::Rax, 1);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::Options;

    fn compile(function: &str) -> Vec<u8> {
        let mut ctx = Context::new(Options::default(), None);
        let handled = compile_operation(&mut ctx, function, &[]).unwrap();
        assert!(handled, "{function} not routed");
        ctx.asm.code
    }

    fn contains(haystack: &[u8], needle: &[u8]) -> bool {
        haystack.windows(needle.len()).any(|w| w == needle)
    }

    #[test]
    fn page_table_handles_count_up() {
        let mut ctx = Context::new(Options::default(), None);
        compile_operation(&mut ctx, "PageTable_Create", &[]).unwrap();
        compile_operation(&mut ctx, "PageTable_Create", &[]).unwrap();
        let mut second = vec![0x48, 0xB8];
        second.extend_from_slice(&2u64.to_le_bytes());
        assert!(contains(&ctx.asm.code, &second));
    }

    #[test]
    fn privileged_flushes_degrade_to_fences() {
        assert!(contains(&compile("TLB_FlushAll"), &[0x0F, 0xAE, 0xF0]));
        assert!(contains(&compile("Cache_Flush"), &[0x0F, 0xAE, 0xF0]));
    }

    #[test]
    fn barrier_kinds_pick_their_fence() {
        assert!(contains(&compile("MemoryBarrier_Full"), &[0x0F, 0xAE, 0xF0]));
        assert!(contains(&compile("MemoryBarrier_Read"), &[0x0F, 0xAE, 0xE8]));
        assert!(contains(&compile("MemoryBarrier_Write"), &[0x0F, 0xAE, 0xF8]));
    }

    #[test]
    fn non_vm_names_fall_through() {
        let mut ctx = Context::new(Options::default(), None);
        assert!(!compile_operation(&mut ctx, "PrintNumber", &[]).unwrap());
    }
}
