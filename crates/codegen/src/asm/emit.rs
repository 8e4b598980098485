//! Primitive instruction emitters.
//!
//! Each emitter appends exactly the bytes for the specified operands, with
//! no implicit operand-size promotion. General-purpose operations use
//! 64-bit operand size throughout; the 8-, 16- and 32-bit forms appear only
//! where a lowering explicitly calls for them (byte loads/stores in string
//! loops, the sockaddr staging stores, SETcc).

use super::encode::{emit_mem, emit_rr, encode_modrm, Amode, Gpr, Xmm};
use super::{Assembler, Cond};

/// A memory operand `[base + disp]`, exposed to the lowering modules.
#[derive(Clone, Copy, Debug)]
pub struct Mem {
    pub(crate) amode: Amode,
}

impl Mem {
    /// `[base]`
    pub fn base(base: Gpr) -> Mem {
        Mem {
            amode: Amode::base(base),
        }
    }

    /// `[base + disp]`
    pub fn base_disp(base: Gpr, disp: i32) -> Mem {
        Mem {
            amode: Amode::base_disp(base, disp),
        }
    }

    /// `[base + index + disp]`
    pub fn base_index_disp(base: Gpr, index: Gpr, disp: i32) -> Mem {
        Mem {
            amode: Amode::base_index_disp(base, index, disp),
        }
    }

    /// `[rbp - offset]`, the addressing form for frame locals.
    pub fn local(offset: u32) -> Mem {
        Mem::base_disp(Gpr::Rbp, -(offset as i32))
    }

    /// `[r15 + index*8]`, the addressing form for pool variables.
    pub fn pool(index: u32) -> Mem {
        Mem::base_disp(Gpr::R15, index as i32 * 8)
    }
}

impl Assembler {
    /// `MOV r64, imm64` (the full 10-byte form, so output never depends on
    /// the immediate's magnitude).
    pub fn mov_ri(&mut self, dst: Gpr, imm: i64) {
        let enc = dst.enc();
        self.code.push(0x48 | ((enc >> 3) & 1));
        self.code.push(0xB8 | (enc & 7));
        self.code.extend_from_slice(&imm.to_le_bytes());
    }

    /// `MOV dst, src`
    pub fn mov_rr(&mut self, dst: Gpr, src: Gpr) {
        emit_rr(&mut self.code, &[], true, &[0x89], src.enc(), dst.enc());
    }

    /// `MOV r64, [mem]`
    pub fn load(&mut self, dst: Gpr, mem: Mem) {
        emit_mem(&mut self.code, &[], true, &[0x8B], dst.enc(), mem.amode);
    }

    /// `MOV [mem], r64`
    pub fn store(&mut self, mem: Mem, src: Gpr) {
        emit_mem(&mut self.code, &[], true, &[0x89], src.enc(), mem.amode);
    }

    /// `MOVZX r64, BYTE [mem]`
    pub fn load_u8(&mut self, dst: Gpr, mem: Mem) {
        emit_mem(
            &mut self.code,
            &[],
            true,
            &[0x0F, 0xB6],
            dst.enc(),
            mem.amode,
        );
    }

    /// `MOV [mem], r8` — the low byte of `src`, which must be one of
    /// RAX/RCX/RDX/RBX so no REX-dependent byte-register renaming applies.
    pub fn store_u8(&mut self, mem: Mem, src: Gpr) {
        debug_assert!(src.enc() < 4);
        emit_mem(&mut self.code, &[], false, &[0x88], src.enc(), mem.amode);
    }

    /// `MOV BYTE [mem], imm8`
    pub fn store_u8_imm(&mut self, mem: Mem, imm: u8) {
        emit_mem(&mut self.code, &[], false, &[0xC6], 0, mem.amode);
        self.code.push(imm);
    }

    /// `MOV WORD [mem], imm16`
    pub fn store_u16_imm(&mut self, mem: Mem, imm: u16) {
        emit_mem(&mut self.code, &[0x66], false, &[0xC7], 0, mem.amode);
        self.code.extend_from_slice(&imm.to_le_bytes());
    }

    /// `MOV WORD [mem], r16`
    pub fn store_u16(&mut self, mem: Mem, src: Gpr) {
        debug_assert!(src.enc() < 8);
        emit_mem(&mut self.code, &[0x66], false, &[0x89], src.enc(), mem.amode);
    }

    /// `MOV DWORD [mem], r32`
    pub fn store_u32(&mut self, mem: Mem, src: Gpr) {
        debug_assert!(src.enc() < 8);
        emit_mem(&mut self.code, &[], false, &[0x89], src.enc(), mem.amode);
    }

    /// `MOV QWORD [mem], imm32` (sign-extended)
    pub fn store_imm32(&mut self, mem: Mem, imm: i32) {
        emit_mem(&mut self.code, &[], true, &[0xC7], 0, mem.amode);
        self.code.extend_from_slice(&imm.to_le_bytes());
    }

    /// `LEA r64, [mem]`
    pub fn lea(&mut self, dst: Gpr, mem: Mem) {
        emit_mem(&mut self.code, &[], true, &[0x8D], dst.enc(), mem.amode);
    }

    /// `PUSH r64`
    pub fn push(&mut self, reg: Gpr) {
        let enc = reg.enc();
        if enc >= 8 {
            self.code.push(0x41);
        }
        self.code.push(0x50 | (enc & 7));
    }

    /// `POP r64`
    pub fn pop(&mut self, reg: Gpr) {
        let enc = reg.enc();
        if enc >= 8 {
            self.code.push(0x41);
        }
        self.code.push(0x58 | (enc & 7));
    }

    // Two-operand integer ALU, `op r/m64, r64` forms.

    /// `ADD dst, src`
    pub fn add_rr(&mut self, dst: Gpr, src: Gpr) {
        emit_rr(&mut self.code, &[], true, &[0x01], src.enc(), dst.enc());
    }

    /// `SUB dst, src`
    pub fn sub_rr(&mut self, dst: Gpr, src: Gpr) {
        emit_rr(&mut self.code, &[], true, &[0x29], src.enc(), dst.enc());
    }

    /// `AND dst, src`
    pub fn and_rr(&mut self, dst: Gpr, src: Gpr) {
        emit_rr(&mut self.code, &[], true, &[0x21], src.enc(), dst.enc());
    }

    /// `OR dst, src`
    pub fn or_rr(&mut self, dst: Gpr, src: Gpr) {
        emit_rr(&mut self.code, &[], true, &[0x09], src.enc(), dst.enc());
    }

    /// `XOR dst, src`
    pub fn xor_rr(&mut self, dst: Gpr, src: Gpr) {
        emit_rr(&mut self.code, &[], true, &[0x31], src.enc(), dst.enc());
    }

    /// `CMP dst, src`
    pub fn cmp_rr(&mut self, dst: Gpr, src: Gpr) {
        emit_rr(&mut self.code, &[], true, &[0x39], src.enc(), dst.enc());
    }

    /// `TEST dst, src`
    pub fn test_rr(&mut self, dst: Gpr, src: Gpr) {
        emit_rr(&mut self.code, &[], true, &[0x85], src.enc(), dst.enc());
    }

    /// `IMUL dst, src` (two-operand form)
    pub fn imul_rr(&mut self, dst: Gpr, src: Gpr) {
        emit_rr(
            &mut self.code,
            &[],
            true,
            &[0x0F, 0xAF],
            dst.enc(),
            src.enc(),
        );
    }

    /// `IMUL dst, src, imm32`
    pub fn imul_rri(&mut self, dst: Gpr, src: Gpr, imm: i32) {
        emit_rr(&mut self.code, &[], true, &[0x69], dst.enc(), src.enc());
        self.code.extend_from_slice(&imm.to_le_bytes());
    }

    fn alu_ri(&mut self, ext: u8, dst: Gpr, imm: i32) {
        if let Ok(imm8) = i8::try_from(imm) {
            emit_rr(&mut self.code, &[], true, &[0x83], ext, dst.enc());
            self.code.push(imm8 as u8);
        } else {
            emit_rr(&mut self.code, &[], true, &[0x81], ext, dst.enc());
            self.code.extend_from_slice(&imm.to_le_bytes());
        }
    }

    /// `ADD dst, imm`
    pub fn add_ri(&mut self, dst: Gpr, imm: i32) {
        self.alu_ri(0, dst, imm);
    }

    /// `OR dst, imm`
    pub fn or_ri(&mut self, dst: Gpr, imm: i32) {
        self.alu_ri(1, dst, imm);
    }

    /// `AND dst, imm`
    pub fn and_ri(&mut self, dst: Gpr, imm: i32) {
        self.alu_ri(4, dst, imm);
    }

    /// `SUB dst, imm`
    pub fn sub_ri(&mut self, dst: Gpr, imm: i32) {
        self.alu_ri(5, dst, imm);
    }

    /// `XOR dst, imm`
    pub fn xor_ri(&mut self, dst: Gpr, imm: i32) {
        self.alu_ri(6, dst, imm);
    }

    /// `CMP dst, imm`
    pub fn cmp_ri(&mut self, dst: Gpr, imm: i32) {
        self.alu_ri(7, dst, imm);
    }

    /// `CMP QWORD [mem], imm` (sign-extended imm8/imm32)
    pub fn cmp_mi(&mut self, mem: Mem, imm: i32) {
        if let Ok(imm8) = i8::try_from(imm) {
            emit_mem(&mut self.code, &[], true, &[0x83], 7, mem.amode);
            self.code.push(imm8 as u8);
        } else {
            emit_mem(&mut self.code, &[], true, &[0x81], 7, mem.amode);
            self.code.extend_from_slice(&imm.to_le_bytes());
        }
    }

    /// `CMP QWORD [mem], r64`
    pub fn cmp_mr(&mut self, mem: Mem, src: Gpr) {
        emit_mem(&mut self.code, &[], true, &[0x39], src.enc(), mem.amode);
    }

    /// `CMP BYTE [mem], imm8`
    pub fn cmp_m8_imm(&mut self, mem: Mem, imm: u8) {
        emit_mem(&mut self.code, &[], false, &[0x80], 7, mem.amode);
        self.code.push(imm);
    }

    /// `CMP dst8, src8` for the low bytes of RAX..RBX.
    pub fn cmp_r8_r8(&mut self, dst: Gpr, src: Gpr) {
        debug_assert!(dst.enc() < 4 && src.enc() < 4);
        self.code.push(0x38);
        self.code.push(encode_modrm(0b11, src.enc(), dst.enc()));
    }

    /// `TEST r8, r8` for the low bytes of RAX..RBX.
    pub fn test_r8(&mut self, reg: Gpr) {
        debug_assert!(reg.enc() < 4);
        self.code.push(0x84);
        self.code.push(encode_modrm(0b11, reg.enc(), reg.enc()));
    }

    /// `NEG r64`
    pub fn neg(&mut self, reg: Gpr) {
        emit_rr(&mut self.code, &[], true, &[0xF7], 3, reg.enc());
    }

    /// `NOT r64`
    pub fn not(&mut self, reg: Gpr) {
        emit_rr(&mut self.code, &[], true, &[0xF7], 2, reg.enc());
    }

    /// `INC r64`
    pub fn inc(&mut self, reg: Gpr) {
        emit_rr(&mut self.code, &[], true, &[0xFF], 0, reg.enc());
    }

    /// `DEC r64`
    pub fn dec(&mut self, reg: Gpr) {
        emit_rr(&mut self.code, &[], true, &[0xFF], 1, reg.enc());
    }

    /// `INC QWORD [mem]`
    pub fn inc_m(&mut self, mem: Mem) {
        emit_mem(&mut self.code, &[], true, &[0xFF], 0, mem.amode);
    }

    /// `CQO` — sign-extend RAX into RDX:RAX.
    pub fn cqo(&mut self) {
        self.code.extend_from_slice(&[0x48, 0x99]);
    }

    /// `IDIV r64` — signed divide RDX:RAX.
    pub fn idiv(&mut self, reg: Gpr) {
        emit_rr(&mut self.code, &[], true, &[0xF7], 7, reg.enc());
    }

    /// `DIV r64` — unsigned divide RDX:RAX.
    pub fn div(&mut self, reg: Gpr) {
        emit_rr(&mut self.code, &[], true, &[0xF7], 6, reg.enc());
    }

    /// `IMUL r64` — one-operand signed multiply into RDX:RAX.
    pub fn imul(&mut self, reg: Gpr) {
        emit_rr(&mut self.code, &[], true, &[0xF7], 5, reg.enc());
    }

    /// `SHL r64, CL`
    pub fn shl_cl(&mut self, reg: Gpr) {
        emit_rr(&mut self.code, &[], true, &[0xD3], 4, reg.enc());
    }

    /// `SHR r64, CL`
    pub fn shr_cl(&mut self, reg: Gpr) {
        emit_rr(&mut self.code, &[], true, &[0xD3], 5, reg.enc());
    }

    /// `SAR r64, CL`
    pub fn sar_cl(&mut self, reg: Gpr) {
        emit_rr(&mut self.code, &[], true, &[0xD3], 7, reg.enc());
    }

    /// `SHL r64, imm8`
    pub fn shl_ri(&mut self, reg: Gpr, imm: u8) {
        emit_rr(&mut self.code, &[], true, &[0xC1], 4, reg.enc());
        self.code.push(imm);
    }

    /// `SHR r64, imm8`
    pub fn shr_ri(&mut self, reg: Gpr, imm: u8) {
        emit_rr(&mut self.code, &[], true, &[0xC1], 5, reg.enc());
        self.code.push(imm);
    }

    /// `SAR r64, imm8`
    pub fn sar_ri(&mut self, reg: Gpr, imm: u8) {
        emit_rr(&mut self.code, &[], true, &[0xC1], 7, reg.enc());
        self.code.push(imm);
    }

    /// `SETcc AL; MOVZX RAX, AL` — materialize a flag as 0/1 in RAX.
    pub fn setcc_bool(&mut self, cc: Cond) {
        self.code
            .extend_from_slice(&[0x0F, 0x90 | cc as u8, 0xC0]);
        self.code.extend_from_slice(&[0x48, 0x0F, 0xB6, 0xC0]);
    }

    /// `RET`
    pub fn ret(&mut self) {
        self.code.push(0xC3);
    }

    /// `SYSCALL`
    pub fn syscall(&mut self) {
        self.code.extend_from_slice(&[0x0F, 0x05]);
    }

    /// `NOP`
    pub fn nop(&mut self) {
        self.code.push(0x90);
    }

    /// `CLD; REP STOSQ` — fill RCX qwords at [RDI] with RAX.
    pub fn rep_stosq(&mut self) {
        self.code.extend_from_slice(&[0xFC, 0xF3, 0x48, 0xAB]);
    }

    /// `CLD; REP STOSB` — fill RCX bytes at [RDI] with AL.
    pub fn rep_stosb(&mut self) {
        self.code.extend_from_slice(&[0xFC, 0xF3, 0xAA]);
    }

    /// `BSWAP r32`
    pub fn bswap_r32(&mut self, reg: Gpr) {
        let enc = reg.enc();
        if enc >= 8 {
            self.code.push(0x41);
        }
        self.code.extend_from_slice(&[0x0F, 0xC8 | (enc & 7)]);
    }

    /// `XCHG AL, AH` — swap the low two bytes of RAX (port byte order).
    pub fn xchg_al_ah(&mut self) {
        self.code.extend_from_slice(&[0x86, 0xC4]);
    }

    /// `RDTSC` — cycle counter into EDX:EAX.
    pub fn rdtsc(&mut self) {
        self.code.extend_from_slice(&[0x0F, 0x31]);
    }

    // SSE2 forms used by the memory-compare/search lowerings. The operands
    // stay within XMM0..XMM3 and the low eight GPRs, so no REX is needed.

    /// `MOVDQU xmm, [mem]`
    pub fn movdqu_load(&mut self, dst: Xmm, mem: Mem) {
        emit_mem(
            &mut self.code,
            &[0xF3],
            false,
            &[0x0F, 0x6F],
            dst.enc(),
            mem.amode,
        );
    }

    /// `PCMPEQB dst, src`
    pub fn pcmpeqb(&mut self, dst: Xmm, src: Xmm) {
        emit_rr(
            &mut self.code,
            &[0x66],
            false,
            &[0x0F, 0x74],
            dst.enc(),
            src.enc(),
        );
    }

    /// `PMOVMSKB r32, xmm`
    pub fn pmovmskb(&mut self, dst: Gpr, src: Xmm) {
        debug_assert!(dst.enc() < 8);
        emit_rr(
            &mut self.code,
            &[0x66],
            false,
            &[0x0F, 0xD7],
            dst.enc(),
            src.enc(),
        );
    }

    /// `MOVD xmm, r32`
    pub fn movd(&mut self, dst: Xmm, src: Gpr) {
        debug_assert!(src.enc() < 8);
        emit_rr(
            &mut self.code,
            &[0x66],
            false,
            &[0x0F, 0x6E],
            dst.enc(),
            src.enc(),
        );
    }

    /// `PUNPCKLBW dst, src`
    pub fn punpcklbw(&mut self, dst: Xmm, src: Xmm) {
        emit_rr(
            &mut self.code,
            &[0x66],
            false,
            &[0x0F, 0x60],
            dst.enc(),
            src.enc(),
        );
    }

    /// `PSHUFLW dst, src, imm8`
    pub fn pshuflw(&mut self, dst: Xmm, src: Xmm, imm: u8) {
        emit_rr(
            &mut self.code,
            &[0xF2],
            false,
            &[0x0F, 0x70],
            dst.enc(),
            src.enc(),
        );
        self.code.push(imm);
    }

    /// `PSHUFD dst, src, imm8`
    pub fn pshufd(&mut self, dst: Xmm, src: Xmm, imm: u8) {
        emit_rr(
            &mut self.code,
            &[0x66],
            false,
            &[0x0F, 0x70],
            dst.enc(),
            src.enc(),
        );
        self.code.push(imm);
    }

    /// `BSF r64, r64` — bit scan forward (first set bit index).
    pub fn bsf(&mut self, dst: Gpr, src: Gpr) {
        emit_rr(
            &mut self.code,
            &[],
            true,
            &[0x0F, 0xBC],
            dst.enc(),
            src.enc(),
        );
    }

    /// `BSR r64, r64` — bit scan reverse (highest set bit index).
    pub fn bsr(&mut self, dst: Gpr, src: Gpr) {
        emit_rr(
            &mut self.code,
            &[],
            true,
            &[0x0F, 0xBD],
            dst.enc(),
            src.enc(),
        );
    }

    /// `POPCNT r64, r64`
    pub fn popcnt(&mut self, dst: Gpr, src: Gpr) {
        emit_rr(
            &mut self.code,
            &[0xF3],
            true,
            &[0x0F, 0xB8],
            dst.enc(),
            src.enc(),
        );
    }

    /// `LZCNT r64, r64`
    pub fn lzcnt(&mut self, dst: Gpr, src: Gpr) {
        emit_rr(
            &mut self.code,
            &[0xF3],
            true,
            &[0x0F, 0xBD],
            dst.enc(),
            src.enc(),
        );
    }

    /// `TZCNT r64, r64`
    pub fn tzcnt(&mut self, dst: Gpr, src: Gpr) {
        emit_rr(
            &mut self.code,
            &[0xF3],
            true,
            &[0x0F, 0xBC],
            dst.enc(),
            src.enc(),
        );
    }

    /// `ROL r64, CL`
    pub fn rol_cl(&mut self, reg: Gpr) {
        emit_rr(&mut self.code, &[], true, &[0xD3], 0, reg.enc());
    }

    /// `ROR r64, CL`
    pub fn ror_cl(&mut self, reg: Gpr) {
        emit_rr(&mut self.code, &[], true, &[0xD3], 1, reg.enc());
    }

    /// `CMOVcc dst, src` — conditional move on the given condition.
    pub fn cmovcc(&mut self, cc: Cond, dst: Gpr, src: Gpr) {
        emit_rr(
            &mut self.code,
            &[],
            true,
            &[0x0F, 0x40 | cc as u8],
            dst.enc(),
            src.enc(),
        );
    }

    /// `TEST r64, imm32`
    pub fn test_ri(&mut self, reg: Gpr, imm: i32) {
        emit_rr(&mut self.code, &[], true, &[0xF7], 0, reg.enc());
        self.code.extend_from_slice(&imm.to_le_bytes());
    }

    /// `BSWAP r64`
    pub fn bswap_r64(&mut self, reg: Gpr) {
        let enc = reg.enc();
        self.code.push(0x48 | ((enc >> 3) & 1));
        self.code.extend_from_slice(&[0x0F, 0xC8 | (enc & 7)]);
    }

    /// `LOCK ADD [mem], r64` — the atomic read-modify-write add.
    pub fn lock_add_m(&mut self, mem: Mem, src: Gpr) {
        emit_mem(&mut self.code, &[0xF0], true, &[0x01], src.enc(), mem.amode);
    }

    /// `MFENCE`
    pub fn mfence(&mut self) {
        self.code.extend_from_slice(&[0x0F, 0xAE, 0xF0]);
    }

    /// `LFENCE`
    pub fn lfence(&mut self) {
        self.code.extend_from_slice(&[0x0F, 0xAE, 0xE8]);
    }

    /// `SFENCE`
    pub fn sfence(&mut self) {
        self.code.extend_from_slice(&[0x0F, 0xAE, 0xF8]);
    }

    /// `CVTSI2SD xmm, r64` — signed integer to double.
    pub fn cvtsi2sd(&mut self, dst: Xmm, src: Gpr) {
        emit_rr(
            &mut self.code,
            &[0xF2],
            true,
            &[0x0F, 0x2A],
            dst.enc(),
            src.enc(),
        );
    }

    /// `CVTTSD2SI r64, xmm` — double to signed integer, truncating.
    pub fn cvttsd2si(&mut self, dst: Gpr, src: Xmm) {
        emit_rr(
            &mut self.code,
            &[0xF2],
            true,
            &[0x0F, 0x2C],
            dst.enc(),
            src.enc(),
        );
    }

    /// `SQRTSD dst, src`
    pub fn sqrtsd(&mut self, dst: Xmm, src: Xmm) {
        emit_rr(
            &mut self.code,
            &[0xF2],
            false,
            &[0x0F, 0x51],
            dst.enc(),
            src.enc(),
        );
    }

    // x87 forms used by the transcendental math lowerings. The FPU stack
    // is private to each lowering: everything pushed is popped before the
    // sequence ends.

    /// `FILD QWORD [mem]`
    pub fn fild64(&mut self, mem: Mem) {
        emit_mem(&mut self.code, &[], false, &[0xDF], 5, mem.amode);
    }

    /// `FISTP QWORD [mem]`
    pub fn fistp64(&mut self, mem: Mem) {
        emit_mem(&mut self.code, &[], false, &[0xDF], 7, mem.amode);
    }

    /// `FLD1`
    pub fn fld1(&mut self) {
        self.code.extend_from_slice(&[0xD9, 0xE8]);
    }

    /// `FLDPI`
    pub fn fldpi(&mut self) {
        self.code.extend_from_slice(&[0xD9, 0xEB]);
    }

    /// `FLDL2E` — log2(e).
    pub fn fldl2e(&mut self) {
        self.code.extend_from_slice(&[0xD9, 0xEA]);
    }

    /// `FLDLG2` — log10(2).
    pub fn fldlg2(&mut self) {
        self.code.extend_from_slice(&[0xD9, 0xEC]);
    }

    /// `FLDLN2` — ln(2).
    pub fn fldln2(&mut self) {
        self.code.extend_from_slice(&[0xD9, 0xED]);
    }

    /// `FLD ST(0)` — duplicate the top of the FPU stack.
    pub fn fld_st0(&mut self) {
        self.code.extend_from_slice(&[0xD9, 0xC0]);
    }

    /// `FXCH ST(1)`
    pub fn fxch(&mut self) {
        self.code.extend_from_slice(&[0xD9, 0xC9]);
    }

    /// `FSTP ST(0)` — pop and discard.
    pub fn fstp_st0(&mut self) {
        self.code.extend_from_slice(&[0xDD, 0xD8]);
    }

    /// `FSTP ST(1)` — store into ST(1) and pop.
    pub fn fstp_st1(&mut self) {
        self.code.extend_from_slice(&[0xDD, 0xD9]);
    }

    /// `FADDP ST(1), ST(0)`
    pub fn faddp(&mut self) {
        self.code.extend_from_slice(&[0xDE, 0xC1]);
    }

    /// `FMULP ST(1), ST(0)`
    pub fn fmulp(&mut self) {
        self.code.extend_from_slice(&[0xDE, 0xC9]);
    }

    /// `FDIVP ST(1), ST(0)`
    pub fn fdivp(&mut self) {
        self.code.extend_from_slice(&[0xDE, 0xF9]);
    }

    /// `FSUBP ST(1), ST(0)`
    pub fn fsubp(&mut self) {
        self.code.extend_from_slice(&[0xDE, 0xE9]);
    }

    /// `FSUBRP ST(1), ST(0)` — reverse subtract and pop.
    pub fn fsubrp(&mut self) {
        self.code.extend_from_slice(&[0xDE, 0xE1]);
    }

    /// `FSUB ST(0), ST(1)`
    pub fn fsub_st0_st1(&mut self) {
        self.code.extend_from_slice(&[0xD8, 0xE1]);
    }

    /// `FMUL ST(0), ST(0)` — square the top of the stack.
    pub fn fmul_st0_st0(&mut self) {
        self.code.extend_from_slice(&[0xD8, 0xC8]);
    }

    /// `FSIN`
    pub fn fsin(&mut self) {
        self.code.extend_from_slice(&[0xD9, 0xFE]);
    }

    /// `FCOS`
    pub fn fcos(&mut self) {
        self.code.extend_from_slice(&[0xD9, 0xFF]);
    }

    /// `FPTAN` — pushes tan(x) then 1.0.
    pub fn fptan(&mut self) {
        self.code.extend_from_slice(&[0xD9, 0xF2]);
    }

    /// `FPATAN` — atan2(ST(1), ST(0)), pops both, pushes the result.
    pub fn fpatan(&mut self) {
        self.code.extend_from_slice(&[0xD9, 0xF3]);
    }

    /// `FSQRT`
    pub fn fsqrt(&mut self) {
        self.code.extend_from_slice(&[0xD9, 0xFA]);
    }

    /// `FRNDINT`
    pub fn frndint(&mut self) {
        self.code.extend_from_slice(&[0xD9, 0xFC]);
    }

    /// `F2XM1` — 2^ST(0) - 1 for ST(0) in [-1, 1].
    pub fn f2xm1(&mut self) {
        self.code.extend_from_slice(&[0xD9, 0xF0]);
    }

    /// `FSCALE` — ST(0) * 2^trunc(ST(1)).
    pub fn fscale(&mut self) {
        self.code.extend_from_slice(&[0xD9, 0xFD]);
    }

    /// `FYL2X` — ST(1) * log2(ST(0)), pops both, pushes the result.
    pub fn fyl2x(&mut self) {
        self.code.extend_from_slice(&[0xD9, 0xF1]);
    }

    /// `FYL2XP1` — ST(1) * log2(ST(0) + 1).
    pub fn fyl2xp1(&mut self) {
        self.code.extend_from_slice(&[0xD9, 0xF9]);
    }

    /// Clear RDI, RSI, RDX, R10, R8 and R9 ahead of staging syscall
    /// arguments, so no stale value rides along in an unused slot.
    pub fn zero_syscall_registers(&mut self) {
        for reg in [Gpr::Rdi, Gpr::Rsi, Gpr::Rdx, Gpr::R10, Gpr::R8, Gpr::R9] {
            self.xor_rr(reg, reg);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn bytes(f: impl FnOnce(&mut Assembler)) -> Vec<u8> {
        let mut asm = Assembler::new();
        f(&mut asm);
        asm.code
    }

    #[test]
    fn mov_ri_is_always_ten_bytes() {
        let b = bytes(|a| a.mov_ri(Gpr::Rax, 14));
        assert_eq!(b, vec![0x48, 0xB8, 14, 0, 0, 0, 0, 0, 0, 0]);
        let b = bytes(|a| a.mov_ri(Gpr::R10, -1));
        assert_eq!(b[..2], [0x49, 0xBA]);
        assert_eq!(b.len(), 10);
    }

    #[test]
    fn mov_rr_forms() {
        assert_eq!(bytes(|a| a.mov_rr(Gpr::Rbx, Gpr::Rax)), vec![0x48, 0x89, 0xC3]);
        assert_eq!(bytes(|a| a.mov_rr(Gpr::R12, Gpr::Rax)), vec![0x49, 0x89, 0xC4]);
        assert_eq!(bytes(|a| a.mov_rr(Gpr::Rbx, Gpr::R12)), vec![0x4C, 0x89, 0xE3]);
    }

    #[test]
    fn frame_local_load_store() {
        // MOV RAX, [RBP - 16] => 48 8B 45 F0.
        assert_eq!(
            bytes(|a| a.load(Gpr::Rax, Mem::local(16))),
            vec![0x48, 0x8B, 0x45, 0xF0]
        );
        // MOV [RBP - 0x110], RAX uses disp32.
        assert_eq!(
            bytes(|a| a.store(Mem::local(0x110), Gpr::Rax)),
            vec![0x48, 0x89, 0x85, 0xF0, 0xFE, 0xFF, 0xFF]
        );
    }

    #[test]
    fn pool_variable_addressing() {
        // MOV RAX, [R15 + 24] => 49 8B 47 18.
        assert_eq!(
            bytes(|a| a.load(Gpr::Rax, Mem::pool(3))),
            vec![0x49, 0x8B, 0x47, 0x18]
        );
        // MOV [R15], RAX => 49 89 07.
        assert_eq!(
            bytes(|a| a.store(Mem::pool(0), Gpr::Rax)),
            vec![0x49, 0x89, 0x07]
        );
    }

    #[test]
    fn push_pop_extended() {
        assert_eq!(bytes(|a| a.push(Gpr::Rbx)), vec![0x53]);
        assert_eq!(bytes(|a| a.push(Gpr::R12)), vec![0x41, 0x54]);
        assert_eq!(bytes(|a| a.pop(Gpr::R13)), vec![0x41, 0x5D]);
    }

    #[test]
    fn alu_imm_narrows_to_imm8() {
        assert_eq!(bytes(|a| a.add_ri(Gpr::Rsp, 16)), vec![0x48, 0x83, 0xC4, 0x10]);
        assert_eq!(
            bytes(|a| a.sub_ri(Gpr::Rsp, 0x1000)),
            vec![0x48, 0x81, 0xEC, 0x00, 0x10, 0x00, 0x00]
        );
    }

    #[test]
    fn division_sequence() {
        let b = bytes(|a| {
            a.cqo();
            a.idiv(Gpr::Rbx);
        });
        assert_eq!(b, vec![0x48, 0x99, 0x48, 0xF7, 0xFB]);
    }

    #[test]
    fn setcc_materializes_bool() {
        // SETL AL; MOVZX RAX, AL.
        assert_eq!(
            bytes(|a| a.setcc_bool(Cond::L)),
            vec![0x0F, 0x9C, 0xC0, 0x48, 0x0F, 0xB6, 0xC0]
        );
    }

    #[test]
    fn sse2_byte_broadcast() {
        let b = bytes(|a| {
            a.movd(Xmm::Xmm0, Gpr::Rax);
            a.punpcklbw(Xmm::Xmm0, Xmm::Xmm0);
            a.pshuflw(Xmm::Xmm0, Xmm::Xmm0, 0);
            a.pshufd(Xmm::Xmm0, Xmm::Xmm0, 0);
        });
        assert_eq!(
            b,
            vec![
                0x66, 0x0F, 0x6E, 0xC0, // MOVD XMM0, EAX
                0x66, 0x0F, 0x60, 0xC0, // PUNPCKLBW XMM0, XMM0
                0xF2, 0x0F, 0x70, 0xC0, 0x00, // PSHUFLW XMM0, XMM0, 0
                0x66, 0x0F, 0x70, 0xC0, 0x00, // PSHUFD XMM0, XMM0, 0
            ]
        );
    }

    #[test]
    fn sse2_compare_loop_core() {
        let b = bytes(|a| {
            a.movdqu_load(Xmm::Xmm0, Mem::base(Gpr::Rsi));
            a.movdqu_load(Xmm::Xmm1, Mem::base(Gpr::Rdi));
            a.pcmpeqb(Xmm::Xmm0, Xmm::Xmm1);
            a.pmovmskb(Gpr::Rax, Xmm::Xmm0);
        });
        assert_eq!(
            b,
            vec![
                0xF3, 0x0F, 0x6F, 0x06, // MOVDQU XMM0, [RSI]
                0xF3, 0x0F, 0x6F, 0x0F, // MOVDQU XMM1, [RDI]
                0x66, 0x0F, 0x74, 0xC1, // PCMPEQB XMM0, XMM1
                0x66, 0x0F, 0xD7, 0xC0, // PMOVMSKB EAX, XMM0
            ]
        );
    }

    #[test]
    fn string_loop_byte_ops() {
        // CMP BYTE [RDI + RCX], 0 => 80 3C 0F 00.
        assert_eq!(
            bytes(|a| a.cmp_m8_imm(Mem::base_index_disp(Gpr::Rdi, Gpr::Rcx, 0), 0)),
            vec![0x80, 0x3C, 0x0F, 0x00]
        );
        // MOV [RDI], CL => 88 0F.
        assert_eq!(
            bytes(|a| a.store_u8(Mem::base(Gpr::Rdi), Gpr::Rcx)),
            vec![0x88, 0x0F]
        );
    }

    #[test]
    fn bit_and_conditional_forms() {
        // POPCNT RAX, RAX / LZCNT / TZCNT share the F3-prefixed 0F Bx row.
        assert_eq!(
            bytes(|a| a.popcnt(Gpr::Rax, Gpr::Rax)),
            vec![0xF3, 0x48, 0x0F, 0xB8, 0xC0]
        );
        assert_eq!(
            bytes(|a| a.lzcnt(Gpr::Rax, Gpr::Rax)),
            vec![0xF3, 0x48, 0x0F, 0xBD, 0xC0]
        );
        assert_eq!(
            bytes(|a| a.tzcnt(Gpr::Rax, Gpr::Rax)),
            vec![0xF3, 0x48, 0x0F, 0xBC, 0xC0]
        );
        // CMOVLE RAX, RCX => 48 0F 4E C1.
        assert_eq!(
            bytes(|a| a.cmovcc(Cond::Le, Gpr::Rax, Gpr::Rcx)),
            vec![0x48, 0x0F, 0x4E, 0xC1]
        );
        // ROL RAX, CL => 48 D3 C0; ROR => 48 D3 C8.
        assert_eq!(bytes(|a| a.rol_cl(Gpr::Rax)), vec![0x48, 0xD3, 0xC0]);
        assert_eq!(bytes(|a| a.ror_cl(Gpr::Rax)), vec![0x48, 0xD3, 0xC8]);
        // BSWAP RAX => 48 0F C8.
        assert_eq!(bytes(|a| a.bswap_r64(Gpr::Rax)), vec![0x48, 0x0F, 0xC8]);
    }

    #[test]
    fn atomic_add_carries_lock_prefix() {
        // LOCK ADD [RAX], RBX => F0 48 01 18.
        assert_eq!(
            bytes(|a| a.lock_add_m(Mem::base(Gpr::Rax), Gpr::Rbx)),
            vec![0xF0, 0x48, 0x01, 0x18]
        );
    }

    #[test]
    fn scalar_double_conversion_round_trip() {
        let b = bytes(|a| {
            a.cvtsi2sd(Xmm::Xmm0, Gpr::Rax);
            a.sqrtsd(Xmm::Xmm0, Xmm::Xmm0);
            a.cvttsd2si(Gpr::Rax, Xmm::Xmm0);
        });
        assert_eq!(
            b,
            vec![
                0xF2, 0x48, 0x0F, 0x2A, 0xC0, // CVTSI2SD XMM0, RAX
                0xF2, 0x0F, 0x51, 0xC0, // SQRTSD XMM0, XMM0
                0xF2, 0x48, 0x0F, 0x2C, 0xC0, // CVTTSD2SI RAX, XMM0
            ]
        );
    }

    #[test]
    fn x87_loads_and_transcendentals() {
        // FILD QWORD [RSP] => DF 2C 24; FISTP QWORD [RSP] => DF 3C 24.
        assert_eq!(
            bytes(|a| a.fild64(Mem::base(Gpr::Rsp))),
            vec![0xDF, 0x2C, 0x24]
        );
        assert_eq!(
            bytes(|a| a.fistp64(Mem::base(Gpr::Rsp))),
            vec![0xDF, 0x3C, 0x24]
        );
        assert_eq!(bytes(|a| a.fsin()), vec![0xD9, 0xFE]);
        assert_eq!(bytes(|a| a.fcos()), vec![0xD9, 0xFF]);
        assert_eq!(bytes(|a| a.fpatan()), vec![0xD9, 0xF3]);
        assert_eq!(bytes(|a| a.fyl2x()), vec![0xD9, 0xF1]);
        assert_eq!(bytes(|a| a.fscale()), vec![0xD9, 0xFD]);
    }

    #[test]
    fn fences() {
        assert_eq!(bytes(|a| a.mfence()), vec![0x0F, 0xAE, 0xF0]);
        assert_eq!(bytes(|a| a.lfence()), vec![0x0F, 0xAE, 0xE8]);
        assert_eq!(bytes(|a| a.sfence()), vec![0x0F, 0xAE, 0xF8]);
    }

    #[test]
    fn syscall_register_zeroing_covers_all_six() {
        let b = bytes(|a| a.zero_syscall_registers());
        // Six XORs; the last three need REX.B and REX.R.
        assert_eq!(b.len(), 18);
        assert_eq!(&b[0..3], &[0x48, 0x31, 0xFF]); // XOR RDI, RDI
        assert_eq!(&b[15..18], &[0x4D, 0x31, 0xC9]); // XOR R9, R9
    }
}
