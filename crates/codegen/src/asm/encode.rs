//! Encoding logic for REX-prefixed instructions.
//!
//! Every general-purpose operation in the backend works in 64-bit operand
//! size (REX.W = 1); 8-bit forms appear only in byte loads/stores and
//! SETcc, and those are emitted with registers whose encodings never
//! collide with the high-byte registers, so a REX prefix is only written
//! when an extended register actually requires one.

/// An x86-64 general-purpose register, in hardware encoding order.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[allow(missing_docs)]
pub enum Gpr {
    Rax = 0,
    Rcx = 1,
    Rdx = 2,
    Rbx = 3,
    Rsp = 4,
    Rbp = 5,
    Rsi = 6,
    Rdi = 7,
    R8 = 8,
    R9 = 9,
    R10 = 10,
    R11 = 11,
    R12 = 12,
    R13 = 13,
    R14 = 14,
    R15 = 15,
}

impl Gpr {
    /// The register's hardware encoding; e.g. `0` for `%rax`.
    #[inline]
    pub fn enc(self) -> u8 {
        self as u8
    }
}

/// An SSE register.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[allow(missing_docs)]
pub enum Xmm {
    Xmm0 = 0,
    Xmm1 = 1,
    Xmm2 = 2,
    Xmm3 = 3,
}

impl Xmm {
    #[inline]
    pub(crate) fn enc(self) -> u8 {
        self as u8
    }
}

/// Encode the ModR/M byte.
#[inline]
pub(crate) fn encode_modrm(m0d: u8, enc_reg_g: u8, rm_e: u8) -> u8 {
    debug_assert!(m0d < 4);
    debug_assert!(enc_reg_g < 16);
    debug_assert!(rm_e < 16);
    ((m0d & 3) << 6) | ((enc_reg_g & 7) << 3) | (rm_e & 7)
}

/// Encode the SIB byte (scale-index-base).
#[inline]
pub(crate) fn encode_sib(scale: u8, enc_index: u8, enc_base: u8) -> u8 {
    debug_assert!(scale < 4);
    debug_assert!(enc_index < 16);
    debug_assert!(enc_base < 16);
    ((scale & 3) << 6) | ((enc_index & 7) << 3) | (enc_base & 7)
}

/// Build a REX prefix byte from its four fields.
#[inline]
pub(crate) fn rex(w: bool, r: u8, x: u8, b: u8) -> u8 {
    0x40 | ((w as u8) << 3) | ((r & 1) << 2) | ((x & 1) << 1) | (b & 1)
}

/// A memory operand of the form `[base + index*1 + disp]`.
///
/// Displacements pick the shortest ModR/M form: none when zero (except for
/// RBP/R13 bases, which have no disp-less encoding), disp8 when it
/// sign-extends, disp32 otherwise.
#[derive(Clone, Copy, Debug)]
pub(crate) struct Amode {
    pub base: Gpr,
    pub index: Option<Gpr>,
    pub disp: i32,
}

impl Amode {
    pub(crate) fn base(base: Gpr) -> Amode {
        Amode {
            base,
            index: None,
            disp: 0,
        }
    }

    pub(crate) fn base_disp(base: Gpr, disp: i32) -> Amode {
        Amode {
            base,
            index: None,
            disp,
        }
    }

    pub(crate) fn base_index_disp(base: Gpr, index: Gpr, disp: i32) -> Amode {
        debug_assert!(index != Gpr::Rsp, "rsp cannot be an index register");
        Amode {
            base,
            index: Some(index),
            disp,
        }
    }
}

fn disp_mod(amode: &Amode) -> (u8, bool, bool) {
    // (mod bits, emit disp8, emit disp32)
    let base_low = amode.base.enc() & 7;
    if amode.disp == 0 && base_low != Gpr::Rbp.enc() {
        (0b00, false, false)
    } else if i8::try_from(amode.disp).is_ok() {
        (0b01, true, false)
    } else {
        (0b10, false, true)
    }
}

/// Emit `opcodes` with a ModR/M (+ SIB, + displacement) memory operand,
/// preceded by the REX prefix the operands require. `legacy_prefixes` go in
/// front of REX; `w` selects 64-bit operand size.
pub(crate) fn emit_mem(
    code: &mut Vec<u8>,
    legacy_prefixes: &[u8],
    w: bool,
    opcodes: &[u8],
    enc_g: u8,
    amode: Amode,
) {
    code.extend_from_slice(legacy_prefixes);

    let r = enc_g >> 3;
    let x = amode.index.map_or(0, |i| i.enc() >> 3);
    let b = amode.base.enc() >> 3;
    let prefix = rex(w, r, x, b);
    if prefix != 0x40 || w {
        code.push(prefix);
    }
    code.extend_from_slice(opcodes);

    let (m0d, disp8, disp32) = disp_mod(&amode);
    let base_low = amode.base.enc() & 7;
    match amode.index {
        Some(index) => {
            code.push(encode_modrm(m0d, enc_g, 0b100));
            code.push(encode_sib(0, index.enc(), amode.base.enc()));
        }
        None if base_low == Gpr::Rsp.enc() => {
            // rsp/r12 base always takes a SIB byte with no index.
            code.push(encode_modrm(m0d, enc_g, 0b100));
            code.push(encode_sib(0, 0b100, amode.base.enc()));
        }
        None => {
            code.push(encode_modrm(m0d, enc_g, amode.base.enc()));
        }
    }
    if disp8 {
        code.push(amode.disp as u8);
    } else if disp32 {
        code.extend_from_slice(&amode.disp.to_le_bytes());
    }
}

/// Emit `opcodes` with a register-register ModR/M operand.
pub(crate) fn emit_rr(
    code: &mut Vec<u8>,
    legacy_prefixes: &[u8],
    w: bool,
    opcodes: &[u8],
    enc_g: u8,
    enc_e: u8,
) {
    code.extend_from_slice(legacy_prefixes);
    let prefix = rex(w, enc_g >> 3, 0, enc_e >> 3);
    if prefix != 0x40 || w {
        code.push(prefix);
    }
    code.extend_from_slice(opcodes);
    code.push(encode_modrm(0b11, enc_g, enc_e));
}

#[cfg(test)]
mod tests {
    use super::*;

    fn mem_bytes(w: bool, opcodes: &[u8], enc_g: u8, amode: Amode) -> Vec<u8> {
        let mut out = Vec::new();
        emit_mem(&mut out, &[], w, opcodes, enc_g, amode);
        out
    }

    #[test]
    fn rbp_base_forces_disp8() {
        // MOV RAX, [RBP] has no disp-less form; expect 48 8B 45 00.
        let bytes = mem_bytes(true, &[0x8B], Gpr::Rax.enc(), Amode::base(Gpr::Rbp));
        assert_eq!(bytes, vec![0x48, 0x8B, 0x45, 0x00]);
    }

    #[test]
    fn rsp_base_takes_sib() {
        // MOV RAX, [RSP] => 48 8B 04 24.
        let bytes = mem_bytes(true, &[0x8B], Gpr::Rax.enc(), Amode::base(Gpr::Rsp));
        assert_eq!(bytes, vec![0x48, 0x8B, 0x04, 0x24]);
    }

    #[test]
    fn disp32_for_large_offsets() {
        // MOV RAX, [RBP - 0x188] => 48 8B 85 78 FE FF FF.
        let bytes = mem_bytes(
            true,
            &[0x8B],
            Gpr::Rax.enc(),
            Amode::base_disp(Gpr::Rbp, -0x188),
        );
        assert_eq!(bytes, vec![0x48, 0x8B, 0x85, 0x78, 0xFE, 0xFF, 0xFF]);
    }

    #[test]
    fn extended_registers_set_rex_bits() {
        // MOV RAX, [R15 + disp32] => 49 8B 87 ...
        let bytes = mem_bytes(true, &[0x8B], Gpr::Rax.enc(), Amode::base_disp(Gpr::R15, 0x100));
        assert_eq!(&bytes[..3], &[0x49, 0x8B, 0x87]);
        // MOV [R15], RAX — r15's low bits are not rbp's, so mod=00 is legal.
        let bytes = mem_bytes(true, &[0x89], Gpr::Rax.enc(), Amode::base(Gpr::R15));
        assert_eq!(bytes, vec![0x49, 0x89, 0x07]);
        // MOV [R13], RAX shares rbp's low bits and needs a zero disp8.
        let bytes = mem_bytes(true, &[0x89], Gpr::Rax.enc(), Amode::base(Gpr::R13));
        assert_eq!(bytes, vec![0x49, 0x89, 0x45, 0x00]);
    }

    #[test]
    fn base_index_uses_sib() {
        // LEA RBX, [RDI + RDX + 16] => 48 8D 5C 17 10.
        let bytes = mem_bytes(
            true,
            &[0x8D],
            Gpr::Rbx.enc(),
            Amode::base_index_disp(Gpr::Rdi, Gpr::Rdx, 16),
        );
        assert_eq!(bytes, vec![0x48, 0x8D, 0x5C, 0x17, 0x10]);
    }

    #[test]
    fn byte_op_without_rex() {
        // CMP BYTE [RDI + RCX], 0 => 80 3C 0F 00.
        let mut out = Vec::new();
        emit_mem(
            &mut out,
            &[],
            false,
            &[0x80],
            7,
            Amode::base_index_disp(Gpr::Rdi, Gpr::Rcx, 0),
        );
        out.push(0x00);
        assert_eq!(out, vec![0x80, 0x3C, 0x0F, 0x00]);
    }
}
