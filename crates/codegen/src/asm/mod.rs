//! Binary machine-code emission.
//!
//! The assembler owns two byte vectors, `code` and `data`, and everything
//! needed to finish them: the label/jump manager, the relocation list, and
//! the string table. Modules emit through the primitive emitters in
//! [`emit`]; nothing else appends to the buffers.
//!
//! Forward references all use the same placeholder-plus-relocation pattern:
//! the emitter writes four zero bytes and records a [`Reloc`]; the
//! relocation passes patch them once every target is known. Near jumps use
//! the 32-bit-displacement form unconditionally so displacements never need
//! resizing.

pub mod emit;
mod encode;

pub use emit::Mem;
pub use encode::{Gpr, Xmm};

use crate::result::{CodegenError, CodegenResult};
use log::trace;
use std::fmt;

/// Offset in bytes from the beginning of the code or data buffer.
pub type CodeOffset = u32;

/// A synthetic label naming a position in the code buffer.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct Label(u32);

impl fmt::Display for Label {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "L{}", self.0)
    }
}

/// Condition codes for conditional jumps, in the Jcc rel32 encoding
/// (`0F 80+cc`).
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[allow(missing_docs)]
pub enum Cond {
    C = 0x2,
    Ae = 0x3,
    E = 0x4,
    Ne = 0x5,
    Be = 0x6,
    A = 0x7,
    S = 0x8,
    Ns = 0x9,
    L = 0xC,
    Ge = 0xD,
    Le = 0xE,
    G = 0xF,
}

impl Cond {
    /// JZ and JE share an encoding; the alias keeps call sites readable.
    pub const Z: Cond = Cond::E;
    /// JNZ alias.
    pub const Nz: Cond = Cond::Ne;
    /// JB alias (CF set).
    pub const B: Cond = Cond::C;
}

/// A pending patch of a 4-byte placeholder in `code`.
///
/// One tagged record covers jumps, calls, and data-address loads; the apply
/// passes dispatch on the kind once, as late as possible.
#[derive(Clone, Copy, Debug)]
pub enum Reloc {
    /// A 32-bit displacement to a code label (jump or call target),
    /// resolved by [`Assembler::resolve_jumps`] from label positions alone.
    LabelRel32 {
        /// Offset of the placeholder in `code`.
        at: CodeOffset,
        /// The referenced label.
        label: Label,
    },
    /// A RIP-relative 32-bit displacement into the data segment, patched by
    /// [`Assembler::apply_relocations`] once segment addresses are known.
    DataRel32 {
        /// Offset of the placeholder in `code`.
        at: CodeOffset,
        /// Byte offset of the target within the data buffer.
        data: CodeOffset,
    },
}

/// The growing code and data buffers plus their fix-up state.
pub struct Assembler {
    /// Machine code bytes.
    pub code: Vec<u8>,
    /// Data segment bytes (string table and constants).
    pub data: Vec<u8>,
    labels: Vec<Option<CodeOffset>>,
    relocs: Vec<Reloc>,
    code_base: u64,
    data_base: u64,
    data_overflow: bool,
}

impl Assembler {
    /// Create an empty assembler.
    pub fn new() -> Self {
        Assembler {
            code: Vec::new(),
            data: Vec::new(),
            labels: Vec::new(),
            relocs: Vec::new(),
            code_base: 0,
            data_base: 0,
            data_overflow: false,
        }
    }

    /// Current length of the code buffer.
    pub fn cur_offset(&self) -> CodeOffset {
        self.code.len() as CodeOffset
    }

    /// Return a fresh, unbound label.
    pub fn create_label(&mut self) -> Label {
        let l = Label(self.labels.len() as u32);
        self.labels.push(None);
        l
    }

    /// Record the current code position as `label`'s definition site.
    pub fn mark_label(&mut self, label: Label) {
        let at = self.cur_offset();
        trace!("{label} bound at {at:#x}");
        self.labels[label.0 as usize] = Some(at);
    }

    /// Position of a bound label, if it has been marked.
    pub fn label_offset(&self, label: Label) -> Option<CodeOffset> {
        self.labels[label.0 as usize]
    }

    /// Emit an unconditional `JMP rel32` to `label` with a placeholder
    /// displacement.
    pub fn jmp(&mut self, label: Label) {
        self.code.push(0xE9);
        self.push_label_placeholder(label);
    }

    /// Emit a conditional `Jcc rel32` to `label` with a placeholder
    /// displacement.
    pub fn jcc(&mut self, cc: Cond, label: Label) {
        self.code.push(0x0F);
        self.code.push(0x80 | cc as u8);
        self.push_label_placeholder(label);
    }

    /// Emit a `CALL rel32` to `label` with a placeholder displacement.
    pub fn call_label(&mut self, label: Label) {
        self.code.push(0xE8);
        self.push_label_placeholder(label);
    }

    fn push_label_placeholder(&mut self, label: Label) {
        let at = self.cur_offset();
        self.relocs.push(Reloc::LabelRel32 { at, label });
        self.code.extend_from_slice(&[0, 0, 0, 0]);
    }

    /// Emit `LEA reg, [rip + disp32]` referring to `data_offset` in the data
    /// buffer, with a placeholder displacement.
    pub fn load_data_address(&mut self, reg: Gpr, data_offset: CodeOffset) {
        let enc = reg.enc();
        let prefix = encode::rex(true, enc >> 3, 0, 0);
        self.code.push(prefix);
        self.code.push(0x8D);
        self.code.push(encode::encode_modrm(0b00, enc, 0b101));
        let at = self.cur_offset();
        self.relocs.push(Reloc::DataRel32 {
            at,
            data: data_offset,
        });
        self.code.extend_from_slice(&[0, 0, 0, 0]);
    }

    /// Append `s` to the data buffer, NUL-terminated, returning its byte
    /// offset. Identical strings are not deduplicated.
    pub fn add_string(&mut self, s: &str) -> CodeOffset {
        let offset = self.data.len() as CodeOffset;
        self.data.extend_from_slice(s.as_bytes());
        self.data.push(0);
        if self.data.len() > i32::MAX as usize {
            self.data_overflow = true;
        }
        offset
    }

    /// Append raw bytes to the data buffer, returning their offset.
    pub fn add_data(&mut self, bytes: &[u8]) -> CodeOffset {
        let offset = self.data.len() as CodeOffset;
        self.data.extend_from_slice(bytes);
        if self.data.len() > i32::MAX as usize {
            self.data_overflow = true;
        }
        offset
    }

    /// Resolve every pending label displacement.
    ///
    /// Fails, naming the label, if any referenced label was never marked.
    /// Data-address relocations stay pending; they need the segment layout.
    pub fn resolve_jumps(&mut self) -> CodegenResult<()> {
        let mut remaining = Vec::with_capacity(self.relocs.len());
        for reloc in std::mem::take(&mut self.relocs) {
            match reloc {
                Reloc::LabelRel32 { at, label } => {
                    let target = self.labels[label.0 as usize]
                        .ok_or_else(|| CodegenError::UnresolvedLabel(label.to_string()))?;
                    let disp = target as i64 - (at as i64 + 4);
                    let disp = i32::try_from(disp).map_err(|_| {
                        CodegenError::Resource(format!("jump to {label} exceeds ±2 GiB"))
                    })?;
                    self.code[at as usize..at as usize + 4]
                        .copy_from_slice(&disp.to_le_bytes());
                }
                other => remaining.push(other),
            }
        }
        self.relocs = remaining;
        Ok(())
    }

    /// Record the virtual addresses the ELF writer chose for the two
    /// segments.
    pub fn set_base_addresses(&mut self, code_base: u64, data_base: u64) {
        self.code_base = code_base;
        self.data_base = data_base;
    }

    /// Patch every remaining relocation. After this returns, no byte in
    /// `code` is a placeholder and no unresolved entry remains.
    pub fn apply_relocations(&mut self) -> CodegenResult<()> {
        if self.data_overflow {
            return Err(CodegenError::Resource(
                "data section exceeds 2 GiB".to_string(),
            ));
        }
        for reloc in std::mem::take(&mut self.relocs) {
            match reloc {
                Reloc::LabelRel32 { label, .. } => {
                    return Err(CodegenError::UnresolvedLabel(label.to_string()));
                }
                Reloc::DataRel32 { at, data } => {
                    let target = self.data_base + data as u64;
                    let rip = self.code_base + at as u64 + 4;
                    let disp = target as i64 - rip as i64;
                    let disp = i32::try_from(disp).map_err(|_| {
                        CodegenError::Resource("data reference exceeds ±2 GiB".to_string())
                    })?;
                    self.code[at as usize..at as usize + 4]
                        .copy_from_slice(&disp.to_le_bytes());
                }
            }
        }
        Ok(())
    }

    /// True if any relocation is still pending.
    pub fn has_pending_relocs(&self) -> bool {
        !self.relocs.is_empty()
    }
}

impl Default for Assembler {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn forward_jump_resolves() {
        let mut asm = Assembler::new();
        let target = asm.create_label();
        asm.jmp(target);
        asm.nop();
        asm.nop();
        asm.mark_label(target);
        asm.resolve_jumps().unwrap();
        // E9 disp32, disp = 7 - 5 = 2.
        assert_eq!(asm.code, vec![0xE9, 2, 0, 0, 0, 0x90, 0x90]);
    }

    #[test]
    fn backward_jcc_resolves_negative() {
        let mut asm = Assembler::new();
        let top = asm.create_label();
        asm.mark_label(top);
        asm.nop();
        asm.jcc(Cond::Ne, top);
        asm.resolve_jumps().unwrap();
        // 0F 85 disp32 at offset 1; disp = 0 - 7 = -7.
        assert_eq!(asm.code[1], 0x0F);
        assert_eq!(asm.code[2], 0x85);
        assert_eq!(
            i32::from_le_bytes(asm.code[3..7].try_into().unwrap()),
            -7
        );
    }

    #[test]
    fn unmarked_label_is_an_error() {
        let mut asm = Assembler::new();
        let phantom = asm.create_label();
        asm.call_label(phantom);
        let err = asm.resolve_jumps().unwrap_err();
        match err {
            CodegenError::UnresolvedLabel(name) => assert_eq!(name, "L0"),
            other => panic!("expected UnresolvedLabel, got {other}"),
        }
    }

    #[test]
    fn data_relocation_patches_rip_relative() {
        let mut asm = Assembler::new();
        let off = asm.add_string("hi");
        asm.load_data_address(Gpr::Rsi, off);
        asm.resolve_jumps().unwrap();
        assert!(asm.has_pending_relocs());
        asm.set_base_addresses(0x401000, 0x402000);
        asm.apply_relocations().unwrap();
        assert!(!asm.has_pending_relocs());
        // LEA RSI, [rip+disp]; instruction is 7 bytes, placeholder at 3.
        let disp = i32::from_le_bytes(asm.code[3..7].try_into().unwrap());
        assert_eq!(disp, (0x402000 - (0x401000 + 7)) as i32);
    }

    #[test]
    fn strings_are_nul_terminated_and_appended() {
        let mut asm = Assembler::new();
        assert_eq!(asm.add_string("ab"), 0);
        assert_eq!(asm.add_string(""), 3);
        assert_eq!(asm.data, b"ab\0\0");
    }
}
