//! ELF executable emission.
//!
//! The output is a 64-bit little-endian `ET_EXEC` image with exactly two
//! `PT_LOAD` program headers: code (R+X) and data (R+W). The first page
//! holds the ELF header and both program headers; code starts at file
//! offset 0x1000 and virtual address `0x400000 + 0x1000`; data starts at
//! the next page-aligned file offset, mapped at `0x400000 + that offset`.
//! The entry point is the first byte of the code segment. No section
//! headers, no symbol table, no dynamic linkage.

use crate::asm::Assembler;
use crate::result::CodegenResult;
use log::debug;

/// Standard Linux load address for non-PIE executables.
pub const LOAD_ADDR: u64 = 0x400000;
/// Page size used for segment alignment.
pub const PAGE_SIZE: u64 = 0x1000;

const EHDR_SIZE: usize = 64;
const PHDR_SIZE: usize = 56;

/// Compute the segment layout, apply the remaining relocations, and
/// produce the executable bytes.
pub fn write_executable(asm: &mut Assembler) -> CodegenResult<Vec<u8>> {
    let header_size = PAGE_SIZE;
    let code_vaddr = LOAD_ADDR + header_size;
    let code_end = header_size + asm.code.len() as u64;
    let data_file_offset = (code_end + PAGE_SIZE - 1) & !(PAGE_SIZE - 1);
    let data_vaddr = LOAD_ADDR + data_file_offset;

    asm.set_base_addresses(code_vaddr, data_vaddr);
    asm.apply_relocations()?;
    debug!(
        "ELF layout: code {:#x} ({} bytes), data {:#x} ({} bytes)",
        code_vaddr,
        asm.code.len(),
        data_vaddr,
        asm.data.len()
    );

    let mut out = Vec::with_capacity(data_file_offset as usize + asm.data.len());

    // ELF header.
    out.extend_from_slice(&[0x7F, b'E', b'L', b'F', 2, 1, 1, 0]);
    out.extend_from_slice(&[0u8; 8]);
    out.extend_from_slice(&2u16.to_le_bytes()); // e_type = ET_EXEC
    out.extend_from_slice(&0x3Eu16.to_le_bytes()); // e_machine = EM_X86_64
    out.extend_from_slice(&1u32.to_le_bytes()); // e_version
    out.extend_from_slice(&code_vaddr.to_le_bytes()); // e_entry
    out.extend_from_slice(&(EHDR_SIZE as u64).to_le_bytes()); // e_phoff
    out.extend_from_slice(&0u64.to_le_bytes()); // e_shoff
    out.extend_from_slice(&0u32.to_le_bytes()); // e_flags
    out.extend_from_slice(&(EHDR_SIZE as u16).to_le_bytes()); // e_ehsize
    out.extend_from_slice(&(PHDR_SIZE as u16).to_le_bytes()); // e_phentsize
    out.extend_from_slice(&2u16.to_le_bytes()); // e_phnum
    out.extend_from_slice(&0u16.to_le_bytes()); // e_shentsize
    out.extend_from_slice(&0u16.to_le_bytes()); // e_shnum
    out.extend_from_slice(&0u16.to_le_bytes()); // e_shstrndx
    debug_assert_eq!(out.len(), EHDR_SIZE);

    // Code segment program header: PT_LOAD, R+X.
    write_phdr(
        &mut out,
        5,
        header_size,
        code_vaddr,
        asm.code.len() as u64,
    );
    // Data segment program header: PT_LOAD, R+W.
    write_phdr(
        &mut out,
        6,
        data_file_offset,
        data_vaddr,
        asm.data.len() as u64,
    );

    out.resize(header_size as usize, 0);
    out.extend_from_slice(&asm.code);
    out.resize(data_file_offset as usize, 0);
    out.extend_from_slice(&asm.data);
    Ok(out)
}

fn write_phdr(out: &mut Vec<u8>, flags: u32, offset: u64, vaddr: u64, size: u64) {
    out.extend_from_slice(&1u32.to_le_bytes()); // p_type = PT_LOAD
    out.extend_from_slice(&flags.to_le_bytes());
    out.extend_from_slice(&offset.to_le_bytes());
    out.extend_from_slice(&vaddr.to_le_bytes()); // p_vaddr
    out.extend_from_slice(&vaddr.to_le_bytes()); // p_paddr
    out.extend_from_slice(&size.to_le_bytes()); // p_filesz
    out.extend_from_slice(&size.to_le_bytes()); // p_memsz
    out.extend_from_slice(&PAGE_SIZE.to_le_bytes()); // p_align
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::asm::Gpr;

    fn sample_assembler() -> Assembler {
        let mut asm = Assembler::new();
        let msg = asm.add_string("hi\n");
        asm.mov_ri(Gpr::Rax, 1);
        asm.mov_ri(Gpr::Rdi, 1);
        asm.load_data_address(Gpr::Rsi, msg);
        asm.mov_ri(Gpr::Rdx, 3);
        asm.syscall();
        asm.mov_ri(Gpr::Rax, 60);
        asm.mov_ri(Gpr::Rdi, 0);
        asm.syscall();
        asm
    }

    #[test]
    fn header_fields_are_exec_x86_64() {
        let mut asm = sample_assembler();
        let image = write_executable(&mut asm).unwrap();
        assert_eq!(&image[0..4], b"\x7FELF");
        assert_eq!(image[4], 2); // 64-bit
        assert_eq!(image[5], 1); // little-endian
        assert_eq!(u16::from_le_bytes([image[16], image[17]]), 2); // ET_EXEC
        assert_eq!(u16::from_le_bytes([image[18], image[19]]), 0x3E);
        let entry = u64::from_le_bytes(image[24..32].try_into().unwrap());
        assert_eq!(entry, LOAD_ADDR + PAGE_SIZE);
        assert_eq!(u16::from_le_bytes([image[56], image[57]]), 2); // e_phnum
    }

    #[test]
    fn segments_have_documented_offsets_and_flags() {
        let mut asm = sample_assembler();
        let code_len = asm.code.len() as u64;
        let image = write_executable(&mut asm).unwrap();

        let code_phdr = &image[64..64 + 56];
        assert_eq!(u32::from_le_bytes(code_phdr[0..4].try_into().unwrap()), 1);
        assert_eq!(u32::from_le_bytes(code_phdr[4..8].try_into().unwrap()), 5);
        assert_eq!(
            u64::from_le_bytes(code_phdr[8..16].try_into().unwrap()),
            PAGE_SIZE
        );
        assert_eq!(
            u64::from_le_bytes(code_phdr[32..40].try_into().unwrap()),
            code_len
        );

        let data_phdr = &image[64 + 56..64 + 112];
        assert_eq!(u32::from_le_bytes(data_phdr[4..8].try_into().unwrap()), 6);
        let data_offset = u64::from_le_bytes(data_phdr[8..16].try_into().unwrap());
        assert_eq!(data_offset % PAGE_SIZE, 0);
        let data_vaddr = u64::from_le_bytes(data_phdr[16..24].try_into().unwrap());
        assert_eq!(data_vaddr, LOAD_ADDR + data_offset);
        // Data bytes land at the data offset.
        assert_eq!(&image[data_offset as usize..data_offset as usize + 3], b"hi\n");
    }

    #[test]
    fn output_is_deterministic() {
        let a = write_executable(&mut sample_assembler()).unwrap();
        let b = write_executable(&mut sample_assembler()).unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn no_placeholder_survives_relocation() {
        let mut asm = sample_assembler();
        write_executable(&mut asm).unwrap();
        assert!(!asm.has_pending_relocs());
    }
}
