//! The per-architecture knowledge the core needs: how to classify a
//! relocation type into what dynamic-linking tables its target requires, the
//! dynamic relocation type codes we emit, and the PLT entry shape. Applying
//! relocations to section bytes is a separate concern and lives with the
//! per-architecture relocation kernels.

use crate::error::Result;
use anyhow::bail;

/// What a relocation asks of its target, before taking the target's
/// definition kind into account.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum RelocClass {
    /// The absolute address of the target.
    Absolute,

    /// The target's address relative to the place of the relocation.
    Relative,

    /// The target needs a GOT slot.
    Got,

    /// The target is called and may need a PLT stub.
    Plt,

    /// The target needs a GOT slot holding its TP-relative offset.
    GotTpOff,

    /// The target needs a TLS general-dynamic (module, offset) pair.
    TlsGd,

    /// The module needs a TLS local-dynamic pair.
    TlsLd,

    /// Resolved entirely at link time against the TLS segment.
    TpOff,

    /// The offset of a thread-local within its module's TLS block.
    DtpOff,

    /// No table requirements.
    None,
}

pub(crate) trait Arch {
    const MACHINE: u16;

    /// Dynamic relocation type codes.
    const REL_JUMP_SLOT: u32;
    const REL_GLOB_DAT: u32;
    const REL_COPY: u32;
    const REL_RELATIVE: u32;
    const REL_TPOFF: u32;
    const REL_DTPMOD: u32;
    const REL_DTPOFF: u32;

    const PLT_ENTRY_SIZE: u64;

    fn classify_relocation(r_type: u32) -> Result<RelocClass>;

    /// Emits one PLT entry that jumps through the corresponding GOT slot.
    /// Lazy binding isn't supported, so entries don't push relocation
    /// indices.
    fn write_plt_entry(buf: &mut [u8], got_address: u64, plt_address: u64);

    /// The static thread-pointer-relative offset of a TLS variable.
    fn tp_offset(address: u64, tls_start: u64, tls_end: u64) -> u64;
}

pub(crate) struct X86_64;

impl Arch for X86_64 {
    const MACHINE: u16 = object::elf::EM_X86_64;

    const REL_JUMP_SLOT: u32 = object::elf::R_X86_64_JUMP_SLOT;
    const REL_GLOB_DAT: u32 = object::elf::R_X86_64_GLOB_DAT;
    const REL_COPY: u32 = object::elf::R_X86_64_COPY;
    const REL_RELATIVE: u32 = object::elf::R_X86_64_RELATIVE;
    const REL_TPOFF: u32 = object::elf::R_X86_64_TPOFF64;
    const REL_DTPMOD: u32 = object::elf::R_X86_64_DTPMOD64;
    const REL_DTPOFF: u32 = object::elf::R_X86_64_DTPOFF64;

    const PLT_ENTRY_SIZE: u64 = 16;

    fn classify_relocation(r_type: u32) -> Result<RelocClass> {
        use object::elf::*;
        Ok(match r_type {
            R_X86_64_64 | R_X86_64_32 | R_X86_64_32S | R_X86_64_16 | R_X86_64_8 => {
                RelocClass::Absolute
            }
            R_X86_64_PC64 | R_X86_64_PC32 | R_X86_64_PC16 | R_X86_64_PC8 => RelocClass::Relative,
            R_X86_64_GOT32 | R_X86_64_GOT64 | R_X86_64_GOTPCREL | R_X86_64_GOTPCRELX
            | R_X86_64_REX_GOTPCRELX => RelocClass::Got,
            // GOTPC relocations reference _GLOBAL_OFFSET_TABLE_ itself.
            R_X86_64_GOTPC32 | R_X86_64_GOTPC64 | R_X86_64_GOTOFF64 => RelocClass::None,
            R_X86_64_PLT32 | R_X86_64_PLTOFF64 => RelocClass::Plt,
            R_X86_64_GOTTPOFF => RelocClass::GotTpOff,
            R_X86_64_TLSGD => RelocClass::TlsGd,
            R_X86_64_TLSLD => RelocClass::TlsLd,
            R_X86_64_TPOFF32 | R_X86_64_TPOFF64 => RelocClass::TpOff,
            R_X86_64_DTPOFF32 | R_X86_64_DTPOFF64 => RelocClass::DtpOff,
            R_X86_64_NONE => RelocClass::None,
            _ => bail!("Unsupported relocation type {r_type} for x86-64"),
        })
    }

    fn tp_offset(address: u64, _tls_start: u64, tls_end: u64) -> u64 {
        // The thread pointer sits just past the end of the TLS block.
        address.wrapping_sub(tls_end)
    }

    fn write_plt_entry(buf: &mut [u8], got_address: u64, plt_address: u64) {
        // endbr64; jmp *{got}(%rip); nop padding
        buf[..16].copy_from_slice(&[
            0xf3, 0x0f, 0x1e, 0xfa, // endbr64
            0xff, 0x25, 0, 0, 0, 0, // jmp *0x0(%rip)
            0x66, 0x0f, 0x1f, 0x44, 0, 0, // nopw 0x0(%rax,%rax,1)
        ]);
        let displacement = got_address.wrapping_sub(plt_address + 10) as u32;
        buf[6..10].copy_from_slice(&displacement.to_le_bytes());
    }
}

pub(crate) struct I386;

impl Arch for I386 {
    const MACHINE: u16 = object::elf::EM_386;

    const REL_JUMP_SLOT: u32 = object::elf::R_386_JMP_SLOT;
    const REL_GLOB_DAT: u32 = object::elf::R_386_GLOB_DAT;
    const REL_COPY: u32 = object::elf::R_386_COPY;
    const REL_RELATIVE: u32 = object::elf::R_386_RELATIVE;
    const REL_TPOFF: u32 = object::elf::R_386_TLS_TPOFF;
    const REL_DTPMOD: u32 = object::elf::R_386_TLS_DTPMOD32;
    const REL_DTPOFF: u32 = object::elf::R_386_TLS_DTPOFF32;

    const PLT_ENTRY_SIZE: u64 = 16;

    fn classify_relocation(r_type: u32) -> Result<RelocClass> {
        use object::elf::*;
        Ok(match r_type {
            R_386_32 | R_386_16 | R_386_8 => RelocClass::Absolute,
            R_386_PC32 | R_386_PC16 | R_386_PC8 => RelocClass::Relative,
            R_386_GOT32 | R_386_GOT32X => RelocClass::Got,
            R_386_GOTOFF | R_386_GOTPC => RelocClass::None,
            R_386_PLT32 => RelocClass::Plt,
            R_386_TLS_IE | R_386_TLS_GOTIE => RelocClass::GotTpOff,
            R_386_TLS_GD => RelocClass::TlsGd,
            R_386_TLS_LDM => RelocClass::TlsLd,
            R_386_TLS_LE | R_386_TLS_LE_32 => RelocClass::TpOff,
            R_386_TLS_LDO_32 => RelocClass::DtpOff,
            R_386_NONE => RelocClass::None,
            _ => bail!("Unsupported relocation type {r_type} for i386"),
        })
    }

    fn tp_offset(address: u64, _tls_start: u64, tls_end: u64) -> u64 {
        address.wrapping_sub(tls_end)
    }

    fn write_plt_entry(buf: &mut [u8], got_address: u64, _plt_address: u64) {
        // jmp *got; padding. Non-PIC form: absolute GOT address.
        buf[..16].copy_from_slice(&[
            0xff, 0x25, 0, 0, 0, 0, // jmp *addr
            0x66, 0x90, 0x66, 0x90, 0x66, 0x90, 0x66, 0x90, 0x66, 0x90,
        ]);
        buf[2..6].copy_from_slice(&(got_address as u32).to_le_bytes());
    }
}

pub(crate) struct AArch64;

impl Arch for AArch64 {
    const MACHINE: u16 = object::elf::EM_AARCH64;

    const REL_JUMP_SLOT: u32 = object::elf::R_AARCH64_JUMP_SLOT;
    const REL_GLOB_DAT: u32 = object::elf::R_AARCH64_GLOB_DAT;
    const REL_COPY: u32 = object::elf::R_AARCH64_COPY;
    const REL_RELATIVE: u32 = object::elf::R_AARCH64_RELATIVE;
    const REL_TPOFF: u32 = object::elf::R_AARCH64_TLS_TPREL;
    const REL_DTPMOD: u32 = object::elf::R_AARCH64_TLS_DTPMOD;
    const REL_DTPOFF: u32 = object::elf::R_AARCH64_TLS_DTPREL;

    const PLT_ENTRY_SIZE: u64 = 16;

    fn classify_relocation(r_type: u32) -> Result<RelocClass> {
        use object::elf::*;
        Ok(match r_type {
            R_AARCH64_ABS64 | R_AARCH64_ABS32 | R_AARCH64_ABS16 => RelocClass::Absolute,
            R_AARCH64_PREL64 | R_AARCH64_PREL32 | R_AARCH64_PREL16 => RelocClass::Relative,
            R_AARCH64_ADR_PREL_PG_HI21 | R_AARCH64_ADD_ABS_LO12_NC | R_AARCH64_LDST8_ABS_LO12_NC
            | R_AARCH64_LDST16_ABS_LO12_NC | R_AARCH64_LDST32_ABS_LO12_NC
            | R_AARCH64_LDST64_ABS_LO12_NC | R_AARCH64_LDST128_ABS_LO12_NC => RelocClass::Absolute,
            R_AARCH64_ADR_GOT_PAGE | R_AARCH64_LD64_GOT_LO12_NC => RelocClass::Got,
            R_AARCH64_CALL26 | R_AARCH64_JUMP26 => RelocClass::Plt,
            R_AARCH64_TLSIE_ADR_GOTTPREL_PAGE21 | R_AARCH64_TLSIE_LD64_GOTTPREL_LO12_NC => {
                RelocClass::GotTpOff
            }
            R_AARCH64_TLSGD_ADR_PAGE21 | R_AARCH64_TLSGD_ADD_LO12_NC => RelocClass::TlsGd,
            R_AARCH64_TLSLD_ADR_PAGE21 | R_AARCH64_TLSLD_ADD_LO12_NC => RelocClass::TlsLd,
            R_AARCH64_TLSLE_ADD_TPREL_HI12 | R_AARCH64_TLSLE_ADD_TPREL_LO12
            | R_AARCH64_TLSLE_ADD_TPREL_LO12_NC => RelocClass::TpOff,
            R_AARCH64_NONE => RelocClass::None,
            _ => bail!("Unsupported relocation type {r_type} for aarch64"),
        })
    }

    fn tp_offset(address: u64, tls_start: u64, _tls_end: u64) -> u64 {
        // TLS blocks start 16 bytes past the thread pointer.
        address.wrapping_sub(tls_start).wrapping_add(16)
    }

    fn write_plt_entry(buf: &mut [u8], got_address: u64, plt_address: u64) {
        // adrp x16, got_page; ldr x17, [x16, got_lo]; br x17; nop
        let page_delta = (got_address & !0xfff).wrapping_sub(plt_address & !0xfff);
        let immhi = ((page_delta >> 14) & 0x7ffff) as u32;
        let immlo = ((page_delta >> 12) & 0x3) as u32;
        let adrp = 0x9000_0010 | (immlo << 29) | (immhi << 5);
        let ldr = 0xf940_0211 | ((((got_address & 0xfff) >> 3) as u32) << 10);
        let br: u32 = 0xd61f_0220;
        let nop: u32 = 0xd503_201f;
        buf[..4].copy_from_slice(&adrp.to_le_bytes());
        buf[4..8].copy_from_slice(&ldr.to_le_bytes());
        buf[8..12].copy_from_slice(&br.to_le_bytes());
        buf[12..16].copy_from_slice(&nop.to_le_bytes());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classifies_x86_64_relocations() {
        assert_eq!(
            X86_64::classify_relocation(object::elf::R_X86_64_PLT32).unwrap(),
            RelocClass::Plt
        );
        assert_eq!(
            X86_64::classify_relocation(object::elf::R_X86_64_GOTPCREL).unwrap(),
            RelocClass::Got
        );
        assert_eq!(
            X86_64::classify_relocation(object::elf::R_X86_64_TLSGD).unwrap(),
            RelocClass::TlsGd
        );
        assert!(X86_64::classify_relocation(0xffff).is_err());
    }

    #[test]
    fn x86_64_plt_entry_displacement() {
        let mut buf = [0u8; 16];
        X86_64::write_plt_entry(&mut buf, 0x3000, 0x1000);
        // Displacement is relative to the end of the jmp instruction.
        let displacement = u32::from_le_bytes(buf[6..10].try_into().unwrap());
        assert_eq!(displacement, 0x3000 - (0x1000 + 10));
    }
}
