//! Double-checks the layout invariants before we write anything: extents
//! within the file, non-overlapping alloc chunks and the page congruence
//! rule. These should hold for every successful link, so a violation is an
//! internal error.

use crate::chunks::Chunk;
use crate::context::Context;
use crate::elf;
use crate::error::Result;
use crate::layout::Layout;
use anyhow::bail;

pub(crate) fn validate_layout(ctx: &Context, layout: &Layout) -> Result {
    let mut previous_alloc: Option<&Chunk> = None;

    for chunk in &ctx.chunks {
        let name = String::from_utf8_lossy(chunk.name);

        if chunk.shdr.sh_offset + chunk.file_size() > layout.file_size {
            bail!(
                "Internal error: section `{name}` extends beyond the file \
                 (0x{:x} + 0x{:x} > 0x{:x})",
                chunk.shdr.sh_offset,
                chunk.file_size(),
                layout.file_size
            );
        }

        if !chunk.is_alloc() {
            continue;
        }

        if chunk.shdr.sh_addr % elf::PAGE_SIZE != chunk.shdr.sh_offset % elf::PAGE_SIZE {
            bail!(
                "Internal error: section `{name}` breaks the page congruence rule \
                 (addr 0x{:x}, offset 0x{:x})",
                chunk.shdr.sh_addr,
                chunk.shdr.sh_offset
            );
        }

        if let Some(previous) = previous_alloc {
            // TBSS overlays the addresses of whatever follows the TLS
            // segment, so it's exempt from the no-overlap rule.
            let previous_is_tbss = previous.is_nobits() && previous.is_tls();
            if !previous_is_tbss {
                if previous.shdr.sh_addr + previous.shdr.sh_size > chunk.shdr.sh_addr {
                    bail!(
                        "Internal error: section `{name}` overlaps its predecessor in memory"
                    );
                }
            }
            if previous.shdr.sh_offset + previous.file_size() > chunk.shdr.sh_offset {
                bail!("Internal error: section `{name}` overlaps its predecessor in the file");
            }
        }
        previous_alloc = Some(chunk);
    }

    Ok(())
}
