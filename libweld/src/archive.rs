//! Code to read ar archives. We don't use the ar crate because it provides
//! access to entry data only via the Read trait and we want to borrow the
//! bytes of each entry straight out of the mapped file.

use crate::error::Result;
use anyhow::Context as _;
use anyhow::bail;
use bytemuck::Pod;
use bytemuck::Zeroable;

pub(crate) enum ArchiveEntry<'data> {
    /// The archive's own symbol table (`/`). We don't use it; the symbol
    /// tables of the individual members carry the same information.
    Ignored,
    Regular(ArchiveContent<'data>),
    Thin(ThinEntry<'data>),
}

pub(crate) struct ArchiveContent<'data> {
    pub(crate) identifier: &'data [u8],
    pub(crate) entry_data: &'data [u8],

    /// The offset in the archive at which the data starts.
    pub(crate) data_offset: usize,
}

/// A member of a thin archive: a reference to a file on disk rather than
/// inline contents.
pub(crate) struct ThinEntry<'data> {
    pub(crate) identifier: &'data [u8],
}

pub(crate) struct ArchiveIterator<'data> {
    data: &'data [u8],
    offset: usize,
    is_thin: bool,
    extended_filenames: &'data [u8],
}

#[derive(Zeroable, Pod, Clone, Copy)]
#[repr(C)]
struct EntryHeader {
    ident: [u8; 16],
    _timestamp: [u8; 12],
    _owner_id: [u8; 6],
    _group_id: [u8; 6],
    _mode: [u8; 8],
    size: [u8; 10],
    end: [u8; 2],
}

const HEADER_SIZE: usize = size_of::<EntryHeader>();

const _ASSERTS: () = {
    assert!(HEADER_SIZE == 60);
};

impl<'data> ArchiveIterator<'data> {
    /// Creates an iterator from the bytes of the whole archive, including the
    /// magic.
    pub(crate) fn from_archive_bytes(data: &'data [u8]) -> Result<Self> {
        if let Some(rest) = data.strip_prefix(&object::archive::MAGIC) {
            Ok(Self {
                data: rest,
                offset: object::archive::MAGIC.len(),
                is_thin: false,
                extended_filenames: &[],
            })
        } else if let Some(rest) = data.strip_prefix(&object::archive::THIN_MAGIC) {
            Ok(Self {
                data: rest,
                offset: object::archive::THIN_MAGIC.len(),
                is_thin: true,
                extended_filenames: &[],
            })
        } else {
            bail!("Missing archive magic");
        }
    }

    fn next_result(&mut self) -> Result<Option<ArchiveEntry<'data>>> {
        loop {
            if self.data.len() < HEADER_SIZE {
                if self.data.iter().all(|b| *b == b'\n' || *b == 0) {
                    return Ok(None);
                }
                bail!("Short entry header");
            }
            let (header, rest) = self.data.split_at(HEADER_SIZE);
            let header: &EntryHeader = bytemuck::from_bytes(header);
            let size = parse_decimal(&header.size).context("Invalid entry size")?;
            self.data = rest;
            self.offset += HEADER_SIZE;

            let ident = trim_ident(&header.ident);

            // Member contents are inline except in thin archives, where the
            // size field describes the referenced file instead.
            let is_reference = self.is_thin && ident != b"/" && ident != b"//";
            let inline_size = if is_reference { 0 } else { size };
            if self.data.len() < inline_size {
                bail!(
                    "Entry size is {size}, but only {} bytes left",
                    self.data.len()
                );
            }

            let entry = match ident {
                b"/" => Some(ArchiveEntry::Ignored),
                b"//" => {
                    self.extended_filenames = &self.data[..inline_size];
                    None
                }
                _ => {
                    let identifier = self.evaluate_identifier(ident)?;
                    if is_reference {
                        Some(ArchiveEntry::Thin(ThinEntry { identifier }))
                    } else {
                        Some(ArchiveEntry::Regular(ArchiveContent {
                            identifier,
                            entry_data: &self.data[..inline_size],
                            data_offset: self.offset,
                        }))
                    }
                }
            };

            let size_with_padding = inline_size.next_multiple_of(2).min(self.data.len());
            self.data = &self.data[size_with_padding..];
            self.offset += size_with_padding;

            if let Some(entry) = entry {
                return Ok(Some(entry));
            }
        }
    }

    /// Resolves the identifier of an entry. Long names are stored in the `//`
    /// entry and referenced as `/offset`; short names carry a trailing `/`.
    fn evaluate_identifier(&self, ident: &'data [u8]) -> Result<&'data [u8]> {
        if let Some(rest) = ident.strip_prefix(b"/") {
            let offset: usize = std::str::from_utf8(rest)
                .ok()
                .and_then(|s| s.trim().parse().ok())
                .context("Invalid long-name reference")?;
            if offset >= self.extended_filenames.len() {
                bail!("Long-name reference out of range");
            }
            let names = &self.extended_filenames[offset..];
            // Each name in the long-name table ends with `/\n`. Scan for the
            // newline since paths may themselves contain `/`.
            let end = memchr::memchr(b'\n', names).unwrap_or(names.len());
            return Ok(names[..end].strip_suffix(b"/").unwrap_or(&names[..end]));
        }
        Ok(ident.strip_suffix(b"/").unwrap_or(ident))
    }
}

fn trim_ident(ident: &[u8]) -> &[u8] {
    let end = ident
        .iter()
        .rposition(|b| *b != b' ')
        .map_or(0, |pos| pos + 1);
    &ident[..end]
}

fn parse_decimal(bytes: &[u8]) -> Option<usize> {
    let text = std::str::from_utf8(bytes).ok()?;
    text.trim_end().parse().ok()
}

impl<'data> Iterator for ArchiveIterator<'data> {
    type Item = Result<ArchiveEntry<'data>>;

    fn next(&mut self) -> Option<Self::Item> {
        self.next_result().transpose()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(ident: &str, data: &[u8]) -> Vec<u8> {
        let mut out = Vec::new();
        out.extend_from_slice(format!("{ident:<16}").as_bytes());
        out.extend_from_slice(b"0           ");
        out.extend_from_slice(b"0     ");
        out.extend_from_slice(b"0     ");
        out.extend_from_slice(b"644     ");
        out.extend_from_slice(format!("{:<10}", data.len()).as_bytes());
        out.extend_from_slice(b"`\n");
        out.extend_from_slice(data);
        if data.len() % 2 == 1 {
            out.push(b'\n');
        }
        out
    }

    fn archive(entries: &[(&str, &[u8])]) -> Vec<u8> {
        let mut out = Vec::new();
        out.extend_from_slice(&object::archive::MAGIC);
        for (ident, data) in entries {
            out.extend_from_slice(&entry(ident, data));
        }
        out
    }

    #[test]
    fn iterates_regular_entries() {
        let data = archive(&[("a.o/", b"AAA"), ("b.o/", b"BBBB")]);
        let entries: Vec<_> = ArchiveIterator::from_archive_bytes(&data)
            .unwrap()
            .map(|e| e.unwrap())
            .collect();
        assert_eq!(entries.len(), 2);
        let ArchiveEntry::Regular(first) = &entries[0] else {
            panic!("expected regular entry");
        };
        assert_eq!(first.identifier, b"a.o");
        assert_eq!(first.entry_data, b"AAA");
        let ArchiveEntry::Regular(second) = &entries[1] else {
            panic!("expected regular entry");
        };
        assert_eq!(second.identifier, b"b.o");
        assert_eq!(second.entry_data, b"BBBB");
    }

    #[test]
    fn resolves_long_names() {
        let long_names = b"a_very_long_member_name.o/\n";
        let data = archive(&[
            ("/", b"\0\0\0\0"),
            ("//", long_names),
            ("/0", b"DATA"),
        ]);
        let entries: Vec<_> = ArchiveIterator::from_archive_bytes(&data)
            .unwrap()
            .map(|e| e.unwrap())
            .collect();
        assert_eq!(entries.len(), 2);
        assert!(matches!(entries[0], ArchiveEntry::Ignored));
        let ArchiveEntry::Regular(member) = &entries[1] else {
            panic!("expected regular entry");
        };
        assert_eq!(member.identifier, b"a_very_long_member_name.o");
        assert_eq!(member.entry_data, b"DATA");
    }

    #[test]
    fn iterates_thin_entries() {
        let mut data = Vec::new();
        data.extend_from_slice(&object::archive::THIN_MAGIC);
        data.extend_from_slice(&entry("member.o/", b""));
        let entries: Vec<_> = ArchiveIterator::from_archive_bytes(&data)
            .unwrap()
            .map(|e| e.unwrap())
            .collect();
        assert_eq!(entries.len(), 1);
        let ArchiveEntry::Thin(member) = &entries[0] else {
            panic!("expected thin entry");
        };
        assert_eq!(member.identifier, b"member.o");
    }

    #[test]
    fn rejects_bad_magic() {
        assert!(ArchiveIterator::from_archive_bytes(b"not an archive").is_err());
    }
}
