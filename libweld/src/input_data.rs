//! Figures out what input files we need to read, maps them into memory and
//! identifies what kind of file each one is. Archives are expanded into their
//! members, thin archives into the files they reference and linker scripts
//! into the inputs they request.

use crate::archive::ArchiveEntry;
use crate::archive::ArchiveIterator;
use crate::args::Args;
use crate::args::Input;
use crate::args::InputSpec;
use crate::args::Modifiers;
use crate::error::Result;
use crate::file_kind::FileKind;
use crate::linker_script;
use anyhow::Context as _;
use anyhow::bail;
use hashbrown::HashSet;
use memmap2::Mmap;
use std::collections::VecDeque;
use std::fmt::Display;
use std::ops::Deref;
use std::path::Path;
use std::path::PathBuf;

/// The set of files we loaded, in command-line order with linker-script and
/// thin-archive expansions spliced in at the point they were requested. Owns
/// every mapping for the life of the link.
pub(crate) struct InputData {
    pub(crate) files: Vec<InputFile>,
}

pub(crate) struct InputFile {
    pub(crate) filename: PathBuf,
    pub(crate) kind: FileKind,
    pub(crate) modifiers: Modifiers,

    /// Set for files referenced from a thin archive. Such files are regular
    /// objects on disk but follow archive member semantics for liveness.
    pub(crate) archive_semantics: bool,

    data: FileData,
}

pub(crate) struct FileData {
    bytes: Mmap,

    /// The modification timestamp of the input file just before we opened it.
    /// We expect our input files not to change while we're running; a preload
    /// collaborator would key cached parses on (name, size, mtime).
    #[allow(dead_code)]
    pub(crate) modification_time: std::time::SystemTime,
}

/// Bytes of one linkable input: either a whole file or an archive member.
pub(crate) struct InputBytes<'data> {
    pub(crate) input: InputRef<'data>,
    pub(crate) kind: FileKind,
    pub(crate) data: &'data [u8],
    pub(crate) modifiers: Modifiers,
    pub(crate) has_archive_semantics: bool,
}

/// Identifies an input object that may be an entry in an archive.
#[derive(Clone, Copy)]
pub(crate) struct InputRef<'data> {
    pub(crate) file: &'data InputFile,
    pub(crate) entry: Option<&'data [u8]>,
}

impl InputData {
    #[tracing::instrument(skip_all, name = "Open input files")]
    pub(crate) fn from_args(args: &Args) -> Result<Self> {
        let mut work: VecDeque<Input> = VecDeque::new();
        for input in &args.inputs {
            work.push_back(Input {
                spec: clone_spec(&input.spec),
                modifiers: input.modifiers,
            });
        }

        let mut loaded = InputData { files: Vec::new() };
        let mut seen_paths: HashSet<PathBuf> = HashSet::new();

        while let Some(input) = work.pop_front() {
            let path = resolve_input_path(&input, args)?;
            if !seen_paths.insert(path.clone()) {
                // The registry shares one mapping per path; later references
                // to the same file contribute nothing new.
                continue;
            }
            let data = FileData::new(&path)?;
            let kind = FileKind::identify_bytes(&data)
                .with_context(|| format!("Failed to identify `{}`", path.display()))?;

            match kind {
                FileKind::Text => {
                    let extra = linker_script::linker_script_inputs(&data, input.modifiers)
                        .with_context(|| {
                            format!("Failed to parse linker script `{}`", path.display())
                        })?;
                    // The script's inputs take the place the script occupied
                    // on the command line.
                    for input in extra.into_iter().rev() {
                        work.push_front(input);
                    }
                }
                FileKind::ThinArchive => {
                    let parent = path.parent().unwrap_or(Path::new("."));
                    let members = thin_archive_members(&data, parent).with_context(|| {
                        format!("Failed to read thin archive `{}`", path.display())
                    })?;
                    for member_path in members {
                        if !seen_paths.insert(member_path.clone()) {
                            continue;
                        }
                        let member_data = FileData::new(&member_path)?;
                        let member_kind =
                            FileKind::identify_bytes(&member_data).with_context(|| {
                                format!("Failed to identify `{}`", member_path.display())
                            })?;
                        if member_kind != FileKind::ElfObject {
                            bail!(
                                "Thin archive member is not an object `{}`",
                                member_path.display()
                            );
                        }
                        loaded.files.push(InputFile {
                            filename: member_path,
                            kind: member_kind,
                            modifiers: input.modifiers,
                            archive_semantics: true,
                            data: member_data,
                        });
                    }
                }
                _ => {
                    loaded.files.push(InputFile {
                        filename: path,
                        kind,
                        modifiers: input.modifiers,
                        archive_semantics: false,
                        data,
                    });
                }
            }
        }

        Ok(loaded)
    }
}

/// Expands archives, producing one `InputBytes` per linkable input in
/// command-line order.
#[tracing::instrument(skip_all, name = "Split archives")]
pub(crate) fn split_inputs(input_data: &InputData) -> Result<Vec<InputBytes<'_>>> {
    let mut out = Vec::with_capacity(input_data.files.len());
    for file in &input_data.files {
        match file.kind {
            FileKind::ElfObject | FileKind::ElfDynamic => {
                out.push(InputBytes {
                    input: InputRef { file, entry: None },
                    kind: file.kind,
                    data: file.data(),
                    modifiers: file.modifiers,
                    has_archive_semantics: file.archive_semantics,
                });
            }
            FileKind::Archive => {
                for entry in ArchiveIterator::from_archive_bytes(file.data())? {
                    match entry? {
                        ArchiveEntry::Regular(content) => {
                            let kind = FileKind::identify_bytes(content.entry_data)
                                .with_context(|| {
                                    format!(
                                        "Failed to identify archive member `{}` in `{}`",
                                        String::from_utf8_lossy(content.identifier),
                                        file.filename.display()
                                    )
                                })?;
                            if kind != FileKind::ElfObject {
                                bail!(
                                    "Archive member is not an object `{}` in `{}`",
                                    String::from_utf8_lossy(content.identifier),
                                    file.filename.display()
                                );
                            }
                            out.push(InputBytes {
                                input: InputRef {
                                    file,
                                    entry: Some(content.identifier),
                                },
                                kind,
                                data: content.entry_data,
                                modifiers: file.modifiers,
                                has_archive_semantics: true,
                            });
                        }
                        ArchiveEntry::Ignored => {}
                        ArchiveEntry::Thin(_) => bail!("Thin entry in regular archive"),
                    }
                }
            }
            FileKind::ThinArchive | FileKind::Text => {
                // Expanded during loading.
            }
        }
    }
    Ok(out)
}

fn thin_archive_members(data: &[u8], parent: &Path) -> Result<Vec<PathBuf>> {
    let mut members = Vec::new();
    for entry in ArchiveIterator::from_archive_bytes(data)? {
        match entry? {
            ArchiveEntry::Thin(entry) => {
                let path = Path::new(std::str::from_utf8(entry.identifier).context(
                    "Thin archive member path is not valid UTF-8",
                )?);
                members.push(if path.is_absolute() {
                    path.to_owned()
                } else {
                    parent.join(path)
                });
            }
            ArchiveEntry::Regular(_) | ArchiveEntry::Ignored => {}
        }
    }
    Ok(members)
}

fn resolve_input_path(input: &Input, args: &Args) -> Result<PathBuf> {
    match &input.spec {
        InputSpec::File(path) => Ok(path.as_ref().to_owned()),
        InputSpec::Lib(lib_name) => {
            if input.modifiers.allow_shared {
                let filename = format!("lib{lib_name}.so");
                if let Some(path) = search_for_file(args, &filename) {
                    return Ok(path);
                }
            }
            let filename = format!("lib{lib_name}.a");
            if let Some(path) = search_for_file(args, &filename) {
                return Ok(path);
            }
            bail!("Couldn't find library `{lib_name}` on library search path");
        }
    }
}

fn search_for_file(args: &Args, filename: &str) -> Option<PathBuf> {
    for dir in &args.lib_search_path {
        // Absolute search directories are looked up under the sysroot first.
        let path = match (&args.sysroot, dir.is_absolute()) {
            (Some(sysroot), true) => {
                let prefixed = sysroot.join(dir.strip_prefix("/").unwrap_or(dir));
                let candidate = prefixed.join(filename);
                if candidate.exists() {
                    return Some(candidate);
                }
                dir.join(filename)
            }
            _ => dir.join(filename),
        };
        if path.exists() {
            return Some(path);
        }
    }
    None
}

fn clone_spec(spec: &InputSpec) -> InputSpec {
    match spec {
        InputSpec::File(p) => InputSpec::File(p.clone()),
        InputSpec::Lib(l) => InputSpec::Lib(l.clone()),
    }
}

impl InputFile {
    pub(crate) fn data(&self) -> &[u8] {
        &self.data
    }
}

impl FileData {
    fn new(path: &Path) -> Result<Self> {
        let file = std::fs::File::open(path)
            .with_context(|| format!("Failed to open input file `{}`", path.display()))?;

        let modification_time = std::fs::metadata(path)
            .and_then(|meta| meta.modified())
            .with_context(|| {
                format!("Failed to read file modification time `{}`", path.display())
            })?;

        // Safety: this is only sound if our input files aren't modified while
        // we have them mapped. There's no way to protect against external
        // modification on Linux, but mmap's advantages are too large to give
        // up: we typically read only a fraction of our input bytes and the
        // system can reclaim clean pages under memory pressure.
        let bytes = unsafe { Mmap::map(&file) }
            .with_context(|| format!("Failed to mmap input file `{}`", path.display()))?;

        Ok(FileData {
            bytes,
            modification_time,
        })
    }
}

impl Deref for FileData {
    type Target = [u8];

    fn deref(&self) -> &Self::Target {
        &self.bytes
    }
}

impl Display for InputRef<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        Display::fmt(&self.file.filename.display(), f)?;
        if let Some(entry) = self.entry {
            Display::fmt(" @ ", f)?;
            Display::fmt(&String::from_utf8_lossy(entry), f)?;
        }
        Ok(())
    }
}

impl std::fmt::Debug for InputRef<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        Display::fmt(self, f)
    }
}
