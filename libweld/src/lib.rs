//! A parallel ELF link editor. Consumes relocatable objects, shared objects
//! and archives and produces an executable or shared object. The link is a
//! strictly ordered sequence of phases, each internally parallel, with the
//! phase boundaries acting as global barriers.

use crate::arch::Arch;
use crate::args::Args;
use crate::context::Context;
use crate::error::Result;
use crate::input_data::InputBytes;
use crate::input_data::InputData;
use crate::parsing::ParsedInput;
use crate::resolution::FilesByPriority;
use crate::version_script::VersionScript;
use anyhow::Context as _;
use anyhow::bail;
use object::LittleEndian;
use object::read::elf::FileHeader as _;
use tracing_subscriber::EnvFilter;
use tracing_subscriber::fmt;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

pub(crate) mod alignment;
pub(crate) mod arch;
pub(crate) mod archive;
pub mod args;
pub(crate) mod chunks;
pub(crate) mod comdat;
pub(crate) mod context;
pub(crate) mod dynamic;
pub(crate) mod elf;
pub mod error;
pub(crate) mod file_kind;
pub(crate) mod hash;
pub(crate) mod input_data;
pub(crate) mod layout;
pub(crate) mod linker_script;
pub(crate) mod object_file;
pub(crate) mod output_section;
pub(crate) mod parsing;
pub(crate) mod resolution;
pub(crate) mod scan;
pub(crate) mod shared_file;
pub(crate) mod string_merging;
pub(crate) mod symbol;
pub(crate) mod symbol_db;
pub(crate) mod validation;
pub(crate) mod version_script;
pub(crate) mod writer;

pub struct Linker {
    action: args::Action,
}

impl Linker {
    pub fn from_args<S: AsRef<str>, I: Iterator<Item = S>>(args: I) -> Result<Self> {
        Ok(Linker {
            action: args::parse(args)?,
        })
    }

    pub fn run(&self) -> Result {
        match &self.action {
            args::Action::Link(args) => {
                if args.time_phases {
                    // Reporting span close times gives per-phase durations.
                    tracing_subscriber::registry()
                        .with(
                            fmt::layer()
                                .with_writer(std::io::stderr)
                                .with_span_events(fmt::format::FmtSpan::CLOSE),
                        )
                        .init();
                } else {
                    tracing_subscriber::registry()
                        .with(fmt::layer().with_writer(std::io::stderr))
                        .with(EnvFilter::from_default_env())
                        .init();
                }
                link(args)
            }
            args::Action::Version => {
                println!(
                    "weld version {} (compatible with GNU linkers)",
                    env!("CARGO_PKG_VERSION")
                );
                Ok(())
            }
        }
    }
}

#[tracing::instrument(skip_all, name = "Link")]
fn link(args: &Args) -> Result {
    args.setup_thread_pool()?;
    let input_data = InputData::from_args(args)?;
    let inputs = input_data::split_inputs(&input_data)?;
    match detect_architecture(&inputs)? {
        object::elf::EM_X86_64 => link_files::<arch::X86_64>(args, &inputs),
        object::elf::EM_386 => link_files::<arch::I386>(args, &inputs),
        object::elf::EM_AARCH64 => link_files::<arch::AArch64>(args, &inputs),
        machine => bail!("Unsupported machine type {machine}"),
    }
}

/// The whole pipeline: parse → resolve → comdat → merge → bin → offset →
/// scan → export → version → layout → write.
fn link_files<'data, A: Arch>(args: &'data Args, inputs: &'data [InputBytes<'data>]) -> Result {
    let mut ctx = Context::new(args);
    let num_buckets = symbol_db::num_symbol_buckets(args);

    let version_script_data = args
        .version_script_path
        .as_ref()
        .map(|path| {
            std::fs::read(path)
                .with_context(|| format!("Failed to read version script `{}`", path.display()))
        })
        .transpose()?;
    let version_script = version_script_data
        .as_deref()
        .map(VersionScript::parse)
        .transpose()?
        .unwrap_or_default();

    let mut files = parsing::parse_input_files(inputs, args)?;
    let mut symbol_db = parsing::build_symbol_db(&mut files, args)?;

    resolution::resolve_symbols(&mut files, &mut symbol_db, &ctx.errors)?;
    let by_priority = FilesByPriority::build(&files);

    comdat::eliminate_duplicate_comdats(&mut files, num_buckets);

    chunks::assign_output_sections(&mut files, &mut ctx.output_sections);
    parsing::define_start_stop_symbols(&mut files, &symbol_db, &ctx.output_sections);

    ctx.merged = string_merging::collect_merged_sections(&mut files);
    ctx.piece_map = Some(string_merging::merge_strings(
        &mut files,
        &mut ctx.merged,
        num_buckets,
    ));

    resolution::check_duplicate_symbols(&files, &symbol_db, &ctx.errors)?;

    ctx.bins = chunks::bin_sections(&files, &ctx.output_sections);
    chunks::assign_section_offsets(&files, &mut ctx.bins);
    chunks::allocate_common_symbols(&files, &mut symbol_db, &mut ctx.bins)?;

    scan::scan_relocations::<A>(&files, &by_priority, &symbol_db, &ctx.errors)?;

    let output_soname = prepare_dynamic_strings(&files, &mut ctx);
    dynamic::allocate_dynamic_entries(&files, &by_priority, &mut symbol_db, &mut ctx.dynamic)?;
    if args.export_dynamic || args.shared {
        dynamic::export_dynamic(&files, &mut symbol_db, &mut ctx.dynamic, &version_script)?;
    }
    dynamic::build_version_tables(
        &files,
        &by_priority,
        &symbol_db,
        &mut ctx.dynamic,
        &version_script,
        &output_soname,
    )?;

    let layout = layout::compute::<A>(&files, &by_priority, &mut symbol_db, &mut ctx)?;
    validation::validate_layout(&ctx, &layout)?;

    writer::write_output::<A>(&files, &by_priority, &symbol_db, &ctx, &layout)?;
    Ok(())
}

fn detect_architecture(inputs: &[InputBytes]) -> Result<u16> {
    for input in inputs {
        if input.kind == file_kind::FileKind::ElfObject {
            let header = elf::FileHeader::parse(input.data)
                .with_context(|| format!("Failed to parse `{}`", input.input))?;
            return Ok(header.e_machine(LittleEndian));
        }
    }
    // With no relocatable inputs there's nothing to link, but an empty
    // output is still well-defined; default to the host-typical machine.
    Ok(object::elf::EM_X86_64)
}

/// Interns the strings that .dynamic refers to: DT_NEEDED sonames in input
/// order, DT_RUNPATH and, for shared outputs, our own soname. Returns the
/// output's soname (used as the base version definition name).
fn prepare_dynamic_strings<'data>(files: &[ParsedInput<'data>], ctx: &mut Context<'data>) -> Vec<u8> {
    let output_soname = ctx
        .args
        .soname
        .as_deref()
        .map(|s| s.as_bytes().to_vec())
        .unwrap_or_else(|| {
            ctx.args
                .output
                .file_name()
                .map(|n| std::os::unix::ffi::OsStrExt::as_bytes(n).to_vec())
                .unwrap_or_default()
        });

    if !ctx.args.needs_dynamic() {
        return output_soname;
    }

    for file in files {
        if let ParsedInput::Shared(shared) = file {
            let offset = ctx.dynamic.dynstr.get_or_add(shared.soname);
            ctx.dynamic.needed.push(offset);
        }
    }
    if !ctx.args.rpaths.is_empty() {
        let joined = ctx.args.rpaths.join(":");
        ctx.dynamic.runpath_offset = Some(ctx.dynamic.dynstr.get_or_add(joined.as_bytes()));
    }
    if ctx.args.shared {
        ctx.dynamic.soname_offset = Some(ctx.dynamic.dynstr.get_or_add(&output_soname));
    }
    output_soname
}
