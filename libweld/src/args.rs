//! A hand-written parser for our arguments. We don't use a 3rd party library
//! because order is important for some arguments (e.g. `-l` relative to
//! `--as-needed`) and it's not clear how easy it would be to get that correct
//! with something like clap.

use crate::error::Result;
use anyhow::Context as _;
use anyhow::anyhow;
use anyhow::bail;
use std::num::NonZeroUsize;
use std::path::Path;
use std::path::PathBuf;
use std::sync::Arc;

pub(crate) struct Args {
    pub(crate) inputs: Vec<Input>,
    pub(crate) output: Arc<Path>,
    pub(crate) lib_search_path: Vec<Box<Path>>,
    pub(crate) entry: Option<String>,
    pub(crate) dynamic_linker: Option<Box<Path>>,
    pub(crate) is_static: bool,
    pub(crate) pie: bool,
    pub(crate) export_dynamic: bool,
    pub(crate) rpaths: Vec<String>,
    pub(crate) version_script_path: Option<PathBuf>,
    pub(crate) trace_symbols: Vec<String>,
    pub(crate) num_threads: NonZeroUsize,
    pub(crate) filler: u8,
    pub(crate) sysroot: Option<PathBuf>,
    pub(crate) shared: bool,
    pub(crate) soname: Option<String>,
    pub(crate) bind_now: bool,
    pub(crate) time_phases: bool,
}

pub(crate) enum Action {
    /// The default. Link something.
    Link(Args),

    /// Print the linker version.
    Version,
}

/// Per-input state toggled by `--as-needed` / `-static` and friends.
#[derive(Debug, Eq, PartialEq, Clone, Copy)]
pub(crate) struct Modifiers {
    /// Whether shared objects should only be linked if they're referenced.
    pub(crate) as_needed: bool,

    /// Whether we're currently allowed to link against shared libraries.
    pub(crate) allow_shared: bool,
}

#[derive(Debug, Eq, PartialEq)]
pub(crate) struct Input {
    pub(crate) spec: InputSpec,
    pub(crate) modifiers: Modifiers,
}

#[derive(Debug, Eq, PartialEq)]
pub(crate) enum InputSpec {
    File(Box<Path>),
    Lib(Box<str>),
}

// These flags don't affect our behaviour and are accepted so that we can be
// used as a drop-in replacement for other linkers.
const IGNORED_FLAGS: &[&str] = &[
    "eh-frame-hdr",
    "start-group",
    "end-group",
    "fatal-warnings",
    "disable-new-dtags",
    "enable-new-dtags",
    "gc-sections",
    "no-undefined-version",
    "nostdlib",
    "build-id",
    "plugin-opt",
    "color-diagnostics",
    "relax",
    "no-relax",
    "preload",
];

const IGNORED_ARG_FLAGS: &[&str] = &["hash-style", "m", "plugin"];

pub(crate) fn parse<S: AsRef<str>, I: Iterator<Item = S>>(input: I) -> Result<Action> {
    let arg_strings = expand_response_files(input)?;
    let mut args = arg_strings.iter().map(String::as_str).peekable();

    let mut inputs = Vec::new();
    let mut output = None;
    let mut lib_search_path = Vec::new();
    let mut entry = None;
    let mut dynamic_linker = None;
    let mut is_static = false;
    let mut pie = false;
    let mut export_dynamic = false;
    let mut rpaths = Vec::new();
    let mut version_script_path = None;
    let mut trace_symbols = Vec::new();
    let mut num_threads = None;
    let mut filler = 0;
    let mut sysroot = None;
    let mut shared = false;
    let mut soname = None;
    let mut bind_now = false;
    let mut time_phases = false;
    let mut action = None;
    let mut modifiers = Modifiers::default();

    while let Some(arg) = args.next() {
        if let Some(value) = match_arg(arg, &mut args, "library-path")? {
            lib_search_path.push(Box::from(Path::new(value)));
        } else if let Some(rest) = arg.strip_prefix("-L") {
            let path = if rest.is_empty() {
                args.next().context("option -L: argument missing")?
            } else {
                rest
            };
            lib_search_path.push(Box::from(Path::new(path)));
        } else if let Some(rest) = arg.strip_prefix("-l") {
            let name = if rest.is_empty() {
                args.next().context("option -l: argument missing")?
            } else {
                rest
            };
            inputs.push(Input {
                spec: InputSpec::Lib(Box::from(name)),
                modifiers,
            });
        } else if let Some(value) = match_arg(arg, &mut args, "o")? {
            output = Some(Arc::from(Path::new(value)));
        } else if let Some(value) = match_arg(arg, &mut args, "e")?
            .or(match_arg(arg, &mut args, "entry")?)
        {
            entry = Some(value.to_owned());
        } else if arg == "-static" || arg == "--static" || arg == "-Bstatic" {
            is_static = true;
            modifiers.allow_shared = false;
        } else if arg == "-Bdynamic" {
            modifiers.allow_shared = true;
        } else if arg == "-pie" || arg == "--pie" {
            pie = true;
        } else if arg == "-no-pie" || arg == "--no-pie" {
            pie = false;
        } else if let Some(value) = match_arg(arg, &mut args, "dynamic-linker")? {
            dynamic_linker = Some(Box::from(Path::new(value)));
        } else if arg == "--no-dynamic-linker" {
            dynamic_linker = None;
        } else if matches_flag(arg, "export-dynamic") {
            export_dynamic = true;
        } else if matches_flag(arg, "no-export-dynamic") {
            export_dynamic = false;
        } else if matches_flag(arg, "as-needed") {
            modifiers.as_needed = true;
        } else if matches_flag(arg, "no-as-needed") {
            modifiers.as_needed = false;
        } else if let Some(value) = match_arg(arg, &mut args, "rpath")? {
            rpaths.push(value.to_owned());
        } else if let Some(value) = match_arg(arg, &mut args, "version-script")? {
            version_script_path = Some(PathBuf::from(value));
        } else if let Some(value) = match_arg(arg, &mut args, "y")?
            .or(match_arg(arg, &mut args, "trace-symbol")?)
        {
            trace_symbols.push(value.to_owned());
        } else if let Some(value) = match_arg(arg, &mut args, "thread-count")?
            .or(match_arg(arg, &mut args, "threads")?)
        {
            num_threads = Some(
                NonZeroUsize::new(value.parse().context("Invalid --thread-count")?)
                    .context("--thread-count must be non-zero")?,
            );
        } else if let Some(value) = match_arg(arg, &mut args, "filler")? {
            filler = parse_byte_value(value).context("Invalid --filler")?;
        } else if let Some(value) = match_arg(arg, &mut args, "sysroot")? {
            sysroot = Some(PathBuf::from(value));
        } else if arg == "-shared" || arg == "--shared" {
            shared = true;
        } else if let Some(value) = match_arg(arg, &mut args, "soname")? {
            soname = Some(value.to_owned());
        } else if arg == "-z" {
            if args.next().context("option -z: argument missing")? == "now" {
                bind_now = true;
            }
        } else if let Some(z) = arg.strip_prefix("-z") {
            if z == "now" {
                bind_now = true;
            }
        } else if matches_flag(arg, "time") {
            time_phases = true;
        } else if matches_flag(arg, "version") || arg == "-v" {
            action = Some(Action::Version);
        } else if matches_flag(arg, "help") {
            bail!("Sorry, help isn't implemented yet");
        } else if let Some(stripped) = arg.strip_prefix('-') {
            let stripped = stripped.strip_prefix('-').unwrap_or(stripped);
            let name = stripped.split('=').next().unwrap_or(stripped);
            if IGNORED_FLAGS.contains(&name) {
            } else if IGNORED_ARG_FLAGS.contains(&name) {
                if !stripped.contains('=') {
                    args.next();
                }
            } else {
                bail!("unknown command line option: {arg}");
            }
        } else {
            inputs.push(Input {
                spec: InputSpec::File(Box::from(Path::new(arg))),
                modifiers,
            });
        }
    }

    if let Some(action) = action {
        return Ok(action);
    }

    let num_threads = num_threads.unwrap_or_else(|| {
        std::thread::available_parallelism().unwrap_or(NonZeroUsize::new(1).unwrap())
    });

    Ok(Action::Link(Args {
        inputs,
        output: output.ok_or_else(|| anyhow!("Missing required argument -o"))?,
        lib_search_path,
        entry,
        dynamic_linker,
        is_static,
        pie,
        export_dynamic,
        rpaths,
        version_script_path,
        trace_symbols,
        num_threads,
        filler,
        sysroot,
        shared,
        soname,
        bind_now,
        time_phases,
    }))
}

/// Accepts `-name`, `--name`, `-name=V`, `--name=V` and the separate-argument
/// forms, the way GNU linkers do.
fn match_arg<'a, I: Iterator<Item = &'a str>>(
    arg: &'a str,
    args: &mut std::iter::Peekable<I>,
    name: &str,
) -> Result<Option<&'a str>> {
    let Some(stripped) = arg.strip_prefix('-') else {
        return Ok(None);
    };
    let stripped = stripped.strip_prefix('-').unwrap_or(stripped);
    if stripped == name {
        let value = args
            .next()
            .with_context(|| format!("option {arg}: argument missing"))?;
        return Ok(Some(value));
    }
    if let Some(rest) = stripped.strip_prefix(name) {
        if let Some(value) = rest.strip_prefix('=') {
            return Ok(Some(value));
        }
    }
    Ok(None)
}

fn matches_flag(arg: &str, name: &str) -> bool {
    let Some(stripped) = arg.strip_prefix('-') else {
        return false;
    };
    let stripped = stripped.strip_prefix('-').unwrap_or(stripped);
    stripped == name
}

fn parse_byte_value(s: &str) -> Result<u8> {
    let value = s
        .strip_prefix("0x")
        .or_else(|| s.strip_prefix("0X"))
        .map(|hex| u64::from_str_radix(hex, 16))
        .unwrap_or_else(|| s.parse())?;
    u8::try_from(value).context("value doesn't fit in a byte")
}

/// Expands `@FILE` arguments by substituting the tokens of the named response
/// file inline. Tokens may be quoted with single or double quotes and
/// backslash escapes the next character. Response files may themselves
/// reference response files.
fn expand_response_files<S: AsRef<str>, I: Iterator<Item = S>>(input: I) -> Result<Vec<String>> {
    let mut out = Vec::new();
    for arg in input {
        let arg = arg.as_ref();
        if let Some(path) = arg.strip_prefix('@') {
            let contents = std::fs::read_to_string(path)
                .with_context(|| format!("Failed to read response file `{path}`"))?;
            let tokens = tokenise_response_file(&contents)
                .with_context(|| format!("Failed to parse response file `{path}`"))?;
            out.append(&mut expand_response_files(tokens.into_iter())?);
        } else {
            out.push(arg.to_owned());
        }
    }
    Ok(out)
}

fn tokenise_response_file(contents: &str) -> Result<Vec<String>> {
    let mut tokens = Vec::new();
    let mut chars = contents.chars().peekable();
    while let Some(&ch) = chars.peek() {
        if ch.is_whitespace() {
            chars.next();
            continue;
        }
        let mut token = String::new();
        if ch == '\'' || ch == '"' {
            let quote = ch;
            chars.next();
            loop {
                match chars.next() {
                    Some('\\') => {
                        token.push(chars.next().context("premature end of input")?);
                    }
                    Some(c) if c == quote => break,
                    Some(c) => token.push(c),
                    None => bail!("premature end of input"),
                }
            }
        } else {
            while let Some(&c) = chars.peek() {
                if c.is_whitespace() {
                    break;
                }
                chars.next();
                if c == '\\' {
                    token.push(chars.next().context("premature end of input")?);
                } else {
                    token.push(c);
                }
            }
        }
        tokens.push(token);
    }
    Ok(tokens)
}

impl Args {
    pub(crate) fn setup_thread_pool(&self) -> Result {
        rayon::ThreadPoolBuilder::new()
            .num_threads(self.num_threads.get())
            .build_global()?;
        Ok(())
    }

    /// The image base. PIE and shared objects are linked at 0.
    pub(crate) fn base_address(&self) -> u64 {
        if self.pie || self.shared {
            0
        } else {
            crate::elf::NON_PIE_START_MEM_ADDRESS
        }
    }

    pub(crate) fn needs_dynamic(&self) -> bool {
        !self.is_static
    }

    pub(crate) fn needs_interp(&self) -> bool {
        !self.is_static && !self.shared && self.dynamic_linker.is_some()
    }

    pub(crate) fn entry_symbol_name(&self) -> &str {
        self.entry.as_deref().unwrap_or("_start")
    }
}

impl Default for Modifiers {
    fn default() -> Self {
        Self {
            as_needed: false,
            allow_shared: true,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const INPUT1: &[&str] = &[
        "-pie",
        "-z",
        "relro",
        "--hash-style=gnu",
        "--build-id",
        "--eh-frame-hdr",
        "-m",
        "elf_x86_64",
        "-dynamic-linker",
        "/lib64/ld-linux-x86-64.so.2",
        "-o",
        "/tmp/a.out",
        "/lib/x86_64-linux-gnu/Scrt1.o",
        "/lib/x86_64-linux-gnu/crti.o",
        "-L/usr/lib/x86_64-linux-gnu",
        "-L",
        "/lib",
        "main.o",
        "--as-needed",
        "-lgcc_s",
        "--no-as-needed",
        "-lc",
        "-z",
        "now",
        "/lib/x86_64-linux-gnu/crtn.o",
    ];

    fn parse_args(input: &[&str]) -> Args {
        let Action::Link(args) = parse(input.iter()).unwrap() else {
            panic!("Unexpected action");
        };
        args
    }

    #[test]
    fn test_parse() {
        let args = parse_args(INPUT1);
        assert_eq!(args.output.as_ref(), Path::new("/tmp/a.out"));
        assert!(args.pie);
        assert!(args.bind_now);
        assert_eq!(
            args.dynamic_linker.as_deref(),
            Some(Path::new("/lib64/ld-linux-x86-64.so.2"))
        );
        assert_eq!(args.lib_search_path.len(), 2);
        let libs: Vec<_> = args
            .inputs
            .iter()
            .filter_map(|i| match &i.spec {
                InputSpec::Lib(name) => Some((name.as_ref(), i.modifiers.as_needed)),
                InputSpec::File(_) => None,
            })
            .collect();
        assert_eq!(libs, &[("gcc_s", true), ("c", false)]);
    }

    #[test]
    fn test_arg_forms() {
        let args = parse_args(&["-o", "out", "--entry=main", "--thread-count", "4"]);
        assert_eq!(args.entry.as_deref(), Some("main"));
        assert_eq!(args.num_threads.get(), 4);

        let args = parse_args(&["-o", "out", "-e", "main"]);
        assert_eq!(args.entry.as_deref(), Some("main"));
    }

    #[test]
    fn test_unknown_option() {
        assert!(parse(["-o", "out", "--definitely-not-an-option"].iter()).is_err());
    }

    #[test]
    fn test_missing_output() {
        assert!(parse(["a.o"].iter()).is_err());
    }

    #[test]
    fn test_filler() {
        let args = parse_args(&["-o", "out", "--filler", "0xcc"]);
        assert_eq!(args.filler, 0xcc);
    }

    #[test]
    fn test_response_file_tokens() {
        let tokens = tokenise_response_file("a 'b c' \"d\\\"e\"\n f\\ g").unwrap();
        assert_eq!(tokens, vec!["a", "b c", "d\"e", "f g"]);
        assert!(tokenise_response_file("'unterminated").is_err());
    }
}
