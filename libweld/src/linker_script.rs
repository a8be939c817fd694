//! Handling of text files in place of object files. Libraries like libc.so
//! are often linker scripts containing a GROUP directive listing the actual
//! inputs. We only support the subset of the script language needed to expand
//! those inputs; the full sub-language belongs to an external collaborator.

use crate::args::Input;
use crate::args::InputSpec;
use crate::args::Modifiers;
use crate::error::Result;
use anyhow::bail;
use std::path::Path;

/// Parses the supplied linker script and returns the inputs it requests, in
/// order. `AS_NEEDED` blocks toggle the as-needed modifier for their contents.
pub(crate) fn linker_script_inputs(bytes: &[u8], modifiers: Modifiers) -> Result<Vec<Input>> {
    let text = std::str::from_utf8(bytes).map_err(|_| {
        anyhow::anyhow!("Linker script is not valid UTF-8")
    })?;
    let tokens = tokenise(text);
    let mut inputs = Vec::new();
    let mut it = tokens.iter().peekable();
    while let Some(token) = it.next() {
        match *token {
            "GROUP" | "INPUT" => {
                expect(&mut it, "(")?;
                let mut depth = 1;
                let mut modifiers = modifiers;
                let mut as_needed_depth = None;
                while let Some(token) = it.next() {
                    match *token {
                        ")" => {
                            depth -= 1;
                            if Some(depth) == as_needed_depth {
                                modifiers.as_needed = false;
                                as_needed_depth = None;
                            }
                            if depth == 0 {
                                break;
                            }
                        }
                        "AS_NEEDED" => {
                            expect(&mut it, "(")?;
                            depth += 1;
                            as_needed_depth = Some(depth - 1);
                            modifiers.as_needed = true;
                        }
                        "(" => depth += 1,
                        file => inputs.push(input_for_token(file, modifiers)),
                    }
                }
                if depth != 0 {
                    bail!("Unterminated GROUP/INPUT in linker script");
                }
            }
            "OUTPUT_FORMAT" | "TARGET" => {
                expect(&mut it, "(")?;
                while it.next().is_some_and(|t| *t != ")") {}
            }
            // Comments are stripped by the tokeniser; anything else at the
            // top level is script functionality we delegate elsewhere.
            _ => {}
        }
    }
    Ok(inputs)
}

fn input_for_token(token: &str, modifiers: Modifiers) -> Input {
    if let Some(lib) = token.strip_prefix("-l") {
        Input {
            spec: InputSpec::Lib(Box::from(lib)),
            modifiers,
        }
    } else {
        Input {
            spec: InputSpec::File(Box::from(Path::new(token))),
            modifiers,
        }
    }
}

fn expect<'a>(it: &mut impl Iterator<Item = &'a &'a str>, expected: &str) -> Result {
    match it.next() {
        Some(token) if *token == expected => Ok(()),
        other => bail!("Expected `{expected}` in linker script, got {other:?}"),
    }
}

fn tokenise(text: &str) -> Vec<&str> {
    let mut tokens = Vec::new();
    let mut rest = text;
    while !rest.is_empty() {
        rest = rest.trim_start();
        if let Some(after) = rest.strip_prefix("/*") {
            rest = after.split_once("*/").map_or("", |(_, tail)| tail);
            continue;
        }
        if rest.starts_with('(') || rest.starts_with(')') {
            tokens.push(&rest[..1]);
            rest = &rest[1..];
            continue;
        }
        let end = rest
            .find(|c: char| c.is_whitespace() || c == '(' || c == ')')
            .unwrap_or(rest.len());
        if end > 0 {
            tokens.push(&rest[..end]);
            rest = &rest[end..];
        }
    }
    tokens
}

#[cfg(test)]
mod tests {
    use super::*;

    fn libs(inputs: &[Input]) -> Vec<(String, bool)> {
        inputs
            .iter()
            .map(|i| {
                let name = match &i.spec {
                    InputSpec::File(p) => p.display().to_string(),
                    InputSpec::Lib(l) => format!("-l{l}"),
                };
                (name, i.modifiers.as_needed)
            })
            .collect()
    }

    #[test]
    fn parses_glibc_style_script() {
        let script = br#"/* GNU ld script */
OUTPUT_FORMAT(elf64-x86-64)
GROUP ( /lib/x86_64-linux-gnu/libc.so.6 /usr/lib/x86_64-linux-gnu/libc_nonshared.a
        AS_NEEDED ( /lib64/ld-linux-x86-64.so.2 ) )
"#;
        let inputs = linker_script_inputs(script, Modifiers::default()).unwrap();
        assert_eq!(
            libs(&inputs),
            vec![
                ("/lib/x86_64-linux-gnu/libc.so.6".to_owned(), false),
                (
                    "/usr/lib/x86_64-linux-gnu/libc_nonshared.a".to_owned(),
                    false
                ),
                ("/lib64/ld-linux-x86-64.so.2".to_owned(), true),
            ]
        );
    }

    #[test]
    fn parses_input_with_lib_tokens() {
        let inputs =
            linker_script_inputs(b"INPUT(-lfoo bar.o)", Modifiers::default()).unwrap();
        assert_eq!(
            libs(&inputs),
            vec![("-lfoo".to_owned(), false), ("bar.o".to_owned(), false)]
        );
    }

    #[test]
    fn rejects_unterminated_group() {
        assert!(linker_script_inputs(b"GROUP ( a.o", Modifiers::default()).is_err());
    }
}
