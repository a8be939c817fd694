//! Parses version scripts of the form:
//!
//! ```text
//! V1 {
//!     global:
//!         foo; bar;
//!     local:
//!         *;
//! };
//! V2 { global: baz; } V1;
//! ```
//!
//! An anonymous top-level `{ ... }` block applies visibility without defining
//! a version. Glob patterns other than a lone `*` under `local:` are not
//! supported.

use crate::error::Result;
use anyhow::Context as _;
use anyhow::bail;

#[derive(Default)]
pub(crate) struct VersionScript {
    /// Named versions in declaration order. Version ordinals start at 2;
    /// index 0 of this vector corresponds to ordinal 2.
    pub(crate) versions: Vec<Version>,

    /// Whether unlisted globals default to local visibility (a `local: *;`
    /// clause in any block).
    pub(crate) default_local: bool,
}

pub(crate) struct Version {
    pub(crate) name: String,

    /// The version ordinal (>= 2) for named versions, None for anonymous
    /// blocks.
    pub(crate) ordinal: Option<u16>,

    pub(crate) globals: Vec<String>,
    pub(crate) locals: Vec<String>,
}

/// What the script says about one symbol name.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum SymbolVisibility {
    /// Exported with the given version ordinal (>= 2), or GLOBAL if None.
    Global(Option<u16>),
    Local,
    Unlisted,
}

impl VersionScript {
    pub(crate) fn parse(bytes: &[u8]) -> Result<VersionScript> {
        let text = std::str::from_utf8(bytes).context("Version script is not valid UTF-8")?;
        let tokens = tokenise(text);
        let mut it = tokens.into_iter().peekable();
        let mut script = VersionScript::default();

        while let Some(token) = it.next() {
            let name = if token == "{" {
                String::new()
            } else {
                let name = token.to_owned();
                match it.next() {
                    Some("{") => {}
                    other => bail!("Expected `{{` after version name, got {other:?}"),
                }
                name
            };

            let mut version = Version {
                ordinal: (!name.is_empty())
                    .then(|| script.versions.iter().filter(|v| v.ordinal.is_some()).count() as u16 + 2),
                name,
                globals: Vec::new(),
                locals: Vec::new(),
            };
            let mut bind_global = true;
            loop {
                let token = it.next().context("Unterminated version block")?;
                match token {
                    "global:" => bind_global = true,
                    "local:" => bind_global = false,
                    "}" => break,
                    symbol => {
                        let symbol = symbol.trim_end_matches(';');
                        if symbol.is_empty() {
                            continue;
                        }
                        if bind_global {
                            version.globals.push(symbol.to_owned());
                        } else if symbol == "*" {
                            script.default_local = true;
                        } else {
                            version.locals.push(symbol.to_owned());
                        }
                    }
                }
            }
            // Optional parent version (predecessor) and terminating `;`. We
            // record only the ordering, which the declaration order already
            // gives us.
            if let Some(token) = it.peek() {
                if *token != ";" && !token.is_empty() && *token != "{" {
                    it.next();
                }
            }
            if it.peek() == Some(&";") {
                it.next();
            }

            // Anonymous blocks apply visibility without defining a version.
            if !version.name.is_empty()
                || !version.globals.is_empty()
                || !version.locals.is_empty()
            {
                script.versions.push(version);
            }
        }
        Ok(script)
    }

    pub(crate) fn visibility(&self, name: &str) -> SymbolVisibility {
        for version in &self.versions {
            if version.locals.iter().any(|l| l == name) {
                return SymbolVisibility::Local;
            }
            if version.globals.iter().any(|g| g == name) {
                return SymbolVisibility::Global(version.ordinal);
            }
        }
        if self.default_local {
            SymbolVisibility::Local
        } else {
            SymbolVisibility::Unlisted
        }
    }
}

fn tokenise(text: &str) -> Vec<&str> {
    let mut tokens = Vec::new();
    let mut rest = text;
    while !rest.is_empty() {
        rest = rest.trim_start();
        if let Some(after) = rest.strip_prefix('#') {
            rest = after.split_once('\n').map_or("", |(_, tail)| tail);
            continue;
        }
        if let Some(after) = rest.strip_prefix("/*") {
            rest = after.split_once("*/").map_or("", |(_, tail)| tail);
            continue;
        }
        if rest.starts_with('{') || rest.starts_with('}') || rest.starts_with(';') {
            tokens.push(&rest[..1]);
            rest = &rest[1..];
            continue;
        }
        let end = rest
            .find(|c: char| c.is_whitespace() || c == '{' || c == '}' || c == ';')
            .unwrap_or(rest.len());
        if end > 0 {
            // Keep the token; `global:`/`local:` keep their colon so they're
            // easy to recognise.
            tokens.push(&rest[..end]);
            rest = &rest[end..];
        } else if !rest.is_empty() {
            rest = &rest[1..];
        }
    }
    tokens
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_named_version() {
        let script = VersionScript::parse(
            br#"
V1 {
    global:
        foo;
    local:
        *;
};
"#,
        )
        .unwrap();
        assert_eq!(script.versions.len(), 1);
        assert_eq!(script.versions[0].name, "V1");
        assert!(script.default_local);
        assert_eq!(script.visibility("foo"), SymbolVisibility::Global(Some(2)));
        assert_eq!(script.visibility("bar"), SymbolVisibility::Local);
    }

    #[test]
    fn parses_chained_versions() {
        let script = VersionScript::parse(
            br#"
V1 { global: a; };
V2 { global: b; } V1;
"#,
        )
        .unwrap();
        assert_eq!(script.versions.len(), 2);
        assert_eq!(script.visibility("a"), SymbolVisibility::Global(Some(2)));
        assert_eq!(script.visibility("b"), SymbolVisibility::Global(Some(3)));
        assert_eq!(script.visibility("c"), SymbolVisibility::Unlisted);
    }

    #[test]
    fn parses_anonymous_block() {
        let script = VersionScript::parse(b"{ global: main; local: *; };").unwrap();
        assert!(script.default_local);
        assert_eq!(script.visibility("main"), SymbolVisibility::Global(None));
    }
}
