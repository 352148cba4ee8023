//! Key filtering and public-key header enforcement.

use crate::error::{Error, Result};
use crate::vault::dotenv::{assignment_key, DotenvFile, RawLine};

/// The mandatory top-of-file header binding a vault file to its custody
/// public key.
pub const PUBLIC_KEY_HEADER: &str = "SI_VAULT_PUBLIC_KEY";

/// Include/exclude glob filter over key names. Exclude wins on match;
/// an empty include list admits everything. The header key is never
/// admitted.
#[derive(Debug, Default)]
pub struct KeyFilter {
    include: Vec<glob::Pattern>,
    exclude: Vec<glob::Pattern>,
}

impl KeyFilter {
    pub fn new(include: &[String], exclude: &[String]) -> Result<Self> {
        let compile = |patterns: &[String]| -> Result<Vec<glob::Pattern>> {
            patterns
                .iter()
                .map(|p| {
                    glob::Pattern::new(p).map_err(|e| {
                        Error::InvalidArgument(format!("invalid key pattern {p:?}: {e}"))
                    })
                })
                .collect()
        };
        Ok(Self {
            include: compile(include)?,
            exclude: compile(exclude)?,
        })
    }

    pub fn admits(&self, key: &str) -> bool {
        if key == PUBLIC_KEY_HEADER {
            return false;
        }
        if self.exclude.iter().any(|p| p.matches(key)) {
            return false;
        }
        self.include.is_empty() || self.include.iter().any(|p| p.matches(key))
    }
}

/// Enforce exactly one `SI_VAULT_PUBLIC_KEY=<key>` line at the top of the
/// document (below a shebang if present) with exactly one blank line
/// after it. Pre-existing header lines anywhere in the file are removed
/// first. Idempotent; returns whether the bytes changed.
pub fn ensure_public_key_header(doc: &mut DotenvFile, public_key: &str) -> bool {
    let before = doc.bytes();
    let nl = if doc.default_nl.is_empty() {
        "\n".to_string()
    } else {
        doc.default_nl.clone()
    };
    doc.default_nl = nl.clone();

    doc.lines
        .retain(|line| assignment_key(&line.text).as_deref() != Some(PUBLIC_KEY_HEADER));

    let insert_at = usize::from(
        doc.lines
            .first()
            .is_some_and(|line| line.text.starts_with("#!")),
    );
    doc.lines.insert(
        insert_at,
        RawLine {
            text: format!("{PUBLIC_KEY_HEADER}={}", public_key.trim()),
            nl: nl.clone(),
        },
    );

    // Exactly one blank line after the header: collapse a run of blanks,
    // or insert one when the next line is missing or non-blank.
    let after = insert_at + 1;
    let mut blank_run = 0;
    while after + blank_run < doc.lines.len()
        && doc.lines[after + blank_run].text.trim().is_empty()
    {
        blank_run += 1;
    }
    if blank_run == 0 {
        doc.lines.insert(
            after,
            RawLine {
                text: String::new(),
                nl: nl.clone(),
            },
        );
    } else {
        doc.lines.drain(after + 1..after + blank_run);
        doc.lines[after].text = String::new();
        if doc.lines[after].nl.is_empty() {
            doc.lines[after].nl = nl;
        }
    }

    doc.bytes() != before
}
