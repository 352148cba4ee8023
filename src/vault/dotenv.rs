//! Byte-exact dotenv codec.
//!
//! Files are modeled as raw lines with their own terminators so that
//! parse → serialize reproduces the input byte-for-byte, including a
//! missing final newline and mixed `\r\n`. Edits touch only the value
//! side of an assignment and preserve `export` prefixes, quoting style,
//! inline comments, and surrounding layout.

use crate::error::{Error, Result};
use crate::util;
use std::path::Path;
use std::sync::OnceLock;

/// One physical line: text without the terminator, plus the terminator
/// itself (`"\n"`, `"\r\n"`, or `""` for a final unterminated line).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawLine {
    pub text: String,
    pub nl: String,
}

#[derive(Debug, Clone, Default)]
pub struct DotenvFile {
    pub lines: Vec<RawLine>,
    pub default_nl: String,
}

/// A `KEY=VALUE` entry as it appears on disk. `value_raw` may include
/// surrounding quotes; `line_index` points into `lines`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Entry {
    pub key: String,
    pub value_raw: String,
    pub line_index: usize,
}

#[derive(Debug, Clone)]
struct Assignment {
    leading: String,
    export: bool,
    left_raw: String,
    key: String,
    value_raw: String,
    value_ws: String,
    comment: String,
}

fn key_re() -> &'static regex::Regex {
    static RE: OnceLock<regex::Regex> = OnceLock::new();
    RE.get_or_init(|| regex::Regex::new(r"^[A-Za-z_][A-Za-z0-9_]*$").unwrap())
}

/// Validate a dotenv key name.
pub fn validate_key_name(key: &str) -> Result<()> {
    if key_re().is_match(key) {
        Ok(())
    } else {
        Err(Error::InvalidArgument(format!(
            "invalid key name {key:?} (expected [A-Za-z_][A-Za-z0-9_]*)"
        )))
    }
}

/// Parse raw file text. Total: any input yields a document whose
/// `bytes()` reproduce the input exactly.
pub fn parse(data: &str) -> DotenvFile {
    let lines = split_raw_lines(data);
    let default_nl = lines
        .iter()
        .find(|l| !l.nl.is_empty())
        .map_or_else(|| "\n".to_string(), |l| l.nl.clone());
    DotenvFile { lines, default_nl }
}

fn split_raw_lines(data: &str) -> Vec<RawLine> {
    let mut out = Vec::new();
    let bytes = data.as_bytes();
    let mut start = 0;
    while start < bytes.len() {
        match bytes[start..].iter().position(|&b| b == b'\n') {
            None => {
                out.push(RawLine {
                    text: data[start..].to_string(),
                    nl: String::new(),
                });
                break;
            }
            Some(rel) => {
                let idx = start + rel;
                let (line_end, nl) = if idx > start && bytes[idx - 1] == b'\r' {
                    (idx - 1, "\r\n")
                } else {
                    (idx, "\n")
                };
                out.push(RawLine {
                    text: data[start..line_end].to_string(),
                    nl: nl.to_string(),
                });
                start = idx + 1;
            }
        }
    }
    out
}

impl DotenvFile {
    /// Serialize back to bytes. Inverse of `parse`.
    pub fn bytes(&self) -> Vec<u8> {
        let mut out = Vec::new();
        for line in &self.lines {
            out.extend_from_slice(line.text.as_bytes());
            out.extend_from_slice(line.nl.as_bytes());
        }
        out
    }

    /// All assignments in file order. Malformed key names are aggregated
    /// into one error for the whole file.
    pub fn entries(&self) -> Result<Vec<Entry>> {
        let mut out = Vec::new();
        let mut bad = Vec::new();
        for (i, line) in self.lines.iter().enumerate() {
            let Some(assign) = parse_assignment(&line.text) else {
                continue;
            };
            if validate_key_name(&assign.key).is_err() {
                bad.push(assign.key.clone());
                continue;
            }
            out.push(Entry {
                key: assign.key,
                value_raw: assign.value_raw.trim().to_string(),
                line_index: i,
            });
        }
        if bad.is_empty() {
            Ok(out)
        } else {
            Err(Error::InvalidArgument(format!(
                "invalid key name(s): {}",
                bad.join(", ")
            )))
        }
    }

    /// Last-wins lookup of a key's raw (possibly quoted) value.
    pub fn lookup(&self, key: &str) -> Option<String> {
        let key = key.trim();
        if key.is_empty() {
            return None;
        }
        let mut found = None;
        for line in &self.lines {
            if let Some(assign) = parse_assignment(&line.text) {
                if assign.key == key {
                    found = Some(assign.value_raw.trim().to_string());
                }
            }
        }
        found
    }

    /// Update the value side of the last assignment of `key`, or append a
    /// new line with the document's default terminator. Returns whether
    /// the document changed.
    pub fn set(&mut self, key: &str, rendered_value: &str) -> Result<bool> {
        let key = key.trim();
        validate_key_name(key)?;

        let mut last: Option<(usize, Assignment)> = None;
        for (i, line) in self.lines.iter().enumerate() {
            if let Some(assign) = parse_assignment(&line.text) {
                if assign.key == key {
                    last = Some((i, assign));
                }
            }
        }
        if let Some((i, assign)) = last {
            let text = render_preserve_layout(&assign, rendered_value);
            if self.lines[i].text == text {
                return Ok(false);
            }
            self.lines[i].text = text;
            return Ok(true);
        }

        self.ensure_appendable();
        let nl = self.append_nl();
        self.lines.push(RawLine {
            text: format!("{key}={}", rendered_value.trim()),
            nl,
        });
        Ok(true)
    }

    /// Remove every assignment of `key`. Returns whether anything was
    /// removed.
    pub fn unset(&mut self, key: &str) -> Result<bool> {
        let key = key.trim();
        validate_key_name(key)?;
        let before = self.lines.len();
        self.lines.retain(|line| {
            parse_assignment(&line.text).is_none_or(|a| a.key != key)
        });
        Ok(self.lines.len() != before)
    }

    fn append_nl(&self) -> String {
        if self.default_nl.is_empty() {
            "\n".to_string()
        } else {
            self.default_nl.clone()
        }
    }

    fn ensure_appendable(&mut self) {
        let nl = self.append_nl();
        if let Some(last) = self.lines.last_mut() {
            if last.nl.is_empty() {
                last.nl = nl;
            }
        }
    }
}

/// Key of the assignment on a single line, if any.
pub fn assignment_key(line: &str) -> Option<String> {
    parse_assignment(line).map(|a| a.key)
}

fn parse_assignment(line: &str) -> Option<Assignment> {
    if line.trim().is_empty() {
        return None;
    }
    if line.trim_start_matches([' ', '\t']).starts_with('#') {
        return None;
    }
    let eq = line.find('=')?;
    let left = &line[..eq];
    let right = &line[eq + 1..];

    let leading_len = left.len() - left.trim_start_matches([' ', '\t']).len();
    let leading = left[..leading_len].to_string();
    let mut key_part = left.trim();
    let export = key_part.starts_with("export ") || key_part.starts_with("export\t");
    if export {
        key_part = key_part["export".len()..].trim();
    }
    let key = key_part.trim();
    if key.is_empty() {
        return None;
    }

    let (value_raw, comment) = split_value_and_comment(right);
    let value_ws = leading_whitespace(&value_raw);
    Some(Assignment {
        leading,
        export,
        left_raw: left.to_string(),
        key: key.to_string(),
        value_raw,
        value_ws,
        comment,
    })
}

/// Split the right-hand side of an assignment into the value text and a
/// trailing comment (with its leading whitespace), respecting quotes.
fn split_value_and_comment(right: &str) -> (String, String) {
    let b = right.as_bytes();
    if b.is_empty() {
        return (String::new(), String::new());
    }
    let mut start = 0;
    while start < b.len() && (b[start] == b' ' || b[start] == b'\t') {
        start += 1;
    }
    if start >= b.len() {
        return (right.to_string(), String::new());
    }
    let comment_after = |close: usize| -> Option<usize> {
        let mut ws = close + 1;
        while ws < b.len() && (b[ws] == b' ' || b[ws] == b'\t') {
            ws += 1;
        }
        (ws < b.len() && b[ws] == b'#').then_some(close + 1)
    };
    match b[start] {
        b'#' => (String::new(), right.to_string()),
        b'\'' => {
            match right[start + 1..].find('\'') {
                None => (right.to_string(), String::new()),
                Some(rel) => {
                    let close = start + 1 + rel;
                    match comment_after(close) {
                        Some(cstart) => {
                            (right[..cstart].to_string(), right[cstart..].to_string())
                        }
                        None => (right.to_string(), String::new()),
                    }
                }
            }
        }
        b'"' => {
            let mut escaped = false;
            let mut close = None;
            for (i, &ch) in b.iter().enumerate().skip(start + 1) {
                if escaped {
                    escaped = false;
                } else if ch == b'\\' {
                    escaped = true;
                } else if ch == b'"' {
                    close = Some(i);
                    break;
                }
            }
            match close {
                None => (right.to_string(), String::new()),
                Some(close) => match comment_after(close) {
                    Some(cstart) => {
                        (right[..cstart].to_string(), right[cstart..].to_string())
                    }
                    None => (right.to_string(), String::new()),
                },
            }
        }
        _ => {
            for i in start..b.len() {
                if b[i] != b'#' {
                    continue;
                }
                if i == start {
                    return (String::new(), right.to_string());
                }
                let prev = b[i - 1];
                if prev == b' ' || prev == b'\t' {
                    let mut cstart = i - 1;
                    while cstart > start
                        && (b[cstart - 1] == b' ' || b[cstart - 1] == b'\t')
                    {
                        cstart -= 1;
                    }
                    return (right[..cstart].to_string(), right[cstart..].to_string());
                }
            }
            (right.to_string(), String::new())
        }
    }
}

fn render_preserve_layout(existing: &Assignment, value: &str) -> String {
    if existing.left_raw.trim().is_empty() {
        let export = if existing.export { "export " } else { "" };
        return format!(
            "{}{export}{}={}{}",
            existing.leading,
            existing.key,
            value.trim(),
            existing.comment
        );
    }
    format!(
        "{}={}{}{}",
        existing.left_raw,
        existing.value_ws,
        value.trim(),
        existing.comment
    )
}

fn leading_whitespace(s: &str) -> String {
    let end = s.len() - s.trim_start_matches([' ', '\t']).len();
    s[..end].to_string()
}

/// Characters a value may contain and still render unquoted.
fn is_plain_char(c: char) -> bool {
    c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-' | '/' | ':' | '@' | '+' | '%' | '=')
}

/// Render a value for writing: plain when every character is shell-safe,
/// double-quoted with `\\` and `\"` escaping otherwise.
pub fn render_value(value: &str) -> String {
    if !value.is_empty() && value.chars().all(is_plain_char) {
        return value.to_string();
    }
    let mut out = String::with_capacity(value.len() + 2);
    out.push('"');
    for c in value.chars() {
        match c {
            '\\' => out.push_str("\\\\"),
            '"' => out.push_str("\\\""),
            _ => out.push(c),
        }
    }
    out.push('"');
    out
}

/// Strip one layer of quoting from a raw on-disk value. Accepts plain,
/// single-quoted, and double-quoted (with `\\`/`\"` unescaping) forms.
pub fn unquote_value(raw: &str) -> String {
    let trimmed = raw.trim();
    if trimmed.len() >= 2 && trimmed.starts_with('\'') && trimmed.ends_with('\'') {
        return trimmed[1..trimmed.len() - 1].to_string();
    }
    if trimmed.len() >= 2 && trimmed.starts_with('"') && trimmed.ends_with('"') {
        let inner = &trimmed[1..trimmed.len() - 1];
        let mut out = String::with_capacity(inner.len());
        let mut chars = inner.chars();
        while let Some(c) = chars.next() {
            if c == '\\' {
                match chars.next() {
                    Some(next) => out.push(next),
                    None => out.push('\\'),
                }
            } else {
                out.push(c);
            }
        }
        return out;
    }
    trimmed.to_string()
}

/// Read and parse an env file. Missing file is a local not-found; content
/// must be UTF-8.
pub fn read_file(path: &Path) -> Result<DotenvFile> {
    let data = match std::fs::read(path) {
        Ok(data) => data,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            return Err(Error::NotFound {
                what: format!("env file {}", path.display()),
                remote: false,
            });
        }
        Err(e) => return Err(e.into()),
    };
    let text = String::from_utf8(data).map_err(|_| {
        Error::InvalidArgument(format!("{} is not valid UTF-8", path.display()))
    })?;
    Ok(parse(&text))
}

/// Write env file bytes atomically. Writing through a symlink is refused
/// unless explicitly allowed, in which case the resolved target is
/// rewritten in place.
pub fn write_file_atomic(path: &Path, bytes: &[u8], allow_symlink: bool) -> Result<()> {
    let target = resolve_write_target(path, allow_symlink)?;
    if let Some(parent) = target.parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent)?;
        }
    }
    util::write_file_atomic(&target, bytes, 0o600)
}

fn resolve_write_target(path: &Path, allow_symlink: bool) -> Result<std::path::PathBuf> {
    let meta = match std::fs::symlink_metadata(path) {
        Ok(meta) => meta,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            return Ok(path.to_path_buf());
        }
        Err(e) => return Err(e.into()),
    };
    if !meta.file_type().is_symlink() {
        return Ok(path.to_path_buf());
    }
    if !allow_symlink {
        return Err(Error::InvalidArgument(format!(
            "refusing to write vault env file through symlink: {} \
             (set SI_VAULT_ALLOW_SYMLINK_ENV_FILE=1 to override)",
            path.display()
        )));
    }
    let resolved = std::fs::canonicalize(path)?;
    if resolved.is_dir() {
        return Err(Error::InvalidArgument(format!(
            "vault env symlink resolves to a directory: {}",
            resolved.display()
        )));
    }
    Ok(resolved)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn roundtrip_is_byte_exact() {
        let cases = [
            "",
            "A=1\n",
            "A=1",
            "A=1\r\nB=2\r\n",
            "# comment\n\nexport KEY=\"a b\" # trailing\nLAST=x",
            "\n\n\n",
            "MIXED=1\r\nUNIX=2\nlast=3",
        ];
        for case in cases {
            let doc = parse(case);
            assert_eq!(doc.bytes(), case.as_bytes(), "case {case:?}");
        }
    }

    #[test]
    fn entries_skip_comments_and_blanks() {
        let doc = parse("# top\n\nA=1\nexport B=2\nnot a line\nC=3 # note\n");
        let entries = doc.entries().unwrap();
        let keys: Vec<_> = entries.iter().map(|e| e.key.as_str()).collect();
        assert_eq!(keys, ["A", "B", "C"]);
        assert_eq!(entries[2].value_raw, "3");
    }

    #[test]
    fn entries_reject_bad_key_names() {
        let doc = parse("GOOD=1\n9BAD=2\n");
        let err = doc.entries().unwrap_err();
        assert!(err.to_string().contains("9BAD"), "{err}");
    }

    #[test]
    fn lookup_is_last_wins() {
        let doc = parse("A=first\nA=second\n");
        assert_eq!(doc.lookup("A").as_deref(), Some("second"));
        assert_eq!(doc.lookup("B"), None);
    }

    #[test]
    fn set_preserves_export_and_comment() {
        let mut doc = parse("export KEY=old # keep me\n");
        assert!(doc.set("KEY", "new").unwrap());
        assert_eq!(
            String::from_utf8(doc.bytes()).unwrap(),
            "export KEY=new # keep me\n"
        );
    }

    #[test]
    fn set_appends_with_default_nl() {
        let mut doc = parse("A=1\r\n");
        assert!(doc.set("B", "2").unwrap());
        assert_eq!(String::from_utf8(doc.bytes()).unwrap(), "A=1\r\nB=2\r\n");
    }

    #[test]
    fn set_terminates_final_line_before_append() {
        let mut doc = parse("A=1");
        assert!(doc.set("B", "2").unwrap());
        assert_eq!(String::from_utf8(doc.bytes()).unwrap(), "A=1\nB=2\n");
    }

    #[test]
    fn set_unchanged_value_reports_no_change() {
        let mut doc = parse("A=1\n");
        assert!(!doc.set("A", "1").unwrap());
    }

    #[test]
    fn unset_removes_all_occurrences() {
        let mut doc = parse("A=1\nB=2\nA=3\n");
        assert!(doc.unset("A").unwrap());
        assert_eq!(String::from_utf8(doc.bytes()).unwrap(), "B=2\n");
        assert!(!doc.unset("A").unwrap());
    }

    #[test]
    fn quoted_values_keep_hash_inside() {
        let doc = parse("A=\"v#1\" # real comment\nB='x # y'\n");
        assert_eq!(doc.lookup("A").as_deref(), Some("\"v#1\""));
        assert_eq!(doc.lookup("B").as_deref(), Some("'x # y'"));
    }

    #[test]
    fn render_value_plain_and_quoted() {
        assert_eq!(render_value("abc.123"), "abc.123");
        assert_eq!(render_value("a b"), "\"a b\"");
        assert_eq!(render_value("say \"hi\""), "\"say \\\"hi\\\"\"");
        assert_eq!(render_value(""), "\"\"");
    }

    #[test]
    fn unquote_accepts_all_forms() {
        assert_eq!(unquote_value("plain"), "plain");
        assert_eq!(unquote_value("'single quoted'"), "single quoted");
        assert_eq!(unquote_value("\"a \\\"b\\\"\""), "a \"b\"");
        assert_eq!(unquote_value(render_value("round trip \\ it").as_str()), "round trip \\ it");
    }

    #[test]
    fn read_missing_file_is_local_not_found() {
        let tmp = TempDir::new().unwrap();
        let err = read_file(&tmp.path().join(".env")).unwrap_err();
        match err {
            Error::NotFound { remote, .. } => assert!(!remote),
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn write_then_read_roundtrip() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join(".env");
        let content = b"A=1\r\nB=\"two words\"\r\n";
        write_file_atomic(&path, content, false).unwrap();
        let doc = read_file(&path).unwrap();
        assert_eq!(doc.bytes(), content);
    }

    #[cfg(unix)]
    #[test]
    fn write_refuses_symlink_without_override() {
        let tmp = TempDir::new().unwrap();
        let real = tmp.path().join("real.env");
        std::fs::write(&real, "A=1\n").unwrap();
        let link = tmp.path().join(".env");
        std::os::unix::fs::symlink(&real, &link).unwrap();

        let err = write_file_atomic(&link, b"A=2\n", false).unwrap_err();
        assert!(err.to_string().contains("symlink"), "{err}");

        write_file_atomic(&link, b"A=3\n", true).unwrap();
        assert_eq!(std::fs::read(&real).unwrap(), b"A=3\n");
    }
}
