//! Plaintext guard: refuse to let unencrypted secret values reach a
//! commit. Scans env documents for plaintext assignments, resolves the
//! staged or discovered file set, and manages the git pre-commit hook
//! that wires the check into every commit.

use crate::error::{Error, Finding, Result};
use crate::vault::cipher;
use crate::vault::dotenv::{self, DotenvFile};
use crate::vault::filter::PUBLIC_KEY_HEADER;
use std::path::{Path, PathBuf};
use tokio::process::Command;

/// Sentinel identifying the hook block this tool owns. Bumping the
/// version invalidates previously installed blocks.
pub const HOOK_SENTINEL: &str = "si-vault:hook pre-commit v1";

const HOOK_BEGIN: &str = "# >>> si-vault:hook pre-commit v1 >>>";
const HOOK_END: &str = "# <<< si-vault:hook pre-commit v1 <<<";

/// Keys in `doc` whose values are plaintext: non-empty after unquoting,
/// not ciphertext, and not the public-key header.
pub fn plaintext_keys(doc: &DotenvFile) -> Result<Vec<String>> {
    let mut out = Vec::new();
    for entry in doc.entries()? {
        if entry.key == PUBLIC_KEY_HEADER {
            continue;
        }
        let value = dotenv::unquote_value(&entry.value_raw);
        if value.is_empty() || cipher::is_encrypted_value(&value) {
            continue;
        }
        if !out.contains(&entry.key) {
            out.push(entry.key);
        }
    }
    Ok(out)
}

/// Whether a file name is env-shaped: `.env`, `.env.<suffix>`, or
/// `<prefix>.env`.
pub fn is_env_filename(name: &str) -> bool {
    name == ".env" || name.starts_with(".env.") || name.ends_with(".env")
}

/// Scan the given env files; missing files are skipped, any other read
/// or parse failure is fatal. Fails with an error carrying every
/// offending file when plaintext values are present.
pub fn check_files(paths: &[PathBuf]) -> Result<()> {
    let mut findings = Vec::new();
    for path in paths {
        let doc = match dotenv::read_file(path) {
            Ok(doc) => doc,
            Err(Error::NotFound { .. }) => continue,
            Err(e) => return Err(e),
        };
        let keys = plaintext_keys(&doc)?;
        if !keys.is_empty() {
            findings.push(Finding {
                file: path.clone(),
                keys,
            });
        }
    }
    if findings.is_empty() {
        Ok(())
    } else {
        Err(Error::PlaintextGuard { findings })
    }
}

/// Env-shaped files currently staged for commit, as absolute paths under
/// the repository root. Deleted paths are excluded by the diff filter.
pub async fn staged_env_files(repo_dir: &Path) -> Result<Vec<PathBuf>> {
    let output = Command::new("git")
        .args(["diff", "--cached", "--name-only", "--diff-filter=ACM"])
        .current_dir(repo_dir)
        .output()
        .await
        .map_err(|e| Error::Internal(anyhow::anyhow!("run git diff: {e}")))?;
    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        return Err(Error::InvalidArgument(format!(
            "git diff --cached failed: {}",
            stderr.trim()
        )));
    }
    let listing = String::from_utf8_lossy(&output.stdout);
    let mut out = Vec::new();
    for rel in listing.lines().map(str::trim).filter(|l| !l.is_empty()) {
        let name = Path::new(rel)
            .file_name()
            .and_then(|n| n.to_str())
            .unwrap_or_default();
        if is_env_filename(name) {
            let abs = repo_dir.join(rel);
            if abs.is_file() {
                out.push(abs);
            }
        }
    }
    Ok(out)
}

/// Walk `root` for env-shaped files. `.git`, `node_modules`, and
/// `vendor` trees are never entered; files and directories whose name
/// contains "example" are skipped unless `include_examples`.
pub fn discover_env_files(root: &Path, include_examples: bool) -> Result<Vec<PathBuf>> {
    let mut out = Vec::new();
    walk(root, include_examples, &mut out)?;
    out.sort();
    Ok(out)
}

fn walk(dir: &Path, include_examples: bool, out: &mut Vec<PathBuf>) -> Result<()> {
    let entries = match std::fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(e) if e.kind() == std::io::ErrorKind::PermissionDenied => return Ok(()),
        Err(e) => return Err(e.into()),
    };
    for entry in entries {
        let entry = entry?;
        let name = entry.file_name();
        let Some(name) = name.to_str() else { continue };
        let path = entry.path();
        let file_type = entry.file_type()?;
        if !include_examples && name.to_ascii_lowercase().contains("example") {
            continue;
        }
        if file_type.is_dir() {
            if matches!(name, ".git" | "node_modules" | "vendor") {
                continue;
            }
            walk(&path, include_examples, out)?;
        } else if file_type.is_file() && is_env_filename(name) {
            out.push(path);
        }
    }
    Ok(())
}

fn hooks_dir(repo_dir: &Path) -> Result<PathBuf> {
    let git = repo_dir.join(".git");
    if git.is_dir() {
        return Ok(git.join("hooks"));
    }
    Err(Error::InvalidArgument(format!(
        "{} is not a git repository root",
        repo_dir.display()
    )))
}

fn hook_block() -> String {
    format!(
        "{HOOK_BEGIN}\n\
         # Refuse commits that stage plaintext secrets in env files.\n\
         si vault check --staged || exit 1\n\
         {HOOK_END}\n"
    )
}

fn strip_hook_block(script: &str) -> String {
    let mut out = String::with_capacity(script.len());
    let mut inside = false;
    for line in script.lines() {
        if line.trim() == HOOK_BEGIN {
            inside = true;
            continue;
        }
        if inside {
            if line.trim() == HOOK_END {
                inside = false;
            }
            continue;
        }
        out.push_str(line);
        out.push('\n');
    }
    out
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HookStatus {
    Installed,
    /// A pre-commit hook exists but carries no block of ours.
    Foreign,
    Missing,
}

impl HookStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            HookStatus::Installed => "installed",
            HookStatus::Foreign => "foreign",
            HookStatus::Missing => "missing",
        }
    }
}

pub fn hook_status(repo_dir: &Path) -> Result<HookStatus> {
    let path = hooks_dir(repo_dir)?.join("pre-commit");
    match std::fs::read_to_string(&path) {
        Ok(script) => {
            if script.contains(HOOK_SENTINEL) {
                Ok(HookStatus::Installed)
            } else {
                Ok(HookStatus::Foreign)
            }
        }
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(HookStatus::Missing),
        Err(e) => Err(e.into()),
    }
}

/// Install (or refresh) our block in the pre-commit hook, preserving any
/// existing hook content. Returns whether the hook changed.
pub fn install_hook(repo_dir: &Path) -> Result<bool> {
    let dir = hooks_dir(repo_dir)?;
    std::fs::create_dir_all(&dir)?;
    let path = dir.join("pre-commit");

    let existing = match std::fs::read_to_string(&path) {
        Ok(script) => script,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => String::new(),
        Err(e) => return Err(e.into()),
    };

    let mut script = if existing.is_empty() {
        "#!/bin/sh\n".to_string()
    } else {
        strip_hook_block(&existing)
    };
    if !script.ends_with('\n') {
        script.push('\n');
    }
    if !script.ends_with("\n\n") && script.len() > 1 {
        script.push('\n');
    }
    script.push_str(&hook_block());

    if script == existing {
        return Ok(false);
    }
    write_hook(&path, script.as_bytes())?;
    Ok(true)
}

/// Remove our block. A hook that becomes empty apart from the shebang is
/// deleted entirely. Returns whether anything changed.
pub fn uninstall_hook(repo_dir: &Path) -> Result<bool> {
    let path = hooks_dir(repo_dir)?.join("pre-commit");
    let existing = match std::fs::read_to_string(&path) {
        Ok(script) => script,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(false),
        Err(e) => return Err(e.into()),
    };
    if !existing.contains(HOOK_SENTINEL) {
        return Ok(false);
    }
    let stripped = strip_hook_block(&existing);
    let meaningful = stripped
        .lines()
        .any(|l| !l.trim().is_empty() && !l.starts_with("#!"));
    if meaningful {
        write_hook(&path, stripped.as_bytes())?;
    } else {
        std::fs::remove_file(&path)?;
    }
    Ok(true)
}

fn write_hook(path: &Path, bytes: &[u8]) -> Result<()> {
    crate::util::write_file_atomic(path, bytes, 0o755)?;
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o755))?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::vault::dotenv::parse;
    use tempfile::TempDir;

    #[test]
    fn plaintext_keys_skip_header_empty_and_encrypted() {
        let doc = parse(
            "SI_VAULT_PUBLIC_KEY=02ab\n\
             EMPTY=\n\
             SECRET=hunter2\n\
             SEALED=encrypted:siv:v3:AAAA\n\
             # COMMENTED=out\n\
             QUOTED=\"plain text\"\n",
        );
        let keys = plaintext_keys(&doc).unwrap();
        assert_eq!(keys, ["SECRET", "QUOTED"]);
    }

    #[test]
    fn plaintext_keys_dedupe_repeats() {
        let doc = parse("A=1\nA=2\n");
        assert_eq!(plaintext_keys(&doc).unwrap(), ["A"]);
    }

    #[test]
    fn env_filename_shapes() {
        for name in [".env", ".env.dev", ".env.prod", "service.env"] {
            assert!(is_env_filename(name), "{name}");
        }
        for name in ["env", ".envrc", "notes.txt", ".environment"] {
            assert!(!is_env_filename(name), "{name}");
        }
    }

    #[test]
    fn check_files_reports_every_offender() {
        let tmp = TempDir::new().unwrap();
        let clean = tmp.path().join(".env");
        let dirty = tmp.path().join(".env.dev");
        std::fs::write(&clean, "A=encrypted:siv:v3:AAAA\n").unwrap();
        std::fs::write(&dirty, "B=plain\nC=also\n").unwrap();

        check_files(&[clean.clone()]).unwrap();
        let err = check_files(&[clean, dirty.clone()]).unwrap_err();
        match err {
            Error::PlaintextGuard { findings } => {
                assert_eq!(findings.len(), 1);
                assert_eq!(findings[0].file, dirty);
                assert_eq!(findings[0].keys, ["B", "C"]);
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn check_files_skips_missing_paths() {
        let tmp = TempDir::new().unwrap();
        let present = tmp.path().join(".env");
        std::fs::write(&present, "A=leaked\n").unwrap();

        // A nonexistent default target must not mask real findings.
        let err = check_files(&[tmp.path().join(".env.absent"), present.clone()]).unwrap_err();
        match err {
            Error::PlaintextGuard { findings } => {
                assert_eq!(findings.len(), 1);
                assert_eq!(findings[0].file, present);
            }
            other => panic!("unexpected {other:?}"),
        }
        check_files(&[tmp.path().join(".env.absent")]).unwrap();
    }

    #[test]
    fn discover_skips_ignored_trees_and_examples() {
        let tmp = TempDir::new().unwrap();
        std::fs::create_dir_all(tmp.path().join("app")).unwrap();
        std::fs::create_dir_all(tmp.path().join("node_modules/pkg")).unwrap();
        std::fs::create_dir_all(tmp.path().join(".git")).unwrap();
        std::fs::write(tmp.path().join(".env"), "").unwrap();
        std::fs::write(tmp.path().join("app/.env.dev"), "").unwrap();
        std::fs::write(tmp.path().join("node_modules/pkg/.env"), "").unwrap();
        std::fs::write(tmp.path().join(".env.example"), "").unwrap();

        let found = discover_env_files(tmp.path(), false).unwrap();
        assert_eq!(
            found,
            vec![tmp.path().join(".env"), tmp.path().join("app/.env.dev")]
        );

        let with_examples = discover_env_files(tmp.path(), true).unwrap();
        assert!(with_examples.contains(&tmp.path().join(".env.example")));
    }

    fn git_repo() -> TempDir {
        let tmp = TempDir::new().unwrap();
        std::fs::create_dir_all(tmp.path().join(".git/hooks")).unwrap();
        tmp
    }

    #[test]
    fn install_creates_hook_with_sentinel() {
        let repo = git_repo();
        assert_eq!(hook_status(repo.path()).unwrap(), HookStatus::Missing);
        assert!(install_hook(repo.path()).unwrap());
        assert_eq!(hook_status(repo.path()).unwrap(), HookStatus::Installed);

        let script =
            std::fs::read_to_string(repo.path().join(".git/hooks/pre-commit")).unwrap();
        assert!(script.starts_with("#!/bin/sh\n"));
        assert!(script.contains(HOOK_SENTINEL));
        assert!(script.contains("si vault check --staged"));
    }

    #[test]
    fn install_is_idempotent() {
        let repo = git_repo();
        assert!(install_hook(repo.path()).unwrap());
        assert!(!install_hook(repo.path()).unwrap());
    }

    #[test]
    fn install_preserves_foreign_hook_content() {
        let repo = git_repo();
        let hook = repo.path().join(".git/hooks/pre-commit");
        std::fs::write(&hook, "#!/bin/sh\nlint-staged\n").unwrap();
        assert_eq!(hook_status(repo.path()).unwrap(), HookStatus::Foreign);

        assert!(install_hook(repo.path()).unwrap());
        let script = std::fs::read_to_string(&hook).unwrap();
        assert!(script.contains("lint-staged"));
        assert!(script.contains(HOOK_SENTINEL));

        assert!(uninstall_hook(repo.path()).unwrap());
        let script = std::fs::read_to_string(&hook).unwrap();
        assert!(script.contains("lint-staged"));
        assert!(!script.contains(HOOK_SENTINEL));
    }

    #[test]
    fn uninstall_removes_hook_we_created() {
        let repo = git_repo();
        install_hook(repo.path()).unwrap();
        assert!(uninstall_hook(repo.path()).unwrap());
        assert_eq!(hook_status(repo.path()).unwrap(), HookStatus::Missing);
        assert!(!uninstall_hook(repo.path()).unwrap());
    }

    #[cfg(unix)]
    #[test]
    fn hook_is_executable() {
        use std::os::unix::fs::PermissionsExt;
        let repo = git_repo();
        install_hook(repo.path()).unwrap();
        let mode = std::fs::metadata(repo.path().join(".git/hooks/pre-commit"))
            .unwrap()
            .permissions()
            .mode()
            & 0o777;
        assert_eq!(mode, 0o755);
    }
}
