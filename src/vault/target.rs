//! Vault target resolution: which `(repo, env, env file)` an operation
//! acts on.
//!
//! Explicit flags win and are validated strictly; everything else is
//! derived (git root basename, `SI_VAULT_ENV*`, filename suffix) and
//! coerced into slug form. No file I/O happens before validation of
//! explicit values.

use crate::config::Config;
use crate::error::{Error, Result};
use crate::util;
use std::path::{Path, PathBuf};
use std::sync::OnceLock;

/// Fully resolved target. `env_file` is absolute and lexically cleaned.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VaultTarget {
    pub repo: String,
    pub env: String,
    pub env_file: PathBuf,
    /// Source-control root (or cwd when none found).
    pub repo_dir: PathBuf,
}

/// Raw `--repo` / `--env` / `--file` flag values.
#[derive(Debug, Clone, Default)]
pub struct TargetFlags {
    pub repo: Option<String>,
    pub env: Option<String>,
    pub file: Option<String>,
}

fn slug_re() -> &'static regex::Regex {
    static RE: OnceLock<regex::Regex> = OnceLock::new();
    RE.get_or_init(|| regex::Regex::new(r"^[a-z0-9][a-z0-9._-]{0,63}$").unwrap())
}

/// Does `s` satisfy the slug rule (`[a-z0-9][a-z0-9._-]{0,63}`)?
pub fn is_slug(s: &str) -> bool {
    slug_re().is_match(s)
}

/// Coerce arbitrary text into slug form: lowercase, map disallowed
/// characters to `-`, trim leading separators, cap at 64. Empty result
/// falls back to `fallback`.
pub fn slugify(s: &str, fallback: &str) -> String {
    let mut out = String::new();
    for c in s.trim().to_lowercase().chars() {
        if c.is_ascii_lowercase() || c.is_ascii_digit() || matches!(c, '.' | '_' | '-') {
            out.push(c);
        } else {
            out.push('-');
        }
        if out.len() == 64 {
            break;
        }
    }
    let out = out.trim_start_matches(['.', '_', '-']).to_string();
    if is_slug(&out) {
        out
    } else {
        fallback.to_string()
    }
}

fn require_slug(value: &str, what: &str) -> Result<String> {
    let trimmed = value.trim();
    if is_slug(trimmed) {
        Ok(trimmed.to_string())
    } else {
        Err(Error::InvalidArgument(format!(
            "invalid {what} slug {trimmed:?} (expected [a-z0-9][a-z0-9._-]{{0,63}})"
        )))
    }
}

/// Walk up from `start` to the nearest directory containing `.git`.
pub fn git_root(start: &Path) -> Option<PathBuf> {
    let mut dir = start;
    loop {
        if dir.join(".git").exists() {
            return Some(dir.to_path_buf());
        }
        dir = dir.parent()?;
    }
}

/// Environment slug inferred from an env-file name: the suffix after
/// `.env.`, when it is a valid slug.
fn env_from_filename(path: &Path) -> Option<String> {
    let name = path.file_name()?.to_str()?;
    let suffix = name.strip_prefix(".env.")?;
    is_slug(suffix).then(|| suffix.to_string())
}

/// Resolve the vault target from flags, ambient config, and `cwd`.
pub fn resolve(flags: &TargetFlags, config: &Config, cwd: &Path) -> Result<VaultTarget> {
    // Strict validation of explicit values before any filesystem walk.
    let flag_repo = flags
        .repo
        .as_deref()
        .map(|v| require_slug(v, "repo"))
        .transpose()?;
    let flag_env = flags
        .env
        .as_deref()
        .map(|v| require_slug(v, "env"))
        .transpose()?;

    let repo_dir = git_root(cwd).unwrap_or_else(|| cwd.to_path_buf());

    let repo = match flag_repo {
        Some(repo) => repo,
        None => {
            let base = repo_dir
                .file_name()
                .and_then(|n| n.to_str())
                .unwrap_or_default();
            slugify(base, "repo")
        }
    };

    let file_value = flags
        .file
        .clone()
        .or_else(|| config.vault_env_file.clone())
        .unwrap_or_else(|| ".env".to_string());
    let env_file = util::absolutize(Path::new(&file_value), cwd);

    let env = match flag_env {
        Some(env) => env,
        None => config
            .vault_env
            .as_deref()
            .map(|v| slugify(v, "dev"))
            .or_else(|| env_from_filename(&env_file))
            .unwrap_or_else(|| "dev".to_string()),
    };

    // Derived values still have to satisfy the slug rule.
    let repo = require_slug(&repo, "repo")?;
    let env = require_slug(&env, "env")?;

    Ok(VaultTarget {
        repo,
        env,
        env_file,
        repo_dir,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn flags(repo: Option<&str>, env: Option<&str>, file: Option<&str>) -> TargetFlags {
        TargetFlags {
            repo: repo.map(String::from),
            env: env.map(String::from),
            file: file.map(String::from),
        }
    }

    #[test]
    fn slug_rule() {
        assert!(is_slug("my-app"));
        assert!(is_slug("a"));
        assert!(is_slug("web.api_v2"));
        assert!(!is_slug("Prod!"));
        assert!(!is_slug("-leading"));
        assert!(!is_slug(""));
        assert!(!is_slug(&"a".repeat(65)));
    }

    #[test]
    fn slugify_coerces_and_falls_back() {
        assert_eq!(slugify("My App!", "repo"), "my-app-");
        assert_eq!(slugify("___", "repo"), "repo");
        assert_eq!(slugify("", "repo"), "repo");
    }

    #[test]
    fn filename_suffix_infers_env() {
        let tmp = TempDir::new().unwrap();
        let target = resolve(
            &flags(None, None, Some(".env.prod")),
            &Config::default(),
            tmp.path(),
        )
        .unwrap();
        assert_eq!(target.env, "prod");
        assert_eq!(target.env_file, tmp.path().join(".env.prod"));
    }

    #[test]
    fn explicit_env_flag_beats_filename() {
        let tmp = TempDir::new().unwrap();
        let target = resolve(
            &flags(None, Some("dev"), Some(".env.prod")),
            &Config::default(),
            tmp.path(),
        )
        .unwrap();
        assert_eq!(target.env, "dev");
    }

    #[test]
    fn defaults_without_hints() {
        let tmp = TempDir::new().unwrap();
        let target = resolve(&TargetFlags::default(), &Config::default(), tmp.path()).unwrap();
        assert_eq!(target.env, "dev");
        assert_eq!(target.env_file, tmp.path().join(".env"));
        assert!(is_slug(&target.repo));
    }

    #[test]
    fn invalid_explicit_slug_rejected_before_io() {
        let tmp = TempDir::new().unwrap();
        let err = resolve(
            &flags(None, Some("Prod!"), None),
            &Config::default(),
            tmp.path(),
        )
        .unwrap_err();
        assert!(matches!(err, Error::InvalidArgument(_)), "{err}");
    }

    #[test]
    fn config_env_file_fallback() {
        let tmp = TempDir::new().unwrap();
        let cfg = Config {
            vault_env_file: Some(".env.staging".to_string()),
            ..Config::default()
        };
        let target = resolve(&TargetFlags::default(), &cfg, tmp.path()).unwrap();
        assert_eq!(target.env_file, tmp.path().join(".env.staging"));
        assert_eq!(target.env, "staging");
    }

    #[test]
    fn git_root_walks_up() {
        let tmp = TempDir::new().unwrap();
        let nested = tmp.path().join("a/b/c");
        std::fs::create_dir_all(&nested).unwrap();
        std::fs::create_dir(tmp.path().join(".git")).unwrap();
        assert_eq!(git_root(&nested).unwrap(), tmp.path());
        let target = resolve(&TargetFlags::default(), &Config::default(), &nested).unwrap();
        assert_eq!(target.repo_dir, tmp.path());
    }
}
