//! Small shared helpers: atomic file writes, advisory locks, the state
//! root, hashing, path cleanup.

use crate::error::{Error, Result};
use anyhow::Context;
use sha2::{Digest, Sha256};
use std::fs;
use std::io::Write;
use std::path::{Component, Path, PathBuf};

/// Write `bytes` to `path` atomically: temp file in the same directory,
/// fsync, rename over the destination. An existing file keeps its
/// permissions; a new file is created with `create_mode` (unix).
pub fn write_file_atomic(path: &Path, bytes: &[u8], create_mode: u32) -> Result<()> {
    let parent = match path.parent() {
        Some(p) if !p.as_os_str().is_empty() => p,
        _ => Path::new("."),
    };
    let existing_perms = fs::metadata(path).ok().map(|m| m.permissions());

    let mut tmp = tempfile::NamedTempFile::new_in(parent)
        .with_context(|| format!("create temp file in {}", parent.display()))?;
    tmp.write_all(bytes)
        .with_context(|| format!("write temp file for {}", path.display()))?;
    tmp.as_file()
        .sync_all()
        .with_context(|| format!("fsync temp file for {}", path.display()))?;

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        let perms = existing_perms.unwrap_or_else(|| fs::Permissions::from_mode(create_mode));
        tmp.as_file()
            .set_permissions(perms)
            .with_context(|| format!("set permissions on {}", path.display()))?;
    }
    #[cfg(not(unix))]
    {
        let _ = (existing_perms, create_mode);
    }

    tmp.persist(path)
        .map_err(|e| Error::Internal(anyhow::anyhow!("rename over {}: {e}", path.display())))?;
    Ok(())
}

/// Advisory exclusive lock held for the lifetime of the guard. The lock
/// file is created if missing, parents included.
pub struct FileLock {
    #[cfg(unix)]
    file: fs::File,
}

impl FileLock {
    pub fn acquire(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)
                    .with_context(|| format!("create {}", parent.display()))?;
            }
        }
        #[cfg(unix)]
        {
            use std::os::unix::io::AsRawFd;
            let file = fs::OpenOptions::new()
                .create(true)
                .truncate(false)
                .read(true)
                .write(true)
                .open(path)
                .with_context(|| format!("open lock file {}", path.display()))?;
            let rc = unsafe { libc::flock(file.as_raw_fd(), libc::LOCK_EX) };
            if rc != 0 {
                return Err(Error::Internal(
                    anyhow::Error::from(std::io::Error::last_os_error())
                        .context(format!("flock {}", path.display())),
                ));
            }
            Ok(Self { file })
        }
        #[cfg(not(unix))]
        {
            let _ = path;
            Ok(Self {})
        }
    }
}

#[cfg(unix)]
impl Drop for FileLock {
    fn drop(&mut self) {
        use std::os::unix::io::AsRawFd;
        unsafe {
            libc::flock(self.file.as_raw_fd(), libc::LOCK_UN);
        }
    }
}

/// Root directory for all per-user state (trust store, control-plane
/// collections). An explicit override wins; otherwise the platform data
/// directory for the `si` application.
pub fn state_root(override_dir: Option<&Path>) -> Result<PathBuf> {
    if let Some(dir) = override_dir {
        return Ok(dir.to_path_buf());
    }
    let dirs = directories::ProjectDirs::from("", "", "si")
        .ok_or_else(|| Error::Internal(anyhow::anyhow!("cannot determine a state directory")))?;
    Ok(dirs.data_local_dir().to_path_buf())
}

/// Lowercase hex SHA-256 of the given bytes.
pub fn sha256_hex(bytes: &[u8]) -> String {
    hex::encode(Sha256::digest(bytes))
}

/// Environment-variable truthiness: 1/true/yes/on, case-insensitive.
pub fn is_truthy(value: &str) -> bool {
    matches!(
        value.trim().to_ascii_lowercase().as_str(),
        "1" | "true" | "yes" | "on"
    )
}

/// UTC now as an RFC 3339 string with second precision.
pub fn now_rfc3339() -> String {
    chrono::Utc::now().to_rfc3339_opts(chrono::SecondsFormat::Secs, true)
}

/// Lexical path cleanup: drops `.`, resolves `..` against preceding
/// components where possible. No filesystem access.
pub fn clean_path(path: &Path) -> PathBuf {
    let mut out = PathBuf::new();
    for comp in path.components() {
        match comp {
            Component::CurDir => {}
            Component::ParentDir => {
                if !out.pop() {
                    out.push("..");
                }
            }
            other => out.push(other.as_os_str()),
        }
    }
    if out.as_os_str().is_empty() {
        out.push(".");
    }
    out
}

/// Absolutize `path` against `cwd`, then clean lexically.
pub fn absolutize(path: &Path, cwd: &Path) -> PathBuf {
    if path.is_absolute() {
        clean_path(path)
    } else {
        clean_path(&cwd.join(path))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn atomic_write_creates_and_replaces() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("out.txt");
        write_file_atomic(&path, b"first", 0o600).unwrap();
        assert_eq!(fs::read(&path).unwrap(), b"first");
        write_file_atomic(&path, b"second", 0o600).unwrap();
        assert_eq!(fs::read(&path).unwrap(), b"second");
    }

    #[cfg(unix)]
    #[test]
    fn atomic_write_sets_create_mode_and_preserves_existing() {
        use std::os::unix::fs::PermissionsExt;
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("secret");
        write_file_atomic(&path, b"x", 0o600).unwrap();
        let mode = fs::metadata(&path).unwrap().permissions().mode() & 0o777;
        assert_eq!(mode, 0o600);

        fs::set_permissions(&path, fs::Permissions::from_mode(0o644)).unwrap();
        write_file_atomic(&path, b"y", 0o600).unwrap();
        let mode = fs::metadata(&path).unwrap().permissions().mode() & 0o777;
        assert_eq!(mode, 0o644, "rewrite must keep existing permissions");
    }

    #[test]
    fn file_lock_acquire_and_release() {
        let tmp = TempDir::new().unwrap();
        let lock_path = tmp.path().join("locks/trust.lock");
        {
            let _guard = FileLock::acquire(&lock_path).unwrap();
            assert!(lock_path.exists());
        }
        // Re-acquire after drop must succeed.
        let _guard = FileLock::acquire(&lock_path).unwrap();
    }

    #[test]
    fn state_root_honors_override() {
        let tmp = TempDir::new().unwrap();
        let root = state_root(Some(tmp.path())).unwrap();
        assert_eq!(root, tmp.path());
    }

    #[test]
    fn sha256_hex_known_vector() {
        assert_eq!(
            sha256_hex(b""),
            "e3b0c44298fc1c149afbf4c8996fb92427ae41e4649b934ca495991b7852b855"
        );
    }

    #[test]
    fn truthy_values() {
        for v in ["1", "true", "TRUE", " yes ", "On"] {
            assert!(is_truthy(v), "{v}");
        }
        for v in ["", "0", "false", "no", "off", "2"] {
            assert!(!is_truthy(v), "{v}");
        }
    }

    #[test]
    fn clean_path_resolves_dots() {
        assert_eq!(clean_path(Path::new("/a/b/../c/./d")), Path::new("/a/c/d"));
        assert_eq!(clean_path(Path::new("a/./b")), Path::new("a/b"));
        assert_eq!(clean_path(Path::new(".")), Path::new("."));
    }

    #[test]
    fn absolutize_joins_relative() {
        assert_eq!(
            absolutize(Path::new(".env"), Path::new("/work/app")),
            Path::new("/work/app/.env")
        );
        assert_eq!(
            absolutize(Path::new("/etc/env"), Path::new("/work")),
            Path::new("/etc/env")
        );
    }
}
