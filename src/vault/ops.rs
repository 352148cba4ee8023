//! Library-level vault operations behind the CLI commands. Each one
//! reads the env file, applies a pure document transform, and persists
//! atomically; custody is only contacted when key material is needed.

use crate::audit;
use crate::config::Config;
use crate::error::{Error, Result};
use crate::vault::dotenv::{self, DotenvFile};
use crate::vault::filter::{ensure_public_key_header, KeyFilter};
use crate::vault::keys::{self, KeyMaterial};
use crate::vault::target::VaultTarget;
use crate::vault::trust::{TrustStatus, TrustStore};
use serde::Serialize;
use std::path::{Path, PathBuf};

/// Suffix of the single restore backup written by `decrypt --inplace`.
pub const RESTORE_SUFFIX: &str = ".si-restore";

fn restore_path(env_file: &Path) -> PathBuf {
    let mut name = env_file
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    name.push_str(RESTORE_SUFFIX);
    env_file.with_file_name(name)
}

async fn material(config: &Config, target: &VaultTarget) -> Result<KeyMaterial> {
    let custody = config.custody()?;
    keys::ensure(&custody, target, config.vault_public_key_hint.as_deref()).await
}

/// Persist the document and let trust follow the edit: a file that was
/// trusted before the rewrite stays trusted at its new fingerprint.
fn write_back(config: &Config, env_file: &Path, doc: &DotenvFile, old_bytes: &[u8]) -> Result<()> {
    let bytes = doc.bytes();
    let mut store = TrustStore::open(&config.state_root()?)?;
    let was_trusted = store.status(env_file, old_bytes) == TrustStatus::Trusted;
    dotenv::write_file_atomic(env_file, &bytes, config.allow_symlink_env_file)?;
    if was_trusted {
        store.record(env_file, &bytes);
        store.save()?;
    }
    Ok(())
}

#[derive(Debug, Serialize)]
pub struct KeypairReport {
    pub repo: String,
    pub env: String,
    pub env_file: PathBuf,
    pub public_key: String,
    pub backup_keys: usize,
    pub rotated: bool,
}

/// Ensure custody key material for the target, optionally rotating to a
/// fresh keypair, and stamp the public-key header into the env file. A
/// missing env file is created with just the header. The private key
/// never leaves custody.
pub async fn keypair(config: &Config, target: &VaultTarget, rotate: bool) -> Result<KeypairReport> {
    let custody = config.custody()?;
    let mut material =
        keys::ensure(&custody, target, config.vault_public_key_hint.as_deref()).await?;
    if rotate {
        material = keys::rotate(&custody, target, &material).await?;
    }

    let (mut doc, created_file) = match dotenv::read_file(&target.env_file) {
        Ok(doc) => (doc, false),
        Err(Error::NotFound { .. }) => (DotenvFile::default(), true),
        Err(e) => return Err(e),
    };
    let old_bytes = doc.bytes();
    let changed = ensure_public_key_header(&mut doc, &material.public_key);
    if changed || created_file {
        write_back(config, &target.env_file, &doc, &old_bytes)?;
    }
    audit::emit(
        "vault.keypair",
        &[
            ("rotated", i64::from(rotate)),
            ("backup_keys", material.backup_private_keys.len() as i64),
        ],
        None,
    );
    Ok(KeypairReport {
        repo: material.repo.clone(),
        env: material.env.clone(),
        env_file: target.env_file.clone(),
        public_key: material.public_key.clone(),
        backup_keys: material.backup_private_keys.len(),
        rotated: rotate,
    })
}

#[derive(Debug, Serialize)]
pub struct StatusReport {
    pub repo: String,
    pub env: String,
    pub env_file: PathBuf,
    pub exists: bool,
    pub header_public_key: Option<String>,
    pub entries: usize,
    pub encrypted: usize,
    pub plaintext: usize,
    pub trust: String,
}

/// Local status of the resolved vault file. Custody is not contacted.
pub fn status(config: &Config, target: &VaultTarget) -> Result<StatusReport> {
    let mut report = StatusReport {
        repo: target.repo.clone(),
        env: target.env.clone(),
        env_file: target.env_file.clone(),
        exists: false,
        header_public_key: None,
        entries: 0,
        encrypted: 0,
        plaintext: 0,
        trust: TrustStatus::Unknown.as_str().to_string(),
    };
    let doc = match dotenv::read_file(&target.env_file) {
        Ok(doc) => doc,
        Err(Error::NotFound { .. }) => return Ok(report),
        Err(e) => return Err(e),
    };
    report.exists = true;
    report.header_public_key = doc
        .lookup(crate::vault::filter::PUBLIC_KEY_HEADER)
        .map(|v| dotenv::unquote_value(&v));
    for entry in doc.entries()? {
        if entry.key == crate::vault::filter::PUBLIC_KEY_HEADER {
            continue;
        }
        report.entries += 1;
        let value = dotenv::unquote_value(&entry.value_raw);
        if crate::vault::cipher::is_encrypted_value(&value) {
            report.encrypted += 1;
        } else if !value.is_empty() {
            report.plaintext += 1;
        }
    }
    let store = TrustStore::open(&config.state_root()?)?;
    report.trust = store
        .status(&target.env_file, &doc.bytes())
        .as_str()
        .to_string();
    Ok(report)
}

#[derive(Debug, Default, Serialize)]
pub struct EncryptReport {
    pub encrypted: usize,
    pub reencrypted: usize,
    pub skipped: usize,
    pub header_updated: bool,
    pub changed: bool,
}

/// Pure document transform behind `encrypt`.
pub fn encrypt_document(
    doc: &mut DotenvFile,
    material: &KeyMaterial,
    filter: &KeyFilter,
    reencrypt: bool,
) -> Result<EncryptReport> {
    let mut report = EncryptReport::default();
    let candidates = material.candidates();
    let mut updates: Vec<(String, String)> = Vec::new();
    for entry in doc.entries()? {
        if !filter.admits(&entry.key) {
            continue;
        }
        let value = dotenv::unquote_value(&entry.value_raw);
        if crate::vault::cipher::is_encrypted_value(&value) {
            if reencrypt {
                let plain = crate::vault::cipher::decrypt(&value, &candidates)?;
                let sealed = crate::vault::cipher::encrypt(&plain, &material.public_key)?;
                updates.push((entry.key, sealed));
                report.reencrypted += 1;
            } else {
                report.skipped += 1;
            }
            continue;
        }
        if value.is_empty() {
            report.skipped += 1;
            continue;
        }
        let sealed = crate::vault::cipher::encrypt(&value, &material.public_key)?;
        updates.push((entry.key, sealed));
        report.encrypted += 1;
    }
    for (key, sealed) in updates {
        if doc.set(&key, &sealed)? {
            report.changed = true;
        }
    }
    report.header_updated = ensure_public_key_header(doc, &material.public_key);
    report.changed |= report.header_updated;
    Ok(report)
}

/// Encrypt plaintext values in the vault file and enforce the header.
/// `--reencrypt` rotates every ciphertext to the current primary key and
/// requires the file to be trusted.
pub async fn encrypt(
    config: &Config,
    target: &VaultTarget,
    filter: &KeyFilter,
    reencrypt: bool,
) -> Result<EncryptReport> {
    let material = material(config, target).await?;
    let mut doc = dotenv::read_file(&target.env_file)?;
    let old_bytes = doc.bytes();
    if reencrypt {
        let store = TrustStore::open(&config.state_root()?)?;
        store.require(&target.env_file, &old_bytes, false)?;
    }
    let report = encrypt_document(&mut doc, &material, filter, reencrypt)?;
    if report.changed {
        write_back(config, &target.env_file, &doc, &old_bytes)?;
    }
    audit::emit(
        "vault.encrypt",
        &[
            ("encrypted", report.encrypted as i64),
            ("reencrypted", report.reencrypted as i64),
            ("skipped", report.skipped as i64),
        ],
        None,
    );
    Ok(report)
}

/// Pure document transform behind `decrypt`: rewrite admitted encrypted
/// values as rendered plaintext. Returns how many were decrypted.
pub fn decrypt_document(
    doc: &mut DotenvFile,
    material: &KeyMaterial,
    filter: &KeyFilter,
) -> Result<usize> {
    let candidates = material.candidates();
    let mut updates: Vec<(String, String)> = Vec::new();
    for entry in doc.entries()? {
        if !filter.admits(&entry.key) {
            continue;
        }
        let value = dotenv::unquote_value(&entry.value_raw);
        if !crate::vault::cipher::is_encrypted_value(&value) {
            continue;
        }
        let plain = crate::vault::cipher::decrypt(&value, &candidates)?;
        updates.push((entry.key, dotenv::render_value(&plain)));
    }
    let count = updates.len();
    for (key, rendered) in updates {
        doc.set(&key, &rendered)?;
    }
    Ok(count)
}

#[derive(Debug, Serialize)]
pub struct DecryptReport {
    pub decrypted: usize,
    pub inplace: bool,
    /// Full decrypted document, present in stdout mode.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub rendered: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub backup: Option<PathBuf>,
}

/// Decrypt the vault file. Stdout mode leaves the file untouched;
/// `--inplace` first writes the encrypted form to the restore backup.
/// Both require the file to be trusted.
pub async fn decrypt(
    config: &Config,
    target: &VaultTarget,
    filter: &KeyFilter,
    inplace: bool,
) -> Result<DecryptReport> {
    let material = material(config, target).await?;
    let mut doc = dotenv::read_file(&target.env_file)?;
    let old_bytes = doc.bytes();

    let store = TrustStore::open(&config.state_root()?)?;
    store.require(&target.env_file, &old_bytes, false)?;

    let decrypted = decrypt_document(&mut doc, &material, filter)?;
    let report = if inplace {
        let backup = restore_path(&target.env_file);
        crate::util::write_file_atomic(&backup, &old_bytes, 0o600)?;
        write_back(config, &target.env_file, &doc, &old_bytes)?;
        DecryptReport {
            decrypted,
            inplace: true,
            rendered: None,
            backup: Some(backup),
        }
    } else {
        let rendered = String::from_utf8(doc.bytes())
            .map_err(|_| Error::Internal(anyhow::anyhow!("decrypted document is not UTF-8")))?;
        DecryptReport {
            decrypted,
            inplace: false,
            rendered: Some(rendered),
            backup: None,
        }
    };
    audit::emit(
        "vault.decrypt",
        &[
            ("decrypted", report.decrypted as i64),
            ("inplace", i64::from(inplace)),
        ],
        None,
    );
    Ok(report)
}

#[derive(Debug, Serialize)]
pub struct RestoreReport {
    pub env_file: PathBuf,
    pub backup: PathBuf,
}

/// Put the encrypted form back from the restore backup and consume it.
pub fn restore(config: &Config, target: &VaultTarget) -> Result<RestoreReport> {
    let backup = restore_path(&target.env_file);
    let bytes = match std::fs::read(&backup) {
        Ok(bytes) => bytes,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            return Err(Error::NotFound {
                what: format!("restore backup {}", backup.display()),
                remote: false,
            });
        }
        Err(e) => return Err(e.into()),
    };
    let old_bytes = std::fs::read(&target.env_file).unwrap_or_default();
    let doc = dotenv::parse(&String::from_utf8(bytes).map_err(|_| {
        Error::InvalidArgument(format!("{} is not valid UTF-8", backup.display()))
    })?);
    write_back(config, &target.env_file, &doc, &old_bytes)?;
    std::fs::remove_file(&backup)?;
    audit::emit("vault.restore", &[], None);
    Ok(RestoreReport {
        env_file: target.env_file.clone(),
        backup,
    })
}

#[derive(Debug, Serialize)]
pub struct SetReport {
    pub key: String,
    pub encrypted: bool,
    pub created_file: bool,
    pub changed: bool,
}

/// Set one key. The value is encrypted to the custody public key unless
/// `--plain`; the header is enforced either way. A missing env file is
/// created.
pub async fn set(
    config: &Config,
    target: &VaultTarget,
    key: &str,
    value: &str,
    plain: bool,
) -> Result<SetReport> {
    let material = material(config, target).await?;
    let (mut doc, created_file) = match dotenv::read_file(&target.env_file) {
        Ok(doc) => (doc, false),
        Err(Error::NotFound { .. }) => (DotenvFile::default(), true),
        Err(e) => return Err(e),
    };
    let old_bytes = doc.bytes();

    let rendered = if plain {
        dotenv::render_value(value)
    } else {
        crate::vault::cipher::encrypt(value, &material.public_key)?
    };
    let mut changed = doc.set(key, &rendered)?;
    changed |= ensure_public_key_header(&mut doc, &material.public_key);
    if changed || created_file {
        write_back(config, &target.env_file, &doc, &old_bytes)?;
    }
    audit::emit("vault.set", &[("encrypted", i64::from(!plain))], None);
    Ok(SetReport {
        key: key.trim().to_string(),
        encrypted: !plain,
        created_file,
        changed,
    })
}

#[derive(Debug, Serialize)]
pub struct UnsetReport {
    pub key: String,
    pub removed: bool,
}

/// Remove every assignment of `key` from the vault file.
pub fn unset(config: &Config, target: &VaultTarget, key: &str) -> Result<UnsetReport> {
    let mut doc = dotenv::read_file(&target.env_file)?;
    let old_bytes = doc.bytes();
    let removed = doc.unset(key)?;
    if removed {
        write_back(config, &target.env_file, &doc, &old_bytes)?;
    }
    audit::emit("vault.unset", &[("removed", i64::from(removed))], None);
    Ok(UnsetReport {
        key: key.trim().to_string(),
        removed,
    })
}

#[derive(Debug, Serialize)]
pub struct GetReport {
    pub key: String,
    pub encrypted: bool,
    pub value: String,
}

/// Read one key. `--reveal` decrypts (trust required); otherwise the
/// stored form is returned untouched.
pub async fn get(
    config: &Config,
    target: &VaultTarget,
    key: &str,
    reveal: bool,
) -> Result<GetReport> {
    let doc = dotenv::read_file(&target.env_file)?;
    let raw = doc.lookup(key).ok_or_else(|| Error::NotFound {
        what: format!("key {key} in {}", target.env_file.display()),
        remote: false,
    })?;
    let value = dotenv::unquote_value(&raw);
    let encrypted = crate::vault::cipher::is_encrypted_value(&value);
    if !reveal || !encrypted {
        return Ok(GetReport {
            key: key.trim().to_string(),
            encrypted,
            value,
        });
    }
    let store = TrustStore::open(&config.state_root()?)?;
    store.require(&target.env_file, &doc.bytes(), false)?;
    let material = material(config, target).await?;
    let plain = crate::vault::cipher::decrypt(&value, &material.candidates())?;
    Ok(GetReport {
        key: key.trim().to_string(),
        encrypted,
        value: plain,
    })
}

#[derive(Debug, Serialize)]
pub struct ListedKey {
    pub key: String,
    pub encrypted: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub value: Option<String>,
}

/// List keys in file order (last assignment wins). `--reveal` decrypts
/// encrypted values and requires trust.
pub async fn list(
    config: &Config,
    target: &VaultTarget,
    reveal: bool,
) -> Result<Vec<ListedKey>> {
    let doc = dotenv::read_file(&target.env_file)?;
    let candidates = if reveal {
        let store = TrustStore::open(&config.state_root()?)?;
        store.require(&target.env_file, &doc.bytes(), false)?;
        Some(material(config, target).await?.candidates())
    } else {
        None
    };

    let mut out: Vec<ListedKey> = Vec::new();
    for entry in doc.entries()? {
        if entry.key == crate::vault::filter::PUBLIC_KEY_HEADER {
            continue;
        }
        let value = dotenv::unquote_value(&entry.value_raw);
        let encrypted = crate::vault::cipher::is_encrypted_value(&value);
        let shown = match (&candidates, encrypted) {
            (Some(candidates), true) => {
                Some(crate::vault::cipher::decrypt(&value, candidates)?)
            }
            (Some(_), false) => Some(value),
            (None, _) => None,
        };
        out.retain(|k| k.key != entry.key);
        out.push(ListedKey {
            key: entry.key,
            encrypted,
            value: shown,
        });
    }
    Ok(out)
}

#[derive(Debug, Serialize)]
pub struct TrustReport {
    pub env_file: PathBuf,
    pub trust: String,
}

/// Trust the current bytes of the vault file.
pub fn trust(config: &Config, target: &VaultTarget) -> Result<TrustReport> {
    let doc = dotenv::read_file(&target.env_file)?;
    let bytes = doc.bytes();
    let mut store = TrustStore::open(&config.state_root()?)?;
    store.record(&target.env_file, &bytes);
    store.save()?;
    audit::emit("vault.trust", &[], None);
    Ok(TrustReport {
        env_file: target.env_file.clone(),
        trust: TrustStatus::Trusted.as_str().to_string(),
    })
}
