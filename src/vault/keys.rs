//! Key material for a `(repo, env)` pair: normalization, decryption
//! candidate ordering, and the custody fetch-or-create bootstrap.

use crate::custody::CustodyClient;
use crate::error::{Error, Result};
use crate::vault::{cipher, target};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::{Mutex, OnceLock};
use zeroize::Zeroize;

/// Custody-held keypair for one repo/env. `public_key` is a 66-char
/// compressed-point hex string; private fields are 64-char hex scalars.
#[derive(Clone, Serialize, Deserialize, Default)]
pub struct KeyMaterial {
    #[serde(default)]
    pub repo: String,
    #[serde(default)]
    pub env: String,
    #[serde(default)]
    pub public_key: String,
    #[serde(default)]
    pub private_key: String,
    #[serde(default)]
    pub backup_private_keys: Vec<String>,
    #[serde(default)]
    pub updated_at: String,
}

impl std::fmt::Debug for KeyMaterial {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KeyMaterial")
            .field("repo", &self.repo)
            .field("env", &self.env)
            .field("public_key", &self.public_key)
            .field("private_key", &"[redacted]")
            .field(
                "backup_private_keys",
                &format_args!("[{} redacted]", self.backup_private_keys.len()),
            )
            .field("updated_at", &self.updated_at)
            .finish()
    }
}

impl Drop for KeyMaterial {
    fn drop(&mut self) {
        self.private_key.zeroize();
        for key in &mut self.backup_private_keys {
            key.zeroize();
        }
    }
}

/// Normalize custody material: lowercase hex, derive the public key from
/// the private scalar when absent, dedupe backups, and enforce slug
/// rules with the target as fallback.
pub fn normalize(material: &KeyMaterial, tgt: &target::VaultTarget) -> Result<KeyMaterial> {
    let private_key = material.private_key.trim().to_lowercase();
    if private_key.is_empty() {
        return Err(Error::InvalidArgument(
            "key material has no private key".into(),
        ));
    }
    let public_key = {
        let given = material.public_key.trim().to_lowercase();
        if given.is_empty() {
            cipher::public_key_for(&private_key)?
        } else {
            given
        }
    };

    let mut backups = Vec::new();
    for raw in &material.backup_private_keys {
        let key = raw.trim().to_lowercase();
        if key.is_empty() || key == private_key || backups.contains(&key) {
            continue;
        }
        backups.push(key);
    }

    let repo = pick_slug(&material.repo, &tgt.repo, "repo")?;
    let env = pick_slug(&material.env, &tgt.env, "env")?;

    Ok(KeyMaterial {
        repo,
        env,
        public_key,
        private_key,
        backup_private_keys: backups,
        updated_at: material.updated_at.trim().to_string(),
    })
}

fn pick_slug(value: &str, fallback: &str, what: &str) -> Result<String> {
    let trimmed = value.trim();
    let chosen = if trimmed.is_empty() { fallback } else { trimmed };
    if target::is_slug(chosen) {
        Ok(chosen.to_string())
    } else {
        Err(Error::InvalidArgument(format!(
            "key material has invalid {what} slug {chosen:?}"
        )))
    }
}

/// `SI_VAULT_PRIVATE_KEY` comma-split candidates, read exactly once per
/// process. Never written back anywhere.
fn env_override_candidates() -> &'static [String] {
    static KEYS: OnceLock<Vec<String>> = OnceLock::new();
    KEYS.get_or_init(|| {
        std::env::var("SI_VAULT_PRIVATE_KEY")
            .ok()
            .map(|raw| parse_override(&raw))
            .unwrap_or_default()
    })
}

fn parse_override(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(|k| k.trim().to_lowercase())
        .filter(|k| !k.is_empty())
        .collect()
}

impl KeyMaterial {
    /// Ordered private-key candidates for decryption: process-env
    /// override first, then the primary key, then backups in order.
    pub fn candidates(&self) -> Vec<String> {
        self.candidates_with_override(env_override_candidates())
    }

    pub fn candidates_with_override(&self, override_keys: &[String]) -> Vec<String> {
        let mut out: Vec<String> = override_keys.to_vec();
        if !self.private_key.is_empty() {
            out.push(self.private_key.clone());
        }
        out.extend(self.backup_private_keys.iter().cloned());
        out
    }
}

fn cache() -> &'static Mutex<HashMap<(String, String), KeyMaterial>> {
    static CACHE: OnceLock<Mutex<HashMap<(String, String), KeyMaterial>>> = OnceLock::new();
    CACHE.get_or_init(|| Mutex::new(HashMap::new()))
}

/// Fetch the key material for the target, generating and uploading a
/// fresh keypair when custody has none yet. Results are cached for the
/// rest of the process. When `hint` (the `SI_VAULT_PUBLIC_KEY` env
/// value) is set it must match the custody public key.
pub async fn ensure(
    custody: &CustodyClient,
    tgt: &target::VaultTarget,
    hint: Option<&str>,
) -> Result<KeyMaterial> {
    let cache_key = (tgt.repo.clone(), tgt.env.clone());
    let cached = {
        let guard = cache()
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        guard.get(&cache_key).cloned()
    };
    let material = match cached {
        Some(material) => material,
        None => {
            let fetched = fetch_or_create(custody, tgt).await?;
            let normalized = normalize(&fetched, tgt)?;
            let mut guard = cache()
                .lock()
                .unwrap_or_else(std::sync::PoisonError::into_inner);
            guard.insert(cache_key, normalized.clone());
            normalized
        }
    };

    if let Some(hint) = hint {
        check_hint(&material, hint)?;
    }
    Ok(material)
}

fn check_hint(material: &KeyMaterial, hint: &str) -> Result<()> {
    let hint = hint.trim().to_lowercase();
    if hint.is_empty() || hint == material.public_key {
        return Ok(());
    }
    // The hint is user input and need not be ASCII; truncate by chars.
    let shown: String = hint.chars().take(8).collect();
    Err(Error::InvalidArgument(format!(
        "SI_VAULT_PUBLIC_KEY does not match custody material for {}/{} \
         (hint {shown}..., custody {}...)",
        material.repo,
        material.env,
        &material.public_key[..material.public_key.len().min(8)]
    )))
}

/// Generate and upload a fresh keypair for the target, keeping every
/// previous private key among the sorted backups. The process cache is
/// replaced so later decrypts see the full candidate set.
pub async fn rotate(
    custody: &CustodyClient,
    tgt: &target::VaultTarget,
    current: &KeyMaterial,
) -> Result<KeyMaterial> {
    let (public_key, private_key) = cipher::generate_keypair();
    let mut backups = current.backup_private_keys.clone();
    let previous = current.private_key.trim().to_lowercase();
    if !previous.is_empty() {
        backups.push(previous);
    }
    backups.sort();
    backups.dedup();
    let fresh = KeyMaterial {
        repo: tgt.repo.clone(),
        env: tgt.env.clone(),
        public_key,
        private_key,
        backup_private_keys: backups,
        updated_at: String::new(),
    };
    let stored = custody.put_vault_key(&fresh, None).await?;
    let normalized = normalize(&stored, tgt)?;
    let mut guard = cache()
        .lock()
        .unwrap_or_else(std::sync::PoisonError::into_inner);
    guard.insert((tgt.repo.clone(), tgt.env.clone()), normalized.clone());
    Ok(normalized)
}

async fn fetch_or_create(
    custody: &CustodyClient,
    tgt: &target::VaultTarget,
) -> Result<KeyMaterial> {
    match custody.get_vault_key(&tgt.repo, &tgt.env).await {
        Ok(material) => Ok(material),
        Err(Error::NotFound { remote: true, .. }) => {
            let (public_key, private_key) = cipher::generate_keypair();
            let fresh = KeyMaterial {
                repo: tgt.repo.clone(),
                env: tgt.env.clone(),
                public_key,
                private_key,
                backup_private_keys: Vec::new(),
                updated_at: String::new(),
            };
            custody.put_vault_key(&fresh, None).await
        }
        Err(other) => Err(other),
    }
}
