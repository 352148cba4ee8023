//! Control-plane snapshot sync.
//!
//! Local collections are JSON arrays of opaque entities under
//! `<state root>/paas/`. `push` bundles them into one snapshot object in
//! custody under the optimistic lock; `pull` either replaces local state
//! or merges entity-by-entity, keeping whichever side is newer. Entities
//! are opaque beyond the `id`/`updated_at` contract.

use crate::audit;
use crate::custody::{CustodyClient, PutResult};
use crate::error::{Error, Result};
use crate::util;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

pub const SNAPSHOT_KIND: &str = "paas-control-plane-snapshot";
const SNAPSHOT_FORMAT: u32 = 1;

/// Collections the control plane synchronizes, in canonical order.
pub const COLLECTIONS: [&str; 8] = [
    "targets",
    "deploy_apps",
    "webhook_routes",
    "addon_apps",
    "bluegreen_apps",
    "agents",
    "approvals",
    "incidents",
];

#[derive(Debug, Serialize, Deserialize)]
pub struct SnapshotBundle {
    pub kind: String,
    pub format: u32,
    pub created_at: String,
    pub collections: BTreeMap<String, Vec<Value>>,
}

#[derive(Debug, Default, Serialize)]
pub struct PullReport {
    pub name: String,
    pub replaced: bool,
    pub collections: BTreeMap<String, usize>,
}

fn paas_dir(state_root: &Path) -> PathBuf {
    state_root.join("paas")
}

fn collection_path(state_root: &Path, collection: &str) -> PathBuf {
    paas_dir(state_root).join(format!("{collection}.json"))
}

/// Every entity must be an object carrying a non-empty string `id` and a
/// parseable RFC 3339 `updated_at`.
fn validate_entity(collection: &str, entity: &Value) -> Result<()> {
    let obj = entity.as_object().ok_or_else(|| {
        Error::InvalidArgument(format!("{collection}: entity is not an object"))
    })?;
    let id = obj.get("id").and_then(Value::as_str).unwrap_or_default();
    if id.trim().is_empty() {
        return Err(Error::InvalidArgument(format!(
            "{collection}: entity missing string id"
        )));
    }
    let updated_at = obj
        .get("updated_at")
        .and_then(Value::as_str)
        .unwrap_or_default();
    if chrono::DateTime::parse_from_rfc3339(updated_at).is_err() {
        return Err(Error::InvalidArgument(format!(
            "{collection}: entity {id:?} has invalid updated_at {updated_at:?}"
        )));
    }
    Ok(())
}

fn validate_collection(collection: &str, entities: &[Value]) -> Result<()> {
    for entity in entities {
        validate_entity(collection, entity)?;
    }
    Ok(())
}

/// Load one local collection; a missing file is an empty collection.
pub fn load_collection(state_root: &Path, collection: &str) -> Result<Vec<Value>> {
    let path = collection_path(state_root, collection);
    match std::fs::read(&path) {
        Ok(data) => {
            let entities: Vec<Value> = serde_json::from_slice(&data).map_err(|e| {
                Error::InvalidArgument(format!("corrupt collection {}: {e}", path.display()))
            })?;
            validate_collection(collection, &entities)?;
            Ok(entities)
        }
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(Vec::new()),
        Err(e) => Err(e.into()),
    }
}

fn write_collection(state_root: &Path, collection: &str, entities: &[Value]) -> Result<()> {
    let path = collection_path(state_root, collection);
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let mut bytes = serde_json::to_vec_pretty(entities)?;
    bytes.push(b'\n');
    util::write_file_atomic(&path, &bytes, 0o600)
}

/// Bundle every local collection into one validated snapshot document.
pub fn bundle(state_root: &Path) -> Result<SnapshotBundle> {
    let mut collections = BTreeMap::new();
    for collection in COLLECTIONS {
        collections.insert(collection.to_string(), load_collection(state_root, collection)?);
    }
    Ok(SnapshotBundle {
        kind: SNAPSHOT_KIND.to_string(),
        format: SNAPSHOT_FORMAT,
        created_at: util::now_rfc3339(),
        collections,
    })
}

async fn snapshot_name(custody: &CustodyClient, name: Option<&str>) -> Result<String> {
    if let Some(name) = name.map(str::trim).filter(|n| !n.is_empty()) {
        return Ok(name.to_string());
    }
    let who = custody.whoami().await?;
    let slug = who.account_slug.trim().to_string();
    if slug.is_empty() {
        Ok("default".to_string())
    } else {
        Ok(slug)
    }
}

/// Serialize local state and PUT it as one snapshot object.
pub async fn push(
    custody: &CustodyClient,
    state_root: &Path,
    name: Option<&str>,
    expected_revision: Option<i64>,
) -> Result<(String, PutResult)> {
    let name = snapshot_name(custody, name).await?;
    let snapshot = bundle(state_root)?;
    let entities: usize = snapshot.collections.values().map(Vec::len).sum();
    let payload = serde_json::to_vec_pretty(&snapshot)?;
    let result = custody
        .put_object(
            SNAPSHOT_KIND,
            &name,
            &payload,
            "application/json",
            expected_revision,
        )
        .await?;
    audit::emit(
        "sync.push",
        &[
            ("entities", entities as i64),
            ("revision", result.revision),
        ],
        Some(&name),
    );
    Ok((name, result))
}

/// Merge one collection: keyed on `id`, the newer `updated_at` wins.
/// Local order is preserved; unseen remote entities append in remote
/// order. Both sides must already be validated.
fn merge_collection(local: &[Value], remote: &[Value]) -> Vec<Value> {
    let newer = |a: &Value, b: &Value| -> bool {
        let ts = |v: &Value| {
            v.get("updated_at")
                .and_then(Value::as_str)
                .and_then(|s| chrono::DateTime::parse_from_rfc3339(s).ok())
        };
        match (ts(a), ts(b)) {
            (Some(a), Some(b)) => a > b,
            _ => false,
        }
    };
    let id_of = |v: &Value| -> String {
        v.get("id")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string()
    };

    let mut remote_by_id: BTreeMap<String, &Value> = BTreeMap::new();
    for entity in remote {
        remote_by_id.insert(id_of(entity), entity);
    }

    let mut out = Vec::with_capacity(local.len());
    let mut taken: Vec<String> = Vec::new();
    for entity in local {
        let id = id_of(entity);
        match remote_by_id.get(&id) {
            Some(remote_entity) if newer(remote_entity, entity) => {
                out.push((*remote_entity).clone());
            }
            _ => out.push(entity.clone()),
        }
        taken.push(id);
    }
    for entity in remote {
        if !taken.contains(&id_of(entity)) {
            out.push(entity.clone());
        }
    }
    out
}

/// Fetch a snapshot and apply it to local state. `replace` rewrites each
/// collection wholesale; otherwise remote entities merge in on recency.
/// All new contents are computed and validated before the first write,
/// so a failure leaves local state untouched.
pub async fn pull(
    custody: &CustodyClient,
    state_root: &Path,
    name: Option<&str>,
    replace: bool,
) -> Result<PullReport> {
    let name = snapshot_name(custody, name).await?;
    let payload = custody.get_payload(SNAPSHOT_KIND, &name).await?;
    let snapshot: SnapshotBundle = serde_json::from_slice(&payload).map_err(|e| {
        Error::InvalidArgument(format!("snapshot {name} is not a valid bundle: {e}"))
    })?;
    if snapshot.kind != SNAPSHOT_KIND {
        return Err(Error::InvalidArgument(format!(
            "snapshot {name} has kind {:?}, expected {SNAPSHOT_KIND:?}",
            snapshot.kind
        )));
    }
    if snapshot.format != SNAPSHOT_FORMAT {
        return Err(Error::InvalidArgument(format!(
            "snapshot {name} has unsupported format {}",
            snapshot.format
        )));
    }

    let empty = Vec::new();
    let mut staged: Vec<(&str, Vec<Value>)> = Vec::new();
    for collection in COLLECTIONS {
        let remote = snapshot.collections.get(collection).unwrap_or(&empty);
        validate_collection(collection, remote)?;
        let next = if replace {
            remote.clone()
        } else {
            let local = load_collection(state_root, collection)?;
            merge_collection(&local, remote)
        };
        staged.push((collection, next));
    }

    let _lock = util::FileLock::acquire(&paas_dir(state_root).join(".lock"))?;
    let mut report = PullReport {
        name: name.clone(),
        replaced: replace,
        collections: BTreeMap::new(),
    };
    for (collection, entities) in staged {
        write_collection(state_root, collection, &entities)?;
        report.collections.insert(collection.to_string(), entities.len());
    }
    let entities: usize = report.collections.values().sum();
    audit::emit(
        "sync.pull",
        &[
            ("entities", entities as i64),
            ("replaced", i64::from(replace)),
        ],
        Some(&name),
    );
    Ok(report)
}

/// Entity counts per local collection.
pub fn status(state_root: &Path) -> Result<BTreeMap<String, usize>> {
    let mut out = BTreeMap::new();
    for collection in COLLECTIONS {
        out.insert(
            collection.to_string(),
            load_collection(state_root, collection)?.len(),
        );
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tempfile::TempDir;

    fn entity(id: &str, updated_at: &str, extra: &str) -> Value {
        json!({ "id": id, "updated_at": updated_at, "note": extra })
    }

    fn seed(state_root: &Path, collection: &str, entities: &[Value]) {
        write_collection(state_root, collection, entities).unwrap();
    }

    #[test]
    fn load_missing_collection_is_empty() {
        let tmp = TempDir::new().unwrap();
        assert!(load_collection(tmp.path(), "targets").unwrap().is_empty());
    }

    #[test]
    fn load_rejects_invalid_entities() {
        let tmp = TempDir::new().unwrap();
        seed(tmp.path(), "targets", &[json!({"id": "a"})]);
        let err = load_collection(tmp.path(), "targets").unwrap_err();
        assert!(err.to_string().contains("updated_at"), "{err}");

        seed(tmp.path(), "agents", &[json!({"updated_at": "2026-01-01T00:00:00Z"})]);
        assert!(load_collection(tmp.path(), "agents").is_err());
    }

    #[test]
    fn bundle_covers_every_collection() {
        let tmp = TempDir::new().unwrap();
        seed(
            tmp.path(),
            "targets",
            &[entity("t1", "2026-01-01T00:00:00Z", "x")],
        );
        let snapshot = bundle(tmp.path()).unwrap();
        assert_eq!(snapshot.kind, SNAPSHOT_KIND);
        assert_eq!(snapshot.collections.len(), COLLECTIONS.len());
        assert_eq!(snapshot.collections["targets"].len(), 1);
        assert!(snapshot.collections["incidents"].is_empty());
    }

    #[test]
    fn merge_keeps_newest_and_appends_new() {
        let local = vec![
            entity("a", "2026-01-02T00:00:00Z", "local-newer"),
            entity("b", "2026-01-01T00:00:00Z", "local-older"),
        ];
        let remote = vec![
            entity("a", "2026-01-01T00:00:00Z", "remote-older"),
            entity("b", "2026-01-03T00:00:00Z", "remote-newer"),
            entity("c", "2026-01-01T00:00:00Z", "remote-new"),
        ];
        let merged = merge_collection(&local, &remote);
        assert_eq!(merged.len(), 3);
        assert_eq!(merged[0]["note"], "local-newer");
        assert_eq!(merged[1]["note"], "remote-newer");
        assert_eq!(merged[2]["id"], "c");
    }

    #[test]
    fn merge_equal_timestamps_keep_local() {
        let local = vec![entity("a", "2026-01-01T00:00:00Z", "local")];
        let remote = vec![entity("a", "2026-01-01T00:00:00Z", "remote")];
        let merged = merge_collection(&local, &remote);
        assert_eq!(merged[0]["note"], "local");
    }

    #[test]
    fn status_counts_entities() {
        let tmp = TempDir::new().unwrap();
        seed(
            tmp.path(),
            "agents",
            &[
                entity("a1", "2026-01-01T00:00:00Z", ""),
                entity("a2", "2026-01-01T00:00:00Z", ""),
            ],
        );
        let counts = status(tmp.path()).unwrap();
        assert_eq!(counts["agents"], 2);
        assert_eq!(counts["targets"], 0);
    }
}
