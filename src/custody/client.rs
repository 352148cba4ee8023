//! Typed HTTP client for the custody service.
//!
//! One thin `request` path carries bearer auth, the per-call deadline,
//! the retry policy, and error normalization; the public methods are
//! shape adapters over it. Base URL and token are validated up front so
//! a misconfigured client fails before any secret leaves the process.

use crate::audit::redact;
use crate::custody::retry::{Outcome, RetryPolicy};
use crate::error::{Error, Result};
use crate::vault::keys::KeyMaterial;
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use reqwest::{Method, StatusCode, Url};
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::net::{IpAddr, ToSocketAddrs};
use std::time::Duration;

const MAX_BEARER_TOKEN_CHARS: usize = 4096;

#[derive(Debug, Clone, Deserialize, Serialize, Default)]
pub struct WhoAmI {
    #[serde(default)]
    pub account_id: String,
    #[serde(default)]
    pub account_slug: String,
    #[serde(default)]
    pub token_id: String,
    #[serde(default)]
    pub scopes: Vec<String>,
}

#[derive(Debug, Clone, Deserialize, Serialize, Default)]
pub struct ObjectMeta {
    #[serde(default)]
    pub kind: String,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub latest_revision: i64,
    #[serde(default)]
    pub checksum: String,
    #[serde(default)]
    pub content_type: String,
    #[serde(default)]
    pub size_bytes: i64,
    #[serde(default)]
    pub created_at: String,
    #[serde(default)]
    pub updated_at: String,
}

#[derive(Debug, Clone, Deserialize, Default)]
pub struct PutResult {
    #[serde(default)]
    pub object: ObjectMeta,
    #[serde(default)]
    pub revision: i64,
}

#[derive(Debug, Clone, Deserialize, Default)]
pub struct ObjectRevision {
    #[serde(default)]
    pub revision: i64,
    #[serde(default)]
    pub checksum: String,
    #[serde(default)]
    pub size_bytes: i64,
    #[serde(default)]
    pub created_at: String,
}

#[derive(Debug, Clone, Deserialize, Default)]
pub struct AuditEvent {
    #[serde(default)]
    pub action: String,
    #[serde(default)]
    pub kind: String,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub created_at: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct TokenRecord {
    #[serde(default)]
    pub id: String,
    #[serde(default)]
    pub label: String,
    #[serde(default)]
    pub scopes: Vec<String>,
    #[serde(default)]
    pub created_at: String,
    #[serde(default)]
    pub expires_at: Option<String>,
    #[serde(default)]
    pub revoked: bool,
}

#[derive(Debug, Clone, Deserialize, Default)]
pub struct IssuedToken {
    #[serde(default)]
    pub id: String,
    #[serde(default)]
    pub token: String,
    #[serde(default)]
    pub label: String,
    #[serde(default)]
    pub scopes: Vec<String>,
    #[serde(default)]
    pub expires_at: Option<String>,
}

#[derive(Debug, Deserialize, Default)]
struct ApiErrorBody {
    #[serde(default)]
    error: String,
    #[serde(default)]
    current_revision: Option<i64>,
}

pub struct CustodyClient {
    base_url: String,
    token: String,
    http: reqwest::Client,
    retry: RetryPolicy,
}

impl std::fmt::Debug for CustodyClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CustodyClient")
            .field("base_url", &self.base_url)
            .field("token", &"[redacted]")
            .finish_non_exhaustive()
    }
}

fn validate_bearer_token(token: &str) -> Result<()> {
    if token.is_empty() {
        return Err(Error::InvalidArgument(
            "custody token is required (set SI_CUSTODY_TOKEN)".into(),
        ));
    }
    if token.len() > MAX_BEARER_TOKEN_CHARS {
        return Err(Error::InvalidArgument("custody token is too long".into()));
    }
    if token.chars().any(|c| c <= '\u{20}' || c == '\u{7f}') {
        return Err(Error::InvalidArgument(
            "custody token must not contain whitespace or control characters".into(),
        ));
    }
    Ok(())
}

fn host_is_loopback(host: &str, port: u16) -> bool {
    let host = host.trim_matches(['[', ']']);
    if host.eq_ignore_ascii_case("localhost") {
        return true;
    }
    if let Ok(ip) = host.parse::<IpAddr>() {
        return ip.is_loopback();
    }
    match (host, port).to_socket_addrs() {
        Ok(mut addrs) => addrs.all(|a| a.ip().is_loopback()),
        Err(_) => false,
    }
}

fn validate_base_url(base_url: &str, allow_insecure_http: bool) -> Result<String> {
    let trimmed = base_url.trim().trim_end_matches('/');
    if trimmed.is_empty() {
        return Err(Error::InvalidArgument(
            "custody base URL is required (set SI_CUSTODY_BASE_URL)".into(),
        ));
    }
    let url = Url::parse(trimmed)
        .map_err(|_| Error::InvalidArgument(format!("invalid custody base URL {trimmed:?}")))?;
    match url.scheme() {
        "https" => {}
        "http" => {
            let host = url.host_str().unwrap_or_default();
            let port = url.port_or_known_default().unwrap_or(80);
            if !allow_insecure_http {
                return Err(Error::InsecureTransport(format!(
                    "custody base URL {trimmed} uses http:// \
                     (set SI_SUN_ALLOW_INSECURE_HTTP=1 for loopback-only development)"
                )));
            }
            if !host_is_loopback(host, port) {
                return Err(Error::InsecureTransport(format!(
                    "insecure http custody base URL is only allowed for loopback hosts, \
                     got {host}"
                )));
            }
        }
        other => {
            return Err(Error::InvalidArgument(format!(
                "unsupported custody URL scheme {other:?}"
            )));
        }
    }
    Ok(trimmed.to_string())
}

impl CustodyClient {
    pub fn new(
        base_url: &str,
        token: &str,
        timeout: Duration,
        allow_insecure_http: bool,
    ) -> Result<Self> {
        let base_url = validate_base_url(base_url, allow_insecure_http)?;
        let token = token.trim().to_string();
        validate_bearer_token(&token)?;
        let http = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| Error::Internal(anyhow::anyhow!("build http client: {e}")))?;
        Ok(Self {
            base_url,
            token,
            http,
            retry: RetryPolicy::default(),
        })
    }

    /// One request with auth, retries, and error normalization. `what`
    /// names the resource for 404 messages; `expected_revision` feeds
    /// 409 conflict details.
    async fn request(
        &self,
        method: Method,
        path: &str,
        body: Option<serde_json::Value>,
        idempotent: bool,
        what: &str,
        expected_revision: Option<i64>,
    ) -> Result<Vec<u8>> {
        let url = format!("{}{path}", self.base_url);
        let mut attempt: u32 = 0;
        loop {
            let mut req = self
                .http
                .request(method.clone(), &url)
                .bearer_auth(&self.token);
            if let Some(body) = &body {
                req = req.json(body);
            }
            let outcome = match req.send().await {
                Err(e) => {
                    let detail = redact(&e.to_string());
                    match self.retry.next_delay(idempotent, attempt, &Outcome::Transport) {
                        Some(delay) => {
                            tracing::debug!(target: "si::custody", %url, attempt, "transport error, retrying: {detail}");
                            tokio::time::sleep(delay).await;
                            attempt += 1;
                            continue;
                        }
                        None => return Err(Error::Network(detail)),
                    }
                }
                Ok(resp) => resp,
            };

            let status = outcome.status();
            if status.is_success() {
                return Ok(outcome
                    .bytes()
                    .await
                    .map_err(|e| Error::Network(redact(&e.to_string())))?
                    .to_vec());
            }

            let retry_after = outcome
                .headers()
                .get(reqwest::header::RETRY_AFTER)
                .and_then(|v| v.to_str().ok())
                .map(str::to_string);
            let probe = Outcome::Status {
                code: status.as_u16(),
                retry_after: retry_after.clone(),
            };
            if let Some(delay) = self.retry.next_delay(idempotent, attempt, &probe) {
                tracing::debug!(target: "si::custody", %url, attempt, status = status.as_u16(), "retrying");
                tokio::time::sleep(delay).await;
                attempt += 1;
                continue;
            }

            let body_bytes = outcome.bytes().await.unwrap_or_default();
            return Err(normalize_error(
                status,
                &body_bytes,
                retry_after.as_deref(),
                what,
                expected_revision,
                attempt + 1,
            ));
        }
    }

    async fn get_json<T: for<'de> Deserialize<'de>>(&self, path: &str, what: &str) -> Result<T> {
        let body = self
            .request(Method::GET, path, None, true, what, None)
            .await?;
        serde_json::from_slice(&body)
            .map_err(|e| Error::Internal(anyhow::anyhow!("parse {what} response: {e}")))
    }

    /// `GET /v1/readyz`
    pub async fn ready(&self) -> Result<()> {
        self.request(Method::GET, "/v1/readyz", None, true, "custody service", None)
            .await?;
        Ok(())
    }

    /// `GET /v1/auth/whoami`
    pub async fn whoami(&self) -> Result<WhoAmI> {
        self.get_json("/v1/auth/whoami", "whoami").await
    }

    /// `GET /v1/vault/private-keys/{repo}/{env}`; a 404 means the pair
    /// has not been provisioned yet.
    pub async fn get_vault_key(&self, repo: &str, env: &str) -> Result<KeyMaterial> {
        self.get_json(
            &format!("/v1/vault/private-keys/{repo}/{env}"),
            &format!("vault key {repo}/{env}"),
        )
        .await
    }

    /// `PUT /v1/vault/private-keys/{repo}/{env}`
    pub async fn put_vault_key(
        &self,
        material: &KeyMaterial,
        expected_revision: Option<i64>,
    ) -> Result<KeyMaterial> {
        let mut body = json!({
            "public_key": material.public_key.trim(),
            "private_key": material.private_key.trim(),
        });
        if !material.backup_private_keys.is_empty() {
            body["backup_private_keys"] = json!(material.backup_private_keys);
        }
        if let Some(rev) = expected_revision {
            body["expected_revision"] = json!(rev);
        }
        let what = format!("vault key {}/{}", material.repo, material.env);
        let path = format!("/v1/vault/private-keys/{}/{}", material.repo, material.env);
        let resp = self
            .request(Method::PUT, &path, Some(body), true, &what, expected_revision)
            .await?;
        serde_json::from_slice(&resp)
            .map_err(|e| Error::Internal(anyhow::anyhow!("parse {what} response: {e}")))
    }

    /// `GET /v1/objects?kind=…&name=…&limit=…`
    pub async fn list_objects(
        &self,
        kind: &str,
        name: &str,
        limit: usize,
    ) -> Result<Vec<ObjectMeta>> {
        #[derive(Deserialize)]
        struct Items {
            #[serde(default)]
            items: Vec<ObjectMeta>,
        }
        let mut path = format!("/v1/objects?limit={limit}");
        if !kind.trim().is_empty() {
            path.push_str(&format!("&kind={}", kind.trim()));
        }
        if !name.trim().is_empty() {
            path.push_str(&format!("&name={}", name.trim()));
        }
        let items: Items = self.get_json(&path, "object list").await?;
        Ok(items.items)
    }

    /// `PUT /v1/objects/{kind}/{name}` with a base64 payload and the
    /// optional optimistic lock.
    pub async fn put_object(
        &self,
        kind: &str,
        name: &str,
        payload: &[u8],
        content_type: &str,
        expected_revision: Option<i64>,
    ) -> Result<PutResult> {
        let mut body = json!({
            "payload_base64": BASE64.encode(payload),
            "content_type": content_type,
        });
        if let Some(rev) = expected_revision {
            body["expected_revision"] = json!(rev);
        }
        let what = format!("object {kind}/{name}");
        let resp = self
            .request(
                Method::PUT,
                &format!("/v1/objects/{kind}/{name}"),
                Some(body),
                true,
                &what,
                expected_revision,
            )
            .await?;
        serde_json::from_slice(&resp)
            .map_err(|e| Error::Internal(anyhow::anyhow!("parse {what} response: {e}")))
    }

    /// `GET /v1/objects/{kind}/{name}/payload` — raw bytes.
    pub async fn get_payload(&self, kind: &str, name: &str) -> Result<Vec<u8>> {
        self.request(
            Method::GET,
            &format!("/v1/objects/{kind}/{name}/payload"),
            None,
            true,
            &format!("object {kind}/{name}"),
            None,
        )
        .await
    }

    /// `GET /v1/objects/{kind}/{name}/revisions?limit=…`
    pub async fn list_revisions(
        &self,
        kind: &str,
        name: &str,
        limit: usize,
    ) -> Result<Vec<ObjectRevision>> {
        #[derive(Deserialize)]
        struct Items {
            #[serde(default)]
            items: Vec<ObjectRevision>,
        }
        let items: Items = self
            .get_json(
                &format!("/v1/objects/{kind}/{name}/revisions?limit={limit}"),
                "revision list",
            )
            .await?;
        Ok(items.items)
    }

    /// `GET /v1/audit?action=…&kind=…&name=…&limit=…`
    pub async fn list_audit(
        &self,
        action: &str,
        kind: &str,
        name: &str,
        limit: usize,
    ) -> Result<Vec<AuditEvent>> {
        #[derive(Deserialize)]
        struct Items {
            #[serde(default)]
            items: Vec<AuditEvent>,
        }
        let mut path = format!("/v1/audit?limit={limit}");
        for (param, value) in [("action", action), ("kind", kind), ("name", name)] {
            if !value.trim().is_empty() {
                path.push_str(&format!("&{param}={}", value.trim()));
            }
        }
        let items: Items = self.get_json(&path, "audit list").await?;
        Ok(items.items)
    }

    /// `POST /v1/tokens` — never retried.
    pub async fn create_token(
        &self,
        label: &str,
        scopes: &[String],
        expires_in_hours: Option<u32>,
    ) -> Result<IssuedToken> {
        let mut body = json!({
            "label": label.trim(),
            "scopes": scopes,
        });
        if let Some(hours) = expires_in_hours {
            body["expires_in_hours"] = json!(hours);
        }
        let resp = self
            .request(Method::POST, "/v1/tokens", Some(body), false, "token", None)
            .await?;
        serde_json::from_slice(&resp)
            .map_err(|e| Error::Internal(anyhow::anyhow!("parse token response: {e}")))
    }

    /// `GET /v1/tokens?include_revoked=…&limit=…`
    pub async fn list_tokens(
        &self,
        include_revoked: bool,
        limit: usize,
    ) -> Result<Vec<TokenRecord>> {
        #[derive(Deserialize)]
        struct Items {
            #[serde(default)]
            items: Vec<TokenRecord>,
        }
        let items: Items = self
            .get_json(
                &format!("/v1/tokens?include_revoked={include_revoked}&limit={limit}"),
                "token list",
            )
            .await?;
        Ok(items.items)
    }

    /// `POST /v1/tokens/{id}/revoke` — never retried.
    pub async fn revoke_token(&self, token_id: &str) -> Result<()> {
        self.request(
            Method::POST,
            &format!("/v1/tokens/{}/revoke", token_id.trim()),
            Some(json!({})),
            false,
            &format!("token {token_id}"),
            None,
        )
        .await?;
        Ok(())
    }

    /// `GET /v1/integrations/registries/{registry}` — opaque index JSON.
    pub async fn get_registry_index(&self, registry: &str) -> Result<serde_json::Value> {
        #[derive(Deserialize)]
        struct Resp {
            index: serde_json::Value,
        }
        let resp: Resp = self
            .get_json(
                &format!("/v1/integrations/registries/{registry}"),
                &format!("registry {registry}"),
            )
            .await?;
        Ok(resp.index)
    }

    /// `PUT /v1/integrations/registries/{registry}`
    pub async fn put_registry_index(
        &self,
        registry: &str,
        payload: serde_json::Value,
        expected_revision: Option<i64>,
    ) -> Result<PutResult> {
        let mut body = json!({ "payload": payload });
        if let Some(rev) = expected_revision {
            body["expected_revision"] = json!(rev);
        }
        let what = format!("registry {registry}");
        let resp = self
            .request(
                Method::PUT,
                &format!("/v1/integrations/registries/{registry}"),
                Some(body),
                true,
                &what,
                expected_revision,
            )
            .await?;
        serde_json::from_slice(&resp)
            .map_err(|e| Error::Internal(anyhow::anyhow!("parse {what} response: {e}")))
    }

    /// `GET /v1/integrations/registries/{registry}/shards/{shard}`
    pub async fn get_registry_shard(
        &self,
        registry: &str,
        shard: &str,
    ) -> Result<serde_json::Value> {
        #[derive(Deserialize)]
        struct Resp {
            payload: serde_json::Value,
        }
        let resp: Resp = self
            .get_json(
                &format!("/v1/integrations/registries/{registry}/shards/{shard}"),
                &format!("registry shard {registry}/{shard}"),
            )
            .await?;
        Ok(resp.payload)
    }

    /// `PUT /v1/integrations/registries/{registry}/shards/{shard}`
    pub async fn put_registry_shard(
        &self,
        registry: &str,
        shard: &str,
        payload: serde_json::Value,
        expected_revision: Option<i64>,
    ) -> Result<PutResult> {
        let mut body = json!({ "payload": payload });
        if let Some(rev) = expected_revision {
            body["expected_revision"] = json!(rev);
        }
        let what = format!("registry shard {registry}/{shard}");
        let resp = self
            .request(
                Method::PUT,
                &format!("/v1/integrations/registries/{registry}/shards/{shard}"),
                Some(body),
                true,
                &what,
                expected_revision,
            )
            .await?;
        serde_json::from_slice(&resp)
            .map_err(|e| Error::Internal(anyhow::anyhow!("parse {what} response: {e}")))
    }
}

/// Map a terminal HTTP error response to the taxonomy.
fn normalize_error(
    status: StatusCode,
    body: &[u8],
    retry_after: Option<&str>,
    what: &str,
    expected_revision: Option<i64>,
    attempts: u32,
) -> Error {
    let text = String::from_utf8_lossy(body);
    let parsed: ApiErrorBody = serde_json::from_slice(body).unwrap_or_default();
    let message = if parsed.error.trim().is_empty() {
        let trimmed = text.trim();
        if trimmed.is_empty() {
            status
                .canonical_reason()
                .unwrap_or("request failed")
                .to_string()
        } else {
            trimmed.to_string()
        }
    } else {
        parsed.error.trim().to_string()
    };
    let message = redact(&message);

    match status {
        StatusCode::UNAUTHORIZED => Error::Unauthorized(message),
        StatusCode::FORBIDDEN => {
            if text.to_lowercase().contains("error code: 1010") {
                Error::Unauthorized(
                    "access denied by cloudflare (error 1010); \
                     check firewall/bot rules for this client IP and user-agent"
                        .into(),
                )
            } else {
                Error::Unauthorized(message)
            }
        }
        StatusCode::NOT_FOUND => Error::NotFound {
            what: what.to_string(),
            remote: true,
        },
        StatusCode::CONFLICT => Error::VersionConflict {
            expected: expected_revision.unwrap_or_default(),
            current: parsed.current_revision.unwrap_or_default(),
        },
        StatusCode::TOO_MANY_REQUESTS => Error::RateLimited {
            attempts,
            retry_after: retry_after
                .and_then(|v| v.trim().parse::<u64>().ok())
                .map(Duration::from_secs),
        },
        _ => Error::Network(format!("{message} (status {})", status.as_u16())),
    }
}
