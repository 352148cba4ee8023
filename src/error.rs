//! Error taxonomy shared by every component.
//!
//! Components return these typed errors unchanged; only `main.rs` maps a
//! kind to a process exit code and renders the user-facing message. Exit
//! codes: 1 user/config error or plaintext findings, 2 custody/network,
//! 3 cryptographic verification failure, 4 conflict (revision or trust).

use std::path::PathBuf;
use std::time::Duration;

/// One offending file from a plaintext scan: the file and the keys whose
/// values are stored unencrypted, in file order.
#[derive(Debug, Clone, serde::Serialize)]
pub struct Finding {
    pub file: PathBuf,
    pub keys: Vec<String>,
}

#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Bad flag value, malformed key name, slug violation, misconfiguration.
    #[error("{0}")]
    InvalidArgument(String),

    /// Something referenced does not exist. `remote` distinguishes a custody
    /// 404 (exit 2) from a missing local file or key (exit 1).
    #[error("{what} not found")]
    NotFound { what: String, remote: bool },

    /// Custody rejected the credential (401/403).
    #[error("custody: {0}")]
    Unauthorized(String),

    /// Transport-level failure talking to custody, or a server error that
    /// survived the retry budget.
    #[error("custody: {0}")]
    Network(String),

    /// Custody kept answering 429 until the retry budget ran out.
    #[error("custody rate limited ({attempts} attempts)")]
    RateLimited {
        attempts: u32,
        retry_after: Option<Duration>,
    },

    /// Optimistic-lock revision mismatch on a custody write.
    #[error("revision conflict: expected {expected}, server has {current}")]
    VersionConflict { expected: i64, current: i64 },

    /// Well-formed ciphertext that no candidate key could open.
    #[error("decrypt failed: {0}")]
    DecryptFailure(String),

    /// Ciphertext that is structurally broken or from an unknown version.
    #[error("ciphertext integrity: {0}")]
    IntegrityFailure(String),

    /// The plaintext guard found unencrypted values.
    #[error("plaintext secrets detected in {} file(s)", findings.len())]
    PlaintextGuard { findings: Vec<Finding> },

    /// Decryption attempted against a vault file outside the trust store.
    #[error("vault file not trusted: {}", file.display())]
    TrustRequired { file: PathBuf },

    /// Refused to send credentials or secrets over an insecure channel.
    #[error("insecure transport refused: {0}")]
    InsecureTransport(String),

    /// Everything unexpected: I/O, serialization, invariant breakage.
    #[error(transparent)]
    Internal(#[from] anyhow::Error),
}

pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    /// Process exit code for this error kind.
    pub fn exit_code(&self) -> i32 {
        match self {
            Error::InvalidArgument(_)
            | Error::PlaintextGuard { .. }
            | Error::InsecureTransport(_)
            | Error::Internal(_) => 1,
            Error::NotFound { remote, .. } => {
                if *remote {
                    2
                } else {
                    1
                }
            }
            Error::Unauthorized(_) | Error::Network(_) | Error::RateLimited { .. } => 2,
            Error::DecryptFailure(_) | Error::IntegrityFailure(_) => 3,
            Error::VersionConflict { .. } | Error::TrustRequired { .. } => 4,
        }
    }

    /// Stable machine-readable kind for `--json` output.
    pub fn kind(&self) -> &'static str {
        match self {
            Error::InvalidArgument(_) => "invalid_argument",
            Error::NotFound { .. } => "not_found",
            Error::Unauthorized(_) => "unauthorized",
            Error::Network(_) => "network",
            Error::RateLimited { .. } => "rate_limited",
            Error::VersionConflict { .. } => "version_conflict",
            Error::DecryptFailure(_) => "decrypt_failure",
            Error::IntegrityFailure(_) => "integrity_failure",
            Error::PlaintextGuard { .. } => "plaintext_guard",
            Error::TrustRequired { .. } => "trust_required",
            Error::InsecureTransport(_) => "insecure_transport",
            Error::Internal(_) => "internal",
        }
    }

    /// Actionable follow-up rendered beneath the one-line summary.
    pub fn hint(&self) -> Option<String> {
        match self {
            Error::TrustRequired { file } => Some(format!(
                "run `si vault trust --file {}` after reviewing the file",
                file.display()
            )),
            Error::PlaintextGuard { .. } => {
                Some("run `si vault encrypt` to encrypt the listed keys".to_string())
            }
            Error::VersionConflict { .. } => {
                Some("re-read the latest revision and retry the write".to_string())
            }
            Error::RateLimited { retry_after, .. } => {
                retry_after.map(|d| format!("server asked to retry after {}s", d.as_secs()))
            }
            _ => None,
        }
    }
}

impl From<std::io::Error> for Error {
    fn from(err: std::io::Error) -> Self {
        Error::Internal(anyhow::Error::from(err))
    }
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Error::Internal(anyhow::Error::from(err))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn exit_codes_match_contract() {
        assert_eq!(Error::InvalidArgument("x".into()).exit_code(), 1);
        assert_eq!(Error::PlaintextGuard { findings: vec![] }.exit_code(), 1);
        assert_eq!(
            Error::NotFound {
                what: ".env".into(),
                remote: false
            }
            .exit_code(),
            1
        );
        assert_eq!(
            Error::NotFound {
                what: "vault key".into(),
                remote: true
            }
            .exit_code(),
            2
        );
        assert_eq!(Error::Unauthorized("bad token".into()).exit_code(), 2);
        assert_eq!(Error::Network("timeout".into()).exit_code(), 2);
        assert_eq!(
            Error::RateLimited {
                attempts: 4,
                retry_after: None
            }
            .exit_code(),
            2
        );
        assert_eq!(Error::DecryptFailure("no key".into()).exit_code(), 3);
        assert_eq!(Error::IntegrityFailure("bad b64".into()).exit_code(), 3);
        assert_eq!(
            Error::VersionConflict {
                expected: 1,
                current: 2
            }
            .exit_code(),
            4
        );
        assert_eq!(
            Error::TrustRequired {
                file: PathBuf::from("/tmp/.env")
            }
            .exit_code(),
            4
        );
        assert_eq!(Error::InsecureTransport("http".into()).exit_code(), 1);
        assert_eq!(Error::Internal(anyhow::anyhow!("boom")).exit_code(), 1);
    }

    #[test]
    fn version_conflict_carries_both_revisions() {
        let err = Error::VersionConflict {
            expected: 1,
            current: 2,
        };
        let msg = err.to_string();
        assert!(msg.contains('1') && msg.contains('2'), "{msg}");
    }

    #[test]
    fn trust_hint_names_the_file() {
        let err = Error::TrustRequired {
            file: PathBuf::from("/work/.env.prod"),
        };
        let hint = err.hint().unwrap();
        assert!(hint.contains("si vault trust"));
        assert!(hint.contains(".env.prod"));
    }

    #[test]
    fn kinds_are_stable() {
        assert_eq!(Error::Network("x".into()).kind(), "network");
        assert_eq!(Error::DecryptFailure("x".into()).kind(), "decrypt_failure");
    }
}
