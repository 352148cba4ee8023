//! Run injector: decrypt a vault file and hand the values to a child
//! process (or `docker exec`) through its environment, never through
//! argv or temp files. Child exit codes propagate verbatim.

use crate::audit;
use crate::error::{Error, Finding, Result};
use crate::vault::cipher;
use crate::vault::dotenv::{self, DotenvFile};
use crate::vault::filter::PUBLIC_KEY_HEADER;
use crate::vault::keys::KeyMaterial;
use std::collections::BTreeMap;
use std::path::Path;
use std::process::Stdio;
use std::time::Duration;
use tokio::process::Command;

const SIGTERM_GRACE: Duration = Duration::from_secs(5);

#[derive(Debug, Clone, Default)]
pub struct RunOptions {
    pub allow_plaintext: bool,
    pub shell: bool,
    pub shell_interactive: bool,
    pub shell_path: Option<String>,
}

/// Decrypted injection set for one vault file.
#[derive(Debug, Default)]
pub struct Injection {
    /// Sorted key/value map handed to the child.
    pub env: BTreeMap<String, String>,
    /// Keys that were carried through as plaintext, in file order.
    pub plaintext: Vec<String>,
    /// How many values were decrypted.
    pub decrypted: usize,
}

/// Decrypt every vault entry into a sorted injection map. Plaintext
/// (non-empty, unencrypted) values are carried through but their keys
/// are reported so the caller can refuse.
pub fn injection_env(doc: &DotenvFile, material: &KeyMaterial) -> Result<Injection> {
    let candidates = material.candidates();
    let mut inj = Injection::default();
    for entry in doc.entries()? {
        if entry.key == PUBLIC_KEY_HEADER {
            continue;
        }
        let raw = dotenv::unquote_value(&entry.value_raw);
        let value = if cipher::is_encrypted_value(&raw) {
            inj.decrypted += 1;
            cipher::decrypt(&raw, &candidates)?
        } else {
            if !raw.is_empty() && !inj.plaintext.contains(&entry.key) {
                inj.plaintext.push(entry.key.clone());
            }
            raw
        };
        // Last assignment wins, matching lookup semantics.
        inj.env.insert(entry.key, value);
    }
    Ok(inj)
}

/// `injection_env` plus the plaintext policy: refuse unless allowed.
pub fn prepare_env(
    doc: &DotenvFile,
    material: &KeyMaterial,
    env_file: &Path,
    allow_plaintext: bool,
) -> Result<Injection> {
    let inj = injection_env(doc, material)?;
    if !inj.plaintext.is_empty() && !allow_plaintext {
        return Err(Error::PlaintextGuard {
            findings: vec![Finding {
                file: env_file.to_path_buf(),
                keys: inj.plaintext,
            }],
        });
    }
    Ok(inj)
}

/// Shell used for `--shell` runs: explicit flag, then `$SHELL`, then
/// `/bin/bash`.
pub fn resolve_shell(shell_path: Option<&str>) -> String {
    if let Some(path) = shell_path {
        let trimmed = path.trim();
        if !trimmed.is_empty() {
            return trimmed.to_string();
        }
    }
    std::env::var("SHELL")
        .ok()
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
        .unwrap_or_else(|| "/bin/bash".to_string())
}

fn build_command(cmd: &[String], env: &BTreeMap<String, String>, opts: &RunOptions) -> Result<Command> {
    if cmd.is_empty() {
        return Err(Error::InvalidArgument(
            "no command given (pass it after `--`)".into(),
        ));
    }
    let mut command = if opts.shell {
        let shell = resolve_shell(opts.shell_path.as_deref());
        let flag = if opts.shell_interactive { "-ic" } else { "-lc" };
        let mut c = Command::new(shell);
        c.arg(flag).arg(cmd.join(" "));
        c
    } else {
        let mut c = Command::new(&cmd[0]);
        c.args(&cmd[1..]);
        c
    };
    command
        .envs(env)
        .stdin(Stdio::inherit())
        .stdout(Stdio::inherit())
        .stderr(Stdio::inherit());
    Ok(command)
}

/// Spawn the child and wait, forwarding Ctrl-C as SIGTERM with a grace
/// period before SIGKILL. Returns the child's exit code.
async fn supervise(mut command: Command, what: &str) -> Result<i32> {
    let mut child = command
        .spawn()
        .map_err(|e| Error::InvalidArgument(format!("cannot start {what}: {e}")))?;
    let pid = child.id();

    let finished = tokio::select! {
        status = child.wait() => Some(status?),
        _ = tokio::signal::ctrl_c() => None,
    };
    let status = match finished {
        Some(status) => status,
        // Interrupted: SIGTERM, a grace period, then SIGKILL.
        None => {
            #[cfg(unix)]
            if let Some(pid) = pid {
                unsafe {
                    libc::kill(pid as libc::pid_t, libc::SIGTERM);
                }
            }
            match tokio::time::timeout(SIGTERM_GRACE, child.wait()).await {
                Ok(status) => status?,
                Err(_) => {
                    child
                        .start_kill()
                        .map_err(|e| Error::Internal(anyhow::anyhow!("kill {what}: {e}")))?;
                    child.wait().await?
                }
            }
        }
    };

    #[cfg(unix)]
    {
        use std::os::unix::process::ExitStatusExt;
        if let Some(signal) = status.signal() {
            return Ok(128 + signal);
        }
    }
    Ok(status.code().unwrap_or(1))
}

/// Run `cmd` with the injection environment layered over the parent's.
pub async fn run_command(cmd: &[String], inj: &Injection, opts: &RunOptions) -> Result<i32> {
    let command = build_command(cmd, &inj.env, opts)?;
    let code = supervise(command, "command").await?;
    audit::emit(
        "vault.run",
        &[
            ("injected", inj.env.len() as i64),
            ("plaintext", inj.plaintext.len() as i64),
            ("decrypted", inj.decrypted as i64),
            ("exit_code", i64::from(code)),
        ],
        None,
    );
    Ok(code)
}

/// Refuse docker operations against a daemon the values could leak to:
/// tcp without TLS verification, or an unrecognized scheme.
pub fn check_docker_host(
    docker_host: Option<&str>,
    tls_verify: Option<&str>,
    allow_insecure: bool,
) -> Result<()> {
    let Some(host) = docker_host.map(str::trim).filter(|h| !h.is_empty()) else {
        return Ok(());
    };
    if allow_insecure {
        return Ok(());
    }
    let scheme = host.split("://").next().unwrap_or_default();
    match scheme {
        "unix" | "npipe" | "ssh" => Ok(()),
        "tcp" => {
            if tls_verify.is_some_and(crate::util::is_truthy) {
                Ok(())
            } else {
                Err(Error::InsecureTransport(format!(
                    "DOCKER_HOST {host} is tcp:// without DOCKER_TLS_VERIFY \
                     (pass --allow-insecure-docker-host to proceed)"
                )))
            }
        }
        _ => Err(Error::InsecureTransport(format!(
            "unrecognized DOCKER_HOST scheme in {host} \
             (pass --allow-insecure-docker-host to proceed)"
        ))),
    }
}

/// Argv for `docker exec`: `-e KEY` name-only flags so values travel in
/// the docker client's own environment, never on the command line.
pub fn docker_exec_args(container: &str, keys: &[&str], cmd: &[String]) -> Vec<String> {
    let mut args = vec!["exec".to_string()];
    for key in keys {
        args.push("-e".to_string());
        args.push((*key).to_string());
    }
    args.push(container.to_string());
    args.extend(cmd.iter().cloned());
    args
}

/// Run `docker exec` against `container` with the injection environment.
pub async fn docker_exec(container: &str, cmd: &[String], inj: &Injection) -> Result<i32> {
    let container = container.trim();
    if container.is_empty() {
        return Err(Error::InvalidArgument("--container is required".into()));
    }
    if cmd.is_empty() {
        return Err(Error::InvalidArgument(
            "no command given (pass it after `--`)".into(),
        ));
    }
    let keys: Vec<&str> = inj.env.keys().map(String::as_str).collect();
    let mut command = Command::new("docker");
    command
        .args(docker_exec_args(container, &keys, cmd))
        .envs(&inj.env)
        .stdin(Stdio::inherit())
        .stdout(Stdio::inherit())
        .stderr(Stdio::inherit());
    let code = supervise(command, "docker exec").await?;
    audit::emit(
        "vault.docker_exec",
        &[
            ("injected", inj.env.len() as i64),
            ("plaintext", inj.plaintext.len() as i64),
            ("decrypted", inj.decrypted as i64),
            ("exit_code", i64::from(code)),
        ],
        None,
    );
    Ok(code)
}
