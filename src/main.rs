#![warn(clippy::all, clippy::pedantic)]
#![allow(
    clippy::bool_to_int_with_if,
    clippy::items_after_statements,
    clippy::missing_errors_doc,
    clippy::module_name_repetitions,
    clippy::needless_pass_by_value,
    clippy::similar_names,
    clippy::single_match_else,
    clippy::too_many_lines,
    clippy::uninlined_format_args
)]

use clap::{Parser, Subcommand};
use serde::Serialize;
use si::vault::filter::KeyFilter;
use si::vault::run::RunOptions;
use si::vault::target::{self, TargetFlags, VaultTarget};
use si::vault::trust::TrustStore;
use si::vault::{dotenv, guard, keys, ops, run};
use si::{
    Config, DockerCommands, Error, HookCommands, Result, SunCommands, SyncCommands,
    TokenCommands, VaultCommands,
};
use tracing_subscriber::{fmt, EnvFilter};

/// si - custody-backed secret vault for env files.
#[derive(Parser, Debug)]
#[command(name = "si")]
#[command(version)]
#[command(about = "Encrypt, inject, and sync env-file secrets", long_about = None)]
struct Cli {
    /// Repository slug (default: git root directory name)
    #[arg(long, global = true)]
    repo: Option<String>,

    /// Environment slug (default: derived from the file name, then SI_VAULT_ENV)
    #[arg(long, global = true)]
    env: Option<String>,

    /// Vault env file path (default: SI_VAULT_ENV_FILE, then .env)
    #[arg(long, global = true)]
    file: Option<String>,

    /// Machine-readable JSON output
    #[arg(long, global = true)]
    json: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Vault operations on the resolved env file
    #[command(subcommand)]
    Vault(VaultCommands),
    /// Control-plane snapshot sync
    #[command(subcommand)]
    Sync(SyncCommands),
    /// Custody service operations
    #[command(subcommand)]
    Sun(SunCommands),
}

fn emit<T: Serialize>(json: bool, report: &T, human: impl FnOnce()) -> Result<()> {
    if json {
        println!("{}", serde_json::to_string_pretty(report)?);
    } else {
        human();
    }
    Ok(())
}

fn resolve_target(cli: &Cli, config: &Config) -> Result<VaultTarget> {
    let cwd = std::env::current_dir()?;
    let flags = TargetFlags {
        repo: cli.repo.clone(),
        env: cli.env.clone(),
        file: cli.file.clone(),
    };
    target::resolve(&flags, config, &cwd)
}

async fn injection_env(
    config: &Config,
    target: &VaultTarget,
    allow_plaintext: bool,
) -> Result<run::Injection> {
    let doc = dotenv::read_file(&target.env_file)?;
    let store = TrustStore::open(&config.state_root()?)?;
    store.require(&target.env_file, &doc.bytes(), false)?;
    let custody = config.custody()?;
    let material =
        keys::ensure(&custody, target, config.vault_public_key_hint.as_deref()).await?;
    run::prepare_env(&doc, &material, &target.env_file, allow_plaintext)
}

async fn run_vault(cli: &Cli, config: &Config, command: &VaultCommands) -> Result<i32> {
    match command {
        VaultCommands::Keypair { rotate } => {
            let target = resolve_target(cli, config)?;
            let report = ops::keypair(config, &target, *rotate).await?;
            emit(config.json, &report, || {
                println!("{}", report.public_key);
            })?;
        }
        VaultCommands::Status => {
            let target = resolve_target(cli, config)?;
            let report = ops::status(config, &target)?;
            emit(config.json, &report, || {
                println!("repo:      {}", report.repo);
                println!("env:       {}", report.env);
                println!("file:      {}", report.env_file.display());
                if report.exists {
                    println!(
                        "header:    {}",
                        report.header_public_key.as_deref().unwrap_or("missing")
                    );
                    println!(
                        "entries:   {} ({} encrypted, {} plaintext)",
                        report.entries, report.encrypted, report.plaintext
                    );
                    println!("trust:     {}", report.trust);
                } else {
                    println!("file does not exist");
                }
            })?;
        }
        VaultCommands::Check {
            paths,
            staged,
            all,
            include_examples,
        } => {
            let target = resolve_target(cli, config)?;
            let files = if *staged {
                guard::staged_env_files(&target.repo_dir).await?
            } else if *all {
                guard::discover_env_files(&target.repo_dir, *include_examples)?
            } else if paths.is_empty() {
                vec![target.env_file.clone()]
            } else {
                let cwd = std::env::current_dir()?;
                paths
                    .iter()
                    .map(|p| si::util::clean_path(&cwd.join(p)))
                    .collect()
            };
            guard::check_files(&files)?;
            let count = files.len();
            emit(config.json, &serde_json::json!({ "clean": count }), || {
                println!("ok: {count} env file(s) clean");
            })?;
        }
        VaultCommands::Hooks(hooks) => {
            let target = resolve_target(cli, config)?;
            let status = match hooks {
                HookCommands::Install => {
                    guard::install_hook(&target.repo_dir)?;
                    guard::hook_status(&target.repo_dir)?
                }
                HookCommands::Uninstall => {
                    guard::uninstall_hook(&target.repo_dir)?;
                    guard::hook_status(&target.repo_dir)?
                }
                HookCommands::Status => guard::hook_status(&target.repo_dir)?,
            };
            emit(
                config.json,
                &serde_json::json!({ "hook": status.as_str() }),
                || println!("pre-commit hook: {}", status.as_str()),
            )?;
        }
        VaultCommands::Encrypt {
            reencrypt,
            include,
            exclude,
        } => {
            let target = resolve_target(cli, config)?;
            let filter = KeyFilter::new(include, exclude)?;
            let report = ops::encrypt(config, &target, &filter, *reencrypt).await?;
            emit(config.json, &report, || {
                println!(
                    "encrypted {} key(s), reencrypted {}, skipped {}",
                    report.encrypted, report.reencrypted, report.skipped
                );
            })?;
        }
        VaultCommands::Decrypt {
            inplace,
            include,
            exclude,
        } => {
            let target = resolve_target(cli, config)?;
            let filter = KeyFilter::new(include, exclude)?;
            let report = ops::decrypt(config, &target, &filter, *inplace).await?;
            if config.json {
                println!("{}", serde_json::to_string_pretty(&report)?);
            } else if let Some(rendered) = &report.rendered {
                print!("{rendered}");
            } else {
                println!("decrypted {} key(s) in place", report.decrypted);
            }
        }
        VaultCommands::Restore => {
            let target = resolve_target(cli, config)?;
            let report = ops::restore(config, &target)?;
            emit(config.json, &report, || {
                println!("restored {}", report.env_file.display());
            })?;
        }
        VaultCommands::Set { key, value, plain } => {
            let target = resolve_target(cli, config)?;
            let report = ops::set(config, &target, key, value, *plain).await?;
            emit(config.json, &report, || {
                let how = if report.encrypted { "encrypted" } else { "plain" };
                println!("set {} ({how})", report.key);
            })?;
        }
        VaultCommands::Unset { key } => {
            let target = resolve_target(cli, config)?;
            let report = ops::unset(config, &target, key)?;
            emit(config.json, &report, || {
                if report.removed {
                    println!("unset {}", report.key);
                } else {
                    println!("{} was not set", report.key);
                }
            })?;
        }
        VaultCommands::Get { key, reveal } => {
            let target = resolve_target(cli, config)?;
            let report = ops::get(config, &target, key, *reveal).await?;
            emit(config.json, &report, || println!("{}", report.value))?;
        }
        VaultCommands::List { reveal } => {
            let target = resolve_target(cli, config)?;
            let listed = ops::list(config, &target, *reveal).await?;
            emit(config.json, &listed, || {
                for item in &listed {
                    match &item.value {
                        Some(value) => println!("{}={value}", item.key),
                        None if item.encrypted => println!("{} (encrypted)", item.key),
                        None => println!("{}", item.key),
                    }
                }
            })?;
        }
        VaultCommands::Trust => {
            let target = resolve_target(cli, config)?;
            let report = ops::trust(config, &target)?;
            emit(config.json, &report, || {
                println!("trusted {}", report.env_file.display());
            })?;
        }
        VaultCommands::Run {
            allow_plaintext,
            shell,
            shell_interactive,
            shell_path,
            cmd,
        } => {
            let target = resolve_target(cli, config)?;
            let inj = injection_env(config, &target, *allow_plaintext).await?;
            let opts = RunOptions {
                allow_plaintext: *allow_plaintext,
                shell: *shell,
                shell_interactive: *shell_interactive,
                shell_path: shell_path.clone(),
            };
            return run::run_command(cmd, &inj, &opts).await;
        }
        VaultCommands::Docker(DockerCommands::Exec {
            container,
            allow_insecure_docker_host,
            allow_plaintext,
            cmd,
        }) => {
            run::check_docker_host(
                config.docker_host.as_deref(),
                config.docker_tls_verify.as_deref(),
                *allow_insecure_docker_host,
            )?;
            let target = resolve_target(cli, config)?;
            let inj = injection_env(config, &target, *allow_plaintext).await?;
            return run::docker_exec(container, cmd, &inj).await;
        }
    }
    Ok(0)
}

async fn run_sync(config: &Config, command: &SyncCommands) -> Result<i32> {
    let state_root = config.state_root()?;
    match command {
        SyncCommands::Push {
            name,
            expected_revision,
        } => {
            let custody = config.custody()?;
            let (name, result) =
                si::sync::push(&custody, &state_root, name.as_deref(), *expected_revision)
                    .await?;
            emit(config.json, &serde_json::json!({
                "name": name.as_str(),
                "revision": result.revision,
            }), || {
                println!("pushed snapshot {name} at revision {}", result.revision);
            })?;
        }
        SyncCommands::Pull { name, replace } => {
            let custody = config.custody()?;
            let report =
                si::sync::pull(&custody, &state_root, name.as_deref(), *replace).await?;
            emit(config.json, &report, || {
                let entities: usize = report.collections.values().sum();
                let mode = if report.replaced { "replaced" } else { "merged" };
                println!(
                    "pulled snapshot {} ({mode}, {entities} entities)",
                    report.name
                );
            })?;
        }
        SyncCommands::Status => {
            let counts = si::sync::status(&state_root)?;
            emit(config.json, &counts, || {
                for (collection, count) in &counts {
                    println!("{collection}: {count}");
                }
            })?;
        }
    }
    Ok(0)
}

async fn run_sun(config: &Config, command: &SunCommands) -> Result<i32> {
    let custody = config.custody()?;
    match command {
        SunCommands::Ready => {
            custody.ready().await?;
            emit(config.json, &serde_json::json!({ "ready": true }), || {
                println!("custody service is ready");
            })?;
        }
        SunCommands::Whoami => {
            let who = custody.whoami().await?;
            emit(config.json, &who, || {
                println!("account: {} ({})", who.account_slug, who.account_id);
                println!("token:   {}", who.token_id);
                println!("scopes:  {}", who.scopes.join(", "));
            })?;
        }
        SunCommands::Token(TokenCommands::List { include_revoked }) => {
            let tokens = custody.list_tokens(*include_revoked, 100).await?;
            emit(config.json, &tokens, || {
                for token in &tokens {
                    let state = if token.revoked { " (revoked)" } else { "" };
                    println!("{} {}{state}", token.id, token.label);
                }
            })?;
        }
        SunCommands::Token(TokenCommands::Create {
            label,
            scopes,
            expires_in_hours,
        }) => {
            let issued = custody
                .create_token(label, scopes, *expires_in_hours)
                .await?;
            emit(config.json, &issued_json(&issued), || {
                println!("id:    {}", issued.id);
                println!("token: {}", issued.token);
                println!("store it now; it cannot be shown again");
            })?;
        }
        SunCommands::Token(TokenCommands::Revoke { id }) => {
            custody.revoke_token(id).await?;
            emit(config.json, &serde_json::json!({ "revoked": id }), || {
                println!("revoked {id}");
            })?;
        }
    }
    Ok(0)
}

fn issued_json(issued: &si::custody::IssuedToken) -> serde_json::Value {
    serde_json::json!({
        "id": issued.id,
        "token": issued.token,
        "label": issued.label,
        "scopes": issued.scopes,
        "expires_at": issued.expires_at,
    })
}

fn report_error(err: &Error, json: bool) {
    if json {
        let mut body = serde_json::json!({
            "error": err.to_string(),
            "kind": err.kind(),
        });
        if let Some(hint) = err.hint() {
            body["hint"] = serde_json::Value::from(hint);
        }
        if let Error::PlaintextGuard { findings } = err {
            body["findings"] = serde_json::to_value(findings).unwrap_or_default();
        }
        eprintln!("{body}");
        return;
    }
    eprintln!("error: {err}");
    if let Error::PlaintextGuard { findings } = err {
        for finding in findings {
            eprintln!("  {}: {}", finding.file.display(), finding.keys.join(", "));
        }
    }
    if let Some(hint) = err.hint() {
        eprintln!("hint: {hint}");
    }
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    // Respects RUST_LOG, defaults to info.
    let subscriber = fmt::Subscriber::builder()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .finish();
    if tracing::subscriber::set_global_default(subscriber).is_err() {
        eprintln!("warning: logging already initialized");
    }

    let mut config = Config::from_env();
    config.json = cli.json;

    let outcome = match &cli.command {
        Commands::Vault(command) => run_vault(&cli, &config, command).await,
        Commands::Sync(command) => run_sync(&config, command).await,
        Commands::Sun(command) => run_sun(&config, command).await,
    };

    match outcome {
        Ok(code) => std::process::exit(code),
        Err(err) => {
            report_error(&err, config.json);
            std::process::exit(err.exit_code());
        }
    }
}
