#![warn(clippy::all, clippy::pedantic)]
#![allow(
    clippy::bool_to_int_with_if,
    clippy::case_sensitive_file_extension_comparisons,
    clippy::cast_possible_wrap,
    clippy::doc_markdown,
    clippy::implicit_clone,
    clippy::items_after_statements,
    clippy::map_unwrap_or,
    clippy::missing_errors_doc,
    clippy::missing_panics_doc,
    clippy::module_name_repetitions,
    clippy::must_use_candidate,
    clippy::needless_pass_by_value,
    clippy::redundant_closure_for_method_calls,
    clippy::return_self_not_must_use,
    clippy::similar_names,
    clippy::single_match_else,
    clippy::struct_field_names,
    clippy::too_many_lines,
    clippy::uninlined_format_args,
    clippy::unnecessary_wraps
)]

use clap::Subcommand;

pub mod audit;
pub mod config;
pub mod custody;
pub mod error;
pub mod sync;
pub mod util;
pub mod vault;

pub use config::Config;
pub use error::{Error, Result};

/// Vault subcommands
#[derive(Subcommand, Debug, Clone)]
pub enum VaultCommands {
    /// Ensure the custody keypair for the target and print its public key
    #[command(long_about = "Ensure the custody keypair for the target and print its\n\
        public key. A missing keypair is generated and uploaded; the\n\
        SI_VAULT_PUBLIC_KEY header is stamped into the env file either\n\
        way. The private key never leaves custody.\n\n\
        Examples:\n  \
        si vault keypair --repo acme --env dev\n  \
        si vault keypair --rotate")]
    Keypair {
        /// Upload a fresh keypair, keeping the old private key in backups
        #[arg(long)]
        rotate: bool,
    },
    /// Show the local status of the resolved vault file
    Status,
    /// Scan env files for plaintext secret values
    #[command(long_about = "Scan env files for plaintext secret values.\n\n\
        By default the resolved vault file is checked; name files to\n\
        check instead as positional arguments. With --staged only files\n\
        staged for commit are checked, which is what the installed\n\
        pre-commit hook runs; --all walks the whole repository.\n\n\
        Examples:\n  \
        si vault check\n  \
        si vault check .env.prod deploy/.env\n  \
        si vault check --staged")]
    Check {
        /// Env files to check (default: the resolved vault file)
        #[arg(value_name = "PATH", conflicts_with_all = ["staged", "all"])]
        paths: Vec<std::path::PathBuf>,
        /// Only check files staged for commit
        #[arg(long)]
        staged: bool,
        /// Check every env-shaped file under the repository
        #[arg(long, conflicts_with = "staged")]
        all: bool,
        /// Also scan files and directories named like examples
        #[arg(long)]
        include_examples: bool,
    },
    /// Manage the git pre-commit hook
    #[command(subcommand)]
    Hooks(HookCommands),
    /// Encrypt plaintext values in the vault file
    #[command(long_about = "Encrypt plaintext values in the vault file.\n\n\
        Values already encrypted are left alone unless --reencrypt, which\n\
        rotates every ciphertext to the current primary key and requires\n\
        the file to be trusted. The SI_VAULT_PUBLIC_KEY header is enforced\n\
        on every run.\n\n\
        Examples:\n  \
        si vault encrypt\n  \
        si vault encrypt --include 'DB_*' --exclude DB_HOST\n  \
        si vault encrypt --reencrypt")]
    Encrypt {
        /// Rotate existing ciphertexts to the current primary key
        #[arg(long)]
        reencrypt: bool,
        /// Only keys matching this glob (repeatable)
        #[arg(long = "include", value_name = "GLOB")]
        include: Vec<String>,
        /// Skip keys matching this glob (repeatable, wins over include)
        #[arg(long = "exclude", value_name = "GLOB")]
        exclude: Vec<String>,
    },
    /// Decrypt the vault file to stdout, or in place with --inplace
    Decrypt {
        /// Rewrite the file itself after saving an encrypted restore backup
        #[arg(long)]
        inplace: bool,
        /// Only keys matching this glob (repeatable)
        #[arg(long = "include", value_name = "GLOB")]
        include: Vec<String>,
        /// Skip keys matching this glob (repeatable, wins over include)
        #[arg(long = "exclude", value_name = "GLOB")]
        exclude: Vec<String>,
    },
    /// Put the encrypted form back from the restore backup
    Restore,
    /// Set a key, encrypting the value unless --plain
    Set {
        key: String,
        value: String,
        /// Store the value unencrypted
        #[arg(long)]
        plain: bool,
    },
    /// Remove a key from the vault file
    Unset { key: String },
    /// Read a key's stored value, or the plaintext with --reveal
    Get {
        key: String,
        /// Decrypt the value (requires trust)
        #[arg(long)]
        reveal: bool,
    },
    /// List keys in the vault file
    List {
        /// Show decrypted values (requires trust)
        #[arg(long)]
        reveal: bool,
    },
    /// Trust the current contents of the vault file for decryption
    Trust,
    /// Run a command with decrypted values injected into its environment
    #[command(long_about = "Run a command with decrypted values injected into its\n\
        environment. Values never touch argv or the filesystem. The child's\n\
        exit code propagates unchanged; Ctrl-C forwards SIGTERM with a 5 s\n\
        grace period before SIGKILL.\n\n\
        Examples:\n  \
        si vault run -- ./server --port 8080\n  \
        si vault run --shell -- 'echo $DB_PASSWORD | wc -c'")]
    Run {
        /// Proceed even when the file still holds plaintext values
        #[arg(long)]
        allow_plaintext: bool,
        /// Run the command through a shell (-lc)
        #[arg(long)]
        shell: bool,
        /// Use an interactive shell (-ic) instead of a login shell
        #[arg(long)]
        shell_interactive: bool,
        /// Shell binary to use (default: $SHELL, then /bin/bash)
        #[arg(long, value_name = "PATH")]
        shell_path: Option<String>,
        /// Command and arguments, after --
        #[arg(trailing_var_arg = true, required = true)]
        cmd: Vec<String>,
    },
    /// Inject decrypted values into a docker container command
    #[command(subcommand)]
    Docker(DockerCommands),
}

/// Docker injection subcommands
#[derive(Subcommand, Debug, Clone)]
pub enum DockerCommands {
    /// docker exec with vault values passed through the client environment
    Exec {
        /// Target container name or id
        #[arg(long)]
        container: String,
        /// Allow a non-TLS-verified remote DOCKER_HOST
        #[arg(long)]
        allow_insecure_docker_host: bool,
        /// Proceed even when the file still holds plaintext values
        #[arg(long)]
        allow_plaintext: bool,
        /// Command and arguments, after --
        #[arg(trailing_var_arg = true, required = true)]
        cmd: Vec<String>,
    },
}

/// Pre-commit hook subcommands
#[derive(Subcommand, Debug, Clone)]
pub enum HookCommands {
    /// Install the plaintext-guard block into .git/hooks/pre-commit
    Install,
    /// Report whether the hook is installed
    Status,
    /// Remove the plaintext-guard block
    Uninstall,
}

/// Control-plane snapshot subcommands
#[derive(Subcommand, Debug, Clone)]
pub enum SyncCommands {
    /// Upload local collections as one snapshot object
    Push {
        /// Snapshot object name (default: the custody account slug)
        #[arg(long)]
        name: Option<String>,
        /// Optimistic lock: fail unless the remote revision matches
        #[arg(long)]
        expected_revision: Option<i64>,
    },
    /// Download a snapshot and merge it into local collections
    Pull {
        /// Snapshot object name (default: the custody account slug)
        #[arg(long)]
        name: Option<String>,
        /// Replace local collections instead of merging on recency
        #[arg(long)]
        replace: bool,
    },
    /// Show entity counts per local collection
    Status,
}

/// Custody service subcommands
#[derive(Subcommand, Debug, Clone)]
pub enum SunCommands {
    /// Check that the custody service answers
    Ready,
    /// Show the account and scopes behind the configured token
    Whoami,
    /// Manage custody API tokens
    #[command(subcommand)]
    Token(TokenCommands),
}

/// Custody token subcommands
#[derive(Subcommand, Debug, Clone)]
pub enum TokenCommands {
    /// List tokens on the account
    List {
        /// Include revoked tokens
        #[arg(long)]
        include_revoked: bool,
    },
    /// Create a token; the secret is printed exactly once
    Create {
        #[arg(long)]
        label: String,
        /// Scope to grant (repeatable)
        #[arg(long = "scope", value_name = "SCOPE")]
        scopes: Vec<String>,
        #[arg(long, value_name = "HOURS")]
        expires_in_hours: Option<u32>,
    },
    /// Revoke a token by id
    Revoke { id: String },
}
