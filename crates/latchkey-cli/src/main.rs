//! `latchkey` — open and create encrypted databases from the terminal.

use std::io::{BufRead, Write};
use std::path::{Path, PathBuf};
use std::sync::mpsc::{self, RecvTimeoutError};
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{anyhow, bail, Context, Result};
use clap::{Parser, Subcommand};
use latchkey_crypto_core::{
    compose, disable_core_dumps, CancelReason, CancellationToken, KdfParams, OuterCipher,
};
use latchkey_unlock::{
    encode, ContainerSettings, Credentials, Database, DirectoryFallbackStore, EngineConfig,
    EngineDeps, FallbackStrategy, FileReference, Generation, JsonSettingsStore,
    LocalFileProvider, StaticPolicy, UnlockEngine, UnlockEvent, UnlockRequest,
    UnlockedDatabase,
};
use secrecy::{ExposeSecret, SecretString};

#[derive(Parser)]
#[command(name = "latchkey")]
#[command(about = "Unlock KDBX databases with a composite key", long_about = None)]
struct Cli {
    /// Directory holding settings, config and fallback copies
    #[arg(long, global = true, default_value = ".latchkey")]
    state_dir: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Unlock a database and print a summary
    Open {
        /// Database file
        path: PathBuf,

        #[command(flatten)]
        key: KeyArgs,

        /// Remember the composite key for next time
        #[arg(long)]
        remember: bool,

        /// Never use a remembered key
        #[arg(long)]
        no_auto_unlock: bool,

        /// Open the local copy if the file cannot be reached
        #[arg(long)]
        use_cache: bool,

        /// Open read-only
        #[arg(long)]
        read_only: bool,

        /// Cancel the attempt after this many seconds
        #[arg(long)]
        give_up_after: Option<u64>,
    },

    /// Write a new, empty database
    Create {
        /// Destination file
        path: PathBuf,

        #[command(flatten)]
        key: KeyArgs,

        /// Database name
        #[arg(long, default_value = "Database")]
        name: String,

        /// Write the 3.1 format (AES-KDF only)
        #[arg(long)]
        legacy: bool,

        /// Use AES-KDF with this many rounds instead of Argon2d
        #[arg(long)]
        aes_rounds: Option<u64>,

        /// Encrypt with ChaCha20 instead of AES-256
        #[arg(long)]
        chacha20: bool,
    },
}

#[derive(clap::Args)]
struct KeyArgs {
    /// Read the password from the first line of stdin
    #[arg(long)]
    password_stdin: bool,

    /// Key file to combine with the password
    #[arg(long)]
    key_file: Option<PathBuf>,
}

impl KeyArgs {
    fn password(&self) -> Result<Option<SecretString>> {
        if !self.password_stdin {
            return Ok(None);
        }
        let mut line = String::new();
        std::io::stdin()
            .lock()
            .read_line(&mut line)
            .context("reading password from stdin")?;
        let password = line.trim_end_matches(['\r', '\n']).to_owned();
        Ok(Some(SecretString::from(password)))
    }
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "latchkey_unlock=info,latchkey_crypto_core=warn".into()),
        )
        .with_writer(std::io::stderr)
        .init();

    if let Err(err) = disable_core_dumps() {
        tracing::warn!("could not disable core dumps: {err}");
    }

    let cli = Cli::parse();
    match cli.command {
        Commands::Open {
            path,
            key,
            remember,
            no_auto_unlock,
            use_cache,
            read_only,
            give_up_after,
        } => {
            let mut request = UnlockRequest::new(FileReference::local(&path));
            let password = key.password()?;
            if password.is_some() || key.key_file.is_some() {
                let mut credentials = Credentials {
                    password,
                    ..Credentials::default()
                };
                if let Some(key_file) = &key.key_file {
                    credentials = credentials.with_key_file(FileReference::local(key_file));
                }
                request = request.with_credentials(credentials);
            }
            if remember {
                request = request.remembering_key();
            }
            request.status.read_only = read_only;
            let policy = StaticPolicy {
                auto_unlock: !no_auto_unlock,
                fallback: if use_cache {
                    FallbackStrategy::UseCache
                } else {
                    FallbackStrategy::ShowError
                },
            };
            let unlocked = open(
                &cli.state_dir,
                request,
                policy,
                give_up_after.map(Duration::from_secs),
            )?;
            print_summary(&unlocked)
        }
        Commands::Create {
            path,
            key,
            name,
            legacy,
            aes_rounds,
            chacha20,
        } => {
            let mut settings = ContainerSettings::default();
            if legacy {
                settings.generation = Generation::Legacy;
                settings.kdf = KdfParams::aes_kdf(aes_rounds.unwrap_or(60_000));
            } else if let Some(rounds) = aes_rounds {
                settings.kdf = KdfParams::aes_kdf(rounds);
            }
            if chacha20 {
                settings.cipher = OuterCipher::ChaCha20;
            }
            create(&path, &key, &name, &settings)
        }
    }
}

fn open(
    state_dir: &Path,
    request: UnlockRequest,
    policy: StaticPolicy,
    give_up_after: Option<Duration>,
) -> Result<UnlockedDatabase> {
    std::fs::create_dir_all(state_dir)
        .with_context(|| format!("creating {}", state_dir.display()))?;
    let engine = UnlockEngine::new(EngineDeps {
        provider: Arc::new(LocalFileProvider::new()),
        settings: Arc::new(JsonSettingsStore::open(state_dir)),
        fallback: Arc::new(DirectoryFallbackStore::new(state_dir.join("fallback"))),
        config: EngineConfig::load(state_dir),
    });

    let (tx, rx) = mpsc::channel();
    let handle = engine.start(request, Arc::new(policy), tx)?;
    let deadline = give_up_after.and_then(|after| Instant::now().checked_add(after));
    let mut stderr = std::io::stderr();

    let outcome = loop {
        let event = match rx.recv_timeout(Duration::from_millis(200)) {
            Ok(event) => event,
            Err(RecvTimeoutError::Timeout) => {
                if deadline.is_some_and(|d| Instant::now() >= d) {
                    handle.cancel(CancelReason::UserRequest);
                }
                continue;
            }
            Err(RecvTimeoutError::Disconnected) => bail!("unlock worker exited without a result"),
        };
        match event {
            UnlockEvent::WillUnlock => {}
            UnlockEvent::AttemptStarted(kind) => {
                writeln!(stderr, "\n{kind:?} attempt")?;
            }
            UnlockEvent::ProgressChanged { fraction, .. } => {
                // Whole percent only.
                #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
                let percent = (fraction * 100.0) as u8;
                write!(stderr, "\r{percent:>3}%")?;
                stderr.flush()?;
            }
            UnlockEvent::DidFail(err) => break Err(err),
            UnlockEvent::DidSucceed(unlocked) => break Ok(*unlocked),
        }
    };
    writeln!(stderr)?;
    if !handle.join() {
        tracing::error!("unlock worker panicked");
    }
    outcome.map_err(|err| anyhow!(err).context("unlock failed"))
}

fn print_summary(unlocked: &UnlockedDatabase) -> Result<()> {
    let mut out = std::io::stdout().lock();
    let db = &unlocked.database;
    writeln!(out, "name:        {}", db.meta.database_name)?;
    writeln!(out, "format:      {:?}", unlocked.generation)?;
    writeln!(out, "attempt:     {:?}", unlocked.attempt)?;
    writeln!(out, "entries:     {}", db.root.entry_count())?;
    writeln!(out, "attachments: {}", db.binaries.len())?;
    if unlocked.status.read_only {
        writeln!(out, "read-only")?;
    }
    if unlocked.status.local_fallback {
        writeln!(out, "opened from local copy")?;
    }
    for warning in &unlocked.warnings {
        writeln!(out, "warning:     {warning}")?;
    }
    Ok(())
}

fn create(path: &Path, key: &KeyArgs, name: &str, settings: &ContainerSettings) -> Result<()> {
    let password = key.password()?;
    let key_file = key
        .key_file
        .as_ref()
        .map(|p| std::fs::read(p).with_context(|| format!("reading {}", p.display())))
        .transpose()?;
    if password.is_none() && key_file.is_none() {
        bail!("a password or a key file is required");
    }
    let mut composite = compose(
        password.as_ref().map(|p| p.expose_secret()),
        key_file.as_deref(),
        None,
    )?;
    let bytes = encode(
        &Database::new(name),
        &mut composite,
        settings,
        None,
        &CancellationToken::new(),
    )?;
    std::fs::write(path, bytes).with_context(|| format!("writing {}", path.display()))?;
    tracing::info!(path = %path.display(), generation = ?settings.generation, "database created");
    Ok(())
}
