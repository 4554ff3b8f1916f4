use anyhow::{bail, Context, Result};
use clap::{Args, Parser, Subcommand};
use indicatif::{ProgressBar, ProgressStyle};
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::time::Duration;
use tracing::{info, warn};
use tracing_subscriber::{fmt, EnvFilter};
use xcrypt::algorithms::{CipherAlgorithm, CipherMode, HashAlgorithm, MacAlgorithm};
use xcrypt::config::Config;
use xcrypt::engine::{CryptoSession, Output, SessionOptions, Source};
use xcrypt::header;
use xcrypt::key_manager::KeyMaterial;
use xcrypt::version::FormatVersion;

/// xcrypt - Encrypt files and directory trees into versioned containers
#[derive(Parser)]
#[command(name = "xcrypt")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Path to configuration file (falls back to XCRYPT_CONFIG)
    #[arg(long, global = true)]
    config: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Args)]
struct KeyArgs {
    /// Use the whole contents of FILE as the key
    #[arg(short = 'k', long = "key", value_name = "FILE", conflicts_with = "password")]
    key_file: Option<PathBuf>,

    /// Use a password as the key
    #[arg(short, long)]
    password: Option<String>,
}

#[derive(Args)]
struct AlgorithmArgs {
    /// Cipher algorithm (see `xcrypt algorithms`)
    #[arg(short, long)]
    cipher: Option<String>,

    /// Hash algorithm
    #[arg(short = 's', long)]
    hash: Option<String>,

    /// Cipher mode
    #[arg(short, long)]
    mode: Option<String>,

    /// MAC algorithm
    #[arg(short = 'a', long)]
    mac: Option<String>,

    /// PBKDF2 iterations (0 selects the default)
    #[arg(short = 'i', long)]
    kdf_iterations: Option<u32>,

    /// Disable compression
    #[arg(short = 'x', long)]
    no_compress: bool,

    /// Raw mode: no header, algorithms must be given again to decrypt
    #[arg(short, long)]
    raw: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Encrypt a file, directory or stdin
    Encrypt {
        /// Input file or directory (stdin when omitted or '-')
        source: Option<PathBuf>,

        /// Output container (stdout when omitted or '-')
        output: Option<PathBuf>,

        #[command(flatten)]
        key: KeyArgs,

        #[command(flatten)]
        algorithms: AlgorithmArgs,

        /// Dereference symlinks instead of storing them
        #[arg(short, long)]
        follow: bool,

        /// Write an older container version
        #[arg(long, value_name = "VERSION")]
        compat: Option<String>,
    },

    /// Decrypt a container
    Decrypt {
        /// Container to decrypt (stdin when omitted or '-')
        source: Option<PathBuf>,

        /// Output file or directory (stdout when omitted or '-')
        output: Option<PathBuf>,

        #[command(flatten)]
        key: KeyArgs,

        #[command(flatten)]
        algorithms: AlgorithmArgs,
    },

    /// Show the header of a container
    Info {
        /// File to inspect
        file: PathBuf,
    },

    /// List supported algorithms and container versions
    Algorithms,
}

impl Commands {
    fn name(&self) -> &'static str {
        match self {
            Self::Encrypt { .. } => "encrypt",
            Self::Decrypt { .. } => "decrypt",
            Self::Info { .. } => "info",
            Self::Algorithms => "algorithms",
        }
    }
}

#[tokio::main]
async fn main() -> Result<ExitCode> {
    // Initialize structured logging
    // Use RUST_LOG environment variable to control log level (e.g., RUST_LOG=info,xcrypt=debug)
    fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_target(true)
        .with_thread_ids(false)
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    info!(command = cli.command.name(), "xcrypt starting");

    match cli.command {
        Commands::Encrypt {
            source,
            output,
            key,
            algorithms,
            follow,
            compat,
        } => {
            let cfg = Config::load_with_env(cli.config.as_deref())?;
            let mut options = session_options(&cfg, &algorithms)?;
            options.follow_links |= follow;
            if let Some(v) = compat {
                options.version = v.parse().with_context(|| format!("invalid --compat '{}'", v))?;
            }
            cmd_encrypt(dash_is_none(source), dash_is_none(output), key, options).await
        }

        Commands::Decrypt {
            source,
            output,
            key,
            algorithms,
        } => {
            let cfg = Config::load_with_env(cli.config.as_deref())?;
            let options = session_options(&cfg, &algorithms)?;
            cmd_decrypt(dash_is_none(source), dash_is_none(output), key, options).await
        }

        Commands::Info { file } => cmd_info(&file),

        Commands::Algorithms => {
            cmd_algorithms();
            Ok(ExitCode::SUCCESS)
        }
    }
}

fn dash_is_none(path: Option<PathBuf>) -> Option<PathBuf> {
    path.filter(|p| p.as_os_str() != "-")
}

/// Config defaults overridden by command line flags
fn session_options(cfg: &Config, args: &AlgorithmArgs) -> Result<SessionOptions> {
    let mut options = cfg.to_options()?;
    if let Some(cipher) = &args.cipher {
        options.cipher = cipher.parse()?;
    }
    if let Some(hash) = &args.hash {
        options.hash = hash.parse()?;
    }
    if let Some(mode) = &args.mode {
        options.mode = mode.parse()?;
    }
    if let Some(mac) = &args.mac {
        options.mac = mac.parse()?;
    }
    if let Some(iterations) = args.kdf_iterations {
        options.kdf_iterations = iterations;
    }
    if args.no_compress {
        options.compress = false;
    }
    options.raw = args.raw;
    Ok(options)
}

async fn load_key(args: KeyArgs) -> Result<KeyMaterial> {
    match (args.key_file, args.password) {
        (Some(path), _) => KeyMaterial::from_file(&path).await,
        (None, Some(password)) => Ok(KeyMaterial::from_password(password)?),
        (None, None) => bail!("no key given; use --key <FILE> or --password <PASSWORD>"),
    }
}

/// Create a styled progress bar for file operations
fn create_progress_bar(total: u64, message: &'static str) -> Result<ProgressBar> {
    let pb = ProgressBar::new(total);
    pb.set_style(
        ProgressStyle::default_bar()
            .template("{spinner:.green} [{elapsed_precise}] [{bar:40.cyan/blue}] {bytes}/{total_bytes} ({percent}%) {msg}")
            .context("building progress bar template")?
            .progress_chars("#>-"),
    );
    pb.set_message(message);
    Ok(pb)
}

/// Drives a session to completion, mirroring its progress on a bar
async fn run_session(mut session: CryptoSession, message: &'static str) -> Result<ExitCode> {
    let pb = create_progress_bar(0, message)?;
    session.execute()?;

    let mut ticker = tokio::time::interval(Duration::from_millis(100));
    let ctrl_c = tokio::signal::ctrl_c();
    tokio::pin!(ctrl_c);
    let mut interrupted = false;

    // A panicked worker never sets a terminal status; watch the worker itself
    while !session.worker_finished() {
        tokio::select! {
            _ = ticker.tick() => {
                let total = session.total();
                pb.set_length(total.size);
                pb.set_position(total.offset);
            }
            _ = &mut ctrl_c, if !interrupted => {
                warn!("interrupt received, cancelling");
                session.cancel();
                interrupted = true;
            }
        }
    }

    let status = session.join().await;
    let total = session.total();
    pb.set_length(total.size);
    pb.set_position(total.offset);

    if status.is_failure() {
        pb.abandon_with_message(status.message());
        eprintln!("error: {}", status);
        session.deinit();
        return Ok(ExitCode::FAILURE);
    }
    if status.is_warning() {
        pb.finish_with_message(status.message());
        eprintln!("warning: {}", status);
    } else {
        pb.finish_with_message("done");
    }
    session.deinit();
    Ok(ExitCode::SUCCESS)
}

/// Encrypt a file, directory tree or stdin
async fn cmd_encrypt(
    source: Option<PathBuf>,
    output: Option<PathBuf>,
    key: KeyArgs,
    options: SessionOptions,
) -> Result<ExitCode> {
    if let Some(path) = &source {
        if header::is_encrypted(path) {
            warn!(path = %path.display(), "source already looks like an encrypted container");
        }
    }
    let key = load_key(key).await?;

    let source = source.map_or(Source::Stdin, Source::Path);
    let output = output.map_or(Output::Stdout, Output::Path);
    let session = CryptoSession::encrypt(source, output, key, options).context("preparing encryption")?;

    run_session(session, "Encrypting").await
}

/// Decrypt a container to a file, directory or stdout
async fn cmd_decrypt(
    source: Option<PathBuf>,
    output: Option<PathBuf>,
    key: KeyArgs,
    options: SessionOptions,
) -> Result<ExitCode> {
    if let Some(path) = &source {
        if !options.raw && !header::is_encrypted(path) {
            bail!("{} is not an encrypted container", path.display());
        }
    }
    let key = load_key(key).await?;

    let source = source.map_or(Source::Stdin, Source::Path);
    let output = output.map_or(Output::Stdout, Output::Path);
    let session = CryptoSession::decrypt(source, output, key, options).context("preparing decryption")?;

    run_session(session, "Decrypting").await
}

/// Show the clear-text header of a container
fn cmd_info(file: &Path) -> Result<ExitCode> {
    let mut f = std::fs::File::open(file).with_context(|| format!("opening {}", file.display()))?;

    let Some(found) = header::probe(&mut f)? else {
        println!("{}: not an encrypted container", file.display());
        return Ok(ExitCode::FAILURE);
    };

    let algs = found.algorithms;
    println!("{}", file.display());
    println!("  Version:         {}", found.version);
    println!("  Cipher:          {}", algs.cipher);
    println!("  Hash:            {}", algs.hash);
    println!("  Mode:            {}", algs.mode);
    match algs.mac {
        Some(mac) => println!("  MAC:             {}", mac),
        None => println!("  MAC:             none"),
    }
    if algs.kdf_iterations > 0 {
        println!("  KDF iterations:  {}", algs.kdf_iterations);
    }
    Ok(ExitCode::SUCCESS)
}

fn cmd_algorithms() {
    let ciphers: Vec<&str> = CipherAlgorithm::ALL.iter().map(|c| c.name()).collect();
    let hashes: Vec<&str> = HashAlgorithm::ALL.iter().map(|h| h.name()).collect();
    let modes: Vec<&str> = CipherMode::ALL.iter().map(|m| m.name()).collect();
    let macs: Vec<String> = MacAlgorithm::all().map(|m| m.to_string()).collect();
    let versions: Vec<&str> = FormatVersion::ALL.iter().map(|v| v.name()).collect();

    println!("Ciphers:   {}", ciphers.join(", "));
    println!("Hashes:    {}", hashes.join(", "));
    println!("Modes:     {}", modes.join(", "));
    println!("MACs:      {}", macs.join(", "));
    println!("Versions:  {} (default {})", versions.join(", "), FormatVersion::CURRENT);
}
