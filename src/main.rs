//! seqvault - Encrypted virtual drive with multi-device nonce sequencing
//!
//! Usage:
//!   seqvault create <dir>                        - Create a new drive
//!   seqvault encrypt <dir> <src> <name>          - Encrypt a file into the drive
//!   seqvault decrypt <dir> <name> <dst>          - Decrypt a file out of the drive
//!   seqvault auth-id <dir>                       - Show this device's auth id
//!   seqvault export-auth <dir> <auth-id> [file]  - Authorize another device
//!   seqvault import-auth <dir> <file>            - Accept an authorization
//!   seqvault revoke <dir>                        - Revoke this device
//!   seqvault change-password <dir>               - Re-seal under a new password
//!   seqvault status <dir>                        - Show drive status

use anyhow::Context;
use clap::{Parser, Subcommand};
use seqvault::{
    config::{default_config_path, Config},
    drive::Drive,
    sequence::{FileSequencer, NonceSequencer},
    stream::StreamOptions,
};
use std::fs::File;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{error, info};
use tracing_subscriber::fmt::writer::BoxMakeWriter;
use tracing_subscriber::{EnvFilter, FmtSubscriber};

#[derive(Parser)]
#[command(name = "seqvault")]
#[command(author = "seqvault Contributors")]
#[command(version = env!("CARGO_PKG_VERSION"))]
#[command(about = "Encrypted virtual drive with multi-device nonce sequencing")]
struct Cli {
    /// Configuration file path
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Enable verbose logging
    #[arg(short, long)]
    verbose: bool,

    /// Read the drive password from a file instead of prompting
    #[arg(long, global = true)]
    password_file: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Create a new drive
    Create {
        /// Drive root directory
        dir: PathBuf,

        /// Chunk size for new files (0 disables integrity)
        #[arg(long)]
        chunk_size: Option<u32>,
    },

    /// Encrypt a local file into the drive
    Encrypt {
        dir: PathBuf,

        /// Plaintext source file
        src: PathBuf,

        /// Name of the file inside the drive
        name: String,

        /// Re-encrypt an existing drive file with its stored nonce
        #[arg(long)]
        overwrite: bool,
    },

    /// Decrypt a drive file to a local file
    Decrypt {
        dir: PathBuf,

        /// Name of the file inside the drive
        name: String,

        /// Plaintext destination file
        dst: PathBuf,

        /// Skip integrity verification
        #[arg(long)]
        no_verify: bool,
    },

    /// Show this device's auth id for the drive
    AuthId { dir: PathBuf },

    /// Hand half of this device's nonce range to another device
    ExportAuth {
        dir: PathBuf,

        /// Auth id of the receiving device
        target_auth_id: String,

        /// Output file (defaults to the drive's export directory)
        file: Option<PathBuf>,
    },

    /// Accept an authorization file exported for this device
    ImportAuth { dir: PathBuf, file: PathBuf },

    /// Permanently revoke this device's write access
    Revoke { dir: PathBuf },

    /// Change the drive password
    ChangePassword { dir: PathBuf },

    /// Show drive status
    Status { dir: PathBuf },
}

fn main() {
    let cli = Cli::parse();

    let config_path = cli
        .config
        .as_deref()
        .map(expand_tilde)
        .unwrap_or_else(default_config_path);

    let config = match Config::load_or_default(&config_path) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("Failed to load configuration: {}", e);
            std::process::exit(1);
        }
    };

    if let Err(e) = init_logging(&config, cli.verbose) {
        eprintln!("Failed to initialize logging: {:#}", e);
        std::process::exit(1);
    }

    if let Err(e) = run_command(cli.command, &config, cli.password_file.as_deref()) {
        error!("Error: {:#}", e);
        std::process::exit(1);
    }
}

fn init_logging(config: &Config, verbose: bool) -> anyhow::Result<()> {
    let level = if verbose {
        "debug".to_string()
    } else {
        config.logging.level.to_lowercase()
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));

    let writer = match &config.logging.file {
        Some(path) => {
            let file = File::options()
                .create(true)
                .append(true)
                .open(expand_tilde(path))
                .with_context(|| format!("Failed to open log file {:?}", path))?;
            BoxMakeWriter::new(std::sync::Mutex::new(file))
        }
        None => BoxMakeWriter::new(std::io::stderr),
    };

    let subscriber = FmtSubscriber::builder()
        .with_env_filter(filter)
        .with_target(false)
        .with_ansi(config.logging.file.is_none())
        .with_writer(writer)
        .finish();

    tracing::subscriber::set_global_default(subscriber).context("Failed to set subscriber")?;
    Ok(())
}

fn run_command(
    command: Commands,
    config: &Config,
    password_file: Option<&Path>,
) -> anyhow::Result<()> {
    match command {
        Commands::Create { dir, chunk_size } => cmd_create(config, &dir, chunk_size, password_file),

        Commands::Encrypt {
            dir,
            src,
            name,
            overwrite,
        } => cmd_encrypt(config, &dir, &src, &name, overwrite, password_file),

        Commands::Decrypt {
            dir,
            name,
            dst,
            no_verify,
        } => cmd_decrypt(config, &dir, &name, &dst, no_verify, password_file),

        Commands::AuthId { dir } => cmd_auth_id(config, &dir, password_file),

        Commands::ExportAuth {
            dir,
            target_auth_id,
            file,
        } => cmd_export_auth(config, &dir, &target_auth_id, file, password_file),

        Commands::ImportAuth { dir, file } => cmd_import_auth(config, &dir, &file, password_file),

        Commands::Revoke { dir } => cmd_revoke(config, &dir, password_file),

        Commands::ChangePassword { dir } => cmd_change_password(config, &dir, password_file),

        Commands::Status { dir } => cmd_status(config, &dir, password_file),
    }
}

fn read_password(password_file: Option<&Path>, prompt: &str) -> anyhow::Result<String> {
    match password_file {
        Some(path) => Ok(std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read password file {:?}", path))?
            .trim()
            .to_string()),
        None => rpassword::prompt_password(prompt).context("Failed to read password"),
    }
}

fn open_sequencer(config: &Config) -> anyhow::Result<Arc<dyn NonceSequencer>> {
    let path = expand_tilde(&config.sequencer.path);
    let sequencer = FileSequencer::new(&path)
        .with_context(|| format!("Failed to open sequence file {:?}", path))?;
    Ok(Arc::new(sequencer))
}

fn open_drive(config: &Config, dir: &Path, password_file: Option<&Path>) -> anyhow::Result<Drive> {
    let password = read_password(password_file, "Enter drive password: ")?;
    let drive = Drive::open(
        expand_tilde(dir),
        password.as_bytes(),
        open_sequencer(config)?,
        config.drive_settings(),
    )?;
    Ok(drive)
}

fn cmd_create(
    config: &Config,
    dir: &Path,
    chunk_size: Option<u32>,
    password_file: Option<&Path>,
) -> anyhow::Result<()> {
    let password = read_password(password_file, "Enter new drive password: ")?;
    if password_file.is_none() {
        let confirm = rpassword::prompt_password("Confirm password: ")?;
        anyhow::ensure!(password == confirm, "Passwords do not match");
    }

    let mut settings = config.drive_settings();
    if let Some(chunk_size) = chunk_size {
        settings.default_chunk_size = chunk_size;
    }

    let drive = Drive::create(
        expand_tilde(dir),
        password.as_bytes(),
        open_sequencer(config)?,
        settings,
    )?;

    info!("Drive created");
    println!("Drive ID: {}", drive.drive_id());
    println!("Auth ID:  {}", drive.auth_id()?);
    Ok(())
}

fn cmd_encrypt(
    config: &Config,
    dir: &Path,
    src: &Path,
    name: &str,
    overwrite: bool,
    password_file: Option<&Path>,
) -> anyhow::Result<()> {
    let drive = open_drive(config, dir, password_file)?;
    let mut input = File::open(src).with_context(|| format!("Failed to open {:?}", src))?;

    let options = StreamOptions::default()
        .with_integrity(config.drive.integrity)
        .allow_overwrite(overwrite);
    let mut writer = drive.create_file(name, options)?;
    let copied = std::io::copy(&mut input, &mut writer).map_err(seqvault::Error::from)?;
    writer.finish()?;

    info!("Encrypted {} bytes into {}", copied, name);
    Ok(())
}

fn cmd_decrypt(
    config: &Config,
    dir: &Path,
    name: &str,
    dst: &Path,
    no_verify: bool,
    password_file: Option<&Path>,
) -> anyhow::Result<()> {
    let drive = open_drive(config, dir, password_file)?;

    let options = StreamOptions::default().with_integrity(config.drive.integrity && !no_verify);
    let mut reader = drive.open_file(name, options)?;
    let mut output = File::create(dst).with_context(|| format!("Failed to create {:?}", dst))?;
    let copied = std::io::copy(&mut reader, &mut output).map_err(seqvault::Error::from)?;

    info!("Decrypted {} bytes from {}", copied, name);
    Ok(())
}

fn cmd_auth_id(config: &Config, dir: &Path, password_file: Option<&Path>) -> anyhow::Result<()> {
    let drive = open_drive(config, dir, password_file)?;
    println!("{}", drive.auth_id()?);
    Ok(())
}

fn cmd_export_auth(
    config: &Config,
    dir: &Path,
    target_auth_id: &str,
    file: Option<PathBuf>,
    password_file: Option<&Path>,
) -> anyhow::Result<()> {
    let drive = open_drive(config, dir, password_file)?;
    let path = file.unwrap_or_else(|| drive.export_path());

    drive.export_auth_file(target_auth_id, &path)?;
    println!("Authorization written to {:?}", path);
    println!("Copy it to the other device and run 'seqvault import-auth'");
    Ok(())
}

fn cmd_import_auth(
    config: &Config,
    dir: &Path,
    file: &Path,
    password_file: Option<&Path>,
) -> anyhow::Result<()> {
    let drive = open_drive(config, dir, password_file)?;
    drive.import_auth_file(file)?;
    println!("This device is now authorized to write to drive {}", drive.drive_id());
    Ok(())
}

fn cmd_revoke(config: &Config, dir: &Path, password_file: Option<&Path>) -> anyhow::Result<()> {
    let drive = open_drive(config, dir, password_file)?;
    drive.revoke_authorization()?;
    println!("Write access of this device to drive {} revoked", drive.drive_id());
    Ok(())
}

fn cmd_change_password(
    config: &Config,
    dir: &Path,
    password_file: Option<&Path>,
) -> anyhow::Result<()> {
    let mut drive = open_drive(config, dir, password_file)?;
    let new_password = rpassword::prompt_password("Enter new drive password: ")?;
    let confirm = rpassword::prompt_password("Confirm password: ")?;
    anyhow::ensure!(new_password == confirm, "Passwords do not match");

    drive.change_password(new_password.as_bytes())?;
    println!("Password changed");
    Ok(())
}

fn cmd_status(config: &Config, dir: &Path, password_file: Option<&Path>) -> anyhow::Result<()> {
    let drive = open_drive(config, dir, password_file)?;

    println!("seqvault Status");
    println!("===============");
    println!();
    println!("Drive root: {:?}", drive.root());
    println!("Drive ID: {}", drive.drive_id());
    println!("Sequence file: {:?}", config.sequencer.path);
    match drive.default_chunk_size() {
        0 => println!("Integrity: disabled"),
        size => println!("Integrity: enabled ({} KiB chunks)", size / 1024),
    }

    match drive.sequence()? {
        Some(sequence) => {
            println!("Auth ID: {}", sequence.auth_id);
            println!("Sequence: {:?}", sequence.status);
            println!("Remaining nonces: {}", sequence.remaining());
        }
        None => println!("Sequence: none (run 'seqvault auth-id' to register this device)"),
    }

    Ok(())
}

fn expand_tilde(path: &Path) -> PathBuf {
    if let Ok(rest) = path.strip_prefix("~") {
        if let Some(home) = dirs::home_dir() {
            return home.join(rest);
        }
    }
    path.to_path_buf()
}
