use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use indicatif::{ProgressBar, ProgressStyle};
use pagecrypt::storagefile_ops::SecurePageOps;
use pagecrypt::{config, key_manager::KeyManager, CryptMode, Dispatch};
use std::io::{self, Write};
use std::path::PathBuf;
use tokio::fs;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tracing::info;
use tracing_subscriber::{fmt, EnvFilter};

/// Bytes moved per page-I/O call by import and export.
const TRANSFER_CHUNK: usize = 256 * 1024;

/// pagecrypt - page-granular encrypted file storage
#[derive(Parser)]
#[command(name = "pagecrypt")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Path to configuration file
    #[arg(short, long, default_value = "config.json")]
    config: String,

    /// Encrypt pages in one batch per call instead of one at a time
    #[arg(long, global = true)]
    batched: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Initialize storage (generate config and page key)
    Init {
        /// Storage directory path
        #[arg(short, long, default_value = "./storage")]
        storage_dir: String,

        /// Page key file path
        #[arg(short, long, default_value = "./pagecrypt.key")]
        key_path: String,

        /// Page size for new files
        #[arg(short, long, default_value_t = config::DEFAULT_PAGE_SIZE)]
        page_size: usize,
    },

    /// Create an empty file
    Create {
        name: String,

        /// Store pages unencrypted
        #[arg(long)]
        plain: bool,
    },

    /// Write bytes at an offset (past end-of-file leaves a zero-filled gap)
    Write {
        name: String,

        /// Logical byte offset
        #[arg(short, long, default_value_t = 0)]
        offset: u64,

        /// Text to write
        #[arg(short, long, conflicts_with = "input")]
        text: Option<String>,

        /// File whose contents to write
        #[arg(short, long)]
        input: Option<PathBuf>,
    },

    /// Read a byte range
    Read {
        name: String,

        #[arg(short, long, default_value_t = 0)]
        offset: u64,

        /// Number of bytes (defaults to the rest of the file)
        #[arg(short, long)]
        length: Option<usize>,

        /// Return raw ciphertext instead of plaintext
        #[arg(long)]
        raw: bool,

        /// Output file path (defaults to stdout)
        #[arg(short = 'O', long)]
        output: Option<PathBuf>,
    },

    /// Copy a local file into storage
    Import {
        input: PathBuf,

        /// Name in storage (defaults to input filename)
        #[arg(short, long)]
        name: Option<String>,

        #[arg(long)]
        plain: bool,
    },

    /// Copy a stored file out as plaintext
    Export {
        name: String,

        /// Output file path (defaults to stdout)
        #[arg(short, long)]
        output: Option<PathBuf>,
    },

    /// List all stored files
    List {
        /// Show detailed information
        #[arg(short, long)]
        verbose: bool,
    },

    /// Show one file's metadata
    Stat { name: String },

    /// Remove a stored file
    Remove {
        name: String,

        /// Skip confirmation prompt
        #[arg(short = 'y', long)]
        yes: bool,
    },

    /// Show storage status and statistics
    Status,
}

#[tokio::main]
async fn main() -> Result<()> {
    // Use RUST_LOG to control log level (e.g., RUST_LOG=info,pagecrypt=debug)
    fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_target(true)
        .with_thread_ids(false)
        .init();

    let cli = Cli::parse();
    info!(command = ?cli.command, "pagecrypt starting");

    let (config, batched) = (cli.config.as_str(), cli.batched);
    match cli.command {
        Commands::Init {
            storage_dir,
            key_path,
            page_size,
        } => cmd_init(config, &storage_dir, &key_path, page_size).await,
        Commands::Create { name, plain } => cmd_create(&open_ops(config, batched).await?, &name, plain),
        Commands::Write {
            name,
            offset,
            text,
            input,
        } => cmd_write(&open_ops(config, batched).await?, &name, offset, text, input).await,
        Commands::Read {
            name,
            offset,
            length,
            raw,
            output,
        } => {
            let ops = open_ops(config, batched).await?;
            cmd_read(&ops, &name, offset, length, raw, output.as_ref()).await
        }
        Commands::Import { input, name, plain } => {
            cmd_import(&open_ops(config, batched).await?, &input, name.as_deref(), plain).await
        }
        Commands::Export { name, output } => {
            cmd_export(&open_ops(config, batched).await?, &name, output.as_ref()).await
        }
        Commands::List { verbose } => cmd_list(&open_ops(config, batched).await?, verbose),
        Commands::Stat { name } => cmd_stat(&open_ops(config, batched).await?, &name),
        Commands::Remove { name, yes } => cmd_remove(&open_ops(config, batched).await?, &name, yes),
        Commands::Status => cmd_status(config).await,
    }
}

async fn open_ops(config_path: &str, batched: bool) -> Result<SecurePageOps> {
    let mut cfg = config::Config::load(config_path)?;
    if batched {
        cfg.dispatch = Dispatch::Batched;
    }
    let km = KeyManager::new(&cfg).await?;
    Ok(SecurePageOps::from_config(km, &cfg))
}

fn mode_for(plain: bool) -> CryptMode {
    if plain {
        CryptMode::Plain
    } else {
        CryptMode::Encrypted
    }
}

/// Create a styled progress bar for file transfers
fn create_progress_bar(total: u64, message: &str) -> ProgressBar {
    let pb = ProgressBar::new(total);
    pb.set_style(
        ProgressStyle::default_bar()
            .template("{spinner:.green} [{elapsed_precise}] [{bar:40.cyan/blue}] {bytes}/{total_bytes} ({percent}%) {msg}")
            .unwrap_or_else(|_| ProgressStyle::default_bar())
            .progress_chars("#>-"),
    );
    pb.set_message(message.to_string());
    pb
}

/// Initialize configuration and generate the page key
async fn cmd_init(config_path: &str, storage_dir: &str, key_path: &str, page_size: usize) -> Result<()> {
    println!("Initializing pagecrypt storage...");

    let cfg = config::Config {
        page_size,
        ..config::Config::new(key_path, storage_dir)
    };
    cfg.validate()?;

    if fs::try_exists(config_path).await.unwrap_or(false) {
        anyhow::bail!(
            "Configuration file '{}' already exists. Remove it first or use a different path.",
            config_path
        );
    }

    if fs::try_exists(key_path).await.unwrap_or(false) {
        anyhow::bail!(
            "Key file '{}' already exists. Remove it first or use a different path.",
            key_path
        );
    }

    fs::create_dir_all(storage_dir)
        .await
        .with_context(|| format!("creating storage directory '{}'", storage_dir))?;

    // KeyManager creates the key on first use
    let _km = KeyManager::new(&cfg).await?;

    let config_json = serde_json::to_string_pretty(&cfg)?;
    fs::write(config_path, config_json)
        .await
        .with_context(|| format!("writing config to '{}'", config_path))?;

    println!("Initialization complete!");
    println!("Config:    {}", config_path);
    println!("Key:       {}", key_path);
    println!("Storage:   {}", storage_dir);
    println!("Page size: {} bytes", page_size);
    println!();
    println!("IMPORTANT: Keep your key file secure and backed up!");
    println!("Without it, your encrypted files cannot be recovered.");

    Ok(())
}

fn cmd_create(ops: &SecurePageOps, name: &str, plain: bool) -> Result<()> {
    let file = ops.create(name, mode_for(plain))?;
    println!("Created '{}' ({:?}, {}-byte pages)", name, file.mode(), file.page_size());
    Ok(())
}

async fn cmd_write(
    ops: &SecurePageOps,
    name: &str,
    offset: u64,
    text: Option<String>,
    input: Option<PathBuf>,
) -> Result<()> {
    let data = match (text, input) {
        (Some(text), _) => text.into_bytes(),
        (None, Some(path)) => fs::read(&path)
            .await
            .with_context(|| format!("reading {:?}", path))?,
        (None, None) => anyhow::bail!("nothing to write: pass --text or --input"),
    };

    let file = ops.open(name)?;
    let before = file.size();
    let written = ops.write_at(&file, offset, &data)?;
    println!(
        "Wrote {} bytes at offset {} (size {} -> {})",
        written,
        offset,
        before,
        file.size()
    );
    Ok(())
}

async fn cmd_read(
    ops: &SecurePageOps,
    name: &str,
    offset: u64,
    length: Option<usize>,
    raw: bool,
    output: Option<&PathBuf>,
) -> Result<()> {
    let file = if raw {
        ops.open_view_as_encrypted(name)?
    } else {
        ops.open(name)?
    };
    let len = match length {
        Some(len) => len,
        None => usize::try_from(file.size().saturating_sub(offset))
            .context("file is too large to read into memory")?,
    };
    let mut buf = vec![0u8; len];
    let n = ops.read_at(&file, offset, &mut buf)?;
    buf.truncate(n);

    match output {
        Some(path) => {
            fs::write(path, &buf)
                .await
                .with_context(|| format!("writing to {:?}", path))?;
            eprintln!("Read {} bytes -> {:?}", n, path);
        }
        None => {
            io::stdout().write_all(&buf)?;
            io::stdout().flush()?;
            eprintln!("Read {} bytes", n);
        }
    }
    Ok(())
}

async fn cmd_import(ops: &SecurePageOps, input: &PathBuf, name: Option<&str>, plain: bool) -> Result<()> {
    let name = match name {
        Some(name) => name.to_string(),
        None => input
            .file_name()
            .context("input file has no filename")?
            .to_string_lossy()
            .to_string(),
    };

    let total = fs::metadata(input)
        .await
        .with_context(|| format!("reading metadata for {:?}", input))?
        .len();
    let mut source = fs::File::open(input)
        .await
        .with_context(|| format!("opening {:?}", input))?;

    let file = ops.create(&name, mode_for(plain))?;
    let pb = create_progress_bar(total, "Importing");
    let mut buf = vec![0u8; TRANSFER_CHUNK];
    let mut offset = 0u64;

    loop {
        let n = source.read(&mut buf).await?;
        if n == 0 {
            break;
        }
        let written = ops.write_at(&file, offset, &buf[..n])?;
        offset += written as u64;
        pb.set_position(offset);
    }

    pb.finish_with_message(format!("Imported {} bytes", offset));
    println!("  {} -> {}", input.display(), name);
    Ok(())
}

async fn cmd_export(ops: &SecurePageOps, name: &str, output: Option<&PathBuf>) -> Result<()> {
    let file = ops.open(name)?;
    let total = file.size();
    let pb = create_progress_bar(total, "Exporting");
    let mut buf = vec![0u8; TRANSFER_CHUNK];
    let mut offset = 0u64;

    let mut sink: Box<dyn tokio::io::AsyncWrite + Unpin> = match output {
        Some(path) => Box::new(
            fs::File::create(path)
                .await
                .with_context(|| format!("creating {:?}", path))?,
        ),
        None => {
            pb.set_draw_target(indicatif::ProgressDrawTarget::hidden());
            Box::new(tokio::io::stdout())
        }
    };

    loop {
        let n = ops.read_at(&file, offset, &mut buf)?;
        if n == 0 {
            break;
        }
        sink.write_all(&buf[..n]).await?;
        offset += n as u64;
        pb.set_position(offset);
    }
    sink.flush().await?;

    pb.finish_with_message(format!("Exported {} bytes", offset));
    if output.is_none() {
        eprintln!("Exported {} bytes to stdout", offset);
    }
    Ok(())
}

fn cmd_list(ops: &SecurePageOps, verbose: bool) -> Result<()> {
    let files = ops.list_files()?;

    if files.is_empty() {
        println!("No files found");
        return Ok(());
    }

    println!("Files ({} total):", files.len());
    println!();

    if verbose {
        println!(
            "{:<32} {:>12} {:>12} {:>10} {:>8}",
            "FILENAME", "SIZE", "STORED", "MODE", "PAGE"
        );
        println!("{}", "-".repeat(78));
        for entry in files {
            match entry.metadata {
                Some(meta) => println!(
                    "{:<32} {:>12} {:>12} {:>10} {:>8}",
                    entry.name,
                    meta.size,
                    entry.stored_bytes,
                    format!("{:?}", meta.mode).to_lowercase(),
                    meta.page_size
                ),
                None => println!(
                    "{:<32} {:>12} {:>12} {:>10} {:>8}",
                    entry.name, "?", entry.stored_bytes, "no meta", "?"
                ),
            }
        }
    } else {
        for entry in files {
            let size = entry.metadata.map_or(entry.stored_bytes, |m| m.size);
            println!("  {} ({} bytes)", entry.name, size);
        }
    }

    Ok(())
}

fn cmd_stat(ops: &SecurePageOps, name: &str) -> Result<()> {
    let meta = ops.get_metadata(name)?;
    let pages = meta.size.div_ceil(meta.page_size as u64);
    println!("File:       {}", meta.filename);
    println!("Size:       {} bytes", meta.size);
    println!("Mode:       {:?}", meta.mode);
    println!("Page size:  {} bytes", meta.page_size);
    println!("Pages:      {}", pages);
    Ok(())
}

fn cmd_remove(ops: &SecurePageOps, name: &str, yes: bool) -> Result<()> {
    if !ops.exists(name) {
        anyhow::bail!("File '{}' not found in storage", name);
    }

    if !yes {
        print!("Delete '{}'? This cannot be undone. [y/N]: ", name);
        io::stdout().flush()?;

        let mut response = String::new();
        io::stdin().read_line(&mut response)?;

        if !response.trim().eq_ignore_ascii_case("y") {
            println!("Cancelled.");
            return Ok(());
        }
    }

    ops.delete_file(name)?;
    println!("Deleted '{}'", name);
    Ok(())
}

/// Show storage status and statistics
async fn cmd_status(config_path: &str) -> Result<()> {
    let cfg = config::Config::load(config_path)?;

    println!("pagecrypt Status");
    println!();
    println!("Configuration:");
    println!("  Config file:   {}", config_path);
    println!("  Key file:      {}", cfg.key_path);
    println!("  Storage dir:   {}", cfg.storage_dir);
    println!("  Page size:     {} bytes", cfg.page_size);
    println!("  Cache pages:   {}", cfg.cache_pages);
    println!("  Dispatch:      {:?}", cfg.dispatch);
    println!();

    let key_exists = fs::try_exists(&cfg.key_path).await.unwrap_or(false);
    println!("Key Status:      {}", if key_exists { "Present" } else { "Missing" });
    println!();
    if !key_exists {
        return Ok(());
    }

    let km = KeyManager::new(&cfg).await?;
    let ops = SecurePageOps::from_config(km, &cfg);
    let files = ops.list_files()?;

    let total_files = files.len();
    let logical: u64 = files.iter().filter_map(|f| f.metadata.as_ref()).map(|m| m.size).sum();
    let stored: u64 = files.iter().map(|f| f.stored_bytes).sum();
    let encrypted = files
        .iter()
        .filter(|f| f.metadata.as_ref().is_some_and(|m| m.mode.is_encrypted()))
        .count();
    let orphaned = files.iter().filter(|f| f.metadata.is_none()).count();

    println!("Storage Statistics:");
    println!("  Total files:       {}", total_files);
    println!("  Encrypted:         {}/{}", encrypted, total_files);
    println!("  Logical size:      {} bytes ({:.2} MB)", logical, logical as f64 / 1_048_576.0);
    println!("  Stored size:       {} bytes", stored);

    if orphaned > 0 {
        println!();
        println!("WARNING: {} file(s) missing metadata", orphaned);
    }

    Ok(())
}
