//! Blobcask CLI
//!
//! Operates on a local store root: write payloads, read them back by
//! handle, delete, list, and inspect.

use anyhow::{Context, Result};
use blobcask_common::StoreConfig;
use blobcask_engine::Store;
use clap::{Parser, Subcommand};
use std::io::{Read, Write};
use std::path::PathBuf;

#[derive(Parser, Debug)]
#[command(name = "blobcask-cli")]
#[command(about = "Blobcask content-addressed blob store CLI")]
#[command(version)]
struct Args {
    /// Store root directory
    #[arg(short, long, env = "BLOBCASK_ROOT")]
    root: PathBuf,

    /// JSON config file; overrides flag defaults except the root
    #[arg(long)]
    config: Option<PathBuf>,

    /// Deduplicate identical payloads by content hash
    #[arg(long)]
    check_same: bool,

    /// Enable in-place overwrite support (fixed block size)
    #[arg(long)]
    fixed_block_size: bool,

    /// Log level
    #[arg(long, default_value = "warn")]
    log_level: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Write a file (or stdin) and print the new handle
    Write {
        /// Input file; stdin when omitted
        file: Option<PathBuf>,
        /// Overwrite this handle's extent in place
        #[arg(long)]
        handle: Option<String>,
    },
    /// Read a handle's payload to a file (or stdout)
    Read {
        handle: String,
        /// Offset into the payload
        #[arg(long)]
        offset: Option<u64>,
        /// Number of bytes to read
        #[arg(long)]
        length: Option<u64>,
        /// Output file; stdout when omitted
        #[arg(long)]
        out: Option<PathBuf>,
    },
    /// Delete a handle
    Delete { handle: String },
    /// List handles, newest first
    List {
        #[arg(long, default_value_t = 1)]
        page: usize,
        #[arg(long, default_value_t = 20)]
        page_size: usize,
    },
    /// Show a handle's metadata
    Stat { handle: String },
}

fn main() -> Result<()> {
    let args = Args::parse();

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(&args.log_level)),
        )
        .init();

    let cfg = load_config(&args)?;
    let store = Store::open(cfg).context("failed to open store")?;

    match args.command {
        Commands::Write { file, handle } => {
            let payload = match file {
                Some(path) => std::fs::read(&path)
                    .with_context(|| format!("failed to read {}", path.display()))?,
                None => {
                    let mut buf = Vec::new();
                    std::io::stdin().read_to_end(&mut buf)?;
                    buf
                }
            };
            let handle = store.write(&payload, handle.as_deref())?;
            println!("{handle}");
        }
        Commands::Read {
            handle,
            offset,
            length,
            out,
        } => {
            let data = store.read(&handle, offset, length)?;
            match out {
                Some(path) => std::fs::write(&path, &data)
                    .with_context(|| format!("failed to write {}", path.display()))?,
                None => std::io::stdout().write_all(&data)?,
            }
        }
        Commands::Delete { handle } => {
            store.delete(&handle)?;
            println!("deleted {handle}");
        }
        Commands::List { page, page_size } => {
            let (total, records) = store.list_by_time(page, page_size)?;
            println!("{total} handle(s) total");
            for info in records {
                println!(
                    "{}\t{}\t{} bytes\tchunk {} @ {}\t{}",
                    info.handle,
                    info.content_type,
                    info.size,
                    info.chunk_id,
                    info.offset,
                    info.created_at
                );
            }
        }
        Commands::Stat { handle } => {
            let info = store.stat(&handle)?;
            println!("handle:       {}", info.handle);
            println!("content hash: {}", info.content_hash);
            println!("content type: {}", info.content_type);
            println!("size:         {} bytes", info.size);
            println!("blocks:       {} bytes", info.blocks);
            println!("extent:       chunk {} @ offset {}", info.chunk_id, info.offset);
            println!("created at:   {}", info.created_at);
        }
    }

    store.shutdown();
    Ok(())
}

fn load_config(args: &Args) -> Result<StoreConfig> {
    let mut cfg = match &args.config {
        Some(path) => {
            let text = std::fs::read_to_string(path)
                .with_context(|| format!("failed to read {}", path.display()))?;
            serde_json::from_str(&text).context("invalid config file")?
        }
        None => StoreConfig::new(&args.root),
    };
    cfg.data_path = args.root.clone();
    if args.check_same {
        cfg.check_same = true;
    }
    if args.fixed_block_size {
        cfg.fixed_block_size = true;
    }
    Ok(cfg)
}
