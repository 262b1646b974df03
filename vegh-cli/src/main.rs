/*!
Vegh CLI - command-line interface for the Vegh snapshot engine.

Packs directories into verifiable `.snap` files, inspects and restores them,
reports lines of code and uploads snapshots to a remote endpoint.
*/

use anyhow::Context;
use clap::{Parser, Subcommand};
use std::path::{Path, PathBuf};
use std::time::Instant;
use tabled::{settings::Style, Table, Tabled};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use vegh_core::{
    create_engine_from_config, init_observability, GzipCompressor, PackOptions, SnapError,
    SnapshotEngine, SnapshotMetadata, VeghConfig,
};

#[derive(Parser)]
#[command(name = "vegh")]
#[command(about = "Verifiable directory snapshots")]
#[command(version)]
struct Cli {
    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Emit logs as JSON lines
    #[arg(long, global = true)]
    json_logs: bool,

    /// Configuration file (TOML)
    #[arg(long, global = true, env = "VEGH_CONFIG")]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Pack a directory into a snapshot
    Snap {
        /// Source directory
        path: PathBuf,
        /// Output file (defaults to <folder>.snap)
        #[arg(short, long)]
        output: Option<PathBuf>,
        /// Gzip level, 0-9
        #[arg(short, long)]
        level: Option<u32>,
        /// Comment stored in the metadata
        #[arg(short, long)]
        comment: Option<String>,
        /// Force-include pattern (repeatable)
        #[arg(short, long)]
        include: Vec<String>,
        /// Exclude pattern (repeatable)
        #[arg(short, long)]
        exclude: Vec<String>,
        /// Also collect hidden files and directories
        #[arg(long)]
        hidden: bool,
    },
    /// Verify a snapshot and show its metadata
    Check {
        /// Snapshot file
        file: PathBuf,
    },
    /// List the files in a snapshot
    List {
        /// Snapshot file
        file: PathBuf,
    },
    /// Restore a snapshot into a directory
    Restore {
        /// Snapshot file
        file: PathBuf,
        /// Destination directory
        #[arg(default_value = ".")]
        out_dir: PathBuf,
    },
    /// Upload a snapshot
    Send {
        /// Snapshot file
        file: PathBuf,
        /// Target URL
        url: String,
        /// Bearer token
        #[arg(long, env = "VEGH_AUTH_TOKEN", hide_env_values = true)]
        auth: Option<String>,
        /// Upload in chunks regardless of size
        #[arg(long)]
        force_chunk: bool,
    },
    /// Count lines of code inside a snapshot
    Loc {
        /// Snapshot file
        file: PathBuf,
    },
}

#[derive(Tabled)]
struct EntryRow {
    #[tabled(rename = "Path")]
    path: String,
    #[tabled(rename = "Size")]
    size: String,
    #[tabled(rename = "Mode")]
    mode: String,
}

#[derive(Tabled)]
struct LocRow {
    #[tabled(rename = "Language")]
    language: String,
    #[tabled(rename = "Files")]
    files: u64,
    #[tabled(rename = "Lines")]
    lines: u64,
    #[tabled(rename = "Code")]
    code: u64,
    #[tabled(rename = "Comments")]
    comment: u64,
    #[tabled(rename = "Blank")]
    blank: u64,
    #[tabled(rename = "%")]
    share: String,
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    if let Err(e) = init_observability(cli.verbose, cli.json_logs) {
        eprintln!("warning: {e}");
    }

    if let Err(e) = run(cli).await {
        error!(error = %e, "command failed");
        eprintln!("Error: {e:#}");
        std::process::exit(1);
    }
}

async fn run(cli: Cli) -> anyhow::Result<()> {
    let config = load_config(cli.config.as_deref())?;

    match cli.command {
        Commands::Snap {
            path,
            output,
            level,
            comment,
            include,
            exclude,
            hidden,
        } => {
            let mut config = config;
            if let Some(level) = level {
                config.pack.compression_level = level;
            }
            config.pack.include_hidden |= hidden;
            let engine = create_engine_from_config(config)?;
            snap(&engine, &path, output, comment, include, exclude)
        }
        Commands::Check { file } => check(&create_engine_from_config(config)?, &file),
        Commands::List { file } => list(&create_engine_from_config(config)?, &file),
        Commands::Restore { file, out_dir } => restore(&create_engine_from_config(config)?, &file, &out_dir),
        Commands::Send {
            file,
            url,
            auth,
            force_chunk,
        } => send(&create_engine_from_config(config)?, &file, &url, auth.as_deref(), force_chunk).await,
        Commands::Loc { file } => loc(&create_engine_from_config(config)?, &file),
    }
}

fn load_config(path: Option<&Path>) -> anyhow::Result<VeghConfig> {
    match path {
        Some(path) => VeghConfig::from_file(path)
            .with_context(|| format!("failed to load config from {}", path.display())),
        None => Ok(VeghConfig::default()),
    }
}

fn snap(
    engine: &SnapshotEngine<GzipCompressor>,
    path: &Path,
    output: Option<PathBuf>,
    comment: Option<String>,
    include: Vec<String>,
    exclude: Vec<String>,
) -> anyhow::Result<()> {
    let output = output.unwrap_or_else(|| PathBuf::from(SnapshotMetadata::suggested_filename(path)));
    println!("Packing {} -> {}", path.display(), output.display());

    let started = Instant::now();
    let report = engine.pack(
        path,
        &output,
        &PackOptions {
            comment,
            include,
            exclude,
            ..PackOptions::default()
        },
    )?;

    println!(
        "Done! Packed {} files ({}) into {} in {:.2}s",
        report.file_count(),
        format_size(report.summary.total_bytes),
        format_size(report.summary.file_len),
        started.elapsed().as_secs_f64()
    );
    Ok(())
}

fn check(engine: &SnapshotEngine<GzipCompressor>, file: &Path) -> anyhow::Result<()> {
    match engine.check(file) {
        Ok(report) => {
            println!("Integrity verified");
            println!("  SHA256:  {}", report.digest);
            println!("  Author:  {}", report.metadata.author);
            println!("  Created: {}", format_timestamp(report.metadata.created_at));
            println!("  Tool:    {}", report.metadata.tool_version);
            println!("  Files:   {} ({})", report.entry_count, format_size(report.total_bytes));
            if let Some(comment) = &report.metadata.comment {
                println!("  Comment: {comment}");
            }
            Ok(())
        }
        Err(e @ SnapError::IntegrityCheckFailed { .. }) => {
            warn!(path = %file.display(), "integrity check failed");
            Err(e.into())
        }
        Err(e) => Err(e.into()),
    }
}

fn list(engine: &SnapshotEngine<GzipCompressor>, file: &Path) -> anyhow::Result<()> {
    let entries = engine.list(file)?;
    if entries.is_empty() {
        println!("Snapshot is empty");
        return Ok(());
    }

    let total: u64 = entries.iter().map(|e| e.size_bytes).sum();
    let count = entries.len();
    let rows: Vec<EntryRow> = entries
        .into_iter()
        .map(|e| EntryRow {
            path: e.relative_path,
            size: format_size(e.size_bytes),
            mode: format!("{:o}", e.mode),
        })
        .collect();

    let mut table = Table::new(rows);
    table.with(Style::rounded());
    println!("{table}");
    println!("{count} files, {}", format_size(total));
    Ok(())
}

fn restore(engine: &SnapshotEngine<GzipCompressor>, file: &Path, out_dir: &Path) -> anyhow::Result<()> {
    println!("Restoring {} -> {}", file.display(), out_dir.display());
    let summary = engine.restore(file, out_dir)?;
    println!(
        "Restored {} files ({})",
        summary.files,
        format_size(summary.bytes)
    );
    Ok(())
}

async fn send(
    engine: &SnapshotEngine<GzipCompressor>,
    file: &Path,
    url: &str,
    auth: Option<&str>,
    force_chunk: bool,
) -> anyhow::Result<()> {
    let size = std::fs::metadata(file)
        .with_context(|| format!("file '{}' not found", file.display()))?
        .len();
    println!("Target: {url}");
    println!("File:   {} ({})", file.display(), format_size(size));
    if auth.is_some() {
        println!("Authentication: enabled");
    }

    let cancel = CancellationToken::new();
    let ctrl_c = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("interrupt received, cancelling transfer");
            ctrl_c.cancel();
        }
    });

    let result = engine.send(file, url, auth, force_chunk, cancel).await?;
    println!(
        "Transfer complete: {} request(s), {} chunk(s)",
        result.requests,
        result.chunk_count()
    );
    if !result.response_body.trim().is_empty() {
        println!("Server response:\n{}", result.response_body.trim());
    }
    Ok(())
}

fn loc(engine: &SnapshotEngine<GzipCompressor>, file: &Path) -> anyhow::Result<()> {
    let report = engine.loc(file)?;
    let total = report.total_lines();
    if total == 0 {
        println!("No code detected (or binary only)");
        return Ok(());
    }

    let rows: Vec<LocRow> = report
        .sorted()
        .into_iter()
        .map(|(language, stats)| LocRow {
            language: language.to_string(),
            files: stats.files,
            lines: stats.lines,
            code: stats.code,
            comment: stats.comment,
            blank: stats.blank,
            share: format!("{:.1}", stats.lines as f64 * 100.0 / total as f64),
        })
        .collect();

    let mut table = Table::new(rows);
    table.with(Style::rounded());
    println!("{table}");
    println!("Total: {} lines in {} files", total, report.total_files());
    if report.binary_files > 0 {
        println!("Skipped {} binary files", report.binary_files);
    }
    Ok(())
}

fn format_size(bytes: u64) -> String {
    const UNITS: &[&str] = &["B", "KB", "MB", "GB", "TB"];
    let mut size = bytes as f64;
    let mut unit_index = 0;

    while size >= 1024.0 && unit_index < UNITS.len() - 1 {
        size /= 1024.0;
        unit_index += 1;
    }

    if unit_index == 0 {
        format!("{} {}", bytes, UNITS[unit_index])
    } else {
        format!("{:.1} {}", size, UNITS[unit_index])
    }
}

fn format_timestamp(timestamp: chrono::DateTime<chrono::Utc>) -> String {
    timestamp
        .with_timezone(&chrono::Local)
        .format("%Y-%m-%d %H:%M:%S")
        .to_string()
}
