#![forbid(unsafe_code)]

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use serde::Serialize;
use sofs_block::BufferCache;
use sofs_fsck::CheckReport;
use sofs_mkfs::FormatOptions;
use sofs_ondisk::check_superblock;
use sofs_types::Credentials;
use std::io::Write;
use std::path::PathBuf;

// ── CLI definition ──────────────────────────────────────────────────────────

#[derive(Parser)]
#[command(name = "sofs", about = "SOFS — a UNIX-style file system in a file")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Format a backing file as a fresh SOFS volume.
    Mkfs {
        /// Path to the backing file (size must be a multiple of the block
        /// size).
        device: PathBuf,
        /// Volume name.
        #[arg(short = 'n', long = "name", default_value = "SOFS")]
        name: String,
        /// Number of inodes (default: one per eight blocks).
        #[arg(short = 'i', long = "inodes")]
        inodes: Option<u32>,
        /// Zero-fill the payload of every free data cluster.
        #[arg(short = 'z', long = "zero")]
        zero: bool,
        /// Suppress progress messages.
        #[arg(short = 'q', long = "quiet")]
        quiet: bool,
    },
    /// Run the offline consistency check.
    Fsck {
        /// Path to the backing file.
        device: PathBuf,
        /// Duplicate findings into a log file.
        #[arg(short = 'l', long = "log")]
        log: Option<PathBuf>,
        /// Output the report in JSON format.
        #[arg(long)]
        json: bool,
    },
    /// Print the superblock summary of a volume.
    Inspect {
        /// Path to the backing file.
        device: PathBuf,
        /// Output in JSON format.
        #[arg(long)]
        json: bool,
    },
}

// ── Serializable outputs ────────────────────────────────────────────────────

#[derive(Debug, Serialize)]
struct InspectOutput {
    volume_name: String,
    ntotal: u32,
    properly_unmounted: bool,
    itable_size: u32,
    itotal: u32,
    ifree: u32,
    ihead: Option<u32>,
    itail: Option<u32>,
    dzone_start: u32,
    dzone_total: u32,
    dzone_free: u32,
    retrieval_cache_occupied: usize,
    insertion_cache_occupied: usize,
    dhead: Option<u32>,
    dtail: Option<u32>,
}

// ── Main ────────────────────────────────────────────────────────────────────

fn main() {
    if let Err(error) = run() {
        eprintln!("error: {error:#}");
        std::process::exit(1);
    }
}

fn run() -> Result<()> {
    let cli = Cli::parse();
    match cli.command {
        Command::Mkfs {
            device,
            name,
            inodes,
            zero,
            quiet,
        } => mkfs_cmd(&device, name, inodes, zero, quiet),
        Command::Fsck { device, log, json } => fsck_cmd(&device, log.as_deref(), json),
        Command::Inspect { device, json } => inspect_cmd(&device, json),
    }
}

fn mkfs_cmd(
    device: &PathBuf,
    name: String,
    inodes: Option<u32>,
    zero: bool,
    quiet: bool,
) -> Result<()> {
    let opts = FormatOptions {
        volume_name: name,
        inode_count: inodes,
        zero_fill: zero,
        owner: Credentials::ROOT,
    };

    if !quiet {
        println!("Installing a SOFS file system in {}.", device.display());
    }
    let layout = sofs_mkfs::format(device, &opts)
        .with_context(|| format!("failed to format {}", device.display()))?;
    if !quiet {
        println!(
            "superblock, {} inode-table blocks ({} inodes), {} data clusters ... done.",
            layout.itable_size, layout.itotal, layout.dzone_total
        );
        println!("Formatting concluded.");
    }
    Ok(())
}

fn fsck_cmd(device: &PathBuf, log: Option<&std::path::Path>, json: bool) -> Result<()> {
    let report = sofs_fsck::check(device)
        .with_context(|| format!("failed to check {}", device.display()))?;

    if let Some(log_path) = log {
        write_log(log_path, device, &report)
            .with_context(|| format!("failed to write log file {}", log_path.display()))?;
    }

    if json {
        println!(
            "{}",
            serde_json::to_string_pretty(&report).context("serialize check report")?
        );
    } else {
        println!(
            "checked {}: {} phases run, {} findings",
            device.display(),
            report.phases_run.len(),
            report.findings.len()
        );
        for finding in &report.findings {
            println!("  {finding}");
        }
    }

    if !report.is_clean() {
        std::process::exit(2);
    }
    Ok(())
}

fn write_log(path: &std::path::Path, device: &PathBuf, report: &CheckReport) -> Result<()> {
    let mut file = std::fs::File::create(path)?;
    writeln!(
        file,
        "fsck report for {}: {} findings",
        device.display(),
        report.findings.len()
    )?;
    for finding in &report.findings {
        writeln!(file, "{finding}")?;
    }
    Ok(())
}

fn inspect_cmd(device: &PathBuf, json: bool) -> Result<()> {
    let mut cache = BufferCache::open(device)
        .with_context(|| format!("failed to open {}", device.display()))?;
    cache.load_superblock().context("failed to read superblock")?;
    let sb = cache.superblock().context("superblock unavailable")?;
    check_superblock(sb).context("not a SOFS volume")?;

    let output = InspectOutput {
        volume_name: sb.name.clone(),
        ntotal: sb.ntotal,
        properly_unmounted: sb.properly_unmounted(),
        itable_size: sb.itable_size,
        itotal: sb.itotal,
        ifree: sb.ifree,
        ihead: sb.ihead.map(|n| n.0),
        itail: sb.itail.map(|n| n.0),
        dzone_start: sb.dzone_start,
        dzone_total: sb.dzone_total,
        dzone_free: sb.dzone_free,
        retrieval_cache_occupied: sb.retrieval.occupied(),
        insertion_cache_occupied: sb.insertion.occupied(),
        dhead: sb.dhead.map(|c| c.0),
        dtail: sb.dtail.map(|c| c.0),
    };

    if json {
        println!(
            "{}",
            serde_json::to_string_pretty(&output).context("serialize output")?
        );
    } else {
        println!("SOFS volume: {}", output.volume_name);
        println!("blocks: {}", output.ntotal);
        println!("properly_unmounted: {}", output.properly_unmounted);
        println!(
            "inodes: {} total, {} free (table: {} blocks)",
            output.itotal, output.ifree, output.itable_size
        );
        println!(
            "clusters: {} total, {} free (zone starts at block {})",
            output.dzone_total, output.dzone_free, output.dzone_start
        );
        println!(
            "caches: retrieval {}/50, insertion {}/50",
            output.retrieval_cache_occupied, output.insertion_cache_occupied
        );
        println!(
            "free lists: inodes {:?} -> {:?}, clusters {:?} -> {:?}",
            output.ihead, output.itail, output.dhead, output.dtail
        );
    }
    Ok(())
}
