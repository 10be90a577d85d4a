//! vhdx-inspect - VHDX structure inspector
//!
//! Decodes a VHDX image read-only and prints its headers, log, region table,
//! metadata, BAT and parent chain.

use anyhow::{Context, Result};
use clap::Parser;
use std::path::PathBuf;
use std::process;
use vhdx_core::ChainError;
use vhdx_decoder::{decode_path, BatEntryKind, DecodeOptions, DecodedImage, ParentLink};

#[derive(Parser, Debug)]
#[command(name = "vhdx-inspect")]
#[command(about = "Inspect the on-disk structure of a VHDX image")]
#[command(version)]
struct Cli {
    /// VHDX image to inspect
    path: PathBuf,

    /// Locate and decode parent images of differencing disks
    #[arg(short, long)]
    follow: bool,

    /// Print the state of every BAT entry instead of a summary
    #[arg(short, long)]
    blocks: bool,

    /// Emit the decoded structure as JSON
    #[arg(long)]
    json: bool,

    /// Read the image through a memory mapping
    #[arg(long)]
    mmap: bool,

    /// Maximum number of parents to decode
    #[arg(long, default_value = "16")]
    max_depth: usize,

    /// Log level
    #[arg(long, env = "RUST_LOG", default_value = "warn")]
    log_level: String,
}

impl Cli {
    fn options(&self) -> DecodeOptions {
        DecodeOptions {
            follow_parent_chain: self.follow,
            use_mmap: self.mmap,
            max_chain_depth: self.max_depth,
        }
    }
}

fn main() {
    let cli = Cli::parse();

    tracing_subscriber::fmt()
        .with_env_filter(&cli.log_level)
        .with_writer(std::io::stderr)
        .init();

    if let Err(e) = run(&cli) {
        eprintln!("Error: {:#}", e);
        process::exit(1);
    }
}

fn run(cli: &Cli) -> Result<()> {
    let image = decode_path(&cli.path, &cli.options())
        .with_context(|| format!("failed to decode {}", cli.path.display()))?;

    if cli.json {
        println!("{}", serde_json::to_string_pretty(&image)?);
    } else {
        for (depth, image) in image.chain().enumerate() {
            if depth > 0 {
                println!();
                println!("##### Parent {} #####", depth);
            }
            print_image(image, cli.blocks);
        }
        print_chain_end(image.chain_end());
    }
    Ok(())
}

fn print_image(image: &DecodedImage, blocks: bool) {
    let header = &image.headers.active.header;

    println!("=== Image ===");
    if let Some(path) = &image.path {
        println!("Path:        {}", path.display());
    }
    println!("File size:   {}", format_bytes(image.file_size));
    println!("Creator:     {}", image.identifier.creator);
    println!("Disk type:   {}", image.disk_type);
    println!();

    println!("=== Header ===");
    println!(
        "Current:     {} copy at 0x{:X}, sequence {}",
        image.headers.active.slot, image.headers.active.offset, header.sequence_number
    );
    for copy in &image.headers.copies {
        match &copy.defect {
            Some(defect) => println!("  {} copy:  invalid ({})", copy.slot, defect),
            None => println!("  {} copy:  valid", copy.slot),
        }
    }
    println!("FileWrite:   {}", header.file_write_guid);
    println!("DataWrite:   {}", header.data_write_guid);
    println!("Log GUID:    {}", header.log_guid);
    println!(
        "Log:         {} at 0x{:X}, version {}",
        format_bytes(header.log_length as u64),
        header.log_offset,
        header.log_version
    );
    println!();

    println!("=== Log ===");
    println!("State:       {:?}", image.log.state);
    println!("Applied:     {} entries", image.log.applied.len());
    for entry in &image.log.applied {
        println!(
            "  seq {:<10} at 0x{:<8X} {} data, {} zero",
            entry.sequence_number, entry.log_offset, entry.data_descriptors, entry.zero_descriptors
        );
    }
    if let Some(stop) = &image.log.stop {
        println!("Stopped:     0x{:X}: {}", stop.log_offset, stop.reason);
    }
    println!();

    println!("=== Region Table ===");
    println!(
        "Copy:        {}{}",
        image.region_table.slot,
        if image.region_table.copies_agree {
            ""
        } else {
            " (copies differ)"
        }
    );
    println!("{:<38} {:<10} {:<12} {:<12} {}", "GUID", "Kind", "Offset", "Length", "Required");
    println!("{}", "-".repeat(84));
    for region in &image.region_table.entries {
        println!(
            "{:<38} {:<10} {:<12} {:<12} {}",
            region.guid.to_string(),
            format!("{:?}", region.kind),
            format!("0x{:X}", region.file_offset),
            format_bytes(region.length as u64),
            if region.required { "Yes" } else { "No" }
        );
    }
    println!();

    let metadata = &image.metadata;
    println!("=== Metadata ===");
    println!("Block size:  {}", format_bytes(metadata.file_parameters.block_size as u64));
    println!("Virtual:     {}", format_bytes(metadata.virtual_disk_size));
    println!("Logical:     {} bytes/sector", metadata.logical_sector_size);
    if let Some(physical) = metadata.physical_sector_size {
        println!("Physical:    {} bytes/sector", physical);
    }
    if let Some(id) = metadata.virtual_disk_id {
        println!("Disk ID:     {}", id);
    }
    if let Some(locator) = &metadata.parent_locator {
        println!("Locator:     {}", locator.locator_type);
        for entry in &locator.entries {
            println!("  {} = {}", entry.key, entry.value);
        }
    }
    for item in &metadata.unknown_items {
        println!("Unknown:     {} ({} bytes)", item.item_id, item.length);
    }
    println!();

    let geometry = &image.bat.geometry;
    println!("=== BAT ===");
    println!(
        "Entries:     {} ({} payload, {} sector bitmap, chunk ratio {})",
        geometry.total_entries,
        geometry.payload_blocks,
        geometry.total_entries - geometry.payload_blocks,
        geometry.chunk_ratio
    );

    if blocks {
        println!("{:<10} {:<16} {:<20} {}", "Index", "Kind", "State", "Offset");
        println!("{}", "-".repeat(60));
        for entry in &image.bat.entries {
            let kind = match entry.kind {
                BatEntryKind::Payload { block } => format!("payload {}", block),
                BatEntryKind::SectorBitmap { chunk } => format!("bitmap {}", chunk),
            };
            println!(
                "{:<10} {:<16} {:<20} 0x{:X}",
                entry.index,
                kind,
                entry.state.to_string(),
                entry.file_offset()
            );
        }
    } else {
        let summary = image.bat.summary();
        for (state, count) in &summary.payload {
            println!("  payload {:<20} {}", state, count);
        }
        for (state, count) in &summary.sector_bitmap {
            println!("  bitmap  {:<20} {}", state, count);
        }
    }
}

fn print_chain_end(link: &ParentLink) {
    match link {
        ParentLink::Absent | ParentLink::Decoded(_) => {}
        ParentLink::NotRequested => {
            println!();
            println!("Parent chain not followed (use --follow)");
        }
        ParentLink::Unresolved(error) => {
            println!();
            println!("Parent chain unresolved: {}", error);
            if let ChainError::ParentNotFound { attempts } = error {
                for attempt in attempts {
                    println!("  {}: {}", attempt.path.display(), attempt.reason);
                }
            }
        }
    }
}

fn format_bytes(bytes: u64) -> String {
    if bytes < 1024 {
        format!("{} B", bytes)
    } else if bytes < 1_048_576 {
        format!("{:.2} KB", bytes as f64 / 1024.0)
    } else if bytes < 1_073_741_824 {
        format!("{:.2} MB", bytes as f64 / 1_048_576.0)
    } else {
        format!("{:.2} GB", bytes as f64 / 1_073_741_824.0)
    }
}
