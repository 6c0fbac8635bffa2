//! Veritree CLI
//!
//! Thin process wiring around the library: `build` streams an image through
//! the hash tree builder, `verify` opens a device and runs the metadata
//! parse plus tree walk. All logic lives in the library crate.

use std::fs::File;
use std::io::Read;
use std::path::PathBuf;

use anyhow::Context;
use clap::{Parser, Subcommand};
use tracing::info;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use veritree::verity::header::METADATA_SIZE;
use veritree::{
    EccInfo, HashAlgorithm, HashTreeBuilder, VerityHandle, VerityOpenOptions, BLOCK_SIZE,
};

// =============================================================================
// CLI Arguments
// =============================================================================

/// Veritree - verified block-storage integrity tool
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Build a hash tree over an image and print "root_hash salt"
    Build {
        /// Input image
        input: PathBuf,

        /// Output file for the serialized hash tree
        output: PathBuf,

        /// Salt as lowercase hex
        #[arg(long, env = "VERITREE_SALT")]
        salt: String,

        /// Digest algorithm
        #[arg(long, default_value = "sha256")]
        algorithm: String,

        /// Block size in bytes
        #[arg(long, default_value_t = BLOCK_SIZE)]
        block_size: u64,
    },

    /// Parse, verify and optionally self-heal verity metadata on a device
    Verify {
        /// Device or image file
        device: PathBuf,

        /// Metadata offset; defaults to the last 32 KiB of the device
        #[arg(long)]
        offset: Option<u64>,

        /// Parse metadata but skip the hash tree walk
        #[arg(long)]
        skip_tree: bool,

        /// Open read/write and rewrite corrected blocks
        #[arg(long)]
        rewrite: bool,

        /// Byte offset of the Reed-Solomon parity region, if present
        #[arg(long)]
        fec_start: Option<u64>,

        /// Parity bytes per Reed-Solomon codeword
        #[arg(long, default_value_t = 2)]
        fec_roots: u8,
    },
}

fn main() -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(fmt::layer().with_target(false))
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    match Args::parse().command {
        Command::Build {
            input,
            output,
            salt,
            algorithm,
            block_size,
        } => build(input, output, &salt, &algorithm, block_size),
        Command::Verify {
            device,
            offset,
            skip_tree,
            rewrite,
            fec_start,
            fec_roots,
        } => verify(device, offset, skip_tree, rewrite, fec_start, fec_roots),
    }
}

// =============================================================================
// Build
// =============================================================================

fn build(
    input: PathBuf,
    output: PathBuf,
    salt_hex: &str,
    algorithm: &str,
    block_size: u64,
) -> anyhow::Result<()> {
    let salt = hex::decode(salt_hex).context("salt must be lowercase hex")?;
    let algorithm = HashAlgorithm::from_name(algorithm)?;

    let mut file = File::open(&input).with_context(|| format!("opening {}", input.display()))?;
    let input_size = file.metadata()?.len();
    // Images are padded with zeros to the next block boundary.
    let expected = input_size.div_ceil(block_size) * block_size;

    let mut builder = HashTreeBuilder::new(block_size, algorithm)?;
    builder.initialize(expected, &salt)?;

    let mut buf = vec![0u8; 1 << 20];
    loop {
        let n = file.read(&mut buf)?;
        if n == 0 {
            break;
        }
        builder.update(&buf[..n])?;
    }
    builder.update_zeros(expected - input_size)?;
    builder.build()?;
    builder.write_to_file(&output)?;

    info!(
        tree_bytes = builder.tree_size(expected),
        output = %output.display(),
        "hash tree written"
    );
    println!("{} {}", builder.root_hash_hex(), salt_hex);
    Ok(())
}

// =============================================================================
// Verify
// =============================================================================

fn verify(
    device: PathBuf,
    offset: Option<u64>,
    skip_tree: bool,
    rewrite: bool,
    fec_start: Option<u64>,
    fec_roots: u8,
) -> anyhow::Result<()> {
    let options = VerityOpenOptions {
        writable: rewrite,
        skip_tree_verify: skip_tree,
    };
    let mut handle = VerityHandle::open(&device, options)
        .with_context(|| format!("opening {}", device.display()))?;

    if let Some(start) = fec_start {
        handle.attach_ecc(EccInfo::new(fec_roots, BLOCK_SIZE, start / BLOCK_SIZE, start)?)?;
    }

    let offset = offset.unwrap_or_else(|| handle.device_size().saturating_sub(METADATA_SIZE));
    handle.parse_header(offset)?;

    if handle.is_disabled() {
        println!("verity: disabled");
    } else if let Some(root) = handle.root_hash() {
        println!("root hash: {}", hex::encode(root));
    }
    println!("data size: {}", handle.data_size());
    println!("corrected errors: {}", handle.corrected_errors());
    let (healed, failed) = handle.heal_counts();
    if healed + failed > 0 {
        println!("self-heal rewrites: {healed} ok, {failed} failed");
    }
    Ok(())
}
