use std::{path::PathBuf, process::ExitCode};

use clap::Parser;
use log::info;

use blockfs::{
    compile::image_is_current, compile_to_path, fs::read_from_path, image::format::MAX_BLOCKS,
    util::sha256_file, CompileError, CompileOptions,
};

fn parse_block_size(arg: &str) -> Result<u32, String> {
    match arg.parse() {
        Ok(size @ (512 | 1024 | 2048 | 4096)) => Ok(size),
        _ => Err("must be one of 512, 1024, 2048, 4096".to_string()),
    }
}

/// Compile a directory tree into a flat block-addressed disk image
#[derive(Debug, Parser)]
#[clap(name = "fs-compiler", version)]
struct Args {
    /// The directory to compile
    source: PathBuf,
    /// Where to write the image.  An existing image is replaced only on success.
    output: PathBuf,
    /// Bytes per block
    #[clap(long, default_value = "512", value_parser = parse_block_size)]
    block_size: u32,
    /// Refuse to produce an image larger than this many blocks
    #[clap(long, default_value_t = MAX_BLOCKS as u32)]
    max_blocks: u32,
    /// Record this mtime (seconds since the epoch) for every entry.  Defaults to
    /// $SOURCE_DATE_EPOCH when set.
    #[clap(long)]
    timestamp: Option<u64>,
    /// Do nothing if the image is already newer than everything in the source
    #[clap(long)]
    if_stale: bool,
    /// Print the SHA-256 of the image to stdout
    #[clap(long)]
    digest: bool,
}

fn source_date_epoch() -> Result<Option<u64>, CompileError> {
    match std::env::var("SOURCE_DATE_EPOCH") {
        Ok(value) => value.trim().parse().map(Some).map_err(|_| {
            CompileError::InvalidOptions(format!("SOURCE_DATE_EPOCH={value:?} is not a timestamp"))
        }),
        Err(_) => Ok(None),
    }
}

fn run(args: &Args) -> Result<(), CompileError> {
    let timestamp = match args.timestamp {
        Some(timestamp) => Some(timestamp),
        None => source_date_epoch()?,
    };
    let options = CompileOptions {
        block_size: args.block_size,
        max_blocks: args.max_blocks,
        timestamp,
        ..Default::default()
    };
    options.validate()?;

    let root = read_from_path(&args.source, &options)?;

    if args.if_stale && image_is_current(&root, &args.output) {
        info!("{:?} is up to date", args.output);
    } else {
        compile_to_path(&root, &args.output, &options)?;
    }

    if args.digest {
        let digest = sha256_file(&args.output).map_err(|source| CompileError::WriteFailure {
            path: args.output.clone(),
            source,
        })?;
        println!("{}", hex::encode(digest));
    }

    Ok(())
}

fn main() -> ExitCode {
    env_logger::init();

    let args = Args::parse();
    match run(&args) {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            eprintln!("fs-compiler: {err}");
            ExitCode::from(err.exit_code())
        }
    }
}
