use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::Parser;

use blockfs::image::{debug::dump_image, extract::extract, reader::Image};

/// Produce a detailed dump of an image
///
/// The output lists every region of the image in block order, labelled with the path that owns
/// it, so that diffing the dumps of two images shows exactly where they differ.
#[derive(Debug, Parser)]
#[clap(name = "blockfs-dump", version)]
struct Args {
    /// The path to the image file to dump
    image: PathBuf,
    /// Also unpack the image into this (existing) directory
    #[clap(long)]
    extract: Option<PathBuf>,
}

fn main() -> Result<()> {
    env_logger::init();

    let args = Args::parse();
    let data = std::fs::read(&args.image).with_context(|| format!("Reading {:?}", args.image))?;

    dump_image(&mut std::io::stdout().lock(), &data)?;

    if let Some(dest) = &args.extract {
        extract(&Image::open(&data)?, dest)?;
    }

    Ok(())
}
