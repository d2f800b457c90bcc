use std::{io::Write, path::PathBuf};

use anyhow::Result;
use argp::FromArgs;
use tracing::info;

use crate::{
    graph::addr::Endian,
    rom::{self, config::PatchConfig},
    util::file::{buf_writer, read_bytes},
};

#[derive(FromArgs, PartialEq, Debug)]
/// Commands for building patched ROM images.
#[argp(subcommand, name = "rom")]
pub struct Args {
    #[argp(subcommand)]
    command: SubCommand,
}

#[derive(FromArgs, PartialEq, Debug)]
#[argp(subcommand)]
enum SubCommand {
    Apply(ApplyArgs),
}

#[derive(FromArgs, PartialEq, Eq, Debug)]
/// Places encoded blobs into a copy of the base image and rewrites
/// cross-references.
#[argp(subcommand, name = "apply")]
pub struct ApplyArgs {
    #[argp(positional)]
    /// base image
    image: PathBuf,
    #[argp(option, short = 'c')]
    /// patch config YAML
    config: PathBuf,
    #[argp(option, short = 'o')]
    /// output image
    output: PathBuf,
    #[argp(switch)]
    /// treat the image as big-endian
    big_endian: bool,
}

pub fn run(args: Args) -> Result<()> {
    match args.command {
        SubCommand::Apply(c_args) => apply(c_args),
    }
}

fn apply(args: ApplyArgs) -> Result<()> {
    let config = PatchConfig::load(&args.config)?;
    let image = read_bytes(&args.image)?;
    let payloads = config
        .blocks
        .iter()
        .map(|block| read_bytes(&block.source))
        .collect::<Result<Vec<_>>>()?;
    let endian = if args.big_endian { Endian::Big } else { Endian::Little };

    let (patched, placements) = rom::apply(&image, &config, &payloads, endian)?;
    for placement in &placements {
        info!(
            "{} @ {:#010X} ({:#X} bytes)",
            placement.name, placement.address, placement.length
        );
    }

    // Written only after every block has placed; failures above leave the
    // previous output untouched.
    let mut out = buf_writer(&args.output)?;
    out.write_all(&patched)?;
    out.flush()?;
    info!("Wrote {} ({:#X} bytes)", args.output.display(), patched.len());
    Ok(())
}
