use std::{collections::BTreeMap, io::Write, path::PathBuf};

use anyhow::{bail, Result};
use argp::FromArgs;
use tracing::info;

use crate::{
    decode::{build_manifest, write_text, Decoder, Root},
    graph::addr::{AddressSpace, Endian},
    typelib::TypeLibrary,
    util::{
        file::{buf_reader, buf_writer, parse_rename_map, read_bytes},
        parse_hex_arg,
    },
};

#[derive(FromArgs, PartialEq, Eq, Debug)]
/// Decodes a binary blob into editable text plus a symbol manifest.
#[argp(subcommand, name = "decode")]
pub struct Args {
    #[argp(positional)]
    /// binary blob to decode
    blob: PathBuf,
    #[argp(option, short = 'b', from_str_fn(parse_hex_arg))]
    /// base address of the blob
    base: u32,
    #[argp(option, short = 'r')]
    /// root structure (Type:ADDRESS); may be given multiple times
    root: Vec<String>,
    #[argp(option, short = 'o')]
    /// output text file
    output: PathBuf,
    #[argp(option, short = 'm')]
    /// output manifest file
    manifest: PathBuf,
    #[argp(option, short = 't')]
    /// type library YAML (defaults to the built-in library)
    typelib: Option<PathBuf>,
    #[argp(option)]
    /// rename map (ADDRESS = Name lines)
    renames: Option<PathBuf>,
    #[argp(switch)]
    /// treat the blob as big-endian
    big_endian: bool,
}

pub fn run(args: Args) -> Result<()> {
    if args.root.is_empty() {
        bail!("at least one --root is required");
    }
    let roots = args.root.iter().map(|r| Root::parse(r)).collect::<Result<Vec<_>>>()?;
    let library = match &args.typelib {
        Some(path) => TypeLibrary::load(buf_reader(path)?)?,
        None => TypeLibrary::builtin()?,
    };
    let renames = match &args.renames {
        Some(path) => parse_rename_map(path)?,
        None => BTreeMap::new(),
    };
    let data = read_bytes(&args.blob)?;
    let endian = if args.big_endian { Endian::Big } else { Endian::Little };
    let space = AddressSpace::new(args.base, data.len() as u32);

    let decoder = Decoder::new(&data, space, endian, &library, &renames);
    let output = decoder.decode(&roots)?;
    info!("Decoded {} structure(s) from {}", output.graph.len(), args.blob.display());

    let manifest = build_manifest(&output.graph, &space)?;
    let mut text_out = buf_writer(&args.output)?;
    write_text(&mut text_out, &output.graph, &library, &data, &space)?;
    text_out.flush()?;
    let mut manifest_out = buf_writer(&args.manifest)?;
    manifest.write(&mut manifest_out)?;
    manifest_out.flush()?;

    if !output.failures.is_empty() {
        for failure in &output.failures {
            eprintln!(
                "Root {} @ {:#010X} failed: {:?}",
                failure.root.type_name, failure.root.address, failure.error
            );
        }
        bail!("{} root(s) failed to decode", output.failures.len());
    }
    Ok(())
}
