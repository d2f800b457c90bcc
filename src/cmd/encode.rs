use std::{io::Write, path::PathBuf};

use anyhow::Result;
use argp::FromArgs;
use tracing::info;

use crate::{
    encode::{
        expr::{EnumTable, MarkerLookup, MarkerTable, NoLookup, ProjectDatabase},
        Encoder,
    },
    graph::addr::Endian,
    typelib::TypeLibrary,
    util::{
        file::{buf_reader, buf_writer, read_string},
        manifest::Manifest,
        parse_hex_arg,
    },
};

#[derive(FromArgs, PartialEq, Eq, Debug)]
/// Re-encodes an edited text patch into a binary blob plus a fresh manifest.
#[argp(subcommand, name = "encode")]
pub struct Args {
    #[argp(positional)]
    /// text patch to encode
    text: PathBuf,
    #[argp(option, short = 'b', from_str_fn(parse_hex_arg))]
    /// base address for structures placed fresh
    base: u32,
    #[argp(option, short = 'o')]
    /// output blob file
    output: PathBuf,
    #[argp(option, short = 'm')]
    /// output manifest file
    manifest: PathBuf,
    #[argp(option, short = 'p')]
    /// previous manifest, for address stability
    previous: Option<PathBuf>,
    #[argp(option, short = 't')]
    /// type library YAML (defaults to the built-in library)
    typelib: Option<PathBuf>,
    #[argp(option)]
    /// marker table (Name = x y z lines) for $Marker.* expressions
    markers: Option<PathBuf>,
    #[argp(option)]
    /// enum table (NAME = value lines) for $Enum: expressions
    enums: Option<PathBuf>,
    #[argp(switch)]
    /// emit big-endian scalars
    big_endian: bool,
}

pub fn run(args: Args) -> Result<()> {
    let library = match &args.typelib {
        Some(path) => TypeLibrary::load(buf_reader(path)?)?,
        None => TypeLibrary::builtin()?,
    };
    let previous = match &args.previous {
        Some(path) => {
            Some(Manifest::parse(buf_reader(path)?, &path.display().to_string())?)
        }
        None => None,
    };
    let markers: Box<dyn MarkerLookup> = match &args.markers {
        Some(path) => {
            Box::new(MarkerTable::parse(buf_reader(path)?, &path.display().to_string())?)
        }
        None => Box::new(NoLookup),
    };
    let database: Box<dyn ProjectDatabase> = match &args.enums {
        Some(path) => {
            Box::new(EnumTable::parse(buf_reader(path)?, &path.display().to_string())?)
        }
        None => Box::new(NoLookup),
    };

    let text = read_string(&args.text)?;
    let source = args.text.display().to_string();
    let encoder = Encoder {
        library: &library,
        base_address: args.base,
        endian: if args.big_endian { Endian::Big } else { Endian::Little },
        markers: markers.as_ref(),
        database: database.as_ref(),
    };
    let encoded = encoder.encode(&text, &source, previous.as_ref())?;
    info!(
        "Encoded {} structure(s) into {} bytes",
        encoded.manifest.structures().count(),
        encoded.blob.len()
    );

    let mut blob_out = buf_writer(&args.output)?;
    blob_out.write_all(&encoded.blob)?;
    blob_out.flush()?;
    let mut manifest_out = buf_writer(&args.manifest)?;
    encoded.manifest.write(&mut manifest_out)?;
    manifest_out.flush()?;
    Ok(())
}
