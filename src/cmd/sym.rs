use std::path::PathBuf;

use anyhow::Result;
use argp::FromArgs;
use tracing::info;

use crate::{
    sym::{self, SymbolChange, SymbolTable},
    util::{
        file::{buf_reader, process_globs},
        manifest::Manifest,
    },
};

#[derive(FromArgs, PartialEq, Debug)]
/// Commands for reconciling symbols across engine builds.
#[argp(subcommand, name = "sym")]
pub struct Args {
    #[argp(subcommand)]
    command: SubCommand,
}

#[derive(FromArgs, PartialEq, Debug)]
#[argp(subcommand)]
enum SubCommand {
    Diff(DiffArgs),
    Apply(ApplyArgs),
}

#[derive(FromArgs, PartialEq, Eq, Debug)]
/// Reports renames and removals between two build manifests.
#[argp(subcommand, name = "diff")]
pub struct DiffArgs {
    #[argp(positional)]
    /// manifest of the old build
    old: PathBuf,
    #[argp(positional)]
    /// manifest of the new build
    new: PathBuf,
}

#[derive(FromArgs, PartialEq, Eq, Debug)]
/// Propagates renames between two builds through a corpus of text patches.
#[argp(subcommand, name = "apply")]
pub struct ApplyArgs {
    #[argp(positional)]
    /// manifest of the old build
    old: PathBuf,
    #[argp(positional)]
    /// manifest of the new build
    new: PathBuf,
    #[argp(option, short = 'c')]
    /// corpus files (globs and @response files); may be given multiple times
    corpus: Vec<PathBuf>,
}

pub fn run(args: Args) -> Result<()> {
    match args.command {
        SubCommand::Diff(c_args) => diff(c_args),
        SubCommand::Apply(c_args) => apply(c_args),
    }
}

fn load_tables(old: &PathBuf, new: &PathBuf) -> Result<(SymbolTable, SymbolTable)> {
    let old_manifest = Manifest::parse(buf_reader(old)?, &old.display().to_string())?;
    let new_manifest = Manifest::parse(buf_reader(new)?, &new.display().to_string())?;
    Ok((SymbolTable::from_manifest(&old_manifest), SymbolTable::from_manifest(&new_manifest)))
}

fn diff(args: DiffArgs) -> Result<()> {
    let (old, new) = load_tables(&args.old, &args.new)?;
    let changes = sym::diff(&old, &new);
    let mut renamed = 0usize;
    let mut removed = 0usize;
    for (address, change) in &changes {
        match change {
            SymbolChange::Unchanged => {}
            SymbolChange::Renamed(new_name) => {
                println!(
                    "{address:08X}: {} -> {new_name}",
                    old.name_of(*address).unwrap_or("?")
                );
                renamed += 1;
            }
            SymbolChange::Removed => {
                println!("{address:08X}: {} removed", old.name_of(*address).unwrap_or("?"));
                removed += 1;
            }
        }
    }
    info!(
        "{} unchanged, {renamed} renamed, {removed} removed",
        changes.len() - renamed - removed
    );
    Ok(())
}

fn apply(args: ApplyArgs) -> Result<()> {
    let (old, new) = load_tables(&args.old, &args.new)?;
    let changes = sym::diff(&old, &new);
    let pairs = sym::rename_pairs(&old, &changes);
    if pairs.is_empty() {
        info!("No renames to propagate");
        return Ok(());
    }
    let paths = process_globs(&args.corpus)?;
    let report = sym::apply_renames(&paths, &pairs)?;
    let total: usize = report.iter().map(|(_, count)| count).sum();
    info!("{} replacement(s) across {} file(s)", total, report.len());
    Ok(())
}
