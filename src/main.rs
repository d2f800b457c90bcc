use argp::FromArgs;
use tracing_subscriber::EnvFilter;

pub mod cmd;
pub mod decode;
pub mod encode;
pub mod error;
pub mod graph;
pub mod rom;
pub mod sym;
pub mod typelib;
pub mod util;

#[derive(FromArgs, PartialEq, Debug)]
/// Binary-structure patch toolkit for console game images.
struct TopLevel {
    #[argp(subcommand)]
    command: SubCommand,
}

#[derive(FromArgs, PartialEq, Debug)]
#[argp(subcommand)]
enum SubCommand {
    Decode(cmd::decode::Args),
    Encode(cmd::encode::Args),
    Rom(cmd::rom::Args),
    Sym(cmd::sym::Args),
}

/// argp has no built-in version switch, so catch `--version` before the
/// parser sees the arguments.
fn parse_args() -> TopLevel {
    if matches!(std::env::args().nth(1).as_deref(), Some("--version" | "-V")) {
        println!("ptk {} {}", env!("CARGO_PKG_VERSION"), env!("GIT_COMMIT_SHA"));
        std::process::exit(0);
    }
    argp::parse_args_or_exit(argp::DEFAULT)
}

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let args = parse_args();
    let result = match args.command {
        SubCommand::Decode(c_args) => cmd::decode::run(c_args),
        SubCommand::Encode(c_args) => cmd::encode::run(c_args),
        SubCommand::Rom(c_args) => cmd::rom::run(c_args),
        SubCommand::Sym(c_args) => cmd::sym::run(c_args),
    };
    if let Err(e) = result {
        eprintln!("Failed: {e:?}");
        std::process::exit(1);
    }
}
