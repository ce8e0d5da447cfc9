//! fget: the receiver ("get") personality.

use std::process::ExitCode;

use clap::Parser;
use tracing_subscriber::EnvFilter;

use transfer::personality::{run_get, setup, Options, Personality};
use transfer::signal;

#[derive(Parser, Debug)]
#[command(name = "fget", about = "Receive a bulk transfer over the fabric")]
struct Cli {
    /// Address to bind.
    #[arg(short = 'b')]
    bind: Option<String>,

    /// Re-register payload memory regions per-transfer rather than once.
    #[arg(short = 'r')]
    reregister: bool,
}

fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();

    if let Err(e) = signal::install_handlers() {
        eprintln!("fget: installing signal handlers: {}", e);
        return ExitCode::FAILURE;
    }

    let opts = Options {
        bind: cli.bind,
        reregister: cli.reregister,
        cancel: signal::global_token(),
        ..Options::default()
    };

    let rt = match setup(Personality::Get, opts) {
        Ok(rt) => rt,
        Err(e) => {
            eprintln!("fget: {}", e);
            return ExitCode::FAILURE;
        }
    };

    match run_get(&rt) {
        Ok(0) => ExitCode::SUCCESS,
        Ok(_) => ExitCode::FAILURE,
        Err(e) => {
            eprintln!("fget: {}", e);
            ExitCode::FAILURE
        }
    }
}
