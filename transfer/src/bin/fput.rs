//! fput: the transmitter ("put") personality.

use std::process::ExitCode;

use clap::Parser;
use tracing_subscriber::EnvFilter;

use transfer::personality::{run_put, setup, Options, Personality};
use transfer::signal;

#[derive(Parser, Debug)]
#[command(name = "fput", about = "Send a bulk transfer over the fabric")]
struct Cli {
    /// Re-register payload memory regions per-transfer rather than once.
    #[arg(short = 'r')]
    reregister: bool,

    /// RDMA-contiguous mode: restrict writes to one remote segment.
    #[arg(short = 'g')]
    contiguous: bool,

    /// Peer address to connect to.
    address: String,
}

fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();

    if let Err(e) = signal::install_handlers() {
        eprintln!("fput: installing signal handlers: {}", e);
        return ExitCode::FAILURE;
    }

    let opts = Options {
        peer: Some(cli.address),
        reregister: cli.reregister,
        contiguous: cli.contiguous,
        cancel: signal::global_token(),
        ..Options::default()
    };

    let rt = match setup(Personality::Put, opts) {
        Ok(rt) => rt,
        Err(e) => {
            eprintln!("fput: {}", e);
            return ExitCode::FAILURE;
        }
    };

    match run_put(&rt) {
        Ok(0) => ExitCode::SUCCESS,
        Ok(_) => ExitCode::FAILURE,
        Err(e) => {
            eprintln!("fput: {}", e);
            ExitCode::FAILURE
        }
    }
}
