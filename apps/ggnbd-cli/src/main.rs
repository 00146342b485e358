mod logging;
mod platform;

use anyhow::{Context, Result};
use clap::Parser;
use ggnbd_client::NbdSession;
use ggnbd_core::{Cancellation, Lifecycle, LinkConfig, Outcome};
use ggnbd_geom::GgateDevice;
use platform::HostPlatform;
use std::process::ExitCode;
use tracing::error;

#[derive(Debug, Parser)]
#[command(name = "ggnbd")]
#[command(about = "Serve a GEOM Gate device from a remote NBD export", long_about = None)]
struct Args {
    /// Stay in the foreground instead of daemonizing
    #[arg(short = 'f')]
    foreground: bool,
    /// NBD server host name or address
    host: String,
    /// NBD server port
    #[arg(default_value_t = ggnbd_proto::DEFAULT_PORT)]
    port: u16,
}

impl Args {
    fn link_config(&self) -> LinkConfig {
        let mut config = LinkConfig::new(self.host.clone(), self.port);
        config.foreground = self.foreground;
        config
    }
}

fn run(args: &Args) -> Result<Outcome> {
    ggnbd_geom::load_module().context("load geom_gate kernel module")?;
    let cancel = Cancellation::process();
    let lifecycle = Lifecycle::new(
        args.link_config(),
        GgateDevice::new(),
        NbdSession::new(cancel),
        HostPlatform,
        cancel,
    );
    Ok(lifecycle.run())
}

fn main() -> ExitCode {
    let args = Args::parse();
    if let Err(err) = logging::init(&args.host, args.port) {
        eprintln!("ggnbd: {err:#}");
        return ExitCode::FAILURE;
    }
    match run(&args) {
        Ok(outcome) if outcome.is_success() => ExitCode::SUCCESS,
        Ok(_) => ExitCode::FAILURE,
        Err(err) => {
            error!("{err:#}");
            ExitCode::FAILURE
        }
    }
}
