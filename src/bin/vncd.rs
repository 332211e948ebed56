//! vncd daemon entry point.

use clap::Parser;
use nix::sys::signal::{signal, SigHandler, Signal};
use std::net::IpAddr;
use std::time::Duration;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;
use vncd::reconcile::UpdateUsers;
use vncd::session::{SERVER_PROGRAM_VAR, SESSION_PROGRAM_VAR};
use vncd::user::SystemDirectory;
use vncd::{Config, Port, Result, Server};

/// Multi-user VNC front-end proxy.
///
/// Gives every member of GROUP a TCP listener on `PORT-BASE + uid`, accepts
/// one remote client at a time per user, launches a private back-end VNC
/// server (`$VNCD_SERVER`) and X session (`$VNCD_SESSION`) under that user's
/// identity, and relays bytes between client and back-end.
#[derive(Parser, Debug)]
#[command(name = "vncd", version, about)]
struct Args {
    /// UNIX group whose members get per-user listeners
    #[arg(short = 'g', long = "group")]
    group: String,

    /// Base listen port; a user's port is this plus their uid
    #[arg(short = 'p', long = "port", value_name = "PORT", default_value = "50000")]
    listen_base: Port,

    /// Base back-end VNC port; a user's port is this plus their uid
    #[arg(short = 'P', long = "vnc-port", value_name = "PORT", default_value = "40000")]
    vnc_base: Port,

    /// TCP user-timeout for all sockets, in seconds
    #[arg(short = 't', long = "timeout", value_name = "SECONDS", default_value_t = 60)]
    user_timeout: u64,

    /// Group re-scan period, in seconds
    #[arg(short = 'T', long = "scan-period", value_name = "SECONDS", default_value_t = 30)]
    scan_period: u64,

    /// Increase logging verbosity (-v, -vv)
    #[arg(short = 'v', long = "verbose", action = clap::ArgAction::Count)]
    verbose: u8,

    /// Bind address
    #[arg(value_name = "ADDRESS", default_value = "0.0.0.0")]
    address: IpAddr,
}

impl Args {
    fn into_config(self) -> Config {
        let mut config = Config::new(self.group);
        config.address = self.address;
        config.listen_base = self.listen_base;
        config.vnc_base = self.vnc_base;
        config.user_timeout = Duration::from_secs(self.user_timeout);
        config.scan_period = Duration::from_secs(self.scan_period);
        config.verbose = self.verbose > 0;
        config
    }
}

fn init_logging(verbose: u8) {
    let level = match verbose {
        0 => "info",
        1 => "debug",
        _ => "trace",
    };
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(format!("vncd={level},warn")));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

/// Ignores the signals the relay must not die from.
///
/// SIGPIPE: a peer closing mid-splice must surface as an error on the next
/// poll, not kill the process. SIGCHLD: back-end children are reaped either
/// by `Session::terminate` or, with the handler ignored, by the kernel.
fn ignore_signals() -> Result<()> {
    // SAFETY: replacing dispositions with SIG_IGN before the loop starts;
    // no handlers run Rust code.
    unsafe {
        signal(Signal::SIGPIPE, SigHandler::SigIgn)
            .map_err(vncd::Error::from)?;
        signal(Signal::SIGCHLD, SigHandler::SigIgn)
            .map_err(vncd::Error::from)?;
    }
    Ok(())
}

fn run(args: Args) -> Result<()> {
    let config = args.into_config();
    config.validate()?;
    ignore_signals()?;

    for var in [SERVER_PROGRAM_VAR, SESSION_PROGRAM_VAR] {
        if std::env::var_os(var).is_none() {
            warn!(var, "not set; sessions will fail to launch until it is");
        }
    }

    let mut server = Server::new()?;
    server.set_user_timeout(config.user_timeout);
    info!(
        group = %config.group,
        address = %config.address,
        listen_base = %config.listen_base,
        vnc_base = %config.vnc_base,
        "vncd starting"
    );
    let reconciler = UpdateUsers::new(Box::new(SystemDirectory), config, server.now());
    server.submit(Box::new(reconciler));
    server.run()
}

fn main() {
    let args = Args::parse();
    init_logging(args.verbose);
    if let Err(err) = run(args) {
        error!(error = %err, "fatal");
        eprintln!("vncd: {err}");
        std::process::exit(1);
    }
}
