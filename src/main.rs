//! Binary entry point: parses the CLI (spec section 6), wires up logging,
//! builds the run configuration, and hands off to the control loop. Exit
//! code mirrors the target child's (spec section 6: "the optimizer's own
//! exit status follows the child's, except for setup failures which exit
//! non-zero before any child is launched").

#[macro_use]
extern crate log;

use std::sync::atomic::{AtomicI32, Ordering};
use std::sync::Arc;

use clap::Parser;

use numa_optimizer::config::{Cli, RunConfig};
use numa_optimizer::control_loop::OptimizerState;
use numa_optimizer::verbosity;

fn main() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("warn")).init();

    let cli = Cli::parse();
    let config = RunConfig::from(cli);
    verbosity::set_level(config.verbose);

    let caught_signal = Arc::new(AtomicI32::new(0));
    register_signal_handlers(&caught_signal);

    let state = match OptimizerState::setup(config) {
        Ok(s) => s,
        Err(e) => {
            eprintln!("setup failed: {}", e);
            std::process::exit(1);
        }
    };

    let signal_flag = caught_signal.clone();
    match state.run(move || match signal_flag.load(Ordering::Relaxed) {
        0 => None,
        sig => Some(sig),
    }) {
        Ok(code) => std::process::exit(code),
        Err(e) => {
            eprintln!("fatal error: {}", e);
            std::process::exit(1);
        }
    }
}

/// Registers SIGTERM/SIGINT so a caught signal ends the loop after its
/// in-flight tick rather than tearing the process down mid-tick, and records
/// which signal fired so shutdown can forward the same one to every tracked
/// TID (spec section 5: "on SIGTERM/SIGINT it propagates the signal to every
/// filtered TID then performs the same shutdown"). SIGCHLD needs no handler
/// of its own: `Child::poll_exit` reaps the child non-blockingly every tick.
fn register_signal_handlers(caught_signal: &Arc<AtomicI32>) {
    for sig in [signal_hook::consts::SIGTERM, signal_hook::consts::SIGINT] {
        let flag = caught_signal.clone();
        let result = unsafe {
            signal_hook::low_level::register(sig, move || {
                flag.store(sig, Ordering::SeqCst);
            })
        };
        if let Err(e) = result {
            warn!("failed to register signal handler for {}: {}", sig, e);
        }
    }
}
