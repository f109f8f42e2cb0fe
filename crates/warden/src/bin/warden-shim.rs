//! warden-shim - multi-call command interceptor
//!
//! Installed as symlinks named after the programs it guards. Invoked as
//! `warden-shim <program> [args...]` it behaves as if called under that name.

use tracing_subscriber::EnvFilter;
use warden::shim::{invoked_name, Invocation, Shim, DENIED_EXIT, SHIM_BINARY};

fn main() {
    // stdout belongs to the wrapped command
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")))
        .with_writer(std::io::stderr)
        .init();

    let mut argv = std::env::args_os().map(|a| a.to_string_lossy().into_owned());
    let mut name = invoked_name(&argv.next().unwrap_or_else(|| SHIM_BINARY.to_string()));
    let mut args: Vec<String> = argv.collect();

    if name == SHIM_BINARY {
        if args.is_empty() {
            eprintln!("usage: {} <program> [args...]", SHIM_BINARY);
            std::process::exit(2);
        }
        name = invoked_name(&args.remove(0));
    }

    let runtime = match tokio::runtime::Builder::new_current_thread().enable_all().build() {
        Ok(rt) => rt,
        Err(e) => {
            eprintln!("warden: cannot start runtime, refusing to run {}: {}", name, e);
            std::process::exit(DENIED_EXIT);
        }
    };

    let code = runtime.block_on(async {
        match Shim::from_env() {
            Ok(shim) => shim.run(Invocation::classify(&name, args)).await,
            Err(e) => {
                eprintln!("warden: cannot load configuration, refusing to run {}: {:#}", name, e);
                DENIED_EXIT
            }
        }
    });
    std::process::exit(code);
}
