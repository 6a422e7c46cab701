//! `useaid` — the useai session-tracking daemon entry point.
//!
//! Grounded on `main.rs`'s startup sequencing: init tracing, resolve paths,
//! run the server until a shutdown signal, then exit. CLI surface is
//! intentionally minimal — argument parsing for the full front end is out of
//! scope (spec.md §1); this binary only knows how to run itself as the
//! daemon or print its version, which is all `ensureDaemon`-style launchers
//! need.

mod chain;
mod config_writer;
mod engine;
mod error;
mod handlers;
mod keystore;
mod paths;
mod server;
mod stats;
mod stores;
mod supervisor;

use tracing_subscriber::EnvFilter;

use paths::Paths;

fn init_tracing() {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    init_tracing();

    let mut args = std::env::args().skip(1);
    match args.next().as_deref() {
        Some("--version") | Some("-v") => {
            println!("{}", server::VERSION);
            return Ok(());
        }
        Some("recover") => {
            let paths = Paths::resolve();
            let os = supervisor::current_os();
            let home = directories::UserDirs::new()
                .map(|d| d.home_dir().to_path_buf())
                .unwrap_or_else(|| paths.base().to_path_buf());
            let unit_path = supervisor::autostart_path(os, &home);
            supervisor::recover(os, &unit_path)?;
            println!("cleared crash-loop state for {}", unit_path.display());
            return Ok(());
        }
        _ => {}
    }

    let paths = Paths::resolve();
    let port = std::env::var("USEAI_PORT")
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(server::DEFAULT_PORT);

    server::run(paths, port).await
}
