use anyhow::Context;
use tracing::{info, Level};

use portico::cgi::spawn::CommandSpawner;
use portico::config::Config;
use portico::event::select_backend;
use portico::server::dispatcher::Dispatcher;
use portico::signals::SignalFlags;

fn main() -> anyhow::Result<()> {
    let path = Config::resolve_path(std::env::args().nth(1));
    let cfg = Config::load(&path)?;

    let level: Level = cfg.log_level.parse().unwrap_or(Level::INFO);
    tracing_subscriber::fmt()
        .with_target(false)
        .with_level(true)
        .with_max_level(level)
        .init();

    info!(config = %path.display(), "starting portico");

    let signals = SignalFlags::install().context("installing signal handlers")?;
    let backend = select_backend(cfg.event_backend).context("creating readiness backend")?;
    let mut dispatcher = Dispatcher::new(&cfg, backend, Box::new(CommandSpawner))?;

    dispatcher.run(&signals.shutdown, &signals.child)?;

    info!("Shutdown complete");
    Ok(())
}
