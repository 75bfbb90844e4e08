// Third Party
use signal_hook::{
    consts::{SIGINT, SIGTERM},
    iterator::Signals,
};
use tracing::info;
use tracing_subscriber::EnvFilter;

/// Initialize the tracing subscriber, honoring `RUST_LOG` when set.
pub fn init_tracing(crate_name: &str, level: tracing::Level) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(format!("{}={}", crate_name, level)));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}

/// Exit promptly on SIGINT/SIGTERM. There is no graceful shutdown path: the
/// next run reconciles labels on startup, so nothing in flight is worth
/// waiting for.
pub fn setup_exit_hooks() -> Result<(), anyhow::Error> {
    let mut signals = Signals::new([SIGINT, SIGTERM])?;
    std::thread::spawn(move || {
        if let Some(signal) = signals.forever().next() {
            info!("Received signal {}, exiting", signal);
            std::process::exit(0);
        }
    });
    Ok(())
}
