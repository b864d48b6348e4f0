//! Run command - watch the app until interrupted.

use depotsync::tracker::Tracker;
use tokio_util::sync::CancellationToken;
use tracing::info;

use super::common::{runtime, CommonArgs};
use crate::error::CliError;

/// Run the watch loop.
pub fn run(args: &CommonArgs) -> Result<(), CliError> {
    let config = args.load_config()?;
    let _logging = args.init_logging(&config)?;
    let tracker = Tracker::from_config(&config)?;

    let shutdown = CancellationToken::new();
    let signal = shutdown.clone();
    ctrlc::set_handler(move || {
        println!();
        println!("Received shutdown signal, finishing active synchronization...");
        signal.cancel();
    })
    .map_err(|e| CliError::Config(format!("Failed to set signal handler: {}", e)))?;

    runtime()?.block_on(async {
        tracker.start().await?;
        println!("Watching app {} (Ctrl+C to stop)", tracker.app());

        shutdown.cancelled().await;
        tracker.shutdown().await;
        info!("Shutdown complete");
        Ok::<(), CliError>(())
    })
}
