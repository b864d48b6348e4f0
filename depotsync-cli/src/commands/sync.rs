//! Sync command - one detection poll and synchronization pass.

use depotsync::tracker::Tracker;

use super::common::{runtime, CommonArgs};
use crate::error::CliError;

pub fn run(args: &CommonArgs) -> Result<(), CliError> {
    let config = args.load_config()?;
    let _logging = args.init_logging(&config)?;
    let tracker = Tracker::from_config(&config)?;

    let synced = runtime()?.block_on(tracker.sync_once())?;
    if synced.is_empty() {
        println!("Nothing to synchronize");
    } else {
        let changes: Vec<String> = synced.iter().map(|c| c.to_string()).collect();
        println!("Synchronized changes: {}", changes.join(", "));
    }
    Ok(())
}
