//! Status command - print cursors and queued changes from the store.

use depotsync::model::ChangeNumber;
use depotsync::store::LocalStore;
use depotsync::tracker::{read_status, TrackerError, TrackerStatus};

use super::common::{display_path, CommonArgs};
use crate::error::CliError;

fn cursor(value: Option<ChangeNumber>) -> String {
    value
        .map(|c| c.to_string())
        .unwrap_or_else(|| "(none)".to_string())
}

fn render(status: &TrackerStatus) -> String {
    let pending = if status.pending.is_empty() {
        "(none)".to_string()
    } else {
        status
            .pending
            .iter()
            .map(|c| c.to_string())
            .collect::<Vec<_>>()
            .join(", ")
    };
    format!(
        "App:                {}\nLast seen change:   {}\nLast synced change: {}\nPending changes:    {}",
        status.app,
        cursor(status.last_seen),
        cursor(status.last_synced),
        pending
    )
}

pub fn run(args: &CommonArgs) -> Result<(), CliError> {
    let config = args.load_config()?;
    let app = config.require_app()?;
    let path = config.paths.store_file();
    let store = LocalStore::open(&path).map_err(TrackerError::from)?;
    let status = read_status(&store, app)?;

    println!("Store:              {}", display_path(&path));
    println!("{}", render(&status));
    Ok(())
}
