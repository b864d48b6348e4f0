//! Config path command.

use super::common::{display_path, CommonArgs};
use crate::error::CliError;

pub fn run(args: &CommonArgs) -> Result<(), CliError> {
    let path = args.config_path()?;
    println!("{}", display_path(&path));
    if !path.exists() {
        println!("(file does not exist, defaults are used)");
    }
    Ok(())
}
