use flexi_logger::{DeferredNow, Logger, style};
use log::Record;

use crate::Error;

/// Logs go to stderr; stdout carries command output.
pub fn init() -> Result<(), Error> {
    Logger::try_with_env_or_str("info")?
        .format(cli_format)
        .log_to_stderr()
        .start()?;

    Ok(())
}

fn cli_format(
    w: &mut dyn std::io::Write,
    now: &mut DeferredNow,
    record: &Record,
) -> std::io::Result<()> {
    let level = record.level();
    write!(
        w,
        "{} {} {}",
        now.format("%H:%M:%S%.3f"),
        style(level).paint(level.to_string()),
        record.args()
    )
}
