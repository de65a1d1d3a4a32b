pub(crate) mod command;
pub(crate) mod inspect;
pub(crate) mod listen;
pub(crate) mod read;
pub(crate) mod scan;
pub(crate) mod ui;
pub(crate) mod write;

use std::io;

use serde::Serialize;
use tracing::debug;

use crate::session::GattSession;

pub use self::command::{
    Args, Command, FakeArgs, ListenArgs, LogLevel, OutputFormat, ReadArgs, ScanArgs, TargetArgs,
    WriteArgs, WritePayload,
};

/// Disconnects, logging rather than surfacing any failure.
pub(crate) async fn close_quietly(session: &GattSession) {
    if let Err(error) = session.disconnect().await {
        debug!(%error, "session did not disconnect cleanly");
    }
}

/// Writes `value` as pretty JSON followed by a newline.
pub(crate) fn write_json<W, T>(out: &mut W, value: &T) -> anyhow::Result<()>
where
    W: io::Write,
    T: Serialize + ?Sized,
{
    serde_json::to_writer_pretty(&mut *out, value)?;
    writeln!(out)?;
    Ok(())
}
