use std::io;

use anyhow::Result;
use tracing::instrument;

use crate::app::SessionHandler;
use crate::codec::encode_utf8;
use crate::hw::WriteMode;

use super::ui::{Painter, WriteReport, WriteView};
use super::{OutputFormat, WriteArgs, WritePayload, close_quietly, write_json};

#[instrument(skip_all, level = "info", fields(characteristic = %args.characteristic()))]
pub(crate) async fn run<W>(
    handler: SessionHandler,
    args: &WriteArgs,
    out: &mut W,
    format: OutputFormat,
    painter: &Painter,
) -> Result<()>
where
    W: io::Write,
{
    let session = handler.connect().await?;
    let characteristic = args.characteristic();
    let bytes = match args.payload() {
        WritePayload::Text(text) => encode_utf8(&text),
        WritePayload::Bytes(bytes) => bytes,
    };
    let mode = session.with_catalog(|catalog| {
        catalog
            .characteristic(characteristic)
            .map_or(WriteMode::WithResponse, |info| info.preferred_write_mode())
    });
    let written = session.write(characteristic, &bytes).await;
    close_quietly(&session).await;
    written?;

    let report = WriteReport {
        characteristic: characteristic.clone(),
        bytes_written: bytes.len(),
        mode,
    };
    match format {
        OutputFormat::Pretty => writeln!(out, "{}", WriteView::new(&report, painter))?,
        OutputFormat::Json => write_json(out, &report)?,
    }
    Ok(())
}
