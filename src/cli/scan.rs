use std::io;

use anyhow::Result;
use tokio_stream::StreamExt;
use tracing::{debug, instrument};

use crate::catalog::CatalogDevice;
use crate::error::GattError;
use crate::session::GattSession;

use super::ui::{DeviceListView, Painter};
use super::{OutputFormat, ScanArgs, write_json};

/// Scans until the scan window closes or Ctrl+C, then lists what was found.
#[instrument(skip_all, level = "info", fields(name_prefix = ?args.name_prefix()))]
pub(crate) async fn run<W>(
    session: &GattSession,
    args: &ScanArgs,
    out: &mut W,
    format: OutputFormat,
    painter: &Painter,
) -> Result<()>
where
    W: io::Write,
{
    let mut results = session.start_scan().await?;
    let mut reported = 0_usize;
    let interrupted = loop {
        tokio::select! {
            signal = tokio::signal::ctrl_c() => {
                signal.map_err(|source| GattError::CtrlC { source })?;
                break true;
            }
            maybe_device = results.next() => match maybe_device {
                Some(device) => {
                    reported += 1;
                    debug!(device = %device.device_id(), reported, "scan reported device");
                }
                None => break false,
            },
        }
    };
    drop(results);

    if interrupted {
        session.stop_scan().await?;
    }

    let devices: Vec<CatalogDevice> = session
        .devices()
        .into_iter()
        .filter(|entry| {
            args.name_prefix()
                .is_none_or(|prefix| entry.device().local_name_starts_with(prefix))
        })
        .collect();

    match format {
        OutputFormat::Pretty => writeln!(out, "{}", DeviceListView::new(&devices, painter))?,
        OutputFormat::Json => write_json(out, &devices)?,
    }
    Ok(())
}
