use std::io;

use anyhow::Result;
use tracing::instrument;

use crate::app::SessionHandler;
use crate::error::GattError;
use crate::session::GattSession;

use super::ui::{CatalogReport, CatalogView, Painter, ServiceReport};
use super::{OutputFormat, close_quietly, write_json};

#[instrument(skip_all, level = "info")]
pub(crate) async fn run<W>(
    handler: SessionHandler,
    out: &mut W,
    format: OutputFormat,
    painter: &Painter,
) -> Result<()>
where
    W: io::Write,
{
    let session = handler.connect().await?;
    let report = catalog_report(&session);
    close_quietly(&session).await;
    let report = report?;

    match format {
        OutputFormat::Pretty => writeln!(out, "{}", CatalogView::new(&report, painter))?,
        OutputFormat::Json => write_json(out, &report)?,
    }
    Ok(())
}

/// Snapshots the connected device and its discovered GATT table.
pub(crate) fn catalog_report(session: &GattSession) -> Result<CatalogReport, GattError> {
    session
        .with_catalog(|catalog| {
            let owner = catalog.services_owner()?;
            let device = catalog.device(owner)?.clone();
            let services = catalog
                .services()
                .iter()
                .map(|service| ServiceReport {
                    service: service.clone(),
                    characteristics: catalog.characteristics(service.uuid()).to_vec(),
                })
                .collect();
            Some(CatalogReport { device, services })
        })
        .ok_or(GattError::NotConnected)
}
