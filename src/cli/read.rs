use std::io;

use anyhow::Result;
use tracing::instrument;

use crate::app::SessionHandler;
use crate::catalog::{Entity, EntityId};
use crate::codec::decode_display;

use super::ui::{Painter, ReadReport, ReadView};
use super::{OutputFormat, ReadArgs, close_quietly, write_json};

#[instrument(skip_all, level = "info", fields(characteristic = %args.characteristic()))]
pub(crate) async fn run<W>(
    handler: SessionHandler,
    args: &ReadArgs,
    out: &mut W,
    format: OutputFormat,
    painter: &Painter,
) -> Result<()>
where
    W: io::Write,
{
    let session = handler.connect().await?;
    let characteristic = args.characteristic();
    let name = match session.lookup(&EntityId::Characteristic(characteristic.clone())) {
        Some(Entity::Characteristic(info)) => info.name().to_string(),
        _ => characteristic.to_string(),
    };
    let value = session.read(characteristic).await;
    close_quietly(&session).await;

    let report = ReadReport {
        characteristic: characteristic.clone(),
        name,
        decoded: decode_display(&value?),
    };
    match format {
        OutputFormat::Pretty => writeln!(out, "{}", ReadView::new(&report, painter))?,
        OutputFormat::Json => write_json(out, &report)?,
    }
    Ok(())
}
