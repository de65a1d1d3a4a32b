use std::io;

use anyhow::Result;
use tokio::sync::mpsc;
use tracing::{debug, instrument};

use crate::app::SessionHandler;
use crate::error::GattError;
use crate::hub::ValueEvent;

use super::ui::{ListenStopReason, ListenSummary, ListenSummaryView, NotificationView, Painter};
use super::{ListenArgs, OutputFormat, close_quietly};

/// Prints notifications until the limit, Ctrl+C, or the link going away.
#[instrument(
    skip_all,
    level = "info",
    fields(characteristic = %args.characteristic(), max = ?args.max_notifications())
)]
pub(crate) async fn run<W>(
    handler: SessionHandler,
    args: &ListenArgs,
    out: &mut W,
    format: OutputFormat,
    painter: &Painter,
) -> Result<()>
where
    W: io::Write,
{
    let session = handler.connect().await?;
    let characteristic = args.characteristic();

    let (sender, mut receiver) = mpsc::unbounded_channel::<ValueEvent>();
    let subscribed = session
        .subscribe(characteristic, move |event: &ValueEvent| -> Result<()> {
            sender.send(event.clone())?;
            Ok(())
        })
        .await;
    if let Err(error) = subscribed {
        close_quietly(&session).await;
        return Err(error.into());
    }

    let mut printer = NotificationPrinter {
        out: &mut *out,
        format,
        painter,
        received: 0,
    };
    let outcome = printer
        .print_until_stopped(&mut receiver, args.max_notifications())
        .await;
    let received = printer.received;

    if let Err(error) = session.unsubscribe(characteristic).await {
        debug!(%error, "unsubscribe failed during listen shutdown");
    }
    close_quietly(&session).await;

    let summary = ListenSummary {
        characteristic: characteristic.clone(),
        received,
        stop_reason: outcome?,
    };
    match format {
        OutputFormat::Pretty => writeln!(out, "{}", ListenSummaryView::new(&summary, painter))?,
        OutputFormat::Json => writeln!(out, "{}", serde_json::to_string(&summary)?)?,
    }
    Ok(())
}

struct NotificationPrinter<'a, W> {
    out: &'a mut W,
    format: OutputFormat,
    painter: &'a Painter,
    received: usize,
}

impl<W> NotificationPrinter<'_, W>
where
    W: io::Write,
{
    async fn print_until_stopped(
        &mut self,
        receiver: &mut mpsc::UnboundedReceiver<ValueEvent>,
        limit: Option<usize>,
    ) -> Result<ListenStopReason> {
        if self.format == OutputFormat::Pretty {
            writeln!(self.out, "{}", self.painter.title("Listening..."))?;
        }

        loop {
            tokio::select! {
                signal = tokio::signal::ctrl_c() => {
                    signal.map_err(|source| GattError::CtrlC { source })?;
                    return Ok(ListenStopReason::Interrupted);
                }
                maybe_event = receiver.recv() => {
                    let Some(event) = maybe_event else {
                        return Ok(ListenStopReason::SubscriptionEnded);
                    };
                    self.print(&event)?;
                    if let Some(limit) = limit
                        && self.received >= limit
                    {
                        return Ok(ListenStopReason::ReachedLimit);
                    }
                }
            }
        }
    }

    fn print(&mut self, event: &ValueEvent) -> Result<()> {
        self.received += 1;
        match self.format {
            OutputFormat::Pretty => {
                writeln!(self.out, "{}", NotificationView::new(event, self.painter))?;
            }
            OutputFormat::Json => writeln!(self.out, "{}", serde_json::to_string(event)?)?,
        }
        Ok(())
    }
}
