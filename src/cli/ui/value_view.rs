use std::fmt::{self, Display, Formatter};

use serde::Serialize;

use crate::codec::DecodedValue;
use crate::hub::ValueEvent;
use crate::hw::{CharacteristicId, WriteMode};
use crate::utils::format_optional;

use super::painter::Painter;
use super::table::Table;

/// Result of a single characteristic read.
#[derive(Debug, Serialize)]
pub(crate) struct ReadReport {
    pub(crate) characteristic: CharacteristicId,
    pub(crate) name: String,
    pub(crate) decoded: DecodedValue,
}

pub(crate) struct ReadView<'a> {
    report: &'a ReadReport,
    painter: &'a Painter,
}

impl<'a> ReadView<'a> {
    pub(crate) fn new(report: &'a ReadReport, painter: &'a Painter) -> Self {
        Self { report, painter }
    }
}

impl Display for ReadView<'_> {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        writeln!(
            f,
            "{} {}",
            self.painter.title(&self.report.name),
            self.painter.detail(self.report.characteristic.to_string())
        )?;
        write!(
            f,
            "{}",
            decoded_table(&self.report.decoded, self.painter)
        )
    }
}

fn decoded_table(decoded: &DecodedValue, painter: &Painter) -> Table {
    Table::key_value(
        painter,
        vec![
            ("hex", painter.payload(&decoded.hex)),
            ("utf8", decoded.utf8.escape_debug().to_string()),
            ("int_le", format_optional(decoded.int_le)),
        ],
    )
}

/// Result of a single characteristic write.
#[derive(Debug, Serialize)]
pub(crate) struct WriteReport {
    pub(crate) characteristic: CharacteristicId,
    pub(crate) bytes_written: usize,
    pub(crate) mode: WriteMode,
}

pub(crate) struct WriteView<'a> {
    report: &'a WriteReport,
    painter: &'a Painter,
}

impl<'a> WriteView<'a> {
    pub(crate) fn new(report: &'a WriteReport, painter: &'a Painter) -> Self {
        Self { report, painter }
    }
}

impl Display for WriteView<'_> {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} {} byte(s) to {} {}",
            self.painter.done("Wrote"),
            self.report.bytes_written,
            self.report.characteristic,
            self.painter.detail(format!("({})", self.report.mode))
        )
    }
}

/// One line per received notification.
pub(crate) struct NotificationView<'a> {
    event: &'a ValueEvent,
    painter: &'a Painter,
}

impl<'a> NotificationView<'a> {
    pub(crate) fn new(event: &'a ValueEvent, painter: &'a Painter) -> Self {
        Self { event, painter }
    }
}

impl Display for NotificationView<'_> {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        let decoded = &self.event.decoded;
        write!(
            f,
            "{} {} {} {}",
            self.painter.detail(format!("#{}", self.event.sequence)),
            self.painter.payload(&decoded.hex),
            self.painter
                .detail(format!("utf8={:?}", decoded.utf8)),
            self.painter
                .detail(format!("int_le={}", format_optional(decoded.int_le)))
        )
    }
}

/// Why a listen run stopped.
#[derive(Debug, Clone, Copy, Eq, PartialEq, Serialize, derive_more::Display)]
#[serde(rename_all = "snake_case")]
pub(crate) enum ListenStopReason {
    #[display("reached the notification limit")]
    ReachedLimit,
    #[display("interrupted")]
    Interrupted,
    #[display("subscription ended")]
    SubscriptionEnded,
}

#[derive(Debug, Serialize)]
pub(crate) struct ListenSummary {
    pub(crate) characteristic: CharacteristicId,
    pub(crate) received: usize,
    pub(crate) stop_reason: ListenStopReason,
}

pub(crate) struct ListenSummaryView<'a> {
    summary: &'a ListenSummary,
    painter: &'a Painter,
}

impl<'a> ListenSummaryView<'a> {
    pub(crate) fn new(summary: &'a ListenSummary, painter: &'a Painter) -> Self {
        Self { summary, painter }
    }
}

impl Display for ListenSummaryView<'_> {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        let reason = match self.summary.stop_reason {
            ListenStopReason::SubscriptionEnded => {
                self.painter.link_down(self.summary.stop_reason.to_string())
            }
            _ => self.painter.detail(self.summary.stop_reason.to_string()),
        };
        write!(
            f,
            "{} {} notification(s) from {} ({reason})",
            self.painter.title("Received"),
            self.summary.received,
            self.summary.characteristic
        )
    }
}
