mod catalog_view;
mod device_view;
mod painter;
mod table;
mod value_view;

pub(crate) use self::catalog_view::{CatalogReport, CatalogView, ServiceReport};
pub(crate) use self::device_view::DeviceListView;
pub(crate) use self::painter::Painter;
pub(crate) use self::value_view::{
    ListenStopReason, ListenSummary, ListenSummaryView, NotificationView, ReadReport, ReadView,
    WriteReport, WriteView,
};
