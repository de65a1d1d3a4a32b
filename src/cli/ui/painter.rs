use owo_colors::{OwoColorize, Style as OwoStyle};

use crate::utils::format_rssi;

const STRONG_SIGNAL_DBM: i16 = -60;
const WEAK_SIGNAL_DBM: i16 = -80;

/// What a fragment of command output stands for.
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
enum Role {
    Title,
    Done,
    Empty,
    LinkDown,
    Detail,
    Address,
    Payload,
    Signal(SignalStrength),
}

#[derive(Debug, Clone, Copy, Eq, PartialEq)]
enum SignalStrength {
    Strong,
    Fair,
    Weak,
}

impl SignalStrength {
    fn from_dbm(rssi: i16) -> Self {
        if rssi >= STRONG_SIGNAL_DBM {
            Self::Strong
        } else if rssi >= WEAK_SIGNAL_DBM {
            Self::Fair
        } else {
            Self::Weak
        }
    }
}

impl Role {
    fn style(self) -> OwoStyle {
        match self {
            Self::Title => OwoStyle::new().bold().cyan(),
            Self::Done => OwoStyle::new().bold().green(),
            Self::Empty => OwoStyle::new().bold().yellow(),
            Self::LinkDown => OwoStyle::new().bold().red(),
            Self::Detail => OwoStyle::new().dimmed(),
            Self::Address => OwoStyle::new().bold().blue(),
            Self::Payload => OwoStyle::new().bold(),
            Self::Signal(SignalStrength::Strong) => OwoStyle::new().green(),
            Self::Signal(SignalStrength::Fair) => OwoStyle::new().yellow(),
            Self::Signal(SignalStrength::Weak) => OwoStyle::new().red(),
        }
    }
}

/// Styles GATT explorer output; plain text when colour is off.
#[derive(Debug)]
pub(crate) struct Painter {
    use_colour: bool,
}

impl Painter {
    pub(crate) fn new(use_colour: bool) -> Self {
        Self { use_colour }
    }

    /// Service and characteristic names, section headings.
    pub(crate) fn title<T: AsRef<str>>(&self, text: T) -> String {
        self.paint(Role::Title, text.as_ref())
    }

    /// Completed connects and writes.
    pub(crate) fn done<T: AsRef<str>>(&self, text: T) -> String {
        self.paint(Role::Done, text.as_ref())
    }

    /// Scans or discoveries that turned up nothing.
    pub(crate) fn empty<T: AsRef<str>>(&self, text: T) -> String {
        self.paint(Role::Empty, text.as_ref())
    }

    pub(crate) fn link_down<T: AsRef<str>>(&self, text: T) -> String {
        self.paint(Role::LinkDown, text.as_ref())
    }

    /// UUIDs, sequence numbers and other secondary facts.
    pub(crate) fn detail<T: AsRef<str>>(&self, text: T) -> String {
        self.paint(Role::Detail, text.as_ref())
    }

    pub(crate) fn address<T: AsRef<str>>(&self, text: T) -> String {
        self.paint(Role::Address, text.as_ref())
    }

    /// Raw attribute bytes.
    pub(crate) fn payload<T: AsRef<str>>(&self, text: T) -> String {
        self.paint(Role::Payload, text.as_ref())
    }

    /// Renders an advertisement RSSI, coloured by signal strength.
    pub(crate) fn rssi(&self, rssi: Option<i16>) -> String {
        let text = format_rssi(rssi);
        match rssi {
            Some(dbm) => self.paint(Role::Signal(SignalStrength::from_dbm(dbm)), &text),
            None => self.paint(Role::Detail, &text),
        }
    }

    fn paint(&self, role: Role, text: &str) -> String {
        if self.use_colour {
            text.style(role.style()).to_string()
        } else {
            text.to_string()
        }
    }
}
