/// Formats an optional RSSI for terminal output.
pub(crate) fn format_rssi(rssi: Option<i16>) -> String {
    match rssi {
        Some(value) => format!("{value} dBm"),
        None => "-".to_string(),
    }
}

/// Formats an optional integer rendering for terminal output.
pub(crate) fn format_optional<T: ToString>(value: Option<T>) -> String {
    value.map_or_else(|| "-".to_string(), |value| value.to_string())
}

/// Joins labels with `, `, rendering an empty list as `-`.
pub(crate) fn join_or_dash(labels: &[String]) -> String {
    if labels.is_empty() {
        "-".to_string()
    } else {
        labels.join(", ")
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;
    use rstest::rstest;

    use super::*;

    #[rstest]
    #[case(Some(-43), "-43 dBm")]
    #[case(None, "-")]
    fn format_rssi_renders_unit(#[case] rssi: Option<i16>, #[case] expected: &str) {
        assert_eq!(expected, format_rssi(rssi));
    }

    #[test]
    fn format_optional_handles_absence() {
        assert_eq!("-", format_optional::<u32>(None));
        assert_eq!("513", format_optional(Some(513u32)));
    }

    #[rstest]
    #[case(&[], "-")]
    #[case(&["read".to_string(), "notify".to_string()], "read, notify")]
    fn join_or_dash_renders_lists(#[case] labels: &[String], #[case] expected: &str) {
        assert_eq!(expected, join_or_dash(labels));
    }
}
