use serde::Serialize;
use tracing::instrument;

/// Largest payload that is also rendered as a little-endian integer.
const MAX_INT_BYTES: usize = 4;

/// Display renderings of one characteristic value.
#[derive(Debug, Clone, Eq, PartialEq, Serialize)]
pub struct DecodedValue {
    /// Upper-case byte pairs joined by `-`, e.g. `01-02`.
    pub hex: String,
    /// Lossy UTF-8 interpretation of the bytes.
    pub utf8: String,
    /// Little-endian unsigned reconstruction, present for payloads of at most four bytes.
    ///
    /// Three-byte payloads are decoded the same way even though they are not
    /// a fixed-width integer; treat the value as best-effort display only.
    pub int_le: Option<u32>,
}

/// Renders raw characteristic bytes for display. Never fails.
#[instrument(skip(bytes), level = "trace", fields(len = bytes.len()))]
pub fn decode_display(bytes: &[u8]) -> DecodedValue {
    DecodedValue {
        hex: dashed_hex(bytes),
        utf8: String::from_utf8_lossy(bytes).into_owned(),
        int_le: little_endian_u32(bytes),
    }
}

/// Encodes outbound text as a UTF-8 write payload.
#[must_use]
pub fn encode_utf8(text: &str) -> Vec<u8> {
    text.as_bytes().to_vec()
}

fn dashed_hex(bytes: &[u8]) -> String {
    bytes
        .iter()
        .map(|byte| hex::encode_upper([*byte]))
        .collect::<Vec<_>>()
        .join("-")
}

fn little_endian_u32(bytes: &[u8]) -> Option<u32> {
    if bytes.len() > MAX_INT_BYTES {
        return None;
    }

    Some(
        bytes
            .iter()
            .enumerate()
            .fold(0u32, |value, (index, byte)| {
                value | (u32::from(*byte) << (8 * index))
            }),
    )
}
