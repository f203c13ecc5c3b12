/// Serial line decoding for receiver output
///
/// The receiver firmware prints one JSON object per line. Older firmware
/// prefixed each object with human-readable fields (`... | {json}`); those
/// lines are still accepted by taking the part after the first pipe.
/// Lines starting with `#` are debug output and ignored.
use serde_json::Value;

use crate::models::ParsedPacket;

fn looks_like_object(text: &str) -> bool {
    text.starts_with('{') && text.ends_with('}')
}

fn extract_json_text(line: &str) -> Option<&str> {
    let text = line.trim();
    if text.is_empty() || text.starts_with('#') {
        return None;
    }

    if looks_like_object(text) {
        return Some(text);
    }

    // Legacy "<prefix> | {json}" format
    let (_, rest) = text.split_once('|')?;
    let rest = rest.trim();
    looks_like_object(rest).then_some(rest)
}

/// Decode one serial line into a packet.
///
/// Returns None for blank, comment, malformed or non-object lines.
pub fn parse_line(line: &str) -> Option<ParsedPacket> {
    let json_text = extract_json_text(line)?;
    match serde_json::from_str::<Value>(json_text) {
        Ok(Value::Object(packet)) => Some(packet),
        _ => None,
    }
}
