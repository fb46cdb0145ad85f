use uuid::Uuid;

use crate::error::{OmniError, Result};

pub const TRACE_ID_LEN: usize = 32;
pub const SPAN_ID_LEN: usize = 16;

/// 128-bit random trace id, lowercase hex.
pub fn new_trace_id() -> String {
    Uuid::new_v4().simple().to_string()
}

/// 64-bit random span id, lowercase hex.
pub fn new_span_id() -> String {
    let mut id = Uuid::new_v4().simple().to_string();
    id.truncate(SPAN_ID_LEN);
    id
}

pub fn parse_trace_id(input: &str) -> Result<String> {
    parse_hex_id(input, TRACE_ID_LEN, "trace")
}

pub fn parse_span_id(input: &str) -> Result<String> {
    parse_hex_id(input, SPAN_ID_LEN, "span")
}

fn parse_hex_id(input: &str, len: usize, what: &str) -> Result<String> {
    if input.len() != len || !input.chars().all(|c| c.is_ascii_hexdigit()) {
        return Err(OmniError::Parse(format!("invalid {what} id: {input}")));
    }
    if input.chars().all(|c| c == '0') {
        return Err(OmniError::Parse(format!("all-zero {what} id")));
    }
    Ok(input.to_ascii_lowercase())
}
