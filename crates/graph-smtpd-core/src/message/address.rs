//! Address list translation

use serde::Serialize;

/// A single message recipient
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Recipient {
    pub address: String,
}

impl Recipient {
    pub fn new(address: impl Into<String>) -> Self {
        Self {
            address: address.into(),
        }
    }
}

/// Split a comma separated header value into recipients.
///
/// Segments are trimmed but otherwise taken as-is; no address syntax
/// checking happens here. Empty input yields no recipients.
pub fn parse_address_list(addresses: &str) -> Vec<Recipient> {
    if addresses.trim().is_empty() {
        return Vec::new();
    }

    addresses
        .split(',')
        .map(|address| Recipient::new(address.trim()))
        .collect()
}
