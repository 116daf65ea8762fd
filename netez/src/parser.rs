//! Parser for RouterOS terse output.
//!
//! `print terse` emits one item per line:
//!
//! ```text
//!  0  R  name=ether1 default-name=ether1 type=ether mtu=1500
//!  1 X   name=wlan1 type=wlan mtu=1500 comment=guest network
//! *2 D   address=10.0.0.1/24 network=10.0.0.0 interface=ether2
//! ```
//!
//! The leading item number (or internal `*id`) becomes the synthetic
//! [`ID_FIELD`], flag letters become [`FLAGS_FIELD`]. What a flag means is
//! left to the caller.

use indexmap::IndexMap;

/// Synthetic field holding the flag letters of a line.
pub const FLAGS_FIELD: &str = "__flags";

/// Synthetic field holding the item number or internal id of a line.
pub const ID_FIELD: &str = "__id";

/// One item reported by the device. Field order follows the device output.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Record {
    fields: IndexMap<String, String>,
}

impl Record {
    /// Create an empty record.
    pub fn new() -> Self {
        Self::default()
    }

    /// Get a field value; `None` means unknown, not empty.
    pub fn get(&self, key: &str) -> Option<&str> {
        self.fields.get(key).map(String::as_str)
    }

    /// Insert or replace a field.
    pub fn insert(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.fields.insert(key.into(), value.into());
    }

    /// Whether the field is present.
    pub fn contains(&self, key: &str) -> bool {
        self.fields.contains_key(key)
    }

    /// Flag letters, empty if the line carried none.
    pub fn flags(&self) -> &str {
        self.get(FLAGS_FIELD).unwrap_or("")
    }

    /// Whether a given flag letter is set.
    pub fn has_flag(&self, flag: char) -> bool {
        self.flags().contains(flag)
    }

    /// Item number or internal id, when the line started with one.
    pub fn id(&self) -> Option<&str> {
        self.get(ID_FIELD)
    }

    /// Number of fields, synthetic ones included.
    pub fn len(&self) -> usize {
        self.fields.len()
    }

    /// Whether the record has no fields.
    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }

    /// Iterate over `(key, value)` pairs in device order.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.fields.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }
}

impl<K: Into<String>, V: Into<String>> FromIterator<(K, V)> for Record {
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        Self {
            fields: iter
                .into_iter()
                .map(|(k, v)| (k.into(), v.into()))
                .collect(),
        }
    }
}

/// Parse terse output into records, one per well-formed line.
///
/// Blank lines and lines without any `key=value` token are dropped; every
/// other line yields exactly one record, in input order.
pub fn parse(raw: &str) -> Vec<Record> {
    raw.lines().filter_map(parse_line).collect()
}

/// Parse a single line.
pub fn parse_line(line: &str) -> Option<Record> {
    let line = line.trim();
    if line.is_empty() || !line.contains('=') {
        return None;
    }

    let mut record = Record::new();
    let mut flags = String::new();
    let mut last_key: Option<String> = None;

    for token in line.split_whitespace() {
        if let Some((key, value)) = token.split_once('=') {
            if key.is_empty() {
                // "=foo" is not a field; treat it as part of the previous value
                append_continuation(&mut record, last_key.as_deref(), token);
                continue;
            }
            record.insert(key, value);
            last_key = Some(key.to_string());
        } else if let Some(key) = last_key.as_deref() {
            append_continuation(&mut record, Some(key), token);
        } else if is_item_id(token) {
            record.insert(ID_FIELD, token);
        } else if is_flag_group(token) {
            flags.push_str(token);
        }
    }

    if last_key.is_none() {
        return None;
    }

    for (_, value) in record.fields.iter_mut() {
        if let Some(inner) = value
            .strip_prefix('"')
            .and_then(|v| v.strip_suffix('"'))
        {
            *value = inner.to_string();
        }
    }

    if !flags.is_empty() {
        record.insert(FLAGS_FIELD, flags);
    }

    Some(record)
}

fn append_continuation(record: &mut Record, key: Option<&str>, token: &str) {
    if let Some(value) = key.and_then(|k| record.fields.get_mut(k)) {
        value.push(' ');
        value.push_str(token);
    }
}

/// `12` or `*1A`.
fn is_item_id(token: &str) -> bool {
    let digits = token.strip_prefix('*').unwrap_or(token);
    let hex = token.starts_with('*');
    !digits.is_empty()
        && digits.chars().all(|c| {
            if hex {
                c.is_ascii_hexdigit()
            } else {
                c.is_ascii_digit()
            }
        })
}

/// `X`, `DR`, `XI`...
fn is_flag_group(token: &str) -> bool {
    !token.is_empty() && token.chars().all(|c| c.is_ascii_uppercase())
}
