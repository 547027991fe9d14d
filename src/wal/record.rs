//! WAL Record Types
//!
//! Defines the records written to the WAL and replicated across nodes,
//! along with their on-disk line format.

use crate::error::{Error, Result};

/// Log Sequence Number - unique identifier for each mutation
pub type Lsn = u64;

/// Operation carried by a WAL record
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WalOp {
    Set,
    Delete,
}

/// One durable mutation: `(lsn, op, key, value)`; the value is empty
/// for deletes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WalRecord {
    pub lsn: Lsn,
    pub op: WalOp,
    pub key: String,
    pub value: String,
}

impl WalRecord {
    pub fn set(lsn: Lsn, key: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            lsn,
            op: WalOp::Set,
            key: key.into(),
            value: value.into(),
        }
    }

    pub fn delete(lsn: Lsn, key: impl Into<String>) -> Self {
        Self {
            lsn,
            op: WalOp::Delete,
            key: key.into(),
            value: String::new(),
        }
    }

    /// Encode as one disk line (without the trailing newline):
    /// `<lsn>|SET|<key>|<value>` or `<lsn>|DELETE|<key>`
    pub fn encode_line(&self) -> String {
        match self.op {
            WalOp::Set => format!(
                "{}|SET|{}|{}",
                self.lsn,
                self.key,
                escape_value(&self.value)
            ),
            WalOp::Delete => format!("{}|DELETE|{}", self.lsn, self.key),
        }
    }

    /// Parse one disk line back into a record
    pub fn parse_line(line: &str) -> Result<Self> {
        let mut parts = line.splitn(4, '|');

        let lsn_str = parts
            .next()
            .ok_or_else(|| Error::Wal("empty WAL line".into()))?;
        let lsn: Lsn = lsn_str
            .parse()
            .map_err(|_| Error::Wal(format!("bad LSN in WAL line: {}", lsn_str)))?;
        if lsn == 0 {
            return Err(Error::Wal("LSN 0 in WAL line".into()));
        }

        let op_str = parts
            .next()
            .ok_or_else(|| Error::WalCorrupted {
                lsn,
                reason: "missing operation".into(),
            })?;
        let key = parts
            .next()
            .ok_or_else(|| Error::WalCorrupted {
                lsn,
                reason: "missing key".into(),
            })?
            .to_string();

        match op_str {
            "SET" => {
                let value = parts.next().unwrap_or("");
                Ok(WalRecord {
                    lsn,
                    op: WalOp::Set,
                    key,
                    value: unescape_value(value)?,
                })
            }
            "DELETE" => Ok(WalRecord::delete(lsn, key)),
            other => Err(Error::WalCorrupted {
                lsn,
                reason: format!("unknown operation: {}", other),
            }),
        }
    }
}

/// Validate a key for use in the store and on the wire: non-empty, no
/// whitespace (keys are single wire tokens), no `|` (the disk field
/// separator).
pub fn validate_key(key: &str) -> Result<()> {
    if key.is_empty() {
        return Err(Error::InvalidKey("key must not be empty".into()));
    }
    if key.contains('|') {
        return Err(Error::InvalidKey(format!("key contains '|': {}", key)));
    }
    if key.chars().any(|c| c.is_whitespace()) {
        return Err(Error::InvalidKey(format!(
            "key contains whitespace: {}",
            key
        )));
    }
    Ok(())
}

// The disk format is one record per line, so newlines and carriage
// returns inside values must be escaped to round-trip.
fn escape_value(value: &str) -> String {
    let mut out = String::with_capacity(value.len());
    for c in value.chars() {
        match c {
            '\\' => out.push_str("\\\\"),
            '\n' => out.push_str("\\n"),
            '\r' => out.push_str("\\r"),
            c => out.push(c),
        }
    }
    out
}

fn unescape_value(value: &str) -> Result<String> {
    let mut out = String::with_capacity(value.len());
    let mut chars = value.chars();
    while let Some(c) = chars.next() {
        if c != '\\' {
            out.push(c);
            continue;
        }
        match chars.next() {
            Some('\\') => out.push('\\'),
            Some('n') => out.push('\n'),
            Some('r') => out.push('\r'),
            other => {
                return Err(Error::Wal(format!(
                    "bad escape sequence in WAL value: \\{}",
                    other.map(String::from).unwrap_or_default()
                )))
            }
        }
    }
    Ok(out)
}
