// Option negotiation (RFC 2347, 2348, 2349).
//
// Options ride at the end of RRQ/WRQ packets and make up the whole body of an OACK, as pairs of
// NUL-terminated strings. A server never fails a transfer because of an option value: anything it
// cannot parse or that falls outside the allowed range is replaced by the default and left out of
// the OACK.

use std::fmt;
use std::ops::RangeInclusive;
use std::time::Duration;

use crate::tftp::{self, TftpResult};

pub const BLKSIZE: &str = "blksize";
pub const TIMEOUT: &str = "timeout";
pub const TSIZE: &str = "tsize";

pub const DEFAULT_BLOCK_SIZE: usize = 512;
pub const MAX_BLOCK_SIZE: usize = 65464;
pub const DEFAULT_TIMEOUT_SECS: u64 = 5;

struct Recognized {
    name: &'static str,
    default: u64,
    range: RangeInclusive<u64>,
}

static RECOGNIZED: [Recognized; 3] = [
    Recognized { name: BLKSIZE, default: DEFAULT_BLOCK_SIZE as u64, range: 8..=MAX_BLOCK_SIZE as u64 },
    Recognized { name: TIMEOUT, default: DEFAULT_TIMEOUT_SECS, range: 1..=255 },
    Recognized { name: TSIZE, default: 0, range: 0..=4_294_967_295 },
];

/// A single option: its name, the value as it appears on the wire, the numeric value once
/// validated, and whether the server accepted it.
#[derive(Debug, Clone, Eq)]
pub struct OptionEntry {
    pub name: String,
    pub raw: String,
    pub value: u64,
    pub accepted: bool,
}

// Only the wire representation takes part in equality.
impl PartialEq for OptionEntry {
    fn eq(&self, other: &Self) -> bool {
        self.name == other.name && self.raw == other.raw
    }
}

/// An ordered list of options. Order is preserved exactly as inserted or received.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct OptionSet {
    entries: Vec<OptionEntry>,
}

impl OptionSet {
    pub fn new() -> OptionSet {
        OptionSet::default()
    }

    /// The complete set of recognized options at their defaults, none of them accepted.
    pub fn defaults() -> OptionSet {
        let entries = RECOGNIZED
            .iter()
            .map(|r| OptionEntry {
                name: r.name.to_string(),
                raw: r.default.to_string(),
                value: r.default,
                accepted: false,
            })
            .collect();
        OptionSet { entries }
    }

    /// Builder-style variant of [`OptionSet::insert`].
    pub fn with_option(mut self, name: impl Into<String>, raw: impl Into<String>) -> OptionSet {
        self.insert(name, raw);
        self
    }

    /// Appends a requested option. A later option with the same name replaces the earlier one in
    /// place.
    pub fn insert(&mut self, name: impl Into<String>, raw: impl Into<String>) {
        let name = name.into();
        let raw = raw.into();
        match self.entries.iter_mut().find(|e| e.name.eq_ignore_ascii_case(&name)) {
            Some(entry) => {
                entry.raw = raw;
                entry.value = 0;
                entry.accepted = false;
            }
            None => self.entries.push(OptionEntry { name, raw, value: 0, accepted: false }),
        }
    }

    /// Splits `buf[start..]` into name/value pairs. The buffer has to end exactly after a value's
    /// terminator; a dangling name or value is a parse error.
    pub fn parse(buf: &[u8], start: usize) -> TftpResult<OptionSet> {
        let mut entries = Vec::new();
        let mut idx = start;
        while idx < buf.len() {
            let (name, name_end) = tftp::read_string(buf, idx, "Option name")?;
            if name_end >= buf.len() {
                return Err(tftp::SocketError::PacketParse(format!("Option '{name}' has no value")));
            }
            let (raw, value_end) = tftp::read_string(buf, name_end, "Option value")?;
            entries.push(OptionEntry { name, raw, value: 0, accepted: false });
            idx = value_end;
        }
        Ok(OptionSet { entries })
    }

    pub fn serialize(&self, out: &mut Vec<u8>) {
        for entry in &self.entries {
            out.extend_from_slice(entry.name.as_bytes());
            out.push(0x00);
            out.extend_from_slice(entry.raw.as_bytes());
            out.push(0x00);
        }
    }

    /// Applies the server's acceptance policy to a set of requested options.
    ///
    /// The result always holds `blksize`, `timeout` and `tsize`, in that order. A recognized option
    /// with a value inside its range is accepted with that value; anything else keeps the default
    /// and stays unaccepted. Unknown names are dropped.
    pub fn validate(&self) -> OptionSet {
        let mut validated = OptionSet::defaults();
        for requested in &self.entries {
            let Some((idx, spec)) = RECOGNIZED
                .iter()
                .enumerate()
                .find(|(_, r)| r.name.eq_ignore_ascii_case(&requested.name))
            else {
                log::debug!("Ignoring unrecognized option '{}'", requested.name);
                continue;
            };

            let slot = &mut validated.entries[idx];
            match requested.raw.parse::<u64>() {
                Ok(value) if spec.range.contains(&value) => {
                    slot.value = value;
                    slot.raw = value.to_string();
                    slot.accepted = true;
                }
                _ => {
                    log::debug!(
                        "Option {}={} is out of range or unparsable, keeping default {}",
                        requested.name, requested.raw, spec.default
                    );
                    slot.value = spec.default;
                    slot.raw = spec.default.to_string();
                    slot.accepted = false;
                }
            }
        }
        validated
    }

    pub fn is_any_accepted(&self) -> bool {
        self.entries.iter().any(|e| e.accepted)
    }

    pub fn is_accepted(&self, name: &str) -> bool {
        self.entry(name).is_some_and(|e| e.accepted)
    }

    /// The accepted subset, in order, as it should appear in an OACK.
    pub fn accepted(&self) -> OptionSet {
        OptionSet {
            entries: self.entries.iter().filter(|e| e.accepted).cloned().collect(),
        }
    }

    /// Overrides the value of an option and marks it accepted.
    pub fn set_accepted(&mut self, name: &str, value: u64) {
        match self.entries.iter_mut().find(|e| e.name.eq_ignore_ascii_case(name)) {
            Some(entry) => {
                entry.value = value;
                entry.raw = value.to_string();
                entry.accepted = true;
            }
            None => self.entries.push(OptionEntry {
                name: name.to_string(),
                raw: value.to_string(),
                value,
                accepted: true,
            }),
        }
    }

    /// The numeric value of an option in a validated set.
    pub fn get(&self, name: &str) -> Option<u64> {
        self.entry(name).map(|e| e.value)
    }

    pub fn block_size(&self) -> usize {
        self.get(BLKSIZE).map_or(DEFAULT_BLOCK_SIZE, |v| v as usize)
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.get(TIMEOUT).unwrap_or(DEFAULT_TIMEOUT_SECS))
    }

    pub fn transfer_size(&self) -> u64 {
        self.get(TSIZE).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn iter(&self) -> impl Iterator<Item = &OptionEntry> {
        self.entries.iter()
    }

    fn entry(&self, name: &str) -> Option<&OptionEntry> {
        self.entries.iter().find(|e| e.name.eq_ignore_ascii_case(name))
    }
}

impl fmt::Display for OptionSet {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        for (i, entry) in self.entries.iter().enumerate() {
            if i > 0 {
                f.write_str(" ")?;
            }
            write!(f, "{}={}", entry.name, entry.raw)?;
        }
        Ok(())
    }
}
