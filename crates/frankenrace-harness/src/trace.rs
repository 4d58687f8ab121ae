//! Trace format.
//!
//! One JSON object per line with an `op` tag and the logical name of the
//! acting thread. Blank lines and lines starting with `#` are skipped.
//! Addresses are JSON numbers or `"0x..."` strings.
//!
//! ```text
//! {"op":"create","thread":"main","child":"a"}
//! {"op":"start","thread":"a"}
//! {"op":"write","thread":"a","addr":"0x1000","size":4}
//! ```

use serde::{Deserialize, Serialize};

use crate::HarnessError;

/// An address as written in a trace.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Addr {
    Num(u64),
    Text(String),
}

impl Addr {
    pub fn resolve(&self, line: usize) -> Result<usize, HarnessError> {
        let bad = || HarnessError::BadAddress {
            line,
            text: match self {
                Self::Num(n) => n.to_string(),
                Self::Text(s) => s.clone(),
            },
        };
        let value = match self {
            Self::Num(n) => *n,
            Self::Text(s) => {
                let s = s.trim();
                match s.strip_prefix("0x").or_else(|| s.strip_prefix("0X")) {
                    Some(hex) => u64::from_str_radix(&hex.replace('_', ""), 16).map_err(|_| bad())?,
                    None => s.parse().map_err(|_| bad())?,
                }
            }
        };
        usize::try_from(value).map_err(|_| bad())
    }
}

impl From<usize> for Addr {
    fn from(value: usize) -> Self {
        Self::Num(value as u64)
    }
}

/// One replayable event.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum TraceEvent {
    Create {
        thread: String,
        child: String,
        #[serde(default)]
        detached: bool,
    },
    Start {
        thread: String,
    },
    Finish {
        thread: String,
    },
    Join {
        thread: String,
        target: String,
    },
    Detach {
        thread: String,
        target: String,
    },
    Read {
        thread: String,
        addr: Addr,
        size: usize,
        #[serde(default)]
        atomic: bool,
    },
    Write {
        thread: String,
        addr: Addr,
        size: usize,
        #[serde(default)]
        atomic: bool,
    },
    Lock {
        thread: String,
        addr: Addr,
    },
    Unlock {
        thread: String,
        addr: Addr,
    },
    Rlock {
        thread: String,
        addr: Addr,
    },
    Runlock {
        thread: String,
        addr: Addr,
    },
    Acquire {
        thread: String,
        addr: Addr,
    },
    Release {
        thread: String,
        addr: Addr,
    },
    Alloc {
        thread: String,
        addr: Addr,
        size: usize,
    },
    Free {
        thread: String,
        addr: Addr,
    },
    Mmap {
        thread: String,
        addr: Addr,
        size: usize,
    },
    Munmap {
        thread: String,
        addr: Addr,
        size: usize,
    },
    FuncEntry {
        thread: String,
        pc: Addr,
    },
    FuncExit {
        thread: String,
    },
}

impl TraceEvent {
    /// Name of the thread performing the event.
    #[must_use]
    pub fn thread(&self) -> &str {
        match self {
            Self::Create { thread, .. }
            | Self::Start { thread }
            | Self::Finish { thread }
            | Self::Join { thread, .. }
            | Self::Detach { thread, .. }
            | Self::Read { thread, .. }
            | Self::Write { thread, .. }
            | Self::Lock { thread, .. }
            | Self::Unlock { thread, .. }
            | Self::Rlock { thread, .. }
            | Self::Runlock { thread, .. }
            | Self::Acquire { thread, .. }
            | Self::Release { thread, .. }
            | Self::Alloc { thread, .. }
            | Self::Free { thread, .. }
            | Self::Mmap { thread, .. }
            | Self::Munmap { thread, .. }
            | Self::FuncEntry { thread, .. }
            | Self::FuncExit { thread } => thread,
        }
    }
}

/// Parse a JSONL trace into `(line number, event)` pairs.
pub fn parse_trace(text: &str) -> Result<Vec<(usize, TraceEvent)>, HarnessError> {
    text.lines()
        .enumerate()
        .map(|(i, l)| (i + 1, l.trim()))
        .filter(|(_, l)| !l.is_empty() && !l.starts_with('#'))
        .map(|(line, l)| {
            serde_json::from_str(l)
                .map(|event| (line, event))
                .map_err(|source| HarnessError::Parse { line, source })
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn addresses_accept_numbers_and_hex() {
        assert_eq!(Addr::Num(4096).resolve(1).unwrap(), 4096);
        assert_eq!(Addr::Text("0x1_000".into()).resolve(1).unwrap(), 4096);
        assert_eq!(Addr::Text("4096".into()).resolve(1).unwrap(), 4096);
        assert!(matches!(
            Addr::Text("0xzz".into()).resolve(7),
            Err(HarnessError::BadAddress { line: 7, .. })
        ));
    }

    #[test]
    fn parse_skips_comments_and_reports_line_numbers() {
        let text = "# header\n\n{\"op\":\"start\",\"thread\":\"a\"}\n{\"op\":\"bogus\"}\n";
        let err = parse_trace(text).unwrap_err();
        assert!(matches!(err, HarnessError::Parse { line: 4, .. }), "{err}");

        let events = parse_trace("{\"op\":\"read\",\"thread\":\"a\",\"addr\":\"0x10\",\"size\":4}")
            .unwrap();
        assert_eq!(
            events,
            vec![(
                1,
                TraceEvent::Read {
                    thread: "a".into(),
                    addr: Addr::Text("0x10".into()),
                    size: 4,
                    atomic: false,
                }
            )]
        );
        assert_eq!(events[0].1.thread(), "a");
    }
}
