//! Deadlock-history file format.
//!
//! Line-oriented text, one file per monitored executable:
//!
//! - a line consisting of `-` begins a new merge set (one historical
//!   deadlock group) and allocates one shared-lock slot;
//! - a line starting with a space holds one member: the lock address
//!   followed by zero or more call-site addresses, terminated by `.`.
//!   A member without call-site addresses was never observed through a
//!   call-stack-identifiable initialization site and is redirected
//!   unconditionally.
//!
//! A malformed file disables prevention for the run rather than aborting.

use std::fs;
use std::io::{self, Write};
use std::path::Path;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum HistoryError {
    #[error("failed to read history file: {0}")]
    Io(#[from] io::Error),
    #[error("malformed history file at line {line}: {text:?}")]
    Malformed { line: usize, text: String },
}

/// One recorded lock: its address in the recording run and the call stack of
/// its initialization site.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HistoryEntry {
    pub lock: usize,
    pub stack: Vec<usize>,
}

/// One historical deadlock group; all member locks share one lock slot.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct HistoryGroup {
    pub entries: Vec<HistoryEntry>,
}

/// Parse a history file into its groups.
pub fn load(path: &Path) -> Result<Vec<HistoryGroup>, HistoryError> {
    parse(&fs::read_to_string(path)?)
}

pub fn parse(content: &str) -> Result<Vec<HistoryGroup>, HistoryError> {
    let mut groups: Vec<HistoryGroup> = Vec::new();
    for (idx, line) in content.lines().enumerate() {
        let malformed = || HistoryError::Malformed {
            line: idx + 1,
            text: line.to_string(),
        };
        if line.is_empty() {
            continue;
        }
        if line == "-" {
            groups.push(HistoryGroup::default());
            continue;
        }
        if !line.starts_with(' ') {
            return Err(malformed());
        }
        let group = groups.last_mut().ok_or_else(malformed)?;
        let body = line.trim().strip_suffix('.').ok_or_else(malformed)?;
        let mut numbers = body
            .split_whitespace()
            .map(|field| field.parse::<usize>().map_err(|_| malformed()));
        let lock = numbers.next().ok_or_else(malformed)??;
        let stack = numbers.collect::<Result<Vec<usize>, _>>()?;
        group.entries.push(HistoryEntry { lock, stack });
    }
    Ok(groups)
}

/// Serialize groups in the on-disk format.
pub fn write<W: Write>(out: &mut W, groups: &[HistoryGroup]) -> io::Result<()> {
    for group in groups {
        writeln!(out, "-")?;
        for entry in &group.entries {
            write!(out, " {}", entry.lock)?;
            for addr in &entry.stack {
                write!(out, " {addr}")?;
            }
            writeln!(out, ".")?;
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_groups() -> Vec<HistoryGroup> {
        vec![
            HistoryGroup {
                entries: vec![
                    HistoryEntry {
                        lock: 12,
                        stack: vec![4096, 4112],
                    },
                    HistoryEntry {
                        lock: 13,
                        stack: vec![4096, 4200, 4304],
                    },
                ],
            },
            HistoryGroup {
                entries: vec![HistoryEntry {
                    lock: 77,
                    stack: Vec::new(),
                }],
            },
        ]
    }

    #[test]
    fn test_round_trip() {
        let groups = sample_groups();
        let mut buf = Vec::new();
        write(&mut buf, &groups).unwrap();
        let reloaded = parse(std::str::from_utf8(&buf).unwrap()).unwrap();
        assert_eq!(reloaded, groups);
    }

    #[test]
    fn test_round_trip_through_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("prog_deadlock.info");
        let groups = sample_groups();
        let mut file = std::fs::File::create(&path).unwrap();
        write(&mut file, &groups).unwrap();
        drop(file);
        assert_eq!(load(&path).unwrap(), groups);
    }

    #[test]
    fn test_member_without_callsites() {
        let groups = parse("-\n 42.\n").unwrap();
        assert_eq!(groups.len(), 1);
        assert_eq!(groups[0].entries[0].lock, 42);
        assert!(groups[0].entries[0].stack.is_empty());
    }

    #[test]
    fn test_member_before_group_is_malformed() {
        assert!(matches!(
            parse(" 42 1 2.\n"),
            Err(HistoryError::Malformed { line: 1, .. })
        ));
    }

    #[test]
    fn test_missing_terminator_is_malformed() {
        assert!(parse("-\n 42 1 2\n").is_err());
    }

    #[test]
    fn test_garbage_is_malformed() {
        assert!(parse("-\n 42 xyzzy.\n").is_err());
        assert!(parse("deadlock\n").is_err());
    }

    #[test]
    fn test_missing_file_is_io_error() {
        let err = load(Path::new("/nonexistent/prog_deadlock.info")).unwrap_err();
        assert!(matches!(err, HistoryError::Io(_)));
    }
}
