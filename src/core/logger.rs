//! JSON-lines dump of the recorded dependencies.
//!
//! Written at finalization when a log path is configured: one line per
//! dependency, grouped by the thread stream that recorded it. Useful for
//! diffing what the recorder saw across runs.

use crate::core::recorder::Dependency;
use crate::core::types::LockId;
use anyhow::{Context, Result};
use serde::Serialize;
use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::Path;

#[derive(Serialize)]
struct DependencyRecord<'a> {
    thread: usize,
    lock: LockId,
    held: &'a [LockId],
    cond_related: bool,
    real: Option<LockId>,
    callsites: usize,
}

pub fn write_dependency_log(path: &Path, streams: &[Vec<Dependency>]) -> Result<()> {
    let file = File::create(path)
        .with_context(|| format!("failed to create dependency log {}", path.display()))?;
    let mut out = BufWriter::new(file);
    for (thread, deps) in streams.iter().enumerate() {
        for dep in deps {
            let record = DependencyRecord {
                thread,
                lock: dep.lock,
                held: &dep.held,
                cond_related: dep.cond_related,
                real: dep.real,
                callsites: dep.callsites.len(),
            };
            writeln!(out, "{}", serde_json::to_string(&record)?)?;
        }
    }
    out.flush()?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_log_is_one_json_line_per_dependency() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("deps.synclog");
        let streams = vec![
            vec![Dependency {
                lock: 2,
                held: vec![1],
                callsites: Vec::new(),
                cond_related: false,
                real: None,
            }],
            vec![Dependency {
                lock: 1,
                held: vec![2],
                callsites: Vec::new(),
                cond_related: true,
                real: None,
            }],
        ];
        write_dependency_log(&path, &streams).unwrap();
        let content = std::fs::read_to_string(&path).unwrap();
        let lines: Vec<&str> = content.lines().collect();
        assert_eq!(lines.len(), 2);
        let first: serde_json::Value = serde_json::from_str(lines[0]).unwrap();
        assert_eq!(first["thread"], 0);
        assert_eq!(first["lock"], 2);
        let second: serde_json::Value = serde_json::from_str(lines[1]).unwrap();
        assert_eq!(second["cond_related"], true);
    }
}
