//! File I/O for the `next-work.jsonl` work queue.
//!
//! Entries are addressed by their parseable index: the position of the line
//! among lines that parse as a [`QueueEntry`]. Blank and malformed lines get no
//! index and are carried through rewrites untouched.

use std::fs;
use std::path::Path;

use anyhow::{Context, Result, anyhow};
use tracing::{debug, instrument, warn};

use super::atomic::write_atomic;
use super::run_state::now_rfc3339;
use crate::core::queue::{IndexedEntry, QueueEntry};

/// Read selectable entries. A missing file is an empty queue.
pub fn read_entries(path: &Path) -> Result<Vec<IndexedEntry>> {
    let contents = match fs::read_to_string(path) {
        Ok(contents) => contents,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(err) => return Err(err).with_context(|| format!("read {}", path.display())),
    };

    let mut entries = Vec::new();
    let mut parseable = 0usize;
    for (line_no, line) in contents.lines().enumerate() {
        if line.trim().is_empty() {
            continue;
        }
        let entry: QueueEntry = match serde_json::from_str(line) {
            Ok(entry) => entry,
            Err(err) => {
                warn!(line = line_no + 1, err = %err, "skipping malformed queue line");
                continue;
            }
        };
        let index = parseable;
        parseable += 1;
        if entry.is_selectable() {
            entries.push(IndexedEntry { index, entry });
        }
    }
    debug!(selectable = entries.len(), parseable, "queue read");
    Ok(entries)
}

/// Rewrite the queue, applying `transform` to the entry at `index` only.
fn rewrite_entry<F: FnOnce(&mut QueueEntry)>(path: &Path, index: usize, transform: F) -> Result<()> {
    let contents = fs::read_to_string(path).with_context(|| format!("read {}", path.display()))?;

    let mut transform = Some(transform);
    let mut parseable = 0usize;
    let mut out = String::with_capacity(contents.len());
    for line in contents.lines() {
        let rewritten = if line.trim().is_empty() {
            None
        } else {
            match serde_json::from_str::<QueueEntry>(line) {
                Ok(mut entry) => {
                    if parseable == index
                        && let Some(apply) = transform.take()
                    {
                        apply(&mut entry);
                    }
                    parseable += 1;
                    serde_json::to_string(&entry).ok()
                }
                Err(_) => None,
            }
        };
        out.push_str(rewritten.as_deref().unwrap_or(line));
        out.push('\n');
    }

    if transform.is_some() {
        debug!(index, parseable, "queue index out of range; nothing mutated");
    }
    write_atomic(path, out.as_bytes())
}

/// Mark the entry consumed by `consumed_by`. A missing queue file is an error.
#[instrument(skip_all, fields(index, consumed_by))]
pub fn mark_consumed(path: &Path, index: usize, consumed_by: &str) -> Result<()> {
    if !path.exists() {
        return Err(anyhow!("next-work.jsonl not found: {}", path.display()));
    }
    let now = now_rfc3339();
    rewrite_entry(path, index, |entry| {
        entry.consumed = true;
        entry.consumed_at = Some(now);
        entry.consumed_by = Some(consumed_by.to_string());
        entry.failed_at = None;
    })
}

/// Record a failure on the entry, leaving it unconsumed. A missing queue file is a no-op.
#[instrument(skip_all, fields(index))]
pub fn mark_failed(path: &Path, index: usize) -> Result<()> {
    if !path.exists() {
        return Ok(());
    }
    let now = now_rfc3339();
    rewrite_entry(path, index, |entry| {
        entry.failed_at = Some(now);
    })
}
