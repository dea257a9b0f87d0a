/// Commit log sink for volatile databases
///
/// Entries go through the same codec as the file log, so an in-memory
/// database exercises the on-disk representation, but nothing is kept:
/// in-memory databases are never replayed.

use crate::log::LogEntry;
use crate::{codec, Result};

#[derive(Debug, Default)]
pub struct MemoryLog {
    entries: u64,
    bytes: u64,
}

impl MemoryLog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Encode an entry and account for it
    pub fn append(&mut self, entry: &LogEntry) -> Result<()> {
        let data = codec::encode(entry)?;
        self.entries += 1;
        self.bytes += data.len() as u64;
        Ok(())
    }

    /// Entries appended so far
    pub fn len(&self) -> u64 {
        self.entries
    }

    pub fn is_empty(&self) -> bool {
        self.entries == 0
    }

    /// Encoded size of everything appended so far
    pub fn encoded_bytes(&self) -> u64 {
        self.bytes
    }
}
