/// Commit log
///
/// Every committed readwrite transaction and every upgrade is one entry.
/// Opening a database replays the log from the start.
///
/// Format: [magic(4) | version(4) | reserved(8)] [entry...]
/// Entry: [len(4) | payload | crc(4)], payload = codec-encoded [`LogEntry`]

use crate::memory_log::MemoryLog;
use crate::schema::DatabaseSchema;
use crate::types::checksum;
use crate::{codec, Error, Key, Record, Result, TxnId, Version};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs::{File, OpenOptions};
use std::io::{ErrorKind, Read, Seek, SeekFrom, Write};
use std::path::Path;
use tracing::{debug, warn};

pub const LOG_FILE_NAME: &str = "agridb.log";

const LOG_HEADER_SIZE: usize = 16;
const LOG_MAGIC: u32 = 0x41474442; // "AGDB"
const LOG_FORMAT_VERSION: u32 = 1;
const ENTRY_HEADER_SIZE: usize = 4; // len(4)

/// One write applied by a committed transaction
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Mutation {
    Put { store: String, key: Key, record: Record },
    Delete { store: String, key: Key },
}

/// Commit log entry
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum LogEntry {
    /// Schema after a successful upgrade; dropped stores lose their records
    Upgrade {
        version: Version,
        schema: DatabaseSchema,
        dropped_stores: Vec<String>,
    },
    /// Writes of one readwrite transaction, plus the key generator of every
    /// store it touched
    Commit {
        txn_id: TxnId,
        mutations: Vec<Mutation>,
        key_generators: BTreeMap<String, Key>,
    },
}

/// Append-only log file
pub struct Wal {
    file: File,
}

impl Wal {
    /// Create a new log file
    pub fn create(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let mut file = OpenOptions::new()
            .read(true)
            .write(true)
            .create_new(true)
            .open(path)?;

        let mut header = Vec::with_capacity(LOG_HEADER_SIZE);
        header.extend_from_slice(&LOG_MAGIC.to_be_bytes());
        header.extend_from_slice(&LOG_FORMAT_VERSION.to_le_bytes());
        header.extend_from_slice(&0u64.to_le_bytes()); // reserved
        file.write_all(&header)?;
        file.sync_all()?;

        Ok(Self { file })
    }

    /// Open an existing log file and read every entry.
    ///
    /// A torn trailing entry (crash mid-append) is cut off; a complete
    /// entry with a bad checksum is corruption.
    pub fn open(path: impl AsRef<Path>) -> Result<(Self, Vec<LogEntry>)> {
        let path = path.as_ref();
        let mut file = OpenOptions::new().read(true).write(true).open(path)?;

        let mut header = [0u8; LOG_HEADER_SIZE];
        file.read_exact(&mut header).map_err(|e| match e.kind() {
            ErrorKind::UnexpectedEof => Error::Corruption("Log header truncated".to_string()),
            _ => Error::Io(e),
        })?;
        let magic = u32::from_be_bytes([header[0], header[1], header[2], header[3]]);
        if magic != LOG_MAGIC {
            return Err(Error::Corruption("Invalid log magic".to_string()));
        }
        let format = u32::from_le_bytes([header[4], header[5], header[6], header[7]]);
        if format != LOG_FORMAT_VERSION {
            return Err(Error::Corruption(format!("Unsupported log format {}", format)));
        }

        let (entries, valid_len) = Self::read_entries(&mut file)?;

        let file_len = file.metadata()?.len();
        if valid_len < file_len {
            warn!(
                "Truncating torn log tail in {} ({} bytes)",
                path.display(),
                file_len - valid_len
            );
            file.set_len(valid_len)?;
            file.sync_all()?;
        }

        debug!("Read {} log entries from {}", entries.len(), path.display());
        Ok((Self { file }, entries))
    }

    fn read_entries(file: &mut File) -> Result<(Vec<LogEntry>, u64)> {
        let file_len = file.metadata()?.len();
        file.seek(SeekFrom::Start(LOG_HEADER_SIZE as u64))?;

        let mut entries = Vec::new();
        let mut valid_len = LOG_HEADER_SIZE as u64;
        loop {
            let mut len_bytes = [0u8; ENTRY_HEADER_SIZE];
            match file.read_exact(&mut len_bytes) {
                Ok(_) => {}
                Err(e) if e.kind() == ErrorKind::UnexpectedEof => break,
                Err(e) => return Err(e.into()),
            }
            let len = u32::from_le_bytes(len_bytes) as usize;
            if valid_len + (ENTRY_HEADER_SIZE + len + 4) as u64 > file_len {
                // Length prefix written, payload never made it
                break;
            }

            let mut data = vec![0u8; len];
            let mut crc_bytes = [0u8; 4];
            let complete = file
                .read_exact(&mut data)
                .and_then(|_| file.read_exact(&mut crc_bytes));
            match complete {
                Ok(_) => {}
                Err(e) if e.kind() == ErrorKind::UnexpectedEof => break,
                Err(e) => return Err(e.into()),
            }

            if !checksum::verify(&data, u32::from_le_bytes(crc_bytes)) {
                return Err(Error::ChecksumMismatch);
            }

            entries.push(codec::decode(&data)?);
            valid_len += (ENTRY_HEADER_SIZE + len + 4) as u64;
        }

        Ok((entries, valid_len))
    }

    /// Append one entry; `sync` forces it to disk before returning
    pub fn append(&mut self, entry: &LogEntry, sync: bool) -> Result<()> {
        let data = codec::encode(entry)?;
        let len = u32::try_from(data.len())
            .map_err(|_| Error::InvalidArgument("Log entry larger than 4 GiB".to_string()))?;

        let mut buf = Vec::with_capacity(ENTRY_HEADER_SIZE + data.len() + 4);
        buf.extend_from_slice(&len.to_le_bytes());
        buf.extend_from_slice(&data);
        buf.extend_from_slice(&checksum::compute(&data).to_le_bytes());

        self.file.seek(SeekFrom::End(0))?;
        self.file.write_all(&buf)?;
        if sync {
            self.file.sync_data()?;
        }
        Ok(())
    }
}

/// Log backend of an engine: a file for on-disk databases, an encoding
/// sink for in-memory ones
pub enum CommitLog {
    File(Wal),
    Memory(MemoryLog),
}

impl CommitLog {
    /// Open the log in `dir`, creating it when absent
    pub fn open_dir(dir: &Path) -> Result<(Self, Vec<LogEntry>)> {
        let path = dir.join(LOG_FILE_NAME);
        if path.exists() {
            let (wal, entries) = Wal::open(&path)?;
            Ok((CommitLog::File(wal), entries))
        } else {
            Ok((CommitLog::File(Wal::create(&path)?), Vec::new()))
        }
    }

    pub fn memory() -> Self {
        CommitLog::Memory(MemoryLog::new())
    }

    pub fn append(&mut self, entry: &LogEntry, sync: bool) -> Result<()> {
        match self {
            CommitLog::File(wal) => wal.append(entry, sync),
            CommitLog::Memory(log) => log.append(entry),
        }
    }
}
