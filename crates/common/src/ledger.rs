//! # Run Ledger: Disk-Backed Hardening Audit Trail
//!
//! Every hardening run, successful or not, is archived with `rkyv` so that the
//! complete attempt history survives the process. The ledger is rewritten
//! whole on append and opened read-only through `mmap` for inspection.

use crate::{RiskLevel, Status};
use memmap2::Mmap;
use rkyv::{Archive, Deserialize, Serialize};
use std::fs::File;
use std::io::Write;
use std::path::Path;

/// Errors from ledger operations.
#[derive(Debug, thiserror::Error)]
pub enum LedgerError {
    #[error("I/O error: {0}")]
    IoError(#[from] std::io::Error),
    #[error("Deserialization error: {0}")]
    DeserializeError(String),
}

/// Final status codes stored in [`LedgerEntry::final_status`].
pub const FINAL_SAFE: u8 = 0;
pub const FINAL_CRITICAL: u8 = 1;

/// One archived attempt.
#[derive(Debug, Clone, PartialEq, Archive, Deserialize, Serialize)]
#[rkyv(derive(Debug))]
pub struct AttemptRecord {
    pub attempt: u32,
    pub raw_code: String,
    pub output_variable: Option<String>,
    pub expression: Option<String>,
    /// [`Status`] as `u8`.
    pub status: u8,
    /// [`RiskLevel`] as `u8`.
    pub risk_level: u8,
    pub reason: String,
}

impl AttemptRecord {
    pub fn status(&self) -> Option<Status> {
        Status::from_u8(self.status)
    }

    pub fn risk_level(&self) -> Option<RiskLevel> {
        RiskLevel::from_u8(self.risk_level)
    }
}

/// One archived hardening run.
#[derive(Debug, Clone, PartialEq, Archive, Deserialize, Serialize)]
#[rkyv(derive(Debug))]
pub struct LedgerEntry {
    /// UUID v4, hyphenated.
    pub run_id: String,
    /// Seconds since the Unix epoch.
    pub timestamp: u64,
    pub description: String,
    /// BLAKE3 fingerprint of the policy enforced during the run.
    pub rules_fingerprint: [u8; 32],
    /// [`FINAL_SAFE`] or [`FINAL_CRITICAL`].
    pub final_status: u8,
    pub explanation: Option<String>,
    pub attempts: Vec<AttemptRecord>,
}

impl LedgerEntry {
    pub fn is_safe(&self) -> bool {
        self.final_status == FINAL_SAFE
    }
}

/// In-memory ledger, serializable to disk.
#[derive(Debug, Clone, Default, Archive, Deserialize, Serialize)]
#[rkyv(derive(Debug))]
pub struct RunLedger {
    pub entries: Vec<LedgerEntry>,
}

impl RunLedger {
    pub fn new() -> Self {
        Self {
            entries: Vec::new(),
        }
    }

    /// Reads a ledger file into memory. A missing file is an empty ledger.
    pub fn load(path: &Path) -> Result<Self, LedgerError> {
        if !path.exists() {
            return Ok(Self::new());
        }
        let mapped = MappedLedger::open(path)?;
        rkyv::deserialize::<RunLedger, rkyv::rancor::Error>(mapped.archived())
            .map_err(|e| LedgerError::DeserializeError(e.to_string()))
    }

    pub fn push(&mut self, entry: LedgerEntry) {
        self.entries.push(entry);
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Sorts entries by timestamp (stable) and serializes with `rkyv`.
    pub fn to_bytes(&mut self) -> Result<Vec<u8>, LedgerError> {
        self.entries.sort_by_key(|e| e.timestamp);
        let aligned = rkyv::to_bytes::<rkyv::rancor::Error>(&*self)
            .map_err(|e| LedgerError::DeserializeError(e.to_string()))?;
        Ok(aligned.to_vec())
    }

    /// Writes the whole ledger to `path`, creating parent directories.
    pub fn save(&mut self, path: &Path) -> Result<(), LedgerError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let bytes = self.to_bytes()?;
        let mut file = File::create(path)?;
        file.write_all(&bytes)?;
        Ok(())
    }

    /// Load, append, save.
    pub fn append(path: &Path, entry: LedgerEntry) -> Result<usize, LedgerError> {
        let mut ledger = Self::load(path)?;
        ledger.push(entry);
        ledger.save(path)?;
        Ok(ledger.len())
    }
}

/// Memory-mapped read-only ledger handle.
pub struct MappedLedger {
    _mmap: Mmap,
}

impl MappedLedger {
    /// Opens and validates a ledger file.
    pub fn open(path: &Path) -> Result<Self, LedgerError> {
        let file = File::open(path)?;
        let mmap = unsafe { Mmap::map(&file)? };

        rkyv::access::<ArchivedRunLedger, rkyv::rancor::Error>(&mmap)
            .map_err(|e| LedgerError::DeserializeError(e.to_string()))?;

        Ok(Self { _mmap: mmap })
    }

    /// Zero-copy view of the archive.
    pub fn archived(&self) -> &ArchivedRunLedger {
        // SAFETY: validated in `open()`; the mmap lives as long as `self`.
        unsafe { rkyv::access_unchecked::<ArchivedRunLedger>(&self._mmap[..]) }
    }

    pub fn len(&self) -> usize {
        self.archived().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.archived().entries.is_empty()
    }
}
