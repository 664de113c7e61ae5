//! Append-only audit journal of broker activity.
//!
//! One JSON object per line. Each entry carries an HMAC-SHA256 over the
//! previous entry's hash, its own header fields and its metadata, so
//! removing, reordering or editing entries breaks the chain.

use std::fs::{self, File, OpenOptions};
use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use base64::{engine::general_purpose, Engine as _};
use hmac::{Hmac, Mac};
use nod_common::RequestId;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha2::Sha256;

use crate::error::{BrokerError, Result};

type HmacSha256 = Hmac<Sha256>;

pub const DEFAULT_JOURNAL_KEY: &str = "nod-journal-change-me";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum JournalEvent {
    Request,
    Decision,
    Credits,
    AgentExit,
}

impl JournalEvent {
    fn as_str(&self) -> &'static str {
        match self {
            JournalEvent::Request => "REQUEST",
            JournalEvent::Decision => "DECISION",
            JournalEvent::Credits => "CREDITS",
            JournalEvent::AgentExit => "AGENT_EXIT",
        }
    }
}

#[derive(Serialize, Deserialize, Clone, Debug)]
pub struct JournalEntry {
    pub seq: u64,
    /// Milliseconds since the Unix epoch.
    pub ts: i64,
    pub ev: JournalEvent,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub request_id: Option<RequestId>,
    pub meta: Value,
    pub prev: String,
    pub hash: String,
}

struct ChainState {
    file: File,
    seq: u64,
    last_hash: String,
}

pub struct Journal {
    path: PathBuf,
    key: Vec<u8>,
    state: Mutex<ChainState>,
}

impl Journal {
    /// Opens (or creates) a journal, continuing the chain of an existing file.
    pub fn open(path: impl AsRef<Path>, key: &[u8]) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent)?;
        }

        let (seq, last_hash) = match last_entry(&path)? {
            Some(entry) => (entry.seq, entry.hash),
            None => (0, String::new()),
        };

        let file = OpenOptions::new().create(true).append(true).open(&path)?;
        Ok(Self {
            path,
            key: key.to_vec(),
            state: Mutex::new(ChainState {
                file,
                seq,
                last_hash,
            }),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Appends one entry and returns its hash.
    pub fn append(
        &self,
        ev: JournalEvent,
        request_id: Option<RequestId>,
        meta: Value,
    ) -> Result<String> {
        let mut state = self
            .state
            .lock()
            .map_err(|_| BrokerError::Journal("journal lock poisoned".to_string()))?;

        let seq = state.seq + 1;
        let ts = chrono::Utc::now().timestamp_millis();
        let hash = chain_hash(&self.key, &state.last_hash, seq, ts, ev, request_id, &meta)?;

        let entry = JournalEntry {
            seq,
            ts,
            ev,
            request_id,
            meta,
            prev: state.last_hash.clone(),
            hash: hash.clone(),
        };
        let line = serde_json::to_string(&entry).map_err(|e| BrokerError::Journal(e.to_string()))?;
        state.file.write_all(line.as_bytes())?;
        state.file.write_all(b"\n")?;
        state.file.flush()?;

        state.seq = seq;
        state.last_hash = hash.clone();
        Ok(hash)
    }

    pub fn current_seq(&self) -> u64 {
        self.state.lock().map(|state| state.seq).unwrap_or(0)
    }
}

fn chain_hash(
    key: &[u8],
    prev: &str,
    seq: u64,
    ts: i64,
    ev: JournalEvent,
    request_id: Option<RequestId>,
    meta: &Value,
) -> Result<String> {
    let mut mac =
        HmacSha256::new_from_slice(key).map_err(|e| BrokerError::Journal(e.to_string()))?;
    let request = request_id.map(|id| id.to_string()).unwrap_or_default();
    let canonical = format!("{}|{}|{}|{}", seq, ts, ev.as_str(), request);
    let meta = serde_json::to_string(meta).map_err(|e| BrokerError::Journal(e.to_string()))?;

    mac.update(prev.as_bytes());
    mac.update(canonical.as_bytes());
    mac.update(meta.as_bytes());
    Ok(general_purpose::STANDARD.encode(mac.finalize().into_bytes()))
}

fn last_entry(path: &Path) -> Result<Option<JournalEntry>> {
    if !path.exists() {
        return Ok(None);
    }
    let reader = BufReader::new(File::open(path)?);
    let mut last = None;
    for line in reader.lines() {
        let line = line?;
        if line.trim().is_empty() {
            continue;
        }
        last = Some(line);
    }
    match last {
        Some(line) => serde_json::from_str(&line).map(Some).map_err(|e| {
            BrokerError::Journal(format!(
                "cannot resume {}: last entry unreadable: {}",
                path.display(),
                e
            ))
        }),
        None => Ok(None),
    }
}

/// Checks sequence numbers, back-links and hashes of a whole journal.
pub struct JournalVerifier {
    key: Vec<u8>,
}

impl JournalVerifier {
    pub fn new(key: &[u8]) -> Self {
        Self { key: key.to_vec() }
    }

    pub fn verify_file(&self, path: impl AsRef<Path>) -> Result<bool> {
        let reader = BufReader::new(File::open(path)?);
        let mut prev = String::new();
        let mut expected_seq = 1u64;

        for line in reader.lines() {
            let line = line?;
            if line.trim().is_empty() {
                continue;
            }
            let Ok(entry) = serde_json::from_str::<JournalEntry>(&line) else {
                return Ok(false);
            };
            if entry.seq != expected_seq || entry.prev != prev {
                return Ok(false);
            }
            let expected = chain_hash(
                &self.key,
                &prev,
                entry.seq,
                entry.ts,
                entry.ev,
                entry.request_id,
                &entry.meta,
            )?;
            if entry.hash != expected {
                return Ok(false);
            }
            prev = entry.hash;
            expected_seq += 1;
        }

        Ok(true)
    }
}
