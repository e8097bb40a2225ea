//! Session metrics ledger.
//!
//! The orchestrator reports to a [`MetricsSink`] passed in at construction:
//! session info at start, the baseline evaluation of the initial weights,
//! one [`Round`] per finalized round, and a [`SessionSummary`] at the end.
//! A fatal error calls [`MetricsSink::abort`], after which no partial
//! artifact may remain.

use std::collections::BTreeMap;
use std::io::{Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tempfile::NamedTempFile;
use tracing::{debug, warn};

use super::config::SessionConfig;
use super::round::Round;
use crate::blacklist::BlacklistRegistry;
use crate::error::FedvalError;
use crate::transport::ClientProperties;
use crate::weights::{ClientId, Metrics};

/// Environment the session runs in.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct SessionInfo {
    /// Crate version
    pub version: String,
    /// Operating system
    pub os: String,
    /// CPU architecture
    pub arch: String,
    /// Effective configuration
    pub config: SessionConfig,
}

impl SessionInfo {
    /// Describe the current process running `config`.
    pub fn new(config: &SessionConfig) -> Self {
        Self {
            version: crate::VERSION.to_string(),
            os: std::env::consts::OS.to_string(),
            arch: std::env::consts::ARCH.to_string(),
            config: config.clone(),
        }
    }
}

/// End-of-session report.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct SessionSummary {
    /// Rounds finalized
    pub rounds_completed: usize,
    /// Final blacklist with first-flag rounds
    pub blacklist: BlacklistRegistry,
    /// Declared properties of every client seen during the session
    pub clients: BTreeMap<ClientId, ClientProperties>,
    /// Server metrics of the last round
    pub final_server_metrics: Option<Metrics>,
}

/// Receiver of session metrics.
pub trait MetricsSink {
    /// Called once before clients are awaited.
    fn record_session_info(&mut self, info: &SessionInfo) -> Result<(), FedvalError>;

    /// Evaluation of the initial global weights.
    fn record_baseline(&mut self, metrics: &Metrics) -> Result<(), FedvalError>;

    /// A finalized round.
    fn record_round(&mut self, round: &Round) -> Result<(), FedvalError>;

    /// Session completed; persist everything.
    fn finish(&mut self, summary: &SessionSummary) -> Result<(), FedvalError>;

    /// Session failed; discard everything written so far.
    fn abort(&mut self);
}

/// Sink that keeps everything in memory.
#[derive(Clone, Debug, Default)]
pub struct MemorySink {
    /// Recorded session info
    pub info: Option<SessionInfo>,
    /// Recorded baseline
    pub baseline: Option<Metrics>,
    /// Recorded rounds in order
    pub rounds: Vec<Round>,
    /// Recorded summary
    pub summary: Option<SessionSummary>,
    /// Whether the session was aborted
    pub aborted: bool,
}

impl MemorySink {
    /// Create an empty sink.
    pub fn new() -> Self {
        Self::default()
    }
}

impl MetricsSink for MemorySink {
    fn record_session_info(&mut self, info: &SessionInfo) -> Result<(), FedvalError> {
        self.info = Some(info.clone());
        Ok(())
    }

    fn record_baseline(&mut self, metrics: &Metrics) -> Result<(), FedvalError> {
        self.baseline = Some(metrics.clone());
        Ok(())
    }

    fn record_round(&mut self, round: &Round) -> Result<(), FedvalError> {
        self.rounds.push(round.clone());
        Ok(())
    }

    fn finish(&mut self, summary: &SessionSummary) -> Result<(), FedvalError> {
        self.summary = Some(summary.clone());
        Ok(())
    }

    fn abort(&mut self) {
        *self = Self {
            aborted: true,
            ..Self::default()
        };
    }
}

#[derive(Debug, Default, Serialize)]
struct SessionDocument {
    #[serde(skip_serializing_if = "Option::is_none")]
    session: Option<SessionInfo>,
    #[serde(skip_serializing_if = "Option::is_none")]
    baseline: Option<Metrics>,
    rounds: BTreeMap<u64, serde_json::Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    summary: Option<SessionSummary>,
}

/// Sink writing one pretty-printed JSON document.
///
/// The document is rewritten into a temporary file next to the destination
/// after every record and only moved to the destination by
/// [`finish`](MetricsSink::finish). Aborting, or dropping the sink before
/// `finish`, deletes the temporary file.
#[derive(Debug)]
pub struct JsonFileSink {
    path: PathBuf,
    file: Option<NamedTempFile>,
    document: SessionDocument,
}

impl JsonFileSink {
    /// Prepare a sink that will persist to `path`.
    pub fn create<P: AsRef<Path>>(path: P) -> Result<Self, FedvalError> {
        let path = path.as_ref().to_path_buf();
        let dir = match path.parent() {
            Some(parent) if !parent.as_os_str().is_empty() => parent.to_path_buf(),
            _ => PathBuf::from("."),
        };
        let file = NamedTempFile::new_in(dir)?;
        debug!(path = %path.display(), temp = %file.path().display(), "metrics sink opened");
        Ok(Self {
            path,
            file: Some(file),
            document: SessionDocument::default(),
        })
    }

    /// Final destination of the ledger.
    pub fn path(&self) -> &Path {
        &self.path
    }

    fn flush(&mut self) -> Result<(), FedvalError> {
        let file = self
            .file
            .as_mut()
            .ok_or_else(|| FedvalError::Config("metrics sink already closed".into()))?;
        let handle = file.as_file_mut();
        handle.set_len(0)?;
        handle.seek(SeekFrom::Start(0))?;
        serde_json::to_writer_pretty(&mut *handle, &self.document)?;
        handle.flush()?;
        Ok(())
    }
}

impl MetricsSink for JsonFileSink {
    fn record_session_info(&mut self, info: &SessionInfo) -> Result<(), FedvalError> {
        self.document.session = Some(info.clone());
        self.flush()
    }

    fn record_baseline(&mut self, metrics: &Metrics) -> Result<(), FedvalError> {
        self.document.baseline = Some(metrics.clone());
        self.flush()
    }

    fn record_round(&mut self, round: &Round) -> Result<(), FedvalError> {
        self.document
            .rounds
            .insert(round.index, serde_json::to_value(round)?);
        self.flush()
    }

    fn finish(&mut self, summary: &SessionSummary) -> Result<(), FedvalError> {
        self.document.summary = Some(summary.clone());
        self.flush()?;
        let file = self
            .file
            .take()
            .ok_or_else(|| FedvalError::Config("metrics sink already closed".into()))?;
        file.persist(&self.path).map_err(|e| FedvalError::Io(e.error))?;
        debug!(path = %self.path.display(), "metrics ledger persisted");
        Ok(())
    }

    fn abort(&mut self) {
        if let Some(file) = self.file.take() {
            if let Err(e) = file.close() {
                warn!(error = %e, "failed to remove partial metrics ledger");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn summary() -> SessionSummary {
        let mut blacklist = BlacklistRegistry::new();
        blacklist.insert(ClientId::new("mallory"), 2);
        SessionSummary {
            rounds_completed: 3,
            blacklist,
            ..SessionSummary::default()
        }
    }

    #[test]
    fn test_json_sink_persists_on_finish() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("metrics.json");

        let mut sink = JsonFileSink::create(&path).unwrap();
        sink.record_session_info(&SessionInfo::new(&SessionConfig::new(3, 3, 1)))
            .unwrap();
        let mut baseline = Metrics::new();
        baseline.insert("accuracy".into(), 0.1);
        sink.record_baseline(&baseline).unwrap();
        assert!(!path.exists());

        sink.finish(&summary()).unwrap();
        assert!(path.exists());

        let json: serde_json::Value =
            serde_json::from_str(&std::fs::read_to_string(&path).unwrap()).unwrap();
        assert_eq!(json["baseline"]["accuracy"], 0.1);
        assert_eq!(json["summary"]["blacklist"]["mallory"], 2);
        assert_eq!(json["session"]["config"]["num_clients"], 3);
    }

    #[test]
    fn test_json_sink_abort_leaves_nothing() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("metrics.json");

        let mut sink = JsonFileSink::create(&path).unwrap();
        sink.record_baseline(&Metrics::new()).unwrap();
        sink.abort();

        assert!(!path.exists());
        assert_eq!(std::fs::read_dir(dir.path()).unwrap().count(), 0);
    }

    #[test]
    fn test_json_sink_drop_leaves_nothing() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("metrics.json");
        {
            let mut sink = JsonFileSink::create(&path).unwrap();
            sink.record_baseline(&Metrics::new()).unwrap();
        }
        assert_eq!(std::fs::read_dir(dir.path()).unwrap().count(), 0);
    }

    #[test]
    fn test_memory_sink_abort_clears() {
        let mut sink = MemorySink::new();
        sink.record_baseline(&Metrics::new()).unwrap();
        sink.abort();
        assert!(sink.aborted);
        assert!(sink.baseline.is_none());
    }
}
