//! Session record: distinguishes a clean shutdown from a crash.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::config::state_dir;
use crate::error::Result;
use crate::persist::{read_json, write_json_atomic};
use crate::process::process_alive;

const SESSIONS_DIR_NAME: &str = "sessions";

/// Liveness record for one backlog+lineage.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Session {
    pub backlog_id: String,
    pub lineage: String,
    /// Set when a run starts; cleared only by a clean shutdown.
    pub active: bool,
    pub clean_shutdown: bool,
    pub pid: u32,
    pub started_at: DateTime<Utc>,
    pub last_heartbeat: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ended_at: Option<DateTime<Utc>>,
}

impl Session {
    /// Started and never marked cleanly shut down.
    pub fn is_open(&self) -> bool {
        self.active && !self.clean_shutdown
    }

    pub fn heartbeat_age(&self) -> Duration {
        (Utc::now() - self.last_heartbeat)
            .to_std()
            .unwrap_or_default()
    }

    /// An open session whose process is running and whose heartbeat is
    /// younger than `max_idle` belongs to a run still in progress.
    pub fn is_live(&self, max_idle: Duration) -> bool {
        self.is_open() && self.heartbeat_age() < max_idle && process_alive(self.pid)
    }

    /// Open but no longer live: the owning process died mid-run or went
    /// quiet for longer than `max_idle`.
    pub fn indicates_crash(&self, max_idle: Duration) -> bool {
        self.is_open() && !self.is_live(max_idle)
    }
}

/// File-backed session record.
#[derive(Debug, Clone)]
pub struct SessionStore {
    path: PathBuf,
    backlog_id: String,
    lineage: String,
}

impl SessionStore {
    pub fn new(root: &Path, backlog_id: impl Into<String>, lineage: impl Into<String>) -> Self {
        let lineage = lineage.into();
        let path = state_dir(root)
            .join(SESSIONS_DIR_NAME)
            .join(format!("{}.json", lineage));
        Self {
            path,
            backlog_id: backlog_id.into(),
            lineage,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn load(&self) -> Result<Option<Session>> {
        read_json(&self.path)
    }

    /// Mark a run as active, replacing any previous record.
    pub fn begin(&self) -> Result<Session> {
        let now = Utc::now();
        let session = Session {
            backlog_id: self.backlog_id.clone(),
            lineage: self.lineage.clone(),
            active: true,
            clean_shutdown: false,
            pid: std::process::id(),
            started_at: now,
            last_heartbeat: now,
            ended_at: None,
        };
        write_json_atomic(&self.path, &session)?;
        debug!(lineage = %self.lineage, "session started");
        Ok(session)
    }

    /// Overwrite the record.
    pub fn save(&self, session: &Session) -> Result<()> {
        write_json_atomic(&self.path, session)
    }

    /// Refresh `last_heartbeat` on an active session. No-op otherwise.
    pub fn heartbeat(&self) -> Result<()> {
        if let Some(mut session) = self.load()? {
            if session.active {
                session.last_heartbeat = Utc::now();
                write_json_atomic(&self.path, &session)?;
            }
        }
        Ok(())
    }

    /// Write the clean-shutdown marker.
    pub fn mark_clean_shutdown(&self) -> Result<()> {
        let now = Utc::now();
        let mut session = match self.load()? {
            Some(session) => session,
            None => Session {
                backlog_id: self.backlog_id.clone(),
                lineage: self.lineage.clone(),
                active: false,
                clean_shutdown: true,
                pid: std::process::id(),
                started_at: now,
                last_heartbeat: now,
                ended_at: None,
            },
        };
        session.active = false;
        session.clean_shutdown = true;
        session.last_heartbeat = now;
        session.ended_at = Some(now);
        write_json_atomic(&self.path, &session)?;
        debug!(lineage = %self.lineage, "session closed cleanly");
        Ok(())
    }

    /// Remove the record entirely (fresh start).
    pub fn discard(&self) -> Result<()> {
        match fs::remove_file(&self.path) {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(err) => Err(err.into()),
        }
    }
}
