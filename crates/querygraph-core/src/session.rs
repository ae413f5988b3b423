//! In-memory session store.
//!
//! Sessions are created when a run starts, looked up by id while it runs and
//! afterwards, and removed explicitly or once their TTL has elapsed.

use crate::{QueryGraphError, Result, RunState, SessionStore};
use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use tracing::debug;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ValidationStatus {
    Passed,
    Failed,
    Warnings,
    NotValidated,
}

/// One generated query, numbered per session starting at 1.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueryVersion {
    pub version: u32,
    pub sql: String,
    pub validation: ValidationStatus,
    pub warnings: Vec<String>,
    pub generated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StatusEntry {
    pub state: RunState,
    pub detail: Option<String>,
    pub at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionRecord {
    pub id: Uuid,
    pub state: RunState,
    pub history: Vec<StatusEntry>,
    pub versions: Vec<QueryVersion>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

pub struct InMemorySessionStore {
    sessions: DashMap<Uuid, SessionRecord>,
    ttl: Duration,
}

impl InMemorySessionStore {
    pub fn new(ttl_secs: u64) -> Self {
        Self {
            sessions: DashMap::new(),
            ttl: Duration::seconds(i64::try_from(ttl_secs).unwrap_or(i64::MAX / 1000)),
        }
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }
}

impl Default for InMemorySessionStore {
    fn default() -> Self {
        Self::new(3600)
    }
}

#[async_trait]
impl SessionStore for InMemorySessionStore {
    async fn create_session(&self, id: Uuid) -> Result<()> {
        let now = Utc::now();
        self.sessions.insert(
            id,
            SessionRecord {
                id,
                state: RunState::Started,
                history: vec![StatusEntry {
                    state: RunState::Started,
                    detail: None,
                    at: now,
                }],
                versions: Vec::new(),
                created_at: now,
                updated_at: now,
                expires_at: now + self.ttl,
            },
        );
        debug!("Session {} created", id);
        Ok(())
    }

    async fn record_status(&self, id: Uuid, state: RunState, detail: Option<String>) -> Result<()> {
        let mut record = self
            .sessions
            .get_mut(&id)
            .ok_or(QueryGraphError::SessionNotFound(id))?;
        let now = Utc::now();
        record.state = state;
        record.history.push(StatusEntry {
            state,
            detail,
            at: now,
        });
        record.updated_at = now;
        record.expires_at = now + self.ttl;
        Ok(())
    }

    async fn record_query_version(
        &self,
        id: Uuid,
        sql: String,
        validation: ValidationStatus,
        warnings: Vec<String>,
    ) -> Result<u32> {
        let mut record = self
            .sessions
            .get_mut(&id)
            .ok_or(QueryGraphError::SessionNotFound(id))?;
        let version = record.versions.last().map(|v| v.version + 1).unwrap_or(1);
        let now = Utc::now();
        record.versions.push(QueryVersion {
            version,
            sql,
            validation,
            warnings,
            generated_at: now,
        });
        record.updated_at = now;
        Ok(version)
    }

    async fn prior_versions(&self, id: Uuid) -> Result<Vec<QueryVersion>> {
        self.sessions
            .get(&id)
            .map(|record| record.versions.clone())
            .ok_or(QueryGraphError::SessionNotFound(id))
    }

    async fn get_session(&self, id: Uuid) -> Result<Option<SessionRecord>> {
        Ok(self.sessions.get(&id).map(|record| record.clone()))
    }

    async fn remove_session(&self, id: Uuid) -> Result<bool> {
        Ok(self.sessions.remove(&id).is_some())
    }

    async fn evict_expired(&self, now: DateTime<Utc>) -> Result<usize> {
        let before = self.sessions.len();
        self.sessions.retain(|_, record| record.expires_at > now);
        let evicted = before.saturating_sub(self.sessions.len());
        if evicted > 0 {
            debug!("Evicted {} expired sessions", evicted);
        }
        Ok(evicted)
    }
}
