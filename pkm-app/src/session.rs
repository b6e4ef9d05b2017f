//! Sessions keyed by id. Each session sits behind its own async mutex so at most one turn
//! runs per session; different sessions proceed in parallel.

use anyhow::Result;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use pkm_llm::{Message, Usage};
use rusqlite::{Connection, params};
use serde::Serialize;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::{Mutex, OwnedMutexGuard};

#[derive(Debug, Clone, Serialize)]
pub struct Session {
    pub id: String,
    pub history: Vec<Message>,
    pub created_at: DateTime<Utc>,
    pub last_active: DateTime<Utc>,
    pub usage_totals: Usage,
    pub turns: u64,
    /// Set by delete so a turn that was waiting on the lock does not write it back.
    #[serde(skip)]
    pub deleted: bool,
}

impl Session {
    pub(crate) fn new(id: &str) -> Self {
        let now = Utc::now();
        Self {
            id: id.to_string(),
            history: Vec::new(),
            created_at: now,
            last_active: now,
            usage_totals: Usage::default(),
            turns: 0,
            deleted: false,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct SessionSummary {
    pub id: String,
    pub created_at: Option<DateTime<Utc>>,
    pub last_active: Option<DateTime<Utc>>,
    pub messages: Option<usize>,
    pub turns: Option<u64>,
    pub usage_totals: Option<Usage>,
    /// A turn holds the lock; details are omitted rather than waited for.
    pub busy: bool,
}

/// SQLite persistence for sessions: upsert, load all, delete. Every call opens its own
/// connection on the blocking pool.
#[derive(Debug, Clone)]
pub struct SessionStore {
    path: PathBuf,
}

const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS pkm_sessions (
    id TEXT PRIMARY KEY,
    history_json TEXT NOT NULL,
    usage_json TEXT NOT NULL,
    turns INTEGER NOT NULL DEFAULT 0,
    created_at TEXT NOT NULL,
    updated_at TEXT NOT NULL
)
"#;

impl SessionStore {
    pub async fn open(path: impl Into<PathBuf>) -> Result<Self> {
        let store = Self { path: path.into() };
        if let Some(parent) = store.path.parent() {
            if !parent.as_os_str().is_empty() {
                tokio::fs::create_dir_all(parent).await.map_err(|e| {
                    anyhow::anyhow!("create session dir {}: {e}", parent.display())
                })?;
            }
        }
        store
            .blocking(|conn| {
                conn.execute_batch(SCHEMA)?;
                Ok(())
            })
            .await?;
        Ok(store)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    async fn blocking<T, F>(&self, f: F) -> Result<T>
    where
        T: Send + 'static,
        F: FnOnce(&Connection) -> Result<T> + Send + 'static,
    {
        let path = self.path.clone();
        tokio::task::spawn_blocking(move || {
            let conn = Connection::open(&path)
                .map_err(|e| anyhow::anyhow!("open session db {}: {e}", path.display()))?;
            f(&conn)
        })
        .await
        .map_err(|e| anyhow::anyhow!("session db task failed: {e}"))?
    }

    pub async fn load_all(&self) -> Result<Vec<Session>> {
        self.blocking(|conn| {
            let mut stmt = conn.prepare(
                "SELECT id, history_json, usage_json, turns, created_at, updated_at FROM pkm_sessions",
            )?;
            let rows = stmt.query_map([], |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, String>(2)?,
                    row.get::<_, i64>(3)?,
                    row.get::<_, String>(4)?,
                    row.get::<_, String>(5)?,
                ))
            })?;
            let mut out = Vec::new();
            for row in rows {
                let (id, history_json, usage_json, turns, created_at, updated_at) = row?;
                match decode_row(&id, &history_json, &usage_json, turns, &created_at, &updated_at) {
                    Ok(session) => out.push(session),
                    Err(e) => {
                        tracing::warn!(session_id = %id, error = %e, "skipping unreadable session row");
                    }
                }
            }
            Ok(out)
        })
        .await
    }

    pub async fn upsert(&self, session: &Session) -> Result<()> {
        let id = session.id.clone();
        let history_json = serde_json::to_string(&session.history)?;
        let usage_json = serde_json::to_string(&session.usage_totals)?;
        let turns = i64::try_from(session.turns).unwrap_or(i64::MAX);
        let created_at = session.created_at.to_rfc3339();
        let updated_at = session.last_active.to_rfc3339();
        self.blocking(move |conn| {
            conn.execute(
                r#"
INSERT INTO pkm_sessions (id, history_json, usage_json, turns, created_at, updated_at)
VALUES (?1, ?2, ?3, ?4, ?5, ?6)
ON CONFLICT(id) DO UPDATE
SET history_json = excluded.history_json,
    usage_json = excluded.usage_json,
    turns = excluded.turns,
    updated_at = excluded.updated_at
"#,
                params![id, history_json, usage_json, turns, created_at, updated_at],
            )?;
            Ok(())
        })
        .await
    }

    pub async fn delete(&self, id: &str) -> Result<bool> {
        let id = id.to_string();
        self.blocking(move |conn| {
            let n = conn.execute("DELETE FROM pkm_sessions WHERE id = ?1", params![id])?;
            Ok(n > 0)
        })
        .await
    }
}

fn decode_row(
    id: &str,
    history_json: &str,
    usage_json: &str,
    turns: i64,
    created_at: &str,
    updated_at: &str,
) -> Result<Session> {
    let history: Vec<Message> = serde_json::from_str(history_json)?;
    let usage_totals: Usage = serde_json::from_str(usage_json)?;
    Ok(Session {
        id: id.to_string(),
        history,
        created_at: DateTime::parse_from_rfc3339(created_at)?.with_timezone(&Utc),
        last_active: DateTime::parse_from_rfc3339(updated_at)?.with_timezone(&Utc),
        usage_totals,
        turns: u64::try_from(turns).unwrap_or(0),
        deleted: false,
    })
}

pub enum LockAttempt {
    Missing,
    Busy,
    Locked(OwnedMutexGuard<Session>),
}

fn summarize(id: String, slot: &Mutex<Session>) -> SessionSummary {
    match slot.try_lock() {
        Ok(s) => SessionSummary {
            id,
            created_at: Some(s.created_at),
            last_active: Some(s.last_active),
            messages: Some(s.history.len()),
            turns: Some(s.turns),
            usage_totals: Some(s.usage_totals),
            busy: false,
        },
        Err(_) => SessionSummary {
            id,
            created_at: None,
            last_active: None,
            messages: None,
            turns: None,
            usage_totals: None,
            busy: true,
        },
    }
}

pub struct SessionManager {
    sessions: DashMap<String, Arc<Mutex<Session>>>,
    store: SessionStore,
}

impl SessionManager {
    pub async fn load_or_new(store: SessionStore) -> Result<Self> {
        let sessions = DashMap::new();
        for session in store.load_all().await? {
            sessions.insert(session.id.clone(), Arc::new(Mutex::new(session)));
        }
        tracing::info!(
            sessions = sessions.len(),
            db = %store.path().display(),
            "sessions loaded"
        );
        Ok(Self { sessions, store })
    }

    pub fn count(&self) -> usize {
        self.sessions.len()
    }

    /// Locks the session for a whole turn, creating it on first use. The DashMap shard
    /// lock is released before awaiting the session lock.
    #[tracing::instrument(level = "debug", skip_all, fields(session_id = %id))]
    pub async fn lock(&self, id: &str) -> OwnedMutexGuard<Session> {
        let slot = self
            .sessions
            .entry(id.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(Session::new(id))))
            .clone();
        slot.lock_owned().await
    }

    /// Non-blocking lookup for read-only callers; never creates a session.
    pub fn try_lock_existing(&self, id: &str) -> LockAttempt {
        let Some(slot) = self.sessions.get(id).map(|s| s.value().clone()) else {
            return LockAttempt::Missing;
        };
        match slot.try_lock_owned() {
            Ok(guard) => LockAttempt::Locked(guard),
            Err(_) => LockAttempt::Busy,
        }
    }

    pub async fn persist(&self, session: &Session) -> Result<()> {
        if session.deleted {
            tracing::debug!(session_id = %session.id, "session deleted during turn, not persisting");
            return Ok(());
        }
        self.store.upsert(session).await
    }

    pub fn list(&self) -> Vec<SessionSummary> {
        let slots: Vec<(String, Arc<Mutex<Session>>)> = self
            .sessions
            .iter()
            .map(|e| (e.key().clone(), e.value().clone()))
            .collect();
        let mut out: Vec<SessionSummary> = slots
            .into_iter()
            .map(|(id, slot)| summarize(id, &slot))
            .collect();
        out.sort_by(|a, b| b.last_active.cmp(&a.last_active));
        out
    }

    /// Waits for any running turn on the session, then removes it from memory and disk.
    #[tracing::instrument(level = "info", skip_all, fields(session_id = %id))]
    pub async fn delete(&self, id: &str) -> Result<bool> {
        let slot = self.sessions.get(id).map(|s| s.value().clone());
        let in_memory = match slot {
            Some(slot) => {
                let mut guard = slot.lock_owned().await;
                guard.deleted = true;
                self.sessions.remove(id);
                true
            }
            None => false,
        };
        let on_disk = self.store.delete(id).await?;
        Ok(in_memory || on_disk)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pkm_llm::CharRatioEstimator;

    #[tokio::test]
    async fn persists_and_reloads_sessions() {
        let tmp = tempfile::tempdir().unwrap();
        let db = tmp.path().join("data").join("sessions.db");
        let est = CharRatioEstimator::default();

        let manager = SessionManager::load_or_new(SessionStore::open(&db).await.unwrap())
            .await
            .unwrap();
        {
            let mut session = manager.lock("s-1").await;
            session.history.push(Message::user_text("hello", &est));
            session.history.push(Message::assistant_text("hi there", &est));
            session.usage_totals.input_tokens = 42;
            session.turns = 1;
            manager.persist(&session).await.unwrap();
        }

        let reloaded = SessionManager::load_or_new(SessionStore::open(&db).await.unwrap())
            .await
            .unwrap();
        let sessions = reloaded.list();
        assert_eq!(sessions.len(), 1);
        assert_eq!(sessions[0].id, "s-1");
        assert_eq!(sessions[0].messages, Some(2));
        assert_eq!(sessions[0].turns, Some(1));
        assert_eq!(sessions[0].usage_totals.map(|u| u.input_tokens), Some(42));

        let session = reloaded.lock("s-1").await;
        assert_eq!(session.history[1].text(), "hi there");
        assert_eq!(session.history[1].token_estimate(), 2);
    }

    #[tokio::test]
    async fn one_turn_at_a_time_per_session() {
        let tmp = tempfile::tempdir().unwrap();
        let manager = Arc::new(
            SessionManager::load_or_new(SessionStore::open(tmp.path().join("s.db")).await.unwrap())
                .await
                .unwrap(),
        );

        let guard = manager.lock("a").await;
        assert!(matches!(manager.try_lock_existing("a"), LockAttempt::Busy));
        assert!(matches!(manager.try_lock_existing("zzz"), LockAttempt::Missing));
        assert!(manager.list()[0].busy);
        // A different session is not blocked.
        let other = manager.lock("b").await;
        drop(other);

        let waiter = {
            let manager = manager.clone();
            tokio::spawn(async move {
                let mut s = manager.lock("a").await;
                s.turns += 1;
                s.turns
            })
        };
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        assert!(!waiter.is_finished());
        drop(guard);
        assert_eq!(waiter.await.unwrap(), 1);
    }

    #[tokio::test]
    async fn delete_removes_memory_and_disk_and_blocks_write_back() {
        let tmp = tempfile::tempdir().unwrap();
        let store = SessionStore::open(tmp.path().join("s.db")).await.unwrap();
        let manager = SessionManager::load_or_new(store.clone()).await.unwrap();

        let guard = manager.lock("gone").await;
        manager.persist(&guard).await.unwrap();
        drop(guard);

        let slot = manager.sessions.get("gone").map(|s| s.value().clone()).unwrap();
        assert!(manager.delete("gone").await.unwrap());
        assert!(store.load_all().await.unwrap().is_empty());
        assert_eq!(manager.count(), 0);

        // A turn still holding the old slot must not resurrect it.
        let stale = slot.lock_owned().await;
        assert!(stale.deleted);
        manager.persist(&stale).await.unwrap();
        assert!(store.load_all().await.unwrap().is_empty());

        assert!(!manager.delete("never-existed").await.unwrap());
    }
}
