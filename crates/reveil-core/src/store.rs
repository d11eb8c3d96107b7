//! Config coordination boundary between the scheduler and request handlers.
//!
//! Readers take a cloned snapshot under a shared lock and release it
//! immediately; writers go through [`AlarmStore::transactional_update`], which
//! validates, persists and publishes a new revision atomically. The lock is a
//! `tokio::sync::RwLock`, which queues waiters fairly, so a steady stream of
//! readers never starves a pending writer.

use std::sync::Mutex;

use chrono::Utc;
use rusqlite::{Connection, OptionalExtension};
use tokio::sync::{watch, RwLock};
use tracing::{info, warn};

use crate::{
    alarm::AlarmDefinition,
    db::init_db,
    error::Result,
};

pub struct AlarmStore {
    conn: Mutex<Connection>,
    current: RwLock<AlarmDefinition>,
    revision: watch::Sender<u64>,
}

impl AlarmStore {
    /// Open the store, loading the persisted definition.
    ///
    /// When nothing is stored yet, `seed` (or a disabled default) is
    /// validated and written. A stored definition that no longer validates
    /// is loaded with `enabled = false`.
    pub fn open(conn: Connection, seed: Option<AlarmDefinition>) -> Result<Self> {
        init_db(&conn)?;

        let stored: Option<(String, i64)> = conn
            .query_row(
                "SELECT definition, revision FROM alarm WHERE id = 1",
                [],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
            .optional()?;

        let store = match stored {
            Some((json, revision)) => {
                let definition = decode_stored(&json);
                Self::from_parts(conn, definition, revision.max(0) as u64)
            }
            None => {
                let definition = match seed {
                    Some(def) => {
                        def.validate()?;
                        def
                    }
                    None => AlarmDefinition::default(),
                };
                let store = Self::from_parts(conn, definition.clone(), 0);
                store.persist(&definition, 0)?;
                info!(enabled = definition.enabled, time = %definition.time_of_day, "alarm definition seeded");
                store
            }
        };
        Ok(store)
    }

    fn from_parts(conn: Connection, definition: AlarmDefinition, revision: u64) -> Self {
        let (revision, _) = watch::channel(revision);
        Self {
            conn: Mutex::new(conn),
            current: RwLock::new(definition),
            revision,
        }
    }

    /// Consistent copy of the current definition. Never blocks on I/O.
    pub async fn load_snapshot(&self) -> AlarmDefinition {
        self.current.read().await.clone()
    }

    /// Atomic read-modify-write.
    ///
    /// The mutator runs on a copy; the result must validate and be persisted
    /// before it becomes visible. On any error the stored and in-memory
    /// definitions are unchanged and no notification is sent.
    pub async fn transactional_update<F>(&self, mutator: F) -> Result<AlarmDefinition>
    where
        F: FnOnce(&mut AlarmDefinition),
    {
        let mut current = self.current.write().await;
        let mut next = current.clone();
        mutator(&mut next);
        next.validate()?;

        if next == *current {
            return Ok(next);
        }

        let revision = *self.revision.borrow() + 1;
        self.persist(&next, revision)?;
        *current = next.clone();
        self.revision.send_replace(revision);

        info!(
            revision,
            enabled = next.enabled,
            time = %next.time_of_day,
            "alarm definition updated"
        );
        Ok(next)
    }

    /// Replace the whole definition (same guarantees as `transactional_update`).
    pub async fn replace(&self, definition: AlarmDefinition) -> Result<AlarmDefinition> {
        self.transactional_update(move |d| *d = definition).await
    }

    /// Receiver that observes the revision number after every committed change.
    pub fn subscribe_on_change(&self) -> watch::Receiver<u64> {
        self.revision.subscribe()
    }

    pub fn revision(&self) -> u64 {
        *self.revision.borrow()
    }

    fn persist(&self, definition: &AlarmDefinition, revision: u64) -> Result<()> {
        let json = serde_json::to_string(definition)?;
        let now = Utc::now().to_rfc3339();
        let mut conn = self.conn.lock().unwrap_or_else(|e| e.into_inner());
        let tx = conn.transaction()?;
        tx.execute(
            "INSERT INTO alarm (id, definition, revision, updated_at)
             VALUES (1, ?1, ?2, ?3)
             ON CONFLICT(id) DO UPDATE SET
                definition = excluded.definition,
                revision   = excluded.revision,
                updated_at = excluded.updated_at",
            rusqlite::params![json, revision as i64, now],
        )?;
        tx.commit()?;
        Ok(())
    }
}

fn decode_stored(json: &str) -> AlarmDefinition {
    match serde_json::from_str::<AlarmDefinition>(json) {
        Ok(def) => match def.validate() {
            Ok(()) => def,
            Err(e) => {
                warn!(error = %e, "stored alarm definition invalid; loading it disabled");
                AlarmDefinition {
                    enabled: false,
                    ..def
                }
            }
        },
        Err(e) => {
            warn!(error = %e, "stored alarm definition unreadable; using disabled default");
            AlarmDefinition::default()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::alarm::TimeOfDay;

    fn seed() -> AlarmDefinition {
        AlarmDefinition {
            enabled: true,
            device_name: "Kitchen".into(),
            playback_target: "spotify:album:1".into(),
            ..AlarmDefinition::default()
        }
    }

    #[tokio::test]
    async fn seeds_when_empty() {
        let store = AlarmStore::open(Connection::open_in_memory().unwrap(), Some(seed())).unwrap();
        let def = store.load_snapshot().await;
        assert!(def.enabled);
        assert_eq!(def.device_name, "Kitchen");
        assert_eq!(store.revision(), 0);
    }

    #[tokio::test]
    async fn invalid_seed_is_rejected() {
        let mut bad = seed();
        bad.device_name.clear();
        assert!(AlarmStore::open(Connection::open_in_memory().unwrap(), Some(bad)).is_err());
    }

    #[tokio::test]
    async fn update_persists_and_notifies() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("reveil.db");

        let store = AlarmStore::open(Connection::open(&path).unwrap(), Some(seed())).unwrap();
        let mut rx = store.subscribe_on_change();

        let updated = store
            .transactional_update(|d| d.time_of_day = TimeOfDay { hour: 6, minute: 15 })
            .await
            .unwrap();
        assert_eq!(updated.time_of_day.to_string(), "06:15");
        assert!(rx.has_changed().unwrap());
        assert_eq!(*rx.borrow_and_update(), 1);

        // Reopen: the stored row wins over the seed.
        drop(store);
        let reopened = AlarmStore::open(Connection::open(&path).unwrap(), Some(seed())).unwrap();
        assert_eq!(reopened.load_snapshot().await.time_of_day.to_string(), "06:15");
        assert_eq!(reopened.revision(), 1);
    }

    #[tokio::test]
    async fn rejected_update_leaves_state_untouched() {
        let store = AlarmStore::open(Connection::open_in_memory().unwrap(), Some(seed())).unwrap();
        let rx = store.subscribe_on_change();

        let res = store.transactional_update(|d| d.volume = 150).await;
        assert!(res.is_err());
        assert_eq!(store.load_snapshot().await.volume, 50);
        assert!(!rx.has_changed().unwrap());
    }

    #[tokio::test]
    async fn no_op_update_does_not_bump_revision() {
        let store = AlarmStore::open(Connection::open_in_memory().unwrap(), Some(seed())).unwrap();
        store.transactional_update(|d| d.volume = 50).await.unwrap();
        assert_eq!(store.revision(), 0);
    }

    #[tokio::test]
    async fn invalid_stored_row_loads_disabled() {
        let conn = Connection::open_in_memory().unwrap();
        init_db(&conn).unwrap();
        conn.execute(
            "INSERT INTO alarm (id, definition, revision, updated_at)
             VALUES (1, ?1, 3, '2026-01-01T00:00:00Z')",
            [r#"{"time_of_day":"07:00","enabled":true,"device_name":"","playback_target":""}"#],
        )
        .unwrap();

        let store = AlarmStore::open(conn, None).unwrap();
        assert!(!store.load_snapshot().await.enabled);
        assert_eq!(store.revision(), 3);
    }
}
