//! Persistence capability: an append-only event log plus a latest-value
//! state store, keyed by string ids. SQLite is the shipped backing; the
//! trait keeps it swappable.

use crate::error::Result;
use crate::failover::{FailoverEvent, RecoveryEvent};
use crate::integrity::{AlertEvent, RepairEvent, ReplicationAudit};
use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

/// Version stamped into every persisted record; bump when a record's
/// serialized shape changes incompatibly.
pub const RECORD_SCHEMA_VERSION: u32 = 1;

pub fn record_schema_version() -> u32 {
    RECORD_SCHEMA_VERSION
}

/// Everything the fleet appends to its audit trail.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum FleetEvent {
    Failover(FailoverEvent),
    Recovery(RecoveryEvent),
    Audit(ReplicationAudit),
    Repair(RepairEvent),
    Alert(AlertEvent),
}

impl FleetEvent {
    pub fn kind(&self) -> &'static str {
        match self {
            FleetEvent::Failover(_) => "failover",
            FleetEvent::Recovery(_) => "recovery",
            FleetEvent::Audit(_) => "audit",
            FleetEvent::Repair(_) => "repair",
            FleetEvent::Alert(_) => "alert",
        }
    }

    pub fn event_id(&self) -> &str {
        match self {
            FleetEvent::Failover(event) => &event.event_id,
            FleetEvent::Recovery(event) => &event.event_id,
            FleetEvent::Audit(audit) => &audit.audit_id,
            FleetEvent::Repair(event) => &event.event_id,
            FleetEvent::Alert(event) => &event.event_id,
        }
    }

    pub fn timestamp(&self) -> DateTime<Utc> {
        match self {
            FleetEvent::Failover(event) => event.timestamp,
            FleetEvent::Recovery(event) => event.timestamp,
            FleetEvent::Audit(audit) => audit.checked_at,
            FleetEvent::Repair(event) => event.timestamp,
            FleetEvent::Alert(event) => event.timestamp,
        }
    }
}

/// Persistence capability consumed by the fleet services. Writers treat
/// failures as log-and-continue: a failed audit write never blocks the
/// in-memory state transition that triggered it.
pub trait FleetStore: Send + Sync {
    fn append_event(&self, event: &FleetEvent) -> Result<()>;

    /// Most recent events first.
    fn recent_events(&self, limit: usize) -> Result<Vec<FleetEvent>>;

    /// Replace the value stored under `key` wholesale.
    fn save_state(&self, key: &str, value: &serde_json::Value) -> Result<()>;

    fn load_state(&self, key: &str) -> Result<Option<serde_json::Value>>;

    /// All `(key, value)` pairs whose key starts with `prefix`.
    fn load_state_prefix(&self, prefix: &str) -> Result<Vec<(String, serde_json::Value)>>;
}

/// SQLite-backed store: one `fleet_events` append-only table and one
/// `fleet_state` latest-value table.
pub struct SqliteFleetStore {
    db_path: PathBuf,
}

impl SqliteFleetStore {
    pub fn new(db_path: PathBuf) -> Result<Self> {
        if let Some(parent) = db_path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }

        let store = Self { db_path };
        store.init_schema()?;
        Ok(store)
    }

    fn get_conn(&self) -> Result<Connection> {
        let conn = Connection::open(&self.db_path)?;
        conn.pragma_update(None, "journal_mode", "WAL")?;
        conn.busy_timeout(Duration::from_secs(5))?;
        Ok(conn)
    }

    fn init_schema(&self) -> Result<()> {
        let conn = self.get_conn()?;

        conn.execute(
            "CREATE TABLE IF NOT EXISTS fleet_events (
                pk INTEGER PRIMARY KEY AUTOINCREMENT,
                event_id TEXT NOT NULL UNIQUE,
                kind TEXT NOT NULL,
                created_at TEXT NOT NULL,
                payload TEXT NOT NULL
            )",
            [],
        )?;

        conn.execute(
            "CREATE INDEX IF NOT EXISTS idx_fleet_events_kind
             ON fleet_events(kind, pk DESC)",
            [],
        )?;

        conn.execute(
            "CREATE TABLE IF NOT EXISTS fleet_state (
                key TEXT PRIMARY KEY,
                value TEXT NOT NULL,
                updated_at TEXT NOT NULL
            )",
            [],
        )?;

        Ok(())
    }
}

impl FleetStore for SqliteFleetStore {
    fn append_event(&self, event: &FleetEvent) -> Result<()> {
        let conn = self.get_conn()?;
        let payload = serde_json::to_string(event)?;

        conn.execute(
            "INSERT OR IGNORE INTO fleet_events (event_id, kind, created_at, payload)
             VALUES (?1, ?2, ?3, ?4)",
            params![
                event.event_id(),
                event.kind(),
                event.timestamp().to_rfc3339(),
                payload
            ],
        )?;

        Ok(())
    }

    fn recent_events(&self, limit: usize) -> Result<Vec<FleetEvent>> {
        let conn = self.get_conn()?;
        let mut stmt = conn.prepare(
            "SELECT payload FROM fleet_events
             ORDER BY pk DESC
             LIMIT ?1",
        )?;

        let mut rows = stmt.query(params![limit as i64])?;
        let mut events = Vec::new();

        while let Some(row) = rows.next()? {
            let payload: String = row.get(0)?;
            match serde_json::from_str(&payload) {
                Ok(event) => events.push(event),
                Err(error) => {
                    tracing::warn!("Skipping undecodable fleet event: {}", error);
                }
            }
        }

        Ok(events)
    }

    fn save_state(&self, key: &str, value: &serde_json::Value) -> Result<()> {
        let conn = self.get_conn()?;

        conn.execute(
            "INSERT INTO fleet_state (key, value, updated_at)
             VALUES (?1, ?2, ?3)
             ON CONFLICT(key) DO UPDATE SET value = ?2, updated_at = ?3",
            params![key, value.to_string(), Utc::now().to_rfc3339()],
        )?;

        Ok(())
    }

    fn load_state(&self, key: &str) -> Result<Option<serde_json::Value>> {
        let conn = self.get_conn()?;

        let raw: Option<String> = conn
            .query_row(
                "SELECT value FROM fleet_state WHERE key = ?1",
                params![key],
                |row| row.get(0),
            )
            .optional()?;

        match raw {
            Some(raw) => Ok(Some(serde_json::from_str(&raw)?)),
            None => Ok(None),
        }
    }

    fn load_state_prefix(&self, prefix: &str) -> Result<Vec<(String, serde_json::Value)>> {
        let conn = self.get_conn()?;
        let mut stmt = conn.prepare(
            "SELECT key, value FROM fleet_state
             WHERE key LIKE ?1
             ORDER BY key",
        )?;

        let pattern = format!("{}%", prefix);
        let mut rows = stmt.query(params![pattern])?;
        let mut entries = Vec::new();

        while let Some(row) = rows.next()? {
            let key: String = row.get(0)?;
            let raw: String = row.get(1)?;
            entries.push((key, serde_json::from_str(&raw)?));
        }

        Ok(entries)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::failover::{FailoverStatus, RepinResult};

    fn failover_event(id: &str) -> FleetEvent {
        FleetEvent::Failover(FailoverEvent {
            schema_version: RECORD_SCHEMA_VERSION,
            event_id: id.to_string(),
            failed_node_id: "node-c".to_string(),
            failed_address: "10.0.0.3:5001".to_string(),
            timestamp: Utc::now(),
            files_affected: 1,
            backup_node_count: 2,
            per_file_results: vec![RepinResult {
                cid: "bafy-a".to_string(),
                success: true,
            }],
            status: FailoverStatus::Completed,
        })
    }

    #[test]
    fn test_events_survive_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let db_path = dir.path().join("fleet.sqlite3");

        {
            let store = SqliteFleetStore::new(db_path.clone()).unwrap();
            store.append_event(&failover_event("ev-1")).unwrap();
            store.append_event(&failover_event("ev-2")).unwrap();
        }

        let store = SqliteFleetStore::new(db_path).unwrap();
        let events = store.recent_events(10).unwrap();

        assert_eq!(events.len(), 2);
        // Most recent first.
        assert_eq!(events[0].event_id(), "ev-2");
        assert_eq!(events[1].event_id(), "ev-1");
    }

    #[test]
    fn test_recent_events_respects_limit() {
        let dir = tempfile::tempdir().unwrap();
        let store = SqliteFleetStore::new(dir.path().join("fleet.sqlite3")).unwrap();

        for index in 0..5 {
            store
                .append_event(&failover_event(&format!("ev-{}", index)))
                .unwrap();
        }

        let events = store.recent_events(2).unwrap();
        assert_eq!(events.len(), 2);
        assert_eq!(events[0].event_id(), "ev-4");
    }

    #[test]
    fn test_state_replaced_wholesale() {
        let dir = tempfile::tempdir().unwrap();
        let store = SqliteFleetStore::new(dir.path().join("fleet.sqlite3")).unwrap();

        store
            .save_state("report", &serde_json::json!({ "healthy": false, "issues": 3 }))
            .unwrap();
        store
            .save_state("report", &serde_json::json!({ "healthy": true }))
            .unwrap();

        let value = store.load_state("report").unwrap().unwrap();
        assert_eq!(value, serde_json::json!({ "healthy": true }));
        assert!(store.load_state("missing").unwrap().is_none());
    }

    #[test]
    fn test_state_prefix_listing() {
        let dir = tempfile::tempdir().unwrap();
        let store = SqliteFleetStore::new(dir.path().join("fleet.sqlite3")).unwrap();

        store
            .save_state("contract:c-1", &serde_json::json!({ "provider_id": "p-1" }))
            .unwrap();
        store
            .save_state("contract:c-2", &serde_json::json!({ "provider_id": "p-2" }))
            .unwrap();
        store
            .save_state("node_records", &serde_json::json!([]))
            .unwrap();

        let contracts = store.load_state_prefix("contract:").unwrap();
        assert_eq!(contracts.len(), 2);
        assert_eq!(contracts[0].0, "contract:c-1");
    }
}
