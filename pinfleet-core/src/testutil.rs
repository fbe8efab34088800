//! Shared test doubles for the capability traits.

use crate::error::Result;
use crate::persistence::{FleetEvent, FleetStore};
use std::collections::HashMap;
use std::sync::Mutex;

#[derive(Default)]
pub(crate) struct MemoryStore {
    pub events: Mutex<Vec<FleetEvent>>,
    pub state: Mutex<HashMap<String, serde_json::Value>>,
}

impl MemoryStore {
    pub fn count_kind(&self, kind: &str) -> usize {
        self.events
            .lock()
            .unwrap()
            .iter()
            .filter(|event| event.kind() == kind)
            .count()
    }
}

impl FleetStore for MemoryStore {
    fn append_event(&self, event: &FleetEvent) -> Result<()> {
        self.events.lock().unwrap().push(event.clone());
        Ok(())
    }

    fn recent_events(&self, limit: usize) -> Result<Vec<FleetEvent>> {
        let events = self.events.lock().unwrap();
        Ok(events.iter().rev().take(limit).cloned().collect())
    }

    fn save_state(&self, key: &str, value: &serde_json::Value) -> Result<()> {
        self.state
            .lock()
            .unwrap()
            .insert(key.to_string(), value.clone());
        Ok(())
    }

    fn load_state(&self, key: &str) -> Result<Option<serde_json::Value>> {
        Ok(self.state.lock().unwrap().get(key).cloned())
    }

    fn load_state_prefix(&self, prefix: &str) -> Result<Vec<(String, serde_json::Value)>> {
        let state = self.state.lock().unwrap();
        let mut entries: Vec<(String, serde_json::Value)> = state
            .iter()
            .filter(|(key, _)| key.starts_with(prefix))
            .map(|(key, value)| (key.clone(), value.clone()))
            .collect();
        entries.sort_by(|a, b| a.0.cmp(&b.0));
        Ok(entries)
    }
}
