use crate::stack::value::{Attributes, Value};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Version of the persisted state layout
pub const STATE_FORMAT_VERSION: u32 = 1;

/// Last-known attributes of every resource in one workspace
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct State {
    pub format_version: u32,
    /// Incremented on every committed mutation
    pub serial: u64,
    /// Identifies one continuous state history; empty until the first commit
    #[serde(default)]
    pub lineage: String,
    #[serde(default)]
    pub resources: BTreeMap<String, ResourceRecord>,
    #[serde(default)]
    pub outputs: BTreeMap<String, Value>,
}

impl Default for State {
    fn default() -> Self {
        Self {
            format_version: STATE_FORMAT_VERSION,
            serial: 0,
            lineage: String::new(),
            resources: BTreeMap::new(),
            outputs: BTreeMap::new(),
        }
    }
}

/// What state remembers about one reconciled instance
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResourceRecord {
    pub instance: String,
    pub module: String,
    pub kind: String,
    pub attributes: Attributes,
    #[serde(default)]
    pub outputs: Attributes,
    #[serde(default)]
    pub dependencies: Vec<String>,
    pub updated_at: DateTime<Utc>,
}

impl State {
    pub fn is_empty(&self) -> bool {
        self.resources.is_empty()
    }

    pub fn get(&self, address: &str) -> Option<&ResourceRecord> {
        self.resources.get(address)
    }

    /// Record a reconciled resource and advance the serial
    pub fn commit(&mut self, address: String, record: ResourceRecord) {
        self.ensure_lineage();
        self.resources.insert(address, record);
        self.serial += 1;
    }

    /// Forget a destroyed resource and advance the serial
    pub fn remove(&mut self, address: &str) -> Option<ResourceRecord> {
        let removed = self.resources.remove(address);
        if removed.is_some() {
            self.serial += 1;
        }
        removed
    }

    /// Update the recorded dependencies of a resource, advancing the serial
    /// only when they change. Returns whether anything changed.
    pub fn set_dependencies(&mut self, address: &str, dependencies: Vec<String>) -> bool {
        match self.resources.get_mut(address) {
            Some(record) if record.dependencies != dependencies => {
                record.dependencies = dependencies;
                self.serial += 1;
                true
            }
            _ => false,
        }
    }

    /// Replace root outputs, advancing the serial only when they change
    pub fn set_outputs(&mut self, outputs: BTreeMap<String, Value>) {
        if self.outputs != outputs {
            self.ensure_lineage();
            self.outputs = outputs;
            self.serial += 1;
        }
    }

    fn ensure_lineage(&mut self) {
        if self.lineage.is_empty() {
            self.lineage = uuid::Uuid::new_v4().to_string();
        }
    }

    /// Resource addresses in state order
    pub fn addresses(&self) -> Vec<&str> {
        self.resources.keys().map(String::as_str).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(instance: &str) -> ResourceRecord {
        ResourceRecord {
            instance: instance.to_string(),
            module: "network".to_string(),
            kind: "null".to_string(),
            attributes: Attributes::from([("id".to_string(), Value::from("vpc-123"))]),
            outputs: Attributes::new(),
            dependencies: vec![],
            updated_at: Utc::now(),
        }
    }

    #[test]
    fn test_commit_advances_serial_and_sets_lineage() {
        let mut state = State::default();
        assert!(state.lineage.is_empty());

        state.commit("module.vpc".to_string(), record("vpc"));
        assert_eq!(state.serial, 1);
        let lineage = state.lineage.clone();
        assert!(!lineage.is_empty());

        state.commit("module.eks".to_string(), record("eks"));
        assert_eq!(state.serial, 2);
        assert_eq!(state.lineage, lineage);
        assert_eq!(state.addresses(), vec!["module.eks", "module.vpc"]);

        assert!(state.remove("module.eks").is_some());
        assert!(state.remove("module.eks").is_none());
        assert_eq!(state.serial, 3);
    }

    #[test]
    fn test_json_round_trip() {
        let mut state = State::default();
        state.commit("module.vpc".to_string(), record("vpc"));
        let json = serde_json::to_string(&state).unwrap();
        let back: State = serde_json::from_str(&json).unwrap();
        assert_eq!(back, state);
    }
}
