// Registration Records
//
// INTENTION: The registry's record table. It is the single source of truth for
// who publishes, subscribes to and serves what, and it is only ever mutated
// under the master's lock.
//
// Keys: topic records are keyed by (name, type, node) so any number of nodes
// can publish or subscribe a topic; service records are keyed by (name) alone
// so a service has exactly one binding. Lookups return records in
// registration order.

use std::collections::HashMap;
use std::fmt;
use std::time::SystemTime;

use serde::{Deserialize, Serialize};

use crate::network::Endpoint;
use crate::routing::GraphName;

/// Role a record advertises
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum RecordType {
    TopicPublisher,
    TopicSubscriber,
    Service,
}

impl RecordType {
    pub fn as_str(&self) -> &'static str {
        match self {
            RecordType::TopicPublisher => "topic-publisher",
            RecordType::TopicSubscriber => "topic-subscriber",
            RecordType::Service => "service",
        }
    }
}

impl fmt::Display for RecordType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One advertised topic or service endpoint
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RegistrationRecord {
    /// Topic or service name
    pub name: GraphName,
    pub record_type: RecordType,
    /// Node that owns the registration
    pub node: GraphName,
    /// Transport endpoint of the owning node
    pub endpoint: Endpoint,
    pub message_type: String,
}

impl RegistrationRecord {
    pub fn new(
        name: GraphName,
        record_type: RecordType,
        node: GraphName,
        endpoint: Endpoint,
        message_type: impl Into<String>,
    ) -> Self {
        Self {
            name,
            record_type,
            node,
            endpoint,
            message_type: message_type.into(),
        }
    }

    pub fn key(&self) -> RecordKey {
        RecordKey::new(&self.name, self.record_type, &self.node)
    }
}

impl fmt::Display for RegistrationRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} {} [{}] by {} at {}",
            self.record_type, self.name, self.message_type, self.node, self.endpoint
        )
    }
}

/// Identity of a record in the table
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct RecordKey {
    pub name: GraphName,
    pub record_type: RecordType,
    /// `None` for services
    pub node: Option<GraphName>,
}

impl RecordKey {
    pub fn new(name: &GraphName, record_type: RecordType, node: &GraphName) -> Self {
        let node = match record_type {
            RecordType::Service => None,
            _ => Some(node.clone()),
        };
        Self {
            name: name.clone(),
            record_type,
            node,
        }
    }
}

/// What an upsert did to the table
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UpsertOutcome {
    Inserted,
    /// Same key and owner; record refreshed in place
    Updated,
    /// A service binding owned by another node was taken over
    Replaced { previous: RegistrationRecord },
}

#[derive(Debug, Clone)]
struct Entry {
    seq: u64,
    registered_at: SystemTime,
    record: RegistrationRecord,
}

/// Registration table
#[derive(Debug, Default)]
pub struct RecordTable {
    entries: HashMap<RecordKey, Entry>,
    next_seq: u64,
}

impl RecordTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    fn next_seq(&mut self) -> u64 {
        self.next_seq += 1;
        self.next_seq
    }

    /// Insert or refresh `record`.
    ///
    /// Refreshing keeps the original registration position. Taking over a
    /// service from another node counts as a new registration (last writer
    /// wins).
    pub fn upsert(&mut self, record: RegistrationRecord) -> UpsertOutcome {
        let key = record.key();
        let now = SystemTime::now();

        if let Some(entry) = self.entries.get_mut(&key) {
            if entry.record.node == record.node {
                entry.record = record;
                entry.registered_at = now;
                return UpsertOutcome::Updated;
            }
        }

        let seq = self.next_seq();
        let previous = self.entries.insert(
            key,
            Entry {
                seq,
                registered_at: now,
                record,
            },
        );
        match previous {
            Some(prev) => UpsertOutcome::Replaced { previous: prev.record },
            None => UpsertOutcome::Inserted,
        }
    }

    /// Records matching `(name, record_type)` in registration order
    pub fn lookup(&self, name: &GraphName, record_type: RecordType) -> Vec<RegistrationRecord> {
        let mut found: Vec<&Entry> = self
            .entries
            .iter()
            .filter(|(key, _)| key.record_type == record_type && &key.name == name)
            .map(|(_, entry)| entry)
            .collect();
        found.sort_by_key(|entry| entry.seq);
        found.into_iter().map(|entry| entry.record.clone()).collect()
    }

    /// When `record` was last registered or refreshed
    pub fn registered_at(&self, record: &RegistrationRecord) -> Option<SystemTime> {
        self.entries.get(&record.key()).map(|entry| entry.registered_at)
    }

    /// Remove the record owned by `node`; absent records are not an error
    pub fn remove(&mut self, name: &GraphName, record_type: RecordType, node: &GraphName) -> Option<RegistrationRecord> {
        let key = RecordKey::new(name, record_type, node);
        match self.entries.get(&key) {
            Some(entry) if &entry.record.node == node => self.entries.remove(&key).map(|e| e.record),
            _ => None,
        }
    }

    /// Remove every record owned by `node`
    pub fn remove_node(&mut self, node: &GraphName) -> Vec<RegistrationRecord> {
        let keys: Vec<RecordKey> = self
            .entries
            .iter()
            .filter(|(_, entry)| &entry.record.node == node)
            .map(|(key, _)| key.clone())
            .collect();

        let mut removed: Vec<Entry> = keys.iter().filter_map(|key| self.entries.remove(key)).collect();
        removed.sort_by_key(|entry| entry.seq);
        removed.into_iter().map(|entry| entry.record).collect()
    }

    /// Every record owned by `node`, in registration order
    pub fn records_of(&self, node: &GraphName) -> Vec<RegistrationRecord> {
        let mut found: Vec<&Entry> = self.entries.values().filter(|e| &e.record.node == node).collect();
        found.sort_by_key(|entry| entry.seq);
        found.into_iter().map(|entry| entry.record.clone()).collect()
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }
}
