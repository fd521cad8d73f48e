//! A small replicated key-value state machine.
//!
//! Commands and queries travel as bincode payloads inside log entries.
//! The machine is deterministic: its state is a pure function of the
//! applied command sequence.

use common::{LogIndex, RaftError, RaftResult};
use consensus::StateMachine;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// A write operation against the store.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum KvCommand {
    Put { key: String, value: String },
    Delete { key: String },
}

impl KvCommand {
    pub fn encode(&self) -> Vec<u8> {
        bincode::serde::encode_to_vec(self, bincode::config::legacy())
            .expect("kv command encoding cannot fail")
    }
}

/// A read operation against the store.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum KvQuery {
    Get { key: String },
    Len,
}

impl KvQuery {
    pub fn encode(&self) -> Vec<u8> {
        bincode::serde::encode_to_vec(self, bincode::config::legacy())
            .expect("kv query encoding cannot fail")
    }
}

/// The in-memory key-value store replicated through the log.
#[derive(Default)]
pub struct KvMachine {
    data: BTreeMap<String, String>,
}

impl KvMachine {
    pub fn new() -> Self {
        Self::default()
    }
}

fn decode<T: serde::de::DeserializeOwned>(bytes: &[u8], what: &str) -> RaftResult<T> {
    bincode::serde::decode_from_slice(bytes, bincode::config::legacy())
        .map(|(value, _)| value)
        .map_err(|e| RaftError::Application(format!("bad {}: {}", what, e)))
}

impl StateMachine for KvMachine {
    fn apply(&mut self, _index: LogIndex, _timestamp: u64, command: &[u8]) -> RaftResult<Vec<u8>> {
        match decode::<KvCommand>(command, "command")? {
            KvCommand::Put { key, value } => {
                let previous = self.data.insert(key, value);
                Ok(previous.map(String::into_bytes).unwrap_or_default())
            }
            KvCommand::Delete { key } => {
                let previous = self.data.remove(&key);
                Ok(previous.map(String::into_bytes).unwrap_or_default())
            }
        }
    }

    fn query(&self, payload: &[u8]) -> RaftResult<Vec<u8>> {
        match decode::<KvQuery>(payload, "query")? {
            KvQuery::Get { key } => Ok(self
                .data
                .get(&key)
                .cloned()
                .map(String::into_bytes)
                .unwrap_or_default()),
            KvQuery::Len => Ok((self.data.len() as u64).to_le_bytes().to_vec()),
        }
    }

    fn snapshot(&self) -> RaftResult<Vec<u8>> {
        bincode::serde::encode_to_vec(&self.data, bincode::config::legacy())
            .map_err(|e| RaftError::Snapshot(format!("failed to serialize kv state: {}", e)))
    }

    fn restore(&mut self, data: &[u8]) -> RaftResult<()> {
        self.data = decode(data, "kv snapshot")?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn put_get_delete() {
        let mut machine = KvMachine::new();
        let previous = machine
            .apply(
                1,
                0,
                &KvCommand::Put {
                    key: "k".into(),
                    value: "v1".into(),
                }
                .encode(),
            )
            .unwrap();
        assert!(previous.is_empty());

        let previous = machine
            .apply(
                2,
                0,
                &KvCommand::Put {
                    key: "k".into(),
                    value: "v2".into(),
                }
                .encode(),
            )
            .unwrap();
        assert_eq!(previous, b"v1");

        let value = machine
            .query(&KvQuery::Get { key: "k".into() }.encode())
            .unwrap();
        assert_eq!(value, b"v2");

        let previous = machine
            .apply(3, 0, &KvCommand::Delete { key: "k".into() }.encode())
            .unwrap();
        assert_eq!(previous, b"v2");
    }

    #[test]
    fn snapshot_round_trip() {
        let mut machine = KvMachine::new();
        for i in 0..5 {
            machine
                .apply(
                    i + 1,
                    0,
                    &KvCommand::Put {
                        key: format!("k{}", i),
                        value: format!("v{}", i),
                    }
                    .encode(),
                )
                .unwrap();
        }
        let snapshot = machine.snapshot().unwrap();

        let mut restored = KvMachine::new();
        restored.restore(&snapshot).unwrap();
        let len = restored.query(&KvQuery::Len.encode()).unwrap();
        assert_eq!(len, 5u64.to_le_bytes().to_vec());
    }

    #[test]
    fn garbage_command_is_application_error() {
        let mut machine = KvMachine::new();
        let result = machine.apply(1, 0, &[0xff; 3]);
        assert!(matches!(result, Err(RaftError::Application(_))));
    }
}
