//! Shared fixtures for the consensus integration tests.
#![allow(dead_code)]

use common::{Entry, EntryKind, IndexedEntry, LogIndex, RaftError, RaftResult};
use consensus::{NodeConfig, ServerContext, StateMachine};
use std::path::Path;

/// A deterministic machine that journals every applied command.
#[derive(Default)]
pub struct Journal {
    pub entries: Vec<Vec<u8>>,
}

impl Journal {
    pub fn new() -> Self {
        Self::default()
    }
}

impl StateMachine for Journal {
    fn apply(&mut self, _index: LogIndex, _timestamp: u64, command: &[u8]) -> RaftResult<Vec<u8>> {
        self.entries.push(command.to_vec());
        Ok(vec![self.entries.len() as u8])
    }

    fn query(&self, _payload: &[u8]) -> RaftResult<Vec<u8>> {
        Ok(vec![self.entries.len() as u8])
    }

    fn snapshot(&self) -> RaftResult<Vec<u8>> {
        bincode::serde::encode_to_vec(&self.entries, bincode::config::legacy())
            .map_err(|e| RaftError::Snapshot(e.to_string()))
    }

    fn restore(&mut self, data: &[u8]) -> RaftResult<()> {
        let (entries, _) = bincode::serde::decode_from_slice(data, bincode::config::legacy())
            .map_err(|e| RaftError::Snapshot(e.to_string()))?;
        self.entries = entries;
        Ok(())
    }
}

/// A fresh server context rooted in `dir`.
pub fn open_context(dir: &Path) -> ServerContext {
    let config = NodeConfig::new(1, dir.to_path_buf());
    ServerContext::open(&config, Box::new(Journal::new())).unwrap()
}

/// Fill the log with `count` blank entries in `term` and commit+apply them.
pub fn seed_committed(ctx: &mut ServerContext, term: u64, count: u64) {
    ctx.advance_term(term).unwrap();
    {
        let mut writer = ctx.log.writer();
        for _ in 0..count {
            writer.append(term, Entry::noop(0)).unwrap();
        }
    }
    ctx.set_commit_index(count);
    ctx.executor.apply_all(&ctx.log, count).unwrap();
}

/// An indexed command entry carrying raw payload bytes.
pub fn entry(index: LogIndex, term: u64, payload: &[u8]) -> IndexedEntry {
    IndexedEntry::new(
        index,
        term,
        Entry::new(EntryKind::Command, payload.to_vec(), 0),
        payload.len() as u32,
    )
}
