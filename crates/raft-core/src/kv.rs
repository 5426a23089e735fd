//! # kv
//!
//! why: a concrete state machine to replicate in tests and the simulator
//! relations: implements applier.rs StateMachine
//! what: string key-value map driven by `set`/`get`/`del`/`append` text commands

use std::collections::BTreeMap;

use crate::{Command, Result, StateMachine};

/// Key-value store whose commands are whitespace separated text:
/// `set k v`, `get k`, `del k`, `append k v`.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct KvStateMachine {
    data: BTreeMap<String, String>,
}

impl KvStateMachine {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.data.get(key).map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    fn execute(&mut self, op: &str) -> String {
        let mut parts = op.splitn(3, ' ');
        match (parts.next(), parts.next(), parts.next()) {
            (Some("set"), Some(key), Some(value)) => {
                self.data.insert(key.to_string(), value.to_string());
                "OK".to_string()
            }
            (Some("get"), Some(key), None) => self.data.get(key).cloned().unwrap_or_default(),
            (Some("del"), Some(key), None) => match self.data.remove(key) {
                Some(_) => "1".to_string(),
                None => "0".to_string(),
            },
            (Some("append"), Some(key), Some(value)) => {
                let entry = self.data.entry(key.to_string()).or_default();
                entry.push_str(value);
                entry.clone()
            }
            _ => format!("ERR unknown command '{op}'"),
        }
    }
}

impl StateMachine for KvStateMachine {
    fn reset(&mut self) {
        self.data.clear();
    }

    fn apply(&mut self, command: &Command) -> Vec<u8> {
        let op = String::from_utf8_lossy(&command.payload);
        self.execute(op.trim()).into_bytes()
    }

    fn snapshot(&self) -> Vec<u8> {
        // a BTreeMap<String, String> always serializes
        serde_json::to_vec(&self.data).unwrap_or_default()
    }

    fn install(&mut self, snapshot: &[u8]) -> Result<()> {
        self.data = serde_json::from_slice(snapshot)?;
        Ok(())
    }
}
