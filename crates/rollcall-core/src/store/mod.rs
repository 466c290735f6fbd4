//! Persistence collaborators for the roster, the ledger and face templates.

mod json;

pub use json::JsonFileStore;

use std::collections::HashMap;
use std::path::PathBuf;
use thiserror::Error;

use crate::types::{AttendanceRecord, FaceTemplate, User};

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("failed to read {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to write {path}: {source}")]
    Write {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("malformed JSON in {path}: {source}")]
    Json {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
    #[error("malformed template {path}: {reason}")]
    Template { path: PathBuf, reason: String },
    #[error("user id {0:?} cannot be used as a template key")]
    InvalidId(String),
    #[error("store unavailable: {0}")]
    Unavailable(String),
}

/// Load/save interface the attendance engine persists through.
///
/// Saves replace the whole collection; the format is owned by the
/// implementation.
pub trait AttendanceStore {
    fn load_users(&self) -> Result<Vec<User>, StoreError>;
    fn save_users(&mut self, users: &[User]) -> Result<(), StoreError>;
    fn load_records(&self) -> Result<Vec<AttendanceRecord>, StoreError>;
    fn save_records(&mut self, records: &[AttendanceRecord]) -> Result<(), StoreError>;
    fn load_template(&self, user_id: &str) -> Result<Option<FaceTemplate>, StoreError>;
    fn save_template(&mut self, template: &FaceTemplate) -> Result<(), StoreError>;
    fn delete_template(&mut self, user_id: &str) -> Result<(), StoreError>;
}

/// Volatile store, used in tests and dry runs.
#[derive(Debug, Default, Clone)]
pub struct MemoryStore {
    pub users: Vec<User>,
    pub records: Vec<AttendanceRecord>,
    pub templates: HashMap<String, FaceTemplate>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_users(users: Vec<User>) -> Self {
        Self {
            users,
            ..Self::default()
        }
    }
}

impl AttendanceStore for MemoryStore {
    fn load_users(&self) -> Result<Vec<User>, StoreError> {
        Ok(self.users.clone())
    }

    fn save_users(&mut self, users: &[User]) -> Result<(), StoreError> {
        self.users = users.to_vec();
        Ok(())
    }

    fn load_records(&self) -> Result<Vec<AttendanceRecord>, StoreError> {
        Ok(self.records.clone())
    }

    fn save_records(&mut self, records: &[AttendanceRecord]) -> Result<(), StoreError> {
        self.records = records.to_vec();
        Ok(())
    }

    fn load_template(&self, user_id: &str) -> Result<Option<FaceTemplate>, StoreError> {
        Ok(self.templates.get(user_id).cloned())
    }

    fn save_template(&mut self, template: &FaceTemplate) -> Result<(), StoreError> {
        self.templates
            .insert(template.owner_id.clone(), template.clone());
        Ok(())
    }

    fn delete_template(&mut self, user_id: &str) -> Result<(), StoreError> {
        self.templates.remove(user_id);
        Ok(())
    }
}
