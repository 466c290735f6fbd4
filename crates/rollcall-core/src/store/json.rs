//! File-backed store: JSON roster and ledger, one binary file per template.
//!
//! Layout under the data directory:
//!
//! ```text
//! users.json          [{"id", "name", "absenceCount", "isDropped"}]
//! attendance.json     [{"userId", "timestamp" (epoch s), "status"}]
//! faces/<id>.bin      [confidence f32 LE][count u32 LE][count × f32 LE]
//! ```

use std::fs;
use std::path::{Path, PathBuf};

use serde::de::DeserializeOwned;
use serde::Serialize;

use super::{AttendanceStore, StoreError};
use crate::types::{AttendanceRecord, FaceTemplate, FeatureVector, User};

const USERS_FILE: &str = "users.json";
const ATTENDANCE_FILE: &str = "attendance.json";
const FACES_DIR: &str = "faces";
const TEMPLATE_EXT: &str = "bin";
const TEMPLATE_HEADER_LEN: usize = 8;

/// Store rooted at a data directory. Missing files read as empty collections.
#[derive(Debug, Clone)]
pub struct JsonFileStore {
    root: PathBuf,
}

impl JsonFileStore {
    /// Open (and create if needed) a store under `root`.
    pub fn open(root: impl Into<PathBuf>) -> Result<Self, StoreError> {
        let root = root.into();
        let faces = root.join(FACES_DIR);
        fs::create_dir_all(&faces).map_err(|source| StoreError::Write {
            path: faces.clone(),
            source,
        })?;
        tracing::debug!(root = %root.display(), "opened file store");
        Ok(Self { root })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn template_path(&self, user_id: &str) -> Result<PathBuf, StoreError> {
        if !User::is_valid_id(user_id) {
            return Err(StoreError::InvalidId(user_id.to_string()));
        }
        Ok(self
            .root
            .join(FACES_DIR)
            .join(format!("{user_id}.{TEMPLATE_EXT}")))
    }

    fn read_json<T: DeserializeOwned>(&self, name: &str) -> Result<Vec<T>, StoreError> {
        let path = self.root.join(name);
        let bytes = match fs::read(&path) {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(source) => return Err(StoreError::Read { path, source }),
        };
        serde_json::from_slice(&bytes).map_err(|source| StoreError::Json { path, source })
    }

    fn write_json<T: Serialize>(&self, name: &str, items: &[T]) -> Result<(), StoreError> {
        let path = self.root.join(name);
        let bytes = serde_json::to_vec_pretty(items).map_err(|source| StoreError::Json {
            path: path.clone(),
            source,
        })?;
        write_replace(&path, &bytes)
    }
}

/// Write to a sibling temp file, then rename over the target.
fn write_replace(path: &Path, bytes: &[u8]) -> Result<(), StoreError> {
    let tmp = path.with_extension("tmp");
    fs::write(&tmp, bytes).map_err(|source| StoreError::Write {
        path: tmp.clone(),
        source,
    })?;
    fs::rename(&tmp, path).map_err(|source| StoreError::Write {
        path: path.to_path_buf(),
        source,
    })
}

fn encode_template(template: &FaceTemplate) -> Vec<u8> {
    let features = template.features.to_le_bytes();
    let mut out = Vec::with_capacity(TEMPLATE_HEADER_LEN + features.len());
    out.extend_from_slice(&template.confidence.to_le_bytes());
    out.extend_from_slice(&(template.features.len() as u32).to_le_bytes());
    out.extend_from_slice(&features);
    out
}

fn decode_template(owner_id: &str, path: &Path, bytes: &[u8]) -> Result<FaceTemplate, StoreError> {
    let malformed = |reason: String| StoreError::Template {
        path: path.to_path_buf(),
        reason,
    };
    if bytes.len() < TEMPLATE_HEADER_LEN {
        return Err(malformed(format!("{} byte header truncated", bytes.len())));
    }
    let confidence = f32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]);
    let count = u32::from_le_bytes([bytes[4], bytes[5], bytes[6], bytes[7]]) as usize;
    let body = &bytes[TEMPLATE_HEADER_LEN..];
    if body.len() != count * 4 {
        return Err(malformed(format!(
            "header declares {count} values, body holds {} bytes",
            body.len()
        )));
    }
    let features = FeatureVector::from_le_bytes(body).map_err(|e| malformed(e.to_string()))?;
    Ok(FaceTemplate {
        owner_id: owner_id.to_string(),
        features,
        confidence,
    })
}

impl AttendanceStore for JsonFileStore {
    fn load_users(&self) -> Result<Vec<User>, StoreError> {
        self.read_json(USERS_FILE)
    }

    fn save_users(&mut self, users: &[User]) -> Result<(), StoreError> {
        self.write_json(USERS_FILE, users)
    }

    fn load_records(&self) -> Result<Vec<AttendanceRecord>, StoreError> {
        self.read_json(ATTENDANCE_FILE)
    }

    fn save_records(&mut self, records: &[AttendanceRecord]) -> Result<(), StoreError> {
        self.write_json(ATTENDANCE_FILE, records)
    }

    fn load_template(&self, user_id: &str) -> Result<Option<FaceTemplate>, StoreError> {
        let path = self.template_path(user_id)?;
        let bytes = match fs::read(&path) {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(source) => return Err(StoreError::Read { path, source }),
        };
        decode_template(user_id, &path, &bytes).map(Some)
    }

    fn save_template(&mut self, template: &FaceTemplate) -> Result<(), StoreError> {
        let path = self.template_path(&template.owner_id)?;
        write_replace(&path, &encode_template(template))
    }

    fn delete_template(&mut self, user_id: &str) -> Result<(), StoreError> {
        let path = self.template_path(user_id)?;
        match fs::remove_file(&path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(source) => Err(StoreError::Write { path, source }),
        }
    }
}
