//! Persisted draft fallback: a single serialized {image, location} snapshot
//! per session key, read on flow entry when in-memory state is absent and
//! cleared on cancel or successful submission.

use std::path::{Path, PathBuf};
use std::sync::Mutex;

use base64::engine::general_purpose::STANDARD as BASE64_STD;
use base64::Engine as _;
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::models::{GeoPosition, ReportDraft};

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("draft io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("draft serialization error: {0}")]
    Serialize(#[from] serde_json::Error),

    #[error("draft image decode error: {0}")]
    ImageDecode(#[from] base64::DecodeError),
}

/// The reload-survivable subset of a draft. Detections are intentionally
/// not persisted; a resumed draft re-runs analysis.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoredDraft {
    pub image: String,
    pub location: Option<GeoPosition>,
    #[serde(default)]
    pub pin_moved: bool,
}

impl StoredDraft {
    pub fn from_draft(draft: &ReportDraft) -> Self {
        Self {
            image: BASE64_STD.encode(&draft.image.encoded),
            location: draft.position,
            pin_moved: draft.pin_moved,
        }
    }

    pub fn image_bytes(&self) -> Result<Vec<u8>, StoreError> {
        Ok(BASE64_STD.decode(&self.image)?)
    }
}

pub trait DraftStore: Send + Sync {
    fn save(&self, draft: &StoredDraft) -> Result<(), StoreError>;
    fn load(&self) -> Result<Option<StoredDraft>, StoreError>;
    fn clear(&self) -> Result<(), StoreError>;
}

impl<T: DraftStore + ?Sized> DraftStore for std::sync::Arc<T> {
    fn save(&self, draft: &StoredDraft) -> Result<(), StoreError> {
        (**self).save(draft)
    }

    fn load(&self) -> Result<Option<StoredDraft>, StoreError> {
        (**self).load()
    }

    fn clear(&self) -> Result<(), StoreError> {
        (**self).clear()
    }
}

/// One JSON file per session key.
#[derive(Debug, Clone)]
pub struct FileDraftStore {
    path: PathBuf,
}

impl FileDraftStore {
    pub fn new(dir: impl AsRef<Path>, session_key: &str) -> Self {
        Self {
            path: dir.as_ref().join(format!("draft-{}.json", session_key)),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl DraftStore for FileDraftStore {
    fn save(&self, draft: &StoredDraft) -> Result<(), StoreError> {
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(&self.path, serde_json::to_vec(draft)?)?;
        Ok(())
    }

    fn load(&self) -> Result<Option<StoredDraft>, StoreError> {
        let bytes = match std::fs::read(&self.path) {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        match serde_json::from_slice(&bytes) {
            Ok(draft) => Ok(Some(draft)),
            Err(e) => {
                // A corrupt fallback is treated as absent rather than fatal;
                // the flow redirects to a fresh capture.
                warn!(path = %self.path.display(), error = %e, "discarding unreadable draft fallback");
                std::fs::remove_file(&self.path).ok();
                Ok(None)
            }
        }
    }

    fn clear(&self) -> Result<(), StoreError> {
        match std::fs::remove_file(&self.path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}

/// In-process store, used in tests and for same-session handoff.
#[derive(Debug, Default)]
pub struct MemoryDraftStore {
    slot: Mutex<Option<StoredDraft>>,
}

impl DraftStore for MemoryDraftStore {
    fn save(&self, draft: &StoredDraft) -> Result<(), StoreError> {
        *self.slot.lock().unwrap_or_else(|e| e.into_inner()) = Some(draft.clone());
        Ok(())
    }

    fn load(&self) -> Result<Option<StoredDraft>, StoreError> {
        Ok(self
            .slot
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone())
    }

    fn clear(&self) -> Result<(), StoreError> {
        *self.slot.lock().unwrap_or_else(|e| e.into_inner()) = None;
        Ok(())
    }
}
