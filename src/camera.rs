//! Camera seam. The stream is exclusively owned by the active capture
//! session; release is explicit and deterministic, never left to drop order.

use std::path::PathBuf;

use async_trait::async_trait;

#[derive(Debug, thiserror::Error)]
pub enum CameraError {
    #[error("camera permission denied")]
    PermissionDenied,

    #[error("camera unavailable")]
    Unavailable,

    #[error("frame capture failed: {0}")]
    CaptureFailed(String),
}

#[async_trait]
pub trait CameraProvider: Send {
    /// Requests the camera stream.
    async fn open(&mut self) -> Result<(), CameraError>;

    /// Freezes the current frame into encoded image bytes.
    async fn capture_frame(&mut self) -> Result<Vec<u8>, CameraError>;

    /// Releases the stream. Must be safe to call more than once.
    fn release(&mut self);
}

/// A "camera" that serves the contents of a file, used by the CLI driver.
#[derive(Debug)]
pub struct FileCamera {
    path: PathBuf,
    open: bool,
}

impl FileCamera {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            open: false,
        }
    }
}

#[async_trait]
impl CameraProvider for FileCamera {
    async fn open(&mut self) -> Result<(), CameraError> {
        if !self.path.exists() {
            return Err(CameraError::Unavailable);
        }
        self.open = true;
        Ok(())
    }

    async fn capture_frame(&mut self) -> Result<Vec<u8>, CameraError> {
        if !self.open {
            return Err(CameraError::Unavailable);
        }
        tokio::fs::read(&self.path)
            .await
            .map_err(|e| CameraError::CaptureFailed(e.to_string()))
    }

    fn release(&mut self) {
        self.open = false;
    }
}
