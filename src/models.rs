use std::fmt;

use chrono::{DateTime, Utc};
use image::DynamicImage;
use serde::{Deserialize, Serialize};

/// A single AI-identified bounding region. Field layout matches the backend
/// wire format: the box is flattened into pixel coordinates.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Detection {
    pub x_min: f64,
    pub y_min: f64,
    pub x_max: f64,
    pub y_max: f64,
    pub confidence: f64,
    pub class_name: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct GeoPosition {
    pub latitude: f64,
    pub longitude: f64,
    /// Reported accuracy in meters. None for manually placed pins.
    #[serde(default)]
    pub accuracy_m: Option<f64>,
}

impl GeoPosition {
    pub fn new(latitude: f64, longitude: f64) -> Self {
        Self {
            latitude,
            longitude,
            accuracy_m: None,
        }
    }

    pub fn with_accuracy(latitude: f64, longitude: f64, accuracy_m: f64) -> Self {
        Self {
            latitude,
            longitude,
            accuracy_m: Some(accuracy_m),
        }
    }

    pub fn lat_lng(&self) -> LatLng {
        LatLng {
            lat: self.latitude,
            lng: self.longitude,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct LatLng {
    pub lat: f64,
    pub lng: f64,
}

/// A frozen photo: the decoded bitmap plus the bytes it arrived as.
/// Immutable once produced; discarded on retake or flow completion.
#[derive(Clone)]
pub struct CapturedImage {
    pub image: DynamicImage,
    pub encoded: Vec<u8>,
}

impl CapturedImage {
    pub fn new(image: DynamicImage, encoded: Vec<u8>) -> Self {
        Self { image, encoded }
    }

    pub fn width(&self) -> u32 {
        self.image.width()
    }

    pub fn height(&self) -> u32 {
        self.image.height()
    }
}

impl fmt::Debug for CapturedImage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "CapturedImage({}x{}, {} encoded bytes)",
            self.width(),
            self.height(),
            self.encoded.len()
        )
    }
}

/// An in-progress, unsubmitted report. Lives from photo acquisition until
/// successful submission or explicit cancellation.
#[derive(Debug, Clone)]
pub struct ReportDraft {
    pub image: CapturedImage,
    pub position: Option<GeoPosition>,
    /// Set once the user drags or clicks the pin; a user-placed position is
    /// never overwritten by a later provider reading.
    pub pin_moved: bool,
    pub detections: Vec<Detection>,
    pub analysis_failed: bool,
    /// The one-shot guard for the automatic detection call.
    pub detect_fired: bool,
}

impl ReportDraft {
    pub fn new(image: CapturedImage, position: Option<GeoPosition>) -> Self {
        Self {
            image,
            position,
            pin_moved: false,
            detections: Vec::new(),
            analysis_failed: false,
            detect_fired: false,
        }
    }
}

/// Server-assigned report record. Tolerates both the submit-response shape
/// and the admin-list shape (`_id`, missing status/created_at).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SubmittedReport {
    #[serde(alias = "_id", alias = "id")]
    pub report_id: String,
    #[serde(default)]
    pub ward_name: String,
    #[serde(default)]
    pub full_address: String,
    #[serde(default)]
    pub image_url: String,
    #[serde(default)]
    pub problem_types: Vec<String>,
    #[serde(default)]
    pub detections: Vec<Detection>,
    #[serde(default = "default_report_status")]
    pub status: String,
    #[serde(default)]
    pub created_at: Option<DateTime<Utc>>,
}

fn default_report_status() -> String {
    "new".to_string()
}

// Request/Response DTOs

#[derive(Debug, Serialize)]
pub struct DetectRequest<'a> {
    pub image: &'a str,
    pub latitude: f64,
    pub longitude: f64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct DetectOutcome {
    #[serde(default)]
    pub detections: Vec<Detection>,
    #[serde(default)]
    pub message: String,
    #[serde(default, alias = "pothole_detected")]
    pub problems_detected: bool,
}

#[derive(Debug, Serialize)]
pub struct SubmitRequest<'a> {
    pub image: &'a str,
    pub location: LatLng,
    pub detections: &'a [Detection],
}

#[derive(Debug, Serialize)]
pub struct StatusUpdate<'a> {
    pub status: &'a str,
}

/// Resolved identity facts injected into the flow. The flow never sees
/// credentials; the host's auth collaborator produces this value.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Identity {
    pub user_id: String,
    pub role: Role,
}

impl Identity {
    pub fn new(user_id: impl Into<String>, role: Role) -> Self {
        Self {
            user_id: user_id.into(),
            role,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Civilian,
    Admin,
}
