//! Client-side engine for capturing and submitting civic problem reports.
//!
//! The flow takes a photo (camera frame or file upload), acquires a GPS
//! position, sends a bandwidth-bounded copy of the photo for AI-assisted
//! detection, lets the user correct the pin, and submits the final report.
//! Platform capabilities (camera, geolocation) and the persisted draft
//! fallback sit behind traits so hosts and tests can inject their own.

pub mod api;
pub mod camera;
pub mod codec;
pub mod config;
pub mod flow;
pub mod location;
pub mod models;
pub mod store;

pub use api::{ApiError, HttpReportApi, ReportApi};
pub use camera::{CameraError, CameraProvider, FileCamera};
pub use codec::CodecError;
pub use config::Config;
pub use flow::{CaptureFlow, FlowError, FlowState};
pub use location::{LocationError, LocationProvider, NoLocation, StaticLocation};
pub use models::{
    CapturedImage, Detection, DetectOutcome, GeoPosition, Identity, ReportDraft, Role,
    SubmittedReport,
};
pub use store::{DraftStore, FileDraftStore, MemoryDraftStore, StoreError, StoredDraft};
