//! The report capture state machine: camera/file capture, location
//! acquisition, one-shot AI analysis, manual pin correction and final
//! submission. Every async edge resolves into a state transition; nothing
//! in here is fatal to the host beyond a redirect back to capture.

use tokio::time::timeout;
use tracing::{debug, info, warn};

use crate::api::{ApiError, ReportApi};
use crate::camera::{CameraError, CameraProvider};
use crate::codec::{self, CodecError};
use crate::config::Config;
use crate::location::LocationProvider;
use crate::models::{
    CapturedImage, Detection, GeoPosition, Identity, ReportDraft, SubmittedReport,
};
use crate::store::{DraftStore, StoreError, StoredDraft};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlowState {
    /// No image yet.
    Idle,
    /// Camera stream is open and owned by this session.
    CameraActive,
    /// File selection in flight (decode + location).
    Uploading,
    /// Image present, possibly waiting on a position before analysis.
    Preview,
    /// detect() in flight.
    Analyzing,
    /// Detections known, or analysis failed and flagged. Pin moves and
    /// submission happen from here.
    AnalyzedReady,
    /// submit() in flight.
    Submitting,
    /// Terminal: a SubmittedReport was produced.
    Done,
}

impl FlowState {
    /// Transient states have a network call or capture in flight and
    /// reject re-entrant actions.
    pub fn is_transient(self) -> bool {
        matches!(
            self,
            FlowState::Uploading | FlowState::Analyzing | FlowState::Submitting
        )
    }
}

#[derive(Debug, thiserror::Error)]
pub enum FlowError {
    #[error("no location set; place a pin before submitting")]
    MissingLocation,

    #[error("no draft in progress; start a new capture")]
    RedirectToCapture,

    #[error("{action} is not allowed while the flow is {state:?}")]
    InvalidState {
        action: &'static str,
        state: FlowState,
    },

    #[error(transparent)]
    Camera(#[from] CameraError),

    #[error(transparent)]
    Codec(#[from] CodecError),

    #[error(transparent)]
    Api(#[from] ApiError),

    #[error(transparent)]
    Store(#[from] StoreError),
}

pub struct CaptureFlow<C, L, A, S>
where
    C: CameraProvider,
    L: LocationProvider,
    A: ReportApi,
    S: DraftStore,
{
    identity: Identity,
    camera: C,
    location: L,
    api: A,
    store: S,
    config: Config,

    state: FlowState,
    draft: Option<ReportDraft>,
    submitted: Option<SubmittedReport>,
    detect_message: Option<String>,
    last_error: Option<String>,
}

impl<C, L, A, S> CaptureFlow<C, L, A, S>
where
    C: CameraProvider,
    L: LocationProvider,
    A: ReportApi,
    S: DraftStore,
{
    pub fn new(
        identity: Identity,
        camera: C,
        location: L,
        api: A,
        store: S,
        config: &Config,
    ) -> Self {
        Self {
            identity,
            camera,
            location,
            api,
            store,
            config: config.clone(),
            state: FlowState::Idle,
            draft: None,
            submitted: None,
            detect_message: None,
            last_error: None,
        }
    }

    pub fn state(&self) -> FlowState {
        self.state
    }

    pub fn identity(&self) -> &Identity {
        &self.identity
    }

    pub fn draft(&self) -> Option<&ReportDraft> {
        self.draft.as_ref()
    }

    pub fn detections(&self) -> &[Detection] {
        self.draft.as_ref().map_or(&[], |d| d.detections.as_slice())
    }

    pub fn position(&self) -> Option<GeoPosition> {
        self.draft.as_ref().and_then(|d| d.position)
    }

    pub fn analysis_failed(&self) -> bool {
        self.draft.as_ref().is_some_and(|d| d.analysis_failed)
    }

    pub fn detect_message(&self) -> Option<&str> {
        self.detect_message.as_deref()
    }

    pub fn last_error(&self) -> Option<&str> {
        self.last_error.as_deref()
    }

    pub fn submitted(&self) -> Option<&SubmittedReport> {
        self.submitted.as_ref()
    }

    /// Re-enters the flow after a reload: restores the persisted fallback
    /// when in-memory state is absent. With neither, the caller must
    /// redirect to the capture entry point.
    pub async fn resume(&mut self) -> Result<(), FlowError> {
        if self.draft.is_some() {
            return Ok(());
        }
        self.ensure("resume", FlowState::Idle)?;

        let Some(stored) = self.store.load()? else {
            return Err(FlowError::RedirectToCapture);
        };
        let bytes = stored.image_bytes()?;
        let image = codec::decode(&bytes)?;

        let mut draft = ReportDraft::new(CapturedImage::new(image, bytes), stored.location);
        draft.pin_moved = stored.pin_moved;
        info!(has_position = draft.position.is_some(), "draft restored from fallback");

        self.draft = Some(draft);
        self.state = FlowState::Preview;
        self.maybe_auto_analyze().await;
        Ok(())
    }

    /// Idle -> CameraActive: requests the camera stream.
    pub async fn open_camera(&mut self) -> Result<(), FlowError> {
        self.ensure("open_camera", FlowState::Idle)?;
        self.camera.open().await?;
        self.state = FlowState::CameraActive;
        Ok(())
    }

    /// CameraActive -> Preview: freezes the current frame and concurrently
    /// attempts a location fix. The stream is released as soon as the frame
    /// is frozen.
    pub async fn capture(&mut self) -> Result<(), FlowError> {
        self.ensure("capture", FlowState::CameraActive)?;

        let frame = self.camera.capture_frame().await?;
        self.camera.release();

        let location_timeout = self.config.location_timeout;
        let (decoded, position) = tokio::join!(
            async { codec::decode(&frame) },
            bounded_acquire(&self.location, location_timeout),
        );
        let image = match decoded {
            Ok(image) => image,
            Err(e) => {
                self.state = FlowState::Idle;
                return Err(e.into());
            }
        };

        self.enter_preview(CapturedImage::new(image, frame), position)
            .await
    }

    /// Idle -> Preview via file selection. An invalid file type keeps the
    /// flow in Idle and triggers no location or detection calls.
    pub async fn select_file(&mut self, bytes: Vec<u8>) -> Result<(), FlowError> {
        self.ensure("select_file", FlowState::Idle)?;
        self.state = FlowState::Uploading;

        let image = match codec::decode(&bytes) {
            Ok(image) => image,
            Err(e) => {
                self.state = FlowState::Idle;
                return Err(e.into());
            }
        };

        let position = bounded_acquire(&self.location, self.config.location_timeout).await;
        self.enter_preview(CapturedImage::new(image, bytes), position)
            .await
    }

    async fn enter_preview(
        &mut self,
        image: CapturedImage,
        position: Option<GeoPosition>,
    ) -> Result<(), FlowError> {
        debug!(?image, has_position = position.is_some(), "entering preview");
        self.draft = Some(ReportDraft::new(image, position));
        self.detect_message = None;
        self.last_error = None;
        self.state = FlowState::Preview;
        self.save_fallback();
        self.maybe_auto_analyze().await;
        Ok(())
    }

    /// Places or moves the pin. Allowed from Preview and AnalyzedReady;
    /// never re-triggers analysis on its own, but does satisfy the
    /// image+position precondition for the single automatic run.
    pub async fn set_pin(&mut self, latitude: f64, longitude: f64) -> Result<(), FlowError> {
        if !matches!(self.state, FlowState::Preview | FlowState::AnalyzedReady) {
            return Err(FlowError::InvalidState {
                action: "set_pin",
                state: self.state,
            });
        }
        {
            let draft = self.draft.as_mut().ok_or(FlowError::RedirectToCapture)?;
            draft.position = Some(GeoPosition::new(latitude, longitude));
            draft.pin_moved = true;
        }
        self.save_fallback();
        self.maybe_auto_analyze().await;
        Ok(())
    }

    /// Explicit retry after a failed or unsatisfying analysis. Resets the
    /// one-shot guard and re-runs detect().
    pub async fn retry_analysis(&mut self) -> Result<(), FlowError> {
        self.ensure("retry_analysis", FlowState::AnalyzedReady)?;
        {
            let draft = self.draft.as_mut().ok_or(FlowError::RedirectToCapture)?;
            if draft.position.is_none() {
                return Err(FlowError::MissingLocation);
            }
            draft.detect_fired = false;
            draft.detections.clear();
            draft.analysis_failed = false;
        }
        self.last_error = None;
        self.detect_message = None;
        self.run_analysis().await;
        Ok(())
    }

    /// Submits the draft. Requires a position: without one this is a local
    /// validation error and no network call is made. Failure leaves the
    /// draft intact and the error surfaced for an explicit retry. Also
    /// reachable from Preview, where a draft can sit without a position.
    pub async fn submit(&mut self) -> Result<SubmittedReport, FlowError> {
        if !matches!(self.state, FlowState::Preview | FlowState::AnalyzedReady) {
            return Err(FlowError::InvalidState {
                action: "submit",
                state: self.state,
            });
        }

        let (bytes, position, detections) = {
            let draft = self.draft.as_ref().ok_or(FlowError::RedirectToCapture)?;
            let position = draft.position.ok_or(FlowError::MissingLocation)?;
            let bytes = codec::compress(
                &draft.image.image,
                self.config.submit_max_width,
                self.config.submit_quality,
            )?;
            (bytes, position, draft.detections.clone())
        };

        self.state = FlowState::Submitting;
        match self.api.submit(&bytes, &position, &detections).await {
            Ok(report) => {
                info!(report_id = %report.report_id, "report submitted");
                self.clear_fallback();
                self.draft = None;
                self.last_error = None;
                self.submitted = Some(report.clone());
                self.state = FlowState::Done;
                Ok(report)
            }
            Err(e) => {
                warn!(error = %e, "submission failed; draft kept for retry");
                self.last_error = Some(e.to_string());
                self.state = FlowState::AnalyzedReady;
                Err(e.into())
            }
        }
    }

    /// Discards the draft to take a new photo. Allowed from Preview and
    /// AnalyzedReady.
    pub fn retake(&mut self) -> Result<(), FlowError> {
        if !matches!(self.state, FlowState::Preview | FlowState::AnalyzedReady) {
            return Err(FlowError::InvalidState {
                action: "retake",
                state: self.state,
            });
        }
        self.reset();
        Ok(())
    }

    /// Abandons the flow from any non-transient state, releasing the camera
    /// if it is held and clearing the persisted fallback.
    pub fn cancel(&mut self) -> Result<(), FlowError> {
        if self.state.is_transient() {
            return Err(FlowError::InvalidState {
                action: "cancel",
                state: self.state,
            });
        }
        if self.state == FlowState::CameraActive {
            self.camera.release();
        }
        self.reset();
        Ok(())
    }

    /// The submitted reports of the injected identity.
    pub async fn my_reports(&self) -> Result<Vec<SubmittedReport>, FlowError> {
        Ok(self.api.list_by_user(&self.identity.user_id).await?)
    }

    fn reset(&mut self) {
        self.clear_fallback();
        self.draft = None;
        self.submitted = None;
        self.detect_message = None;
        self.last_error = None;
        self.state = FlowState::Idle;
    }

    /// Runs detect() if and only if an image and a position are present and
    /// the draft's single automatic run has not fired yet.
    async fn maybe_auto_analyze(&mut self) {
        let ready = self.state == FlowState::Preview
            && self
                .draft
                .as_ref()
                .is_some_and(|d| d.position.is_some() && !d.detect_fired);
        if ready {
            self.run_analysis().await;
        }
    }

    async fn run_analysis(&mut self) {
        let (bytes, position) = {
            let Some(draft) = self.draft.as_mut() else {
                return;
            };
            let Some(position) = draft.position else {
                return;
            };
            // Mark fired before the call: a failed run must not re-fire.
            draft.detect_fired = true;
            match codec::compress(
                &draft.image.image,
                self.config.detect_max_width,
                self.config.detect_quality,
            ) {
                Ok(bytes) => (bytes, position),
                Err(e) => {
                    warn!(error = %e, "detect-pass compression failed");
                    draft.analysis_failed = true;
                    self.last_error = Some(e.to_string());
                    self.state = FlowState::AnalyzedReady;
                    return;
                }
            }
        };

        self.state = FlowState::Analyzing;
        let result = self.api.detect(&bytes, &position).await;

        // The draft may have been discarded while the call was in flight;
        // a stale result must not be applied.
        let Some(draft) = self.draft.as_mut() else {
            self.state = FlowState::Idle;
            return;
        };
        match result {
            Ok(outcome) => {
                info!(
                    detections = outcome.detections.len(),
                    "analysis complete"
                );
                draft.detections = outcome.detections;
                draft.analysis_failed = false;
                self.detect_message = Some(outcome.message);
                self.last_error = None;
            }
            Err(e) => {
                warn!(error = %e, "analysis failed; manual submission remains available");
                draft.detections.clear();
                draft.analysis_failed = true;
                self.last_error = Some(e.to_string());
            }
        }
        self.state = FlowState::AnalyzedReady;
    }

    fn save_fallback(&mut self) {
        if let Some(draft) = &self.draft {
            if let Err(e) = self.store.save(&StoredDraft::from_draft(draft)) {
                warn!(error = %e, "failed to persist draft fallback");
            }
        }
    }

    fn clear_fallback(&mut self) {
        if let Err(e) = self.store.clear() {
            warn!(error = %e, "failed to clear draft fallback");
        }
    }

    fn ensure(&self, action: &'static str, expected: FlowState) -> Result<(), FlowError> {
        if self.state == expected {
            Ok(())
        } else {
            Err(FlowError::InvalidState {
                action,
                state: self.state,
            })
        }
    }
}

async fn bounded_acquire<L: LocationProvider>(
    location: &L,
    limit: std::time::Duration,
) -> Option<GeoPosition> {
    match timeout(limit, location.acquire()).await {
        Ok(Ok(position)) => Some(position),
        Ok(Err(e)) => {
            warn!(error = %e, "location acquisition failed; continuing without a position");
            None
        }
        Err(_) => {
            warn!(timeout = ?limit, "location acquisition timed out; continuing without a position");
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::ApiError;
    use crate::location::LocationError;
    use crate::models::{DetectOutcome, Role};
    use crate::store::MemoryDraftStore;
    use async_trait::async_trait;
    use std::io::Cursor;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use std::sync::Arc;
    use std::time::Duration;

    fn png_bytes(width: u32, height: u32) -> Vec<u8> {
        let img = image::DynamicImage::ImageRgb8(image::RgbImage::from_pixel(
            width,
            height,
            image::Rgb([40, 80, 120]),
        ));
        let mut buf = Cursor::new(Vec::new());
        img.write_to(&mut buf, image::ImageFormat::Png).unwrap();
        buf.into_inner()
    }

    fn pothole_detection() -> Detection {
        Detection {
            x_min: 100.0,
            y_min: 150.0,
            x_max: 300.0,
            y_max: 320.0,
            confidence: 0.92,
            class_name: "pothole".to_string(),
        }
    }

    fn test_config() -> Config {
        Config {
            api_url: "http://localhost:8000".to_string(),
            user_agent: "report-capture/test".to_string(),
            http_timeout: Duration::from_secs(5),
            location_timeout: Duration::from_millis(50),
            detect_max_width: 640,
            detect_quality: 0.5,
            submit_max_width: 1280,
            submit_quality: 0.85,
            draft_dir: std::env::temp_dir(),
        }
    }

    fn identity() -> Identity {
        Identity::new("user-1", Role::Civilian)
    }

    #[derive(Default)]
    struct FakeApi {
        detect_calls: AtomicUsize,
        submit_calls: AtomicUsize,
        detections: Vec<Detection>,
        fail_detect: bool,
        reject_submit: bool,
    }

    #[async_trait]
    impl ReportApi for FakeApi {
        async fn detect(
            &self,
            _image: &[u8],
            _position: &GeoPosition,
        ) -> Result<DetectOutcome, ApiError> {
            self.detect_calls.fetch_add(1, Ordering::Relaxed);
            if self.fail_detect {
                return Err(ApiError::AnalysisFailed("connection refused".to_string()));
            }
            Ok(DetectOutcome {
                detections: self.detections.clone(),
                message: if self.detections.is_empty() {
                    "No problems detected. You can still submit a manual report.".to_string()
                } else {
                    "Problems detected: 1 pothole(s).".to_string()
                },
                problems_detected: !self.detections.is_empty(),
            })
        }

        async fn submit(
            &self,
            _image: &[u8],
            _position: &GeoPosition,
            detections: &[Detection],
        ) -> Result<SubmittedReport, ApiError> {
            self.submit_calls.fetch_add(1, Ordering::Relaxed);
            if self.reject_submit {
                return Err(ApiError::SubmitRejected {
                    status: 400,
                    reason: "missing fields".to_string(),
                });
            }
            Ok(SubmittedReport {
                report_id: "R1".to_string(),
                ward_name: "Shivajinagar".to_string(),
                full_address: "MG Road, Bengaluru".to_string(),
                image_url: "https://img.example/r1.jpg".to_string(),
                problem_types: if detections.is_empty() {
                    vec!["manual".to_string()]
                } else {
                    vec!["pothole".to_string()]
                },
                detections: detections.to_vec(),
                status: "new".to_string(),
                created_at: None,
            })
        }

        async fn list_by_user(&self, _user_id: &str) -> Result<Vec<SubmittedReport>, ApiError> {
            Ok(Vec::new())
        }

        async fn list_all(&self) -> Result<Vec<SubmittedReport>, ApiError> {
            Ok(Vec::new())
        }

        async fn update_status(
            &self,
            _report_id: &str,
            _status: &str,
        ) -> Result<SubmittedReport, ApiError> {
            Err(ApiError::Request("not implemented in fake".to_string()))
        }
    }

    struct FakeCamera {
        frame: Vec<u8>,
        open: bool,
        released: Arc<AtomicBool>,
    }

    impl FakeCamera {
        fn new(frame: Vec<u8>) -> (Self, Arc<AtomicBool>) {
            let released = Arc::new(AtomicBool::new(false));
            (
                Self {
                    frame,
                    open: false,
                    released: released.clone(),
                },
                released,
            )
        }
    }

    #[async_trait]
    impl CameraProvider for FakeCamera {
        async fn open(&mut self) -> Result<(), CameraError> {
            self.open = true;
            self.released.store(false, Ordering::Relaxed);
            Ok(())
        }

        async fn capture_frame(&mut self) -> Result<Vec<u8>, CameraError> {
            if !self.open {
                return Err(CameraError::Unavailable);
            }
            Ok(self.frame.clone())
        }

        fn release(&mut self) {
            self.open = false;
            self.released.store(true, Ordering::Relaxed);
        }
    }

    struct FakeLocation(Result<GeoPosition, LocationError>);

    #[async_trait]
    impl LocationProvider for FakeLocation {
        async fn acquire(&self) -> Result<GeoPosition, LocationError> {
            match &self.0 {
                Ok(pos) => Ok(*pos),
                Err(LocationError::PermissionDenied) => Err(LocationError::PermissionDenied),
                Err(LocationError::Unavailable) => Err(LocationError::Unavailable),
                Err(LocationError::Timeout) => Err(LocationError::Timeout),
            }
        }
    }

    /// Never resolves on its own; the flow's timeout must bound it.
    struct HungLocation;

    #[async_trait]
    impl LocationProvider for HungLocation {
        async fn acquire(&self) -> Result<GeoPosition, LocationError> {
            tokio::time::sleep(Duration::from_secs(300)).await;
            Err(LocationError::Timeout)
        }
    }

    type TestFlow =
        CaptureFlow<FakeCamera, FakeLocation, Arc<FakeApi>, Arc<MemoryDraftStore>>;

    fn flow_with(
        api: Arc<FakeApi>,
        location: FakeLocation,
        store: Arc<MemoryDraftStore>,
    ) -> (TestFlow, Arc<AtomicBool>) {
        let (camera, released) = FakeCamera::new(png_bytes(800, 600));
        let flow = CaptureFlow::new(identity(), camera, location, api, store, &test_config());
        (flow, released)
    }

    fn good_location() -> FakeLocation {
        FakeLocation(Ok(GeoPosition::with_accuracy(12.97, 77.59, 5.0)))
    }

    #[tokio::test]
    async fn test_scenario_a_capture_detect_submit() {
        let api = Arc::new(FakeApi {
            detections: vec![pothole_detection()],
            ..FakeApi::default()
        });
        let store = Arc::new(MemoryDraftStore::default());
        let (mut flow, released) = flow_with(api.clone(), good_location(), store.clone());

        flow.open_camera().await.unwrap();
        assert_eq!(flow.state(), FlowState::CameraActive);

        flow.capture().await.unwrap();
        assert!(released.load(Ordering::Relaxed));
        assert_eq!(flow.state(), FlowState::AnalyzedReady);
        assert_eq!(flow.detections().len(), 1);
        assert_eq!(flow.detections()[0].class_name, "pothole");
        assert!((flow.detections()[0].confidence - 0.92).abs() < 1e-9);
        assert_eq!(flow.position().unwrap().accuracy_m, Some(5.0));

        let report = flow.submit().await.unwrap();
        assert_eq!(report.report_id, "R1");
        assert_eq!(flow.state(), FlowState::Done);
        assert_eq!(flow.submitted().unwrap().report_id, "R1");
        assert_eq!(api.detect_calls.load(Ordering::Relaxed), 1);
        assert_eq!(api.submit_calls.load(Ordering::Relaxed), 1);
    }

    #[tokio::test]
    async fn test_scenario_b_invalid_file_keeps_idle() {
        let api = Arc::new(FakeApi::default());
        let store = Arc::new(MemoryDraftStore::default());
        let (mut flow, _) = flow_with(api.clone(), good_location(), store);

        let err = flow
            .select_file(b"not an image at all".to_vec())
            .await
            .unwrap_err();
        assert!(matches!(err, FlowError::Codec(CodecError::InvalidFileType(_))));
        assert_eq!(flow.state(), FlowState::Idle);
        assert!(flow.draft().is_none());
        assert_eq!(api.detect_calls.load(Ordering::Relaxed), 0);
    }

    #[tokio::test]
    async fn test_scenario_c_detect_waits_for_manual_pin() {
        let api = Arc::new(FakeApi::default());
        let store = Arc::new(MemoryDraftStore::default());
        let (mut flow, _) = flow_with(
            api.clone(),
            FakeLocation(Err(LocationError::Timeout)),
            store,
        );

        flow.select_file(png_bytes(800, 600)).await.unwrap();
        assert_eq!(flow.state(), FlowState::Preview);
        assert!(flow.position().is_none());
        assert_eq!(api.detect_calls.load(Ordering::Relaxed), 0);

        flow.set_pin(12.98, 77.60).await.unwrap();
        assert_eq!(flow.state(), FlowState::AnalyzedReady);
        assert_eq!(api.detect_calls.load(Ordering::Relaxed), 1);
        let position = flow.position().unwrap();
        assert_eq!(position.accuracy_m, None);
        assert!(flow.draft().unwrap().pin_moved);
    }

    #[tokio::test]
    async fn test_scenario_d_analysis_failure_allows_manual_submit() {
        let api = Arc::new(FakeApi {
            fail_detect: true,
            ..FakeApi::default()
        });
        let store = Arc::new(MemoryDraftStore::default());
        let (mut flow, _) = flow_with(api.clone(), good_location(), store);

        flow.select_file(png_bytes(800, 600)).await.unwrap();
        assert_eq!(flow.state(), FlowState::AnalyzedReady);
        assert!(flow.analysis_failed());
        assert!(flow.detections().is_empty());
        assert!(flow.last_error().is_some());

        let report = flow.submit().await.unwrap();
        assert_eq!(report.problem_types, vec!["manual".to_string()]);
        assert_eq!(flow.state(), FlowState::Done);
    }

    #[tokio::test]
    async fn test_pin_moves_never_retrigger_analysis() {
        let api = Arc::new(FakeApi {
            detections: vec![pothole_detection()],
            ..FakeApi::default()
        });
        let store = Arc::new(MemoryDraftStore::default());
        let (mut flow, _) = flow_with(api.clone(), good_location(), store);

        flow.select_file(png_bytes(800, 600)).await.unwrap();
        assert_eq!(api.detect_calls.load(Ordering::Relaxed), 1);

        flow.set_pin(12.98, 77.60).await.unwrap();
        flow.set_pin(12.99, 77.61).await.unwrap();
        flow.set_pin(13.00, 77.62).await.unwrap();
        assert_eq!(api.detect_calls.load(Ordering::Relaxed), 1);
        // Detections from the single run survive the pin moves.
        assert_eq!(flow.detections().len(), 1);
    }

    #[tokio::test]
    async fn test_retry_analysis_is_the_only_refire_path() {
        let api = Arc::new(FakeApi {
            fail_detect: true,
            ..FakeApi::default()
        });
        let store = Arc::new(MemoryDraftStore::default());
        let (mut flow, _) = flow_with(api.clone(), good_location(), store);

        flow.select_file(png_bytes(800, 600)).await.unwrap();
        assert_eq!(api.detect_calls.load(Ordering::Relaxed), 1);
        assert!(flow.analysis_failed());

        flow.retry_analysis().await.unwrap();
        assert_eq!(api.detect_calls.load(Ordering::Relaxed), 2);
        assert_eq!(flow.state(), FlowState::AnalyzedReady);
    }

    #[tokio::test]
    async fn test_submit_without_position_is_local_validation_error() {
        let api = Arc::new(FakeApi::default());
        let store = Arc::new(MemoryDraftStore::default());
        let (mut flow, _) = flow_with(
            api.clone(),
            FakeLocation(Err(LocationError::Unavailable)),
            store,
        );

        flow.select_file(png_bytes(800, 600)).await.unwrap();
        assert_eq!(flow.state(), FlowState::Preview);

        let err = flow.submit().await.unwrap_err();
        assert!(matches!(err, FlowError::MissingLocation));
        assert_eq!(flow.state(), FlowState::Preview);
        assert!(flow.draft().is_some());
        assert_eq!(api.submit_calls.load(Ordering::Relaxed), 0);
        assert_eq!(api.detect_calls.load(Ordering::Relaxed), 0);
    }

    #[tokio::test]
    async fn test_submit_rejection_keeps_draft_for_retry() {
        let api = Arc::new(FakeApi {
            detections: vec![pothole_detection()],
            reject_submit: true,
            ..FakeApi::default()
        });
        let store = Arc::new(MemoryDraftStore::default());
        let (mut flow, _) = flow_with(api.clone(), good_location(), store.clone());

        flow.select_file(png_bytes(800, 600)).await.unwrap();
        let err = flow.submit().await.unwrap_err();
        assert!(matches!(
            err,
            FlowError::Api(ApiError::SubmitRejected { status: 400, .. })
        ));
        assert_eq!(flow.state(), FlowState::AnalyzedReady);
        assert!(flow.draft().is_some());
        assert!(flow.last_error().unwrap().contains("missing fields"));
        // Draft fallback is still readable for a reload.
        assert!(store.load().unwrap().is_some());
    }

    #[tokio::test]
    async fn test_done_clears_fallback() {
        let api = Arc::new(FakeApi::default());
        let store = Arc::new(MemoryDraftStore::default());
        let (mut flow, _) = flow_with(api, good_location(), store.clone());

        flow.select_file(png_bytes(800, 600)).await.unwrap();
        assert!(store.load().unwrap().is_some());

        flow.submit().await.unwrap();
        assert_eq!(flow.state(), FlowState::Done);
        assert!(store.load().unwrap().is_none());
    }

    #[tokio::test]
    async fn test_retake_clears_draft_and_fallback() {
        let api = Arc::new(FakeApi::default());
        let store = Arc::new(MemoryDraftStore::default());
        let (mut flow, _) = flow_with(api, good_location(), store.clone());

        flow.select_file(png_bytes(800, 600)).await.unwrap();
        assert!(store.load().unwrap().is_some());

        flow.retake().unwrap();
        assert_eq!(flow.state(), FlowState::Idle);
        assert!(flow.draft().is_none());
        assert!(flow.detections().is_empty());
        assert!(flow.last_error().is_none());
        assert!(store.load().unwrap().is_none());
    }

    #[tokio::test]
    async fn test_cancel_from_camera_releases_stream() {
        let api = Arc::new(FakeApi::default());
        let store = Arc::new(MemoryDraftStore::default());
        let (mut flow, released) = flow_with(api, good_location(), store);

        flow.open_camera().await.unwrap();
        assert!(!released.load(Ordering::Relaxed));

        flow.cancel().unwrap();
        assert!(released.load(Ordering::Relaxed));
        assert_eq!(flow.state(), FlowState::Idle);
    }

    #[tokio::test]
    async fn test_resume_restores_fallback_and_runs_analysis_once() {
        let api = Arc::new(FakeApi {
            detections: vec![pothole_detection()],
            ..FakeApi::default()
        });
        let store = Arc::new(MemoryDraftStore::default());

        // First session: capture, then "reload" by dropping the flow.
        {
            let (mut flow, _) = flow_with(
                api.clone(),
                FakeLocation(Err(LocationError::Timeout)),
                store.clone(),
            );
            flow.select_file(png_bytes(800, 600)).await.unwrap();
            flow.set_pin(12.98, 77.60).await.unwrap();
        }
        assert!(store.load().unwrap().is_some());
        let calls_before = api.detect_calls.load(Ordering::Relaxed);

        // Second session resumes from the fallback.
        let (mut flow, _) = flow_with(api.clone(), good_location(), store.clone());
        flow.resume().await.unwrap();
        assert_eq!(flow.state(), FlowState::AnalyzedReady);
        assert!(flow.draft().unwrap().pin_moved);
        assert_eq!(flow.position().unwrap().latitude, 12.98);
        assert_eq!(api.detect_calls.load(Ordering::Relaxed), calls_before + 1);
    }

    #[tokio::test]
    async fn test_resume_with_no_fallback_redirects_to_capture() {
        let api = Arc::new(FakeApi::default());
        let store = Arc::new(MemoryDraftStore::default());
        let (mut flow, _) = flow_with(api, good_location(), store);

        let err = flow.resume().await.unwrap_err();
        assert!(matches!(err, FlowError::RedirectToCapture));
        assert_eq!(flow.state(), FlowState::Idle);
    }

    #[tokio::test]
    async fn test_hung_location_provider_is_bounded() {
        let api = Arc::new(FakeApi::default());
        let store = Arc::new(MemoryDraftStore::default());
        let (camera, _) = FakeCamera::new(png_bytes(800, 600));
        let mut flow = CaptureFlow::new(
            identity(),
            camera,
            HungLocation,
            api.clone(),
            store,
            &test_config(),
        );

        let started = std::time::Instant::now();
        flow.select_file(png_bytes(800, 600)).await.unwrap();
        assert!(started.elapsed() < Duration::from_secs(5));
        assert_eq!(flow.state(), FlowState::Preview);
        assert!(flow.position().is_none());
        assert_eq!(api.detect_calls.load(Ordering::Relaxed), 0);
    }

    #[tokio::test]
    async fn test_state_guards_reject_out_of_order_actions() {
        let api = Arc::new(FakeApi::default());
        let store = Arc::new(MemoryDraftStore::default());
        let (mut flow, _) = flow_with(api, good_location(), store);

        assert!(matches!(
            flow.capture().await.unwrap_err(),
            FlowError::InvalidState { .. }
        ));
        assert!(matches!(
            flow.submit().await.unwrap_err(),
            FlowError::InvalidState { .. }
        ));
        assert!(matches!(
            flow.retake().unwrap_err(),
            FlowError::InvalidState { .. }
        ));

        flow.select_file(png_bytes(800, 600)).await.unwrap();
        assert_eq!(flow.state(), FlowState::AnalyzedReady);
        assert!(matches!(
            flow.select_file(png_bytes(10, 10)).await.unwrap_err(),
            FlowError::InvalidState { .. }
        ));
        assert!(matches!(
            flow.open_camera().await.unwrap_err(),
            FlowError::InvalidState { .. }
        ));
    }

    #[tokio::test]
    async fn test_done_is_terminal_until_cancel() {
        let api = Arc::new(FakeApi::default());
        let store = Arc::new(MemoryDraftStore::default());
        let (mut flow, _) = flow_with(api, good_location(), store);

        flow.select_file(png_bytes(800, 600)).await.unwrap();
        flow.submit().await.unwrap();
        assert_eq!(flow.state(), FlowState::Done);

        assert!(matches!(
            flow.submit().await.unwrap_err(),
            FlowError::InvalidState { .. }
        ));

        flow.cancel().unwrap();
        assert_eq!(flow.state(), FlowState::Idle);
        assert!(flow.submitted().is_none());
    }
}
