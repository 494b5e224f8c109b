//! Geolocation seam. The flow treats every failure here as recoverable:
//! the user can always place the pin manually.

use async_trait::async_trait;

use crate::models::GeoPosition;

#[derive(Debug, thiserror::Error)]
pub enum LocationError {
    #[error("location permission denied")]
    PermissionDenied,

    #[error("location unavailable")]
    Unavailable,

    #[error("location request timed out")]
    Timeout,
}

/// Produces a fresh, high-accuracy position reading. Implementations must
/// not serve cached readings; the flow additionally bounds each call with
/// its configured timeout.
#[async_trait]
pub trait LocationProvider: Send + Sync {
    async fn acquire(&self) -> Result<GeoPosition, LocationError>;
}

#[async_trait]
impl<T: LocationProvider + ?Sized> LocationProvider for Box<T> {
    async fn acquire(&self) -> Result<GeoPosition, LocationError> {
        (**self).acquire().await
    }
}

#[async_trait]
impl<T: LocationProvider + ?Sized> LocationProvider for std::sync::Arc<T> {
    async fn acquire(&self) -> Result<GeoPosition, LocationError> {
        (**self).acquire().await
    }
}

/// Fixed coordinates, e.g. supplied on the command line.
#[derive(Debug, Clone, Copy)]
pub struct StaticLocation {
    position: GeoPosition,
}

impl StaticLocation {
    pub fn new(latitude: f64, longitude: f64) -> Self {
        Self {
            position: GeoPosition::new(latitude, longitude),
        }
    }

    pub fn with_accuracy(latitude: f64, longitude: f64, accuracy_m: f64) -> Self {
        Self {
            position: GeoPosition::with_accuracy(latitude, longitude, accuracy_m),
        }
    }
}

#[async_trait]
impl LocationProvider for StaticLocation {
    async fn acquire(&self) -> Result<GeoPosition, LocationError> {
        Ok(self.position)
    }
}

/// A host with no geolocation capability at all.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoLocation;

#[async_trait]
impl LocationProvider for NoLocation {
    async fn acquire(&self) -> Result<GeoPosition, LocationError> {
        Err(LocationError::Unavailable)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_static_location_returns_fixed_reading() {
        let provider = StaticLocation::with_accuracy(12.97, 77.59, 5.0);
        let pos = provider.acquire().await.unwrap();
        assert_eq!(pos.latitude, 12.97);
        assert_eq!(pos.longitude, 77.59);
        assert_eq!(pos.accuracy_m, Some(5.0));
    }

    #[tokio::test]
    async fn test_no_location_is_unavailable() {
        let err = NoLocation.acquire().await.unwrap_err();
        assert!(matches!(err, LocationError::Unavailable));
    }

    #[tokio::test]
    async fn test_boxed_provider_dispatches() {
        let provider: Box<dyn LocationProvider> = Box::new(StaticLocation::new(1.0, 2.0));
        let pos = provider.acquire().await.unwrap();
        assert_eq!(pos.latitude, 1.0);
    }
}
