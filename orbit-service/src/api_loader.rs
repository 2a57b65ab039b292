//! Orbit API enablement in the target process.

use crate::domain::ErrorMessage;
use orbit_protos::CaptureOptions;

/// Turns the API probes compiled into the target on and off.
///
/// Both calls happen while the capture is being set up or torn down, never
/// concurrently with each other for the same target.
pub trait OrbitApiLoader: Send + Sync {
    /// # Errors
    /// Returns an [`ErrorMessage`] explaining why the API could not be enabled.
    fn enable_api(&self, options: &CaptureOptions) -> Result<(), ErrorMessage>;

    /// # Errors
    /// Returns an [`ErrorMessage`] explaining why the API could not be disabled.
    fn disable_api(&self, options: &CaptureOptions) -> Result<(), ErrorMessage>;
}
