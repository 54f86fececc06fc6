use crate::domain::models::CallObservation;

/// Port for sampling the platform's call-observation API.
///
/// Implementations report, on demand, the app's foreground state and the
/// native calls currently known to the system. Sampling must be cheap and
/// non-blocking; the detection engine calls it on every polling tick.
pub trait CallObservationSource: Send + Sync {
    /// Take one sample.
    fn observe(&self) -> CallObservation;
}
