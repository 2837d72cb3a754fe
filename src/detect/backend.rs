use anyhow::Result;

use crate::detect::result::DetectionList;
use crate::frame::Frame;

/// Narrow capability over a loaded detection model.
///
/// The loop only ever needs this one operation. A failed call is not fatal:
/// the scheduler treats it as "no detections this cycle" and carries on.
/// Implementations must not retain the frame past the call.
pub trait Detector: Send {
    /// Backend identifier.
    fn name(&self) -> &'static str;

    /// Run detection on a frame with usable dimensions.
    fn detect(&mut self, frame: &Frame) -> Result<DetectionList>;

    /// Optional warm-up hook, run once after loading.
    fn warm_up(&mut self) -> Result<()> {
        Ok(())
    }
}

/// Loads a detector. Loading may take arbitrarily long and runs alongside
/// camera acquisition, so loaders must be shareable across threads.
pub trait ModelLoader: Send + Sync {
    fn name(&self) -> &str;

    fn load(&self) -> Result<Box<dyn Detector>>;
}
