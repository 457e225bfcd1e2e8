mod backend;
mod backends;
mod result;

pub use backend::{Detector, DetectorBackend, GuardedDetector};
pub use backends::{DetectionScript, ScriptStep, ScriptedBackend};
pub use result::{Detection, ProcessingResult, Track};
