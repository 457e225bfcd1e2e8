mod scripted;

pub use scripted::{DetectionScript, ScriptStep, ScriptedBackend};
