use anyhow::{anyhow, Result};
use serde::Deserialize;
use std::path::Path;

use crate::detect::backend::DetectorBackend;
use crate::detect::result::Detection;
use crate::frame::Frame;

/// One step of a detection script.
#[derive(Clone, Debug, Default, Deserialize)]
pub struct ScriptStep {
    /// Offset in seconds from the start of the script. Only the replay tool
    /// uses it; the backend advances one step per frame.
    #[serde(default)]
    pub t: f64,
    #[serde(default)]
    pub detections: Vec<Detection>,
}

/// A recorded or hand-written detection timeline.
#[derive(Clone, Debug, Default, Deserialize)]
pub struct DetectionScript {
    pub steps: Vec<ScriptStep>,
    /// Start over after the last step instead of going quiet.
    #[serde(default)]
    pub repeat: bool,
}

impl DetectionScript {
    pub fn from_path(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path)
            .map_err(|e| anyhow!("failed to read detection script {}: {}", path.display(), e))?;
        let script: DetectionScript = serde_json::from_str(&raw)
            .map_err(|e| anyhow!("invalid detection script {}: {}", path.display(), e))?;
        script.validate()?;
        Ok(script)
    }

    pub fn validate(&self) -> Result<()> {
        let mut last_t = f64::NEG_INFINITY;
        for (i, step) in self.steps.iter().enumerate() {
            if !step.t.is_finite() || step.t < last_t {
                return Err(anyhow!(
                    "detection script step {} has out-of-order time {}",
                    i,
                    step.t
                ));
            }
            last_t = step.t;
        }
        Ok(())
    }
}

/// Backend that replays a [`DetectionScript`], one step per frame.
///
/// Stands in for a model runtime in demos and tests; the pixels are ignored.
pub struct ScriptedBackend {
    script: DetectionScript,
    cursor: usize,
}

impl ScriptedBackend {
    pub fn new(script: DetectionScript) -> Self {
        Self { script, cursor: 0 }
    }

    /// Backend that never detects anything.
    pub fn empty() -> Self {
        Self::new(DetectionScript::default())
    }

    pub fn steps_played(&self) -> usize {
        self.cursor
    }
}

impl DetectorBackend for ScriptedBackend {
    fn name(&self) -> &'static str {
        "scripted"
    }

    fn detect(&mut self, _frame: &Frame, confidence_threshold: f32) -> Result<Vec<Detection>> {
        let len = self.script.steps.len();
        if len == 0 {
            return Ok(Vec::new());
        }
        let index = if self.script.repeat {
            self.cursor % len
        } else if self.cursor < len {
            self.cursor
        } else {
            return Ok(Vec::new());
        };
        self.cursor += 1;

        Ok(self.script.steps[index]
            .detections
            .iter()
            .filter(|d| d.confidence >= confidence_threshold)
            .cloned()
            .collect())
    }
}
