//! Speaker volume: clamped 0..=100, applied to the mixer and persisted on every change.

use std::process::{Command, Stdio};
use std::sync::Arc;

use parking_lot::Mutex;
use serde_json::{json, Value};
use tracing::{debug, error};

use crate::settings::SettingsStore;
use crate::tools::ToolError;

/// Volume step for the hardware buttons.
pub const BUTTON_STEP: i32 = 5;
/// Volume step for the `adjust_volume` tool.
pub const TOOL_STEP: i32 = 10;

/// Output mixer.
pub trait OutputVolume: Send + Sync {
    fn set_output_volume(&self, percent: u8) -> std::io::Result<()>;
}

/// ALSA mixer through `amixer`.
pub struct AmixerVolume {
    control: String,
}

impl AmixerVolume {
    pub fn new(control: impl Into<String>) -> Self {
        Self {
            control: control.into(),
        }
    }
}

impl Default for AmixerVolume {
    fn default() -> Self {
        Self::new("Speaker")
    }
}

impl OutputVolume for AmixerVolume {
    fn set_output_volume(&self, percent: u8) -> std::io::Result<()> {
        let status = Command::new("amixer")
            .args(["-q", "-M", "sset", &self.control, &format!("{percent}%"), "unmute"])
            .stderr(Stdio::null())
            .status()?;
        if !status.success() {
            return Err(std::io::Error::other(format!("amixer exited with {status}")));
        }
        Ok(())
    }
}

/// `adjust_volume` tool action.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VolumeAction {
    Increase,
    Decrease,
    Set(i32),
}

impl VolumeAction {
    /// Parse tool arguments: `{"action": "increase"|"decrease"|"set", "level": n}`.
    pub fn from_args(args: &Value) -> Result<Self, ToolError> {
        let action = args
            .get("action")
            .and_then(Value::as_str)
            .ok_or_else(|| ToolError::BadArguments("missing 'action'".into()))?;
        match action {
            "increase" => Ok(Self::Increase),
            "decrease" => Ok(Self::Decrease),
            "set" => {
                let level = args
                    .get("level")
                    .and_then(Value::as_f64)
                    .ok_or_else(|| ToolError::BadArguments("'set' requires 'level'".into()))?;
                Ok(Self::Set(level.round() as i32))
            }
            other => Err(ToolError::BadArguments(format!("unknown action '{other}'"))),
        }
    }
}

pub struct VolumeController {
    output: Arc<dyn OutputVolume>,
    settings: Arc<SettingsStore>,
    /// Serializes read-modify-write between buttons and tool calls.
    update: Mutex<()>,
}

impl VolumeController {
    pub fn new(output: Arc<dyn OutputVolume>, settings: Arc<SettingsStore>) -> Self {
        Self {
            output,
            settings,
            update: Mutex::new(()),
        }
    }

    /// Re-apply the persisted level, at startup.
    pub fn restore(&self) -> u8 {
        let level = self.level();
        debug!(level, "restoring volume from settings");
        self.set(i32::from(level))
    }

    pub fn level(&self) -> u8 {
        self.settings.speaker_volume()
    }

    /// Clamp, apply and persist. Mixer or persistence failures are logged,
    /// the new level is still reported.
    pub fn set(&self, level: i32) -> u8 {
        let _update = self.update.lock();
        self.set_locked(level)
    }

    fn set_locked(&self, level: i32) -> u8 {
        let level = level.clamp(0, 100) as u8;
        if let Err(e) = self.output.set_output_volume(level) {
            error!(error = %e, level, "error setting volume");
        }
        if let Err(e) = self.settings.set_speaker_volume(level) {
            error!(error = %e, level, "error persisting volume");
        }
        debug!(level, "volume set");
        level
    }

    fn step(&self, delta: i32) -> u8 {
        let _update = self.update.lock();
        self.set_locked(i32::from(self.level()) + delta)
    }

    pub fn louder(&self) -> u8 {
        self.step(BUTTON_STEP)
    }

    pub fn quieter(&self) -> u8 {
        self.step(-BUTTON_STEP)
    }

    /// Tool entry point. Returns `{"level": n}`.
    pub fn adjust(&self, action: VolumeAction) -> Value {
        let level = match action {
            VolumeAction::Increase => self.step(TOOL_STEP),
            VolumeAction::Decrease => self.step(-TOOL_STEP),
            VolumeAction::Set(level) => self.set(level),
        };
        json!({ "level": level })
    }
}
