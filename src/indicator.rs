//! Mode indicator (LED ring). The hardware driver lives outside this crate;
//! it plugs in through `Indicator`.

use serde::Serialize;
use tracing::info;

use crate::mode::InteractionMode;

/// Indicator colour as 0xRRGGBB.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct Color(pub u32);

impl Color {
    pub const RED: Color = Color(0xFF0000);
    pub const GREEN: Color = Color(0x00FF00);
    pub const BLUE: Color = Color(0x0000FF);
    pub const YELLOW: Color = Color(0xFFFF00);
    pub const OFF: Color = Color(0x000000);
}

impl std::fmt::Display for Color {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "#{:06X}", self.0)
    }
}

/// What the indicator shows for a mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum Pattern {
    /// Light briefly, then turn off.
    Blink(Color),
    Solid(Color),
}

pub fn pattern_for(mode: InteractionMode) -> Pattern {
    match mode {
        InteractionMode::WakeWord => Pattern::Blink(Color::RED),
        InteractionMode::Listening => Pattern::Solid(Color::GREEN),
        InteractionMode::Response => Pattern::Solid(Color::BLUE),
        InteractionMode::Execute => Pattern::Solid(Color::YELLOW),
    }
}

/// Receives every mode change, synchronously, on the transitioning thread.
pub trait Indicator: Send + Sync {
    fn on_mode_change(&self, mode: InteractionMode);
}

/// Indicator that only logs; used when no LED driver is attached.
pub struct LogIndicator;

impl Indicator for LogIndicator {
    fn on_mode_change(&self, mode: InteractionMode) {
        info!(mode = %mode, pattern = ?pattern_for(mode), "indicator");
    }
}
