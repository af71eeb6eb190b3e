//! Two-button panel. Each press arrives on the driver's callback thread.
//! Pressing both deactivates: each handler waits a short settle delay and
//! then samples the other button. The two reads are not atomic, so a press
//! pair is best effort; the left handler owns the combined action and the
//! right handler stands down when it sees the left one held.

use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, info};

use crate::mode::{InteractionMode, ModeMachine};
use crate::session::SessionControl;
use crate::volume::VolumeController;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Button {
    Left,
    Right,
}

impl Button {
    pub fn other(self) -> Button {
        match self {
            Button::Left => Button::Right,
            Button::Right => Button::Left,
        }
    }
}

/// Live pin state, read from inside press callbacks.
pub trait ButtonPins: Send + Sync {
    fn is_pressed(&self, button: Button) -> bool;
}

/// What a press ended up doing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ButtonAction {
    Deactivated,
    Activated,
    VolumeDown(u8),
    VolumeUp(u8),
    Ignored,
}

pub struct ButtonPanel {
    pins: Arc<dyn ButtonPins>,
    modes: Arc<ModeMachine>,
    session: Arc<dyn SessionControl>,
    volume: Arc<VolumeController>,
    settle: Duration,
}

impl ButtonPanel {
    pub fn new(
        pins: Arc<dyn ButtonPins>,
        modes: Arc<ModeMachine>,
        session: Arc<dyn SessionControl>,
        volume: Arc<VolumeController>,
        settle: Duration,
    ) -> Self {
        Self {
            pins,
            modes,
            session,
            volume,
            settle,
        }
    }

    /// Press handler; call from the driver's callback thread.
    pub fn on_press(&self, button: Button) -> ButtonAction {
        std::thread::sleep(self.settle);

        if self.pins.is_pressed(button.other()) {
            return match button {
                Button::Left => {
                    info!("both buttons pressed, deactivating");
                    self.session.stop_session();
                    self.modes.enter_wake_word();
                    ButtonAction::Deactivated
                }
                Button::Right => {
                    debug!("right press while left held, left handler owns it");
                    ButtonAction::Ignored
                }
            };
        }

        let mode = self.modes.current_mode();
        debug!(button = ?button, mode = %mode, "button pressed");
        match mode {
            InteractionMode::WakeWord => {
                info!(button = ?button, "manual activation");
                self.modes.enter_listening();
                self.session.start_session();
                ButtonAction::Activated
            }
            InteractionMode::Listening | InteractionMode::Response => match button {
                Button::Left => ButtonAction::VolumeDown(self.volume.quieter()),
                Button::Right => ButtonAction::VolumeUp(self.volume.louder()),
            },
            InteractionMode::Execute => ButtonAction::Ignored,
        }
    }
}
