#[cfg(target_os = "linux")]
mod linux;
#[cfg(target_os = "linux")]
mod uinput_ffi;
#[cfg(windows)]
mod windows;

mod memory;

pub use memory::{MemoryController, MemoryFactory, MemoryHandle};

use crate::bridge::FeedbackSender;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;

/// Controller personality a session emulates
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Mode {
    Xbox,
    #[default]
    Ds4,
}

impl Mode {
    pub fn as_str(self) -> &'static str {
        match self {
            Mode::Xbox => "xbox",
            Mode::Ds4 => "ds4",
        }
    }

    pub fn from_name(name: &str) -> Option<Self> {
        match name {
            "xbox" => Some(Mode::Xbox),
            "ds4" => Some(Mode::Ds4),
            _ => None,
        }
    }
}

impl fmt::Display for Mode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Position of the single DS4 hat switch
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize)]
pub enum DpadDirection {
    #[default]
    Neutral,
    North,
    NorthEast,
    East,
    SouthEast,
    South,
    SouthWest,
    West,
    NorthWest,
}

impl DpadDirection {
    /// Map a pad offset to its octant. `x` grows to the right and `y` grows downward;
    /// anything outside -1..=1 is treated as its sign.
    pub fn from_offsets(x: i8, y: i8) -> Self {
        match (x.signum(), y.signum()) {
            (0, -1) => DpadDirection::North,
            (1, -1) => DpadDirection::NorthEast,
            (1, 0) => DpadDirection::East,
            (1, 1) => DpadDirection::SouthEast,
            (0, 1) => DpadDirection::South,
            (-1, 1) => DpadDirection::SouthWest,
            (-1, 0) => DpadDirection::West,
            (-1, -1) => DpadDirection::NorthWest,
            _ => DpadDirection::Neutral,
        }
    }

    /// Inverse of [`DpadDirection::from_offsets`]
    pub fn offsets(self) -> (i8, i8) {
        match self {
            DpadDirection::Neutral => (0, 0),
            DpadDirection::North => (0, -1),
            DpadDirection::NorthEast => (1, -1),
            DpadDirection::East => (1, 0),
            DpadDirection::SouthEast => (1, 1),
            DpadDirection::South => (0, 1),
            DpadDirection::SouthWest => (-1, 1),
            DpadDirection::West => (-1, 0),
            DpadDirection::NorthWest => (-1, -1),
        }
    }
}

/// Controller report to be emitted. Axis values are already in the personality's
/// own orientation; backends only scale them.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct PadReport {
    /// Left stick X axis (-1.0 to 1.0)
    pub left_stick_x: f32,
    /// Left stick Y axis (-1.0 to 1.0)
    pub left_stick_y: f32,
    /// Right stick X axis (-1.0 to 1.0)
    pub right_stick_x: f32,
    /// Right stick Y axis (-1.0 to 1.0)
    pub right_stick_y: f32,
    /// Left trigger (0.0 to 1.0)
    pub left_trigger: f32,
    /// Right trigger (0.0 to 1.0)
    pub right_trigger: f32,
    /// Button states
    pub buttons: PadButtons,
    /// Hat position, only driven in DS4 mode
    pub dpad: DpadDirection,
}

impl PadReport {
    pub fn is_neutral(&self) -> bool {
        *self == PadReport::default()
    }
}

/// Buttons by physical position. On a DS4 `a/b/x/y` are cross/circle/square/triangle,
/// `back`/`start` are share/options and `guide` is the PS button.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct PadButtons {
    pub a: bool,
    pub b: bool,
    pub x: bool,
    pub y: bool,
    pub left_bumper: bool,
    pub right_bumper: bool,
    pub back: bool,
    pub start: bool,
    pub guide: bool,
    pub left_thumb: bool,
    pub right_thumb: bool,
    pub dpad_up: bool,
    pub dpad_down: bool,
    pub dpad_left: bool,
    pub dpad_right: bool,
}

/// Rumble and LED feedback received from the virtual controller
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
pub struct Feedback {
    /// Large motor strength (0.0 to 1.0)
    pub large_motor: f32,
    /// Small motor strength (0.0 to 1.0)
    pub small_motor: f32,
    /// Player LED index assigned by the host
    pub led_number: u8,
}

impl Feedback {
    /// Build feedback from raw 0-255 motor levels as drivers report them
    pub fn from_raw(large_motor: u8, small_motor: u8, led_number: u8) -> Self {
        Self {
            large_motor: f32::from(large_motor) / 255.0,
            small_motor: f32::from(small_motor) / 255.0,
            led_number,
        }
    }
}

/// Trait for OS-visible virtual controller backends
pub trait VirtualController: Send {
    fn mode(&self) -> Mode;
    /// Push a full report to the OS as one atomic update
    fn update(&mut self, report: &PadReport) -> anyhow::Result<()>;
}

/// Creates virtual controllers. Feedback produced by the controller must go through
/// `feedback`, from whichever thread the backend receives it on.
pub trait ControllerFactory: Send + Sync {
    fn create(&self, mode: Mode, feedback: FeedbackSender)
        -> anyhow::Result<Box<dyn VirtualController>>;
}

/// Factory for the platform's virtual HID driver
#[derive(Debug, Clone, Copy, Default)]
pub struct NativeFactory;

impl ControllerFactory for NativeFactory {
    #[cfg(target_os = "linux")]
    fn create(
        &self,
        mode: Mode,
        feedback: FeedbackSender,
    ) -> anyhow::Result<Box<dyn VirtualController>> {
        Ok(Box::new(linux::UinputController::new(mode, feedback)?))
    }

    #[cfg(windows)]
    fn create(
        &self,
        mode: Mode,
        feedback: FeedbackSender,
    ) -> anyhow::Result<Box<dyn VirtualController>> {
        match mode {
            Mode::Xbox => Ok(Box::new(windows::VigemXboxController::new(feedback)?)),
            Mode::Ds4 => Ok(Box::new(windows::VigemDs4Controller::new()?)),
        }
    }

    #[cfg(not(any(target_os = "linux", windows)))]
    fn create(
        &self,
        mode: Mode,
        _feedback: FeedbackSender,
    ) -> anyhow::Result<Box<dyn VirtualController>> {
        Err(anyhow::anyhow!(
            "No native virtual controller driver for {} on this platform",
            mode
        ))
    }
}

/// Which controller backend the server should use
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Backend {
    /// uinput on Linux, ViGEmBus on Windows
    #[default]
    Native,
    /// In-process loopback, nothing is exposed to the OS
    Memory,
}

pub fn factory_for(backend: Backend) -> Arc<dyn ControllerFactory> {
    match backend {
        Backend::Native => Arc::new(NativeFactory),
        Backend::Memory => Arc::new(MemoryFactory::new()),
    }
}
