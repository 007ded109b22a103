//! Controller personalities.
//!
//! A [`Device`] turns symbolic control names from the wire protocol into updates of a
//! pending [`PadReport`], and pushes that report to its virtual controller on
//! [`Device::commit`]. Each personality has its own static name table; the session only
//! sees the trait.

use crate::bridge::FeedbackSender;
use crate::virtual_controller::{
    ControllerFactory, DpadDirection, Mode, PadReport, VirtualController,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Button {
    A,
    B,
    X,
    Y,
    LeftBumper,
    RightBumper,
    Back,
    Start,
    Guide,
    LeftThumb,
    RightThumb,
    DpadUp,
    DpadDown,
    DpadLeft,
    DpadRight,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Axis {
    LeftX,
    LeftY,
    RightX,
    RightY,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Trigger {
    Left,
    Right,
}

/// One edge of the directional pad
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Direction {
    Up,
    Down,
    Left,
    Right,
}

/// What a symbolic name resolves to for a given personality
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Control {
    Button(Button),
    /// Contributes to the synthesized hat position
    Direction(Direction),
    Axis(Axis),
    Trigger(Trigger),
}

static COMMON_CONTROLS: [(&str, Control); 15] = [
    ("A", Control::Button(Button::A)),
    ("B", Control::Button(Button::B)),
    ("X", Control::Button(Button::X)),
    ("Y", Control::Button(Button::Y)),
    ("LB", Control::Button(Button::LeftBumper)),
    ("RB", Control::Button(Button::RightBumper)),
    ("back", Control::Button(Button::Back)),
    ("start", Control::Button(Button::Start)),
    ("guide", Control::Button(Button::Guide)),
    ("LS", Control::Button(Button::LeftThumb)),
    ("RS", Control::Button(Button::RightThumb)),
    ("LT", Control::Trigger(Trigger::Left)),
    ("RT", Control::Trigger(Trigger::Right)),
    ("LSx", Control::Axis(Axis::LeftX)),
    ("LSy", Control::Axis(Axis::LeftY)),
];

static XBOX_CONTROLS: [(&str, Control); 6] = [
    ("RSx", Control::Axis(Axis::RightX)),
    ("RSy", Control::Axis(Axis::RightY)),
    ("up", Control::Button(Button::DpadUp)),
    ("down", Control::Button(Button::DpadDown)),
    ("left", Control::Button(Button::DpadLeft)),
    ("right", Control::Button(Button::DpadRight)),
];

// On a DS4, A/B/X/Y land on cross/circle/square/triangle, back/start on share/options
// and guide on the PS button
static DS4_CONTROLS: [(&str, Control); 6] = [
    ("RSx", Control::Axis(Axis::RightX)),
    ("RSy", Control::Axis(Axis::RightY)),
    ("up", Control::Direction(Direction::Up)),
    ("down", Control::Direction(Direction::Down)),
    ("left", Control::Direction(Direction::Left)),
    ("right", Control::Direction(Direction::Right)),
];

/// Look up a symbolic name in a personality's table
pub fn lookup(mode: Mode, name: &str) -> Option<Control> {
    let specific: &[(&str, Control)] = match mode {
        Mode::Xbox => &XBOX_CONTROLS,
        Mode::Ds4 => &DS4_CONTROLS,
    };
    COMMON_CONTROLS
        .iter()
        .chain(specific)
        .find(|(known, _)| *known == name)
        .map(|(_, control)| *control)
}

/// Symbolic names understood by a personality
pub fn control_names(mode: Mode) -> impl Iterator<Item = &'static str> {
    let specific: &'static [(&'static str, Control)] = match mode {
        Mode::Xbox => &XBOX_CONTROLS,
        Mode::Ds4 => &DS4_CONTROLS,
    };
    COMMON_CONTROLS.iter().chain(specific).map(|(name, _)| *name)
}

/// Result of applying a symbolic update
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Applied {
    Ok,
    UnknownControl,
}

fn clamp_axis(value: f32) -> f32 {
    if value.is_finite() {
        value.clamp(-1.0, 1.0)
    } else {
        0.0
    }
}

fn clamp_trigger(value: f32) -> f32 {
    if value.is_finite() {
        value.clamp(0.0, 1.0)
    } else {
        0.0
    }
}

/// A controller personality bound to one virtual controller
pub trait Device: Send {
    fn mode(&self) -> Mode;
    fn set_button(&mut self, button: Button, down: bool);
    fn set_axis(&mut self, axis: Axis, value: f32);
    fn set_trigger(&mut self, trigger: Trigger, value: f32);
    /// Set the pad from offsets: `x` -1 left .. 1 right, `y` -1 up .. 1 down
    fn set_dpad(&mut self, x: i8, y: i8);
    /// Press or release one pad edge
    fn set_direction(&mut self, direction: Direction, down: bool);
    /// Return every control to rest. Takes effect on the next commit.
    fn reset(&mut self);
    /// Push the pending report to the OS as one update
    fn commit(&mut self) -> anyhow::Result<()>;
    /// Pending report, not necessarily committed
    fn report(&self) -> &PadReport;

    /// Apply a symbolic update. Buttons and pad edges are held while `value` is non-zero.
    fn apply(&mut self, name: &str, value: f32) -> Applied {
        let Some(control) = lookup(self.mode(), name) else {
            return Applied::UnknownControl;
        };
        let down = value != 0.0;
        match control {
            Control::Button(button) => self.set_button(button, down),
            Control::Direction(direction) => self.set_direction(direction, down),
            Control::Axis(axis) => self.set_axis(axis, value),
            Control::Trigger(trigger) => self.set_trigger(trigger, value),
        }
        Applied::Ok
    }

    /// Reset and commit, leaving the OS-visible controller at rest
    fn neutralize(&mut self) {
        self.reset();
        if let Err(e) = self.commit() {
            log::error!("Failed to neutralize {} controller: {}", self.mode(), e);
        }
    }
}

fn button_slot(buttons: &mut crate::virtual_controller::PadButtons, button: Button) -> &mut bool {
    match button {
        Button::A => &mut buttons.a,
        Button::B => &mut buttons.b,
        Button::X => &mut buttons.x,
        Button::Y => &mut buttons.y,
        Button::LeftBumper => &mut buttons.left_bumper,
        Button::RightBumper => &mut buttons.right_bumper,
        Button::Back => &mut buttons.back,
        Button::Start => &mut buttons.start,
        Button::Guide => &mut buttons.guide,
        Button::LeftThumb => &mut buttons.left_thumb,
        Button::RightThumb => &mut buttons.right_thumb,
        Button::DpadUp => &mut buttons.dpad_up,
        Button::DpadDown => &mut buttons.dpad_down,
        Button::DpadLeft => &mut buttons.dpad_left,
        Button::DpadRight => &mut buttons.dpad_right,
    }
}

fn axis_slot(report: &mut PadReport, axis: Axis) -> &mut f32 {
    match axis {
        Axis::LeftX => &mut report.left_stick_x,
        Axis::LeftY => &mut report.left_stick_y,
        Axis::RightX => &mut report.right_stick_x,
        Axis::RightY => &mut report.right_stick_y,
    }
}

fn trigger_slot(report: &mut PadReport, trigger: Trigger) -> &mut f32 {
    match trigger {
        Trigger::Left => &mut report.left_trigger,
        Trigger::Right => &mut report.right_trigger,
    }
}

/// Xbox 360 personality: the pad is four independent buttons
pub struct XboxDevice {
    controller: Box<dyn VirtualController>,
    report: PadReport,
}

impl XboxDevice {
    pub fn new(controller: Box<dyn VirtualController>) -> Self {
        Self {
            controller,
            report: PadReport::default(),
        }
    }
}

impl Device for XboxDevice {
    fn mode(&self) -> Mode {
        Mode::Xbox
    }

    fn set_button(&mut self, button: Button, down: bool) {
        *button_slot(&mut self.report.buttons, button) = down;
    }

    fn set_axis(&mut self, axis: Axis, value: f32) {
        *axis_slot(&mut self.report, axis) = clamp_axis(value);
    }

    fn set_trigger(&mut self, trigger: Trigger, value: f32) {
        *trigger_slot(&mut self.report, trigger) = clamp_trigger(value);
    }

    fn set_dpad(&mut self, x: i8, y: i8) {
        let buttons = &mut self.report.buttons;
        buttons.dpad_left = x < 0;
        buttons.dpad_right = x > 0;
        buttons.dpad_up = y < 0;
        buttons.dpad_down = y > 0;
    }

    fn set_direction(&mut self, direction: Direction, down: bool) {
        let button = match direction {
            Direction::Up => Button::DpadUp,
            Direction::Down => Button::DpadDown,
            Direction::Left => Button::DpadLeft,
            Direction::Right => Button::DpadRight,
        };
        self.set_button(button, down);
    }

    fn reset(&mut self) {
        self.report = PadReport::default();
    }

    fn commit(&mut self) -> anyhow::Result<()> {
        self.controller.update(&self.report)
    }

    fn report(&self) -> &PadReport {
        &self.report
    }
}

impl Drop for XboxDevice {
    fn drop(&mut self) {
        self.neutralize();
    }
}

/// DualShock 4 personality: one 9-way hat synthesized from the held pad edges,
/// Y axes grow downward
pub struct Ds4Device {
    controller: Box<dyn VirtualController>,
    report: PadReport,
    held: [bool; 4],
}

impl Ds4Device {
    pub fn new(controller: Box<dyn VirtualController>) -> Self {
        Self {
            controller,
            report: PadReport::default(),
            held: [false; 4],
        }
    }

    fn edge_index(direction: Direction) -> usize {
        match direction {
            Direction::Up => 0,
            Direction::Down => 1,
            Direction::Left => 2,
            Direction::Right => 3,
        }
    }

    /// Recompute the hat from every held edge; opposite edges cancel
    fn synthesize_dpad(&mut self) {
        let [up, down, left, right] = self.held;
        let x = i8::from(right) - i8::from(left);
        let y = i8::from(down) - i8::from(up);
        self.report.dpad = DpadDirection::from_offsets(x, y);
    }
}

impl Device for Ds4Device {
    fn mode(&self) -> Mode {
        Mode::Ds4
    }

    fn set_button(&mut self, button: Button, down: bool) {
        let direction = match button {
            Button::DpadUp => Direction::Up,
            Button::DpadDown => Direction::Down,
            Button::DpadLeft => Direction::Left,
            Button::DpadRight => Direction::Right,
            other => {
                *button_slot(&mut self.report.buttons, other) = down;
                return;
            }
        };
        self.set_direction(direction, down);
    }

    fn set_axis(&mut self, axis: Axis, value: f32) {
        let value = clamp_axis(value);
        *axis_slot(&mut self.report, axis) = match axis {
            Axis::LeftY | Axis::RightY => -value,
            Axis::LeftX | Axis::RightX => value,
        };
    }

    fn set_trigger(&mut self, trigger: Trigger, value: f32) {
        *trigger_slot(&mut self.report, trigger) = clamp_trigger(value);
    }

    fn set_dpad(&mut self, x: i8, y: i8) {
        self.held = [y < 0, y > 0, x < 0, x > 0];
        self.synthesize_dpad();
    }

    fn set_direction(&mut self, direction: Direction, down: bool) {
        self.held[Self::edge_index(direction)] = down;
        self.synthesize_dpad();
    }

    fn reset(&mut self) {
        self.report = PadReport::default();
        self.held = [false; 4];
    }

    fn commit(&mut self) -> anyhow::Result<()> {
        self.controller.update(&self.report)
    }

    fn report(&self) -> &PadReport {
        &self.report
    }
}

impl Drop for Ds4Device {
    fn drop(&mut self) {
        self.neutralize();
    }
}

/// Create the personality for `mode` on a fresh virtual controller and commit its
/// neutral state
pub fn create_device(
    factory: &dyn ControllerFactory,
    mode: Mode,
    feedback: FeedbackSender,
) -> anyhow::Result<Box<dyn Device>> {
    let controller = factory.create(mode, feedback)?;
    let mut device: Box<dyn Device> = match mode {
        Mode::Xbox => Box::new(XboxDevice::new(controller)),
        Mode::Ds4 => Box::new(Ds4Device::new(controller)),
    };
    device.commit()?;
    Ok(device)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::virtual_controller::{MemoryFactory, MemoryHandle};

    fn device(mode: Mode) -> (Box<dyn Device>, MemoryHandle) {
        let factory = MemoryFactory::new();
        let device = create_device(&factory, mode, FeedbackSender::detached()).unwrap();
        (device, factory.last().unwrap())
    }

    #[test]
    fn tables_share_face_buttons_but_not_pad() {
        assert_eq!(lookup(Mode::Xbox, "A"), Some(Control::Button(Button::A)));
        assert_eq!(lookup(Mode::Ds4, "A"), Some(Control::Button(Button::A)));
        assert_eq!(
            lookup(Mode::Xbox, "up"),
            Some(Control::Button(Button::DpadUp))
        );
        assert_eq!(
            lookup(Mode::Ds4, "up"),
            Some(Control::Direction(Direction::Up))
        );
        assert_eq!(lookup(Mode::Ds4, "nope"), None);
        assert_eq!(control_names(Mode::Xbox).count(), 21);
    }

    #[test]
    fn every_listed_name_is_accepted() {
        for mode in [Mode::Xbox, Mode::Ds4] {
            let (mut device, _) = device(mode);
            for name in control_names(mode) {
                assert_eq!(device.apply(name, 0.0), Applied::Ok, "{} {}", mode, name);
            }
        }
    }

    #[test]
    fn unknown_name_is_reported_and_changes_nothing() {
        let (mut device, _) = device(Mode::Xbox);
        assert_eq!(device.apply("turbo", 1.0), Applied::UnknownControl);
        assert!(device.report().is_neutral());
    }

    #[test]
    fn values_are_clamped() {
        let (mut device, handle) = device(Mode::Xbox);
        device.apply("LSx", 3.0);
        device.apply("RSy", -7.5);
        device.apply("LT", 1.5);
        device.apply("RT", -0.5);
        device.apply("LSy", f32::NAN);
        device.commit().unwrap();

        let report = handle.report();
        assert!((report.left_stick_x - 1.0).abs() < f32::EPSILON);
        assert!((report.right_stick_y + 1.0).abs() < f32::EPSILON);
        assert!((report.left_trigger - 1.0).abs() < f32::EPSILON);
        assert!(report.right_trigger.abs() < f32::EPSILON);
        assert!(report.left_stick_y.abs() < f32::EPSILON);
    }

    #[test]
    fn xbox_pad_edges_are_independent_buttons() {
        let (mut device, _) = device(Mode::Xbox);
        device.apply("up", 1.0);
        device.apply("down", 1.0);
        let buttons = &device.report().buttons;
        assert!(buttons.dpad_up && buttons.dpad_down);
        assert_eq!(device.report().dpad, DpadDirection::Neutral);
    }

    #[test]
    fn ds4_pad_follows_held_edges() {
        let (mut device, _) = device(Mode::Ds4);
        device.apply("up", 1.0);
        device.apply("right", 1.0);
        assert_eq!(device.report().dpad, DpadDirection::NorthEast);
        device.apply("up", 0.0);
        assert_eq!(device.report().dpad, DpadDirection::East);
        device.apply("right", 0.0);
        assert_eq!(device.report().dpad, DpadDirection::Neutral);
    }

    #[test]
    fn ds4_pad_covers_every_combination() {
        let names = ["up", "down", "left", "right"];
        for mask in 0u8..16 {
            let (mut device, _) = device(Mode::Ds4);
            for (bit, name) in names.iter().enumerate() {
                if mask & (1 << bit) != 0 {
                    device.apply(name, 1.0);
                }
            }
            let up = mask & 1 != 0;
            let down = mask & 2 != 0;
            let left = mask & 4 != 0;
            let right = mask & 8 != 0;
            let x = i8::from(right) - i8::from(left);
            let y = i8::from(down) - i8::from(up);
            assert_eq!(
                device.report().dpad,
                DpadDirection::from_offsets(x, y),
                "mask {mask:04b}"
            );
        }
    }

    #[test]
    fn ds4_opposite_edges_cancel_on_their_axis() {
        let (mut device, _) = device(Mode::Ds4);
        device.apply("left", 1.0);
        device.apply("right", 1.0);
        assert_eq!(device.report().dpad, DpadDirection::Neutral);
        device.apply("up", 1.0);
        assert_eq!(device.report().dpad, DpadDirection::North);
    }

    #[test]
    fn ds4_set_dpad_and_reset() {
        let (mut device, handle) = device(Mode::Ds4);
        device.set_dpad(-1, 1);
        assert_eq!(device.report().dpad, DpadDirection::SouthWest);
        device.reset();
        device.commit().unwrap();
        assert!(handle.report().is_neutral());
        // pad edges were released by the reset
        device.apply("down", 1.0);
        assert_eq!(device.report().dpad, DpadDirection::South);
    }

    #[test]
    fn ds4_inverts_vertical_axes() {
        let (mut device, _) = device(Mode::Ds4);
        device.apply("LSy", 0.5);
        device.apply("RSy", -0.25);
        assert!((device.report().left_stick_y + 0.5).abs() < f32::EPSILON);
        assert!((device.report().right_stick_y - 0.25).abs() < f32::EPSILON);
    }

    #[test]
    fn nothing_reaches_the_controller_before_commit() {
        let (mut device, handle) = device(Mode::Xbox);
        let commits = handle.commits();
        device.apply("A", 1.0);
        device.apply("B", 1.0);
        assert_eq!(handle.commits(), commits);
        assert!(!handle.report().buttons.a);
        device.commit().unwrap();
        assert!(handle.report().buttons.a && handle.report().buttons.b);
    }

    #[test]
    fn drop_neutralizes_and_releases() {
        let (mut device, handle) = device(Mode::Ds4);
        device.apply("X", 1.0);
        device.commit().unwrap();
        drop(device);
        assert!(handle.report().is_neutral());
        assert!(handle.is_released());
    }
}
