use super::{DpadDirection, Feedback, Mode, PadReport, VirtualController};
use crate::bridge::FeedbackSender;
use std::thread::JoinHandle;
use vigem_client::{
    Client, DS4Report, DualShock4Wired, TargetId, XButtons, XGamepad, Xbox360Wired,
};

const VIGEM_HINT: &str =
    "Make sure ViGEmBus driver is installed from https://github.com/ViGEm/ViGEmBus/releases";

// DS4 report button bits (ViGEmBus DS4_BUTTONS)
const DS4_BUTTON_SQUARE: u16 = 1 << 4;
const DS4_BUTTON_CROSS: u16 = 1 << 5;
const DS4_BUTTON_CIRCLE: u16 = 1 << 6;
const DS4_BUTTON_TRIANGLE: u16 = 1 << 7;
const DS4_BUTTON_SHOULDER_LEFT: u16 = 1 << 8;
const DS4_BUTTON_SHOULDER_RIGHT: u16 = 1 << 9;
const DS4_BUTTON_SHARE: u16 = 1 << 12;
const DS4_BUTTON_OPTIONS: u16 = 1 << 13;
const DS4_BUTTON_THUMB_LEFT: u16 = 1 << 14;
const DS4_BUTTON_THUMB_RIGHT: u16 = 1 << 15;
const DS4_SPECIAL_BUTTON_PS: u8 = 1 << 0;

fn connect_client() -> anyhow::Result<Client> {
    Client::connect()
        .map_err(|e| anyhow::anyhow!("Failed to connect to ViGEmBus: {:?}. {}", e, VIGEM_HINT))
}

pub struct VigemXboxController {
    target: Xbox360Wired<Client>,
    notification_thread: Option<JoinHandle<()>>,
}

impl VigemXboxController {
    pub fn new(feedback: FeedbackSender) -> anyhow::Result<Self> {
        let client = connect_client()?;
        let mut target = Xbox360Wired::new(client, TargetId::XBOX360_WIRED);

        target
            .plugin()
            .map_err(|e| anyhow::anyhow!("Failed to plug in virtual controller: {:?}", e))?;
        target
            .wait_ready()
            .map_err(|e| anyhow::anyhow!("Controller not ready: {:?}", e))?;

        log::info!("Virtual Xbox 360 controller created via ViGEmBus");

        // Runs on a ViGEm-owned thread; only enqueue from here
        let notification_thread = match target.request_notification() {
            Ok(request_notification) => {
                let handle = request_notification.spawn_thread(move |_notif, data| {
                    let update =
                        Feedback::from_raw(data.large_motor, data.small_motor, data.led_number);
                    log::trace!(
                        "Rumble update: large={:.2}, small={:.2}, led={}",
                        update.large_motor,
                        update.small_motor,
                        update.led_number
                    );
                    feedback.notify(update);
                });
                log::info!("Force feedback notifications enabled");
                Some(handle)
            }
            Err(e) => {
                log::warn!("Failed to enable force feedback notifications: {:?}", e);
                None
            }
        };

        Ok(Self {
            target,
            notification_thread,
        })
    }
}

impl VirtualController for VigemXboxController {
    fn mode(&self) -> Mode {
        Mode::Xbox
    }

    fn update(&mut self, report: &PadReport) -> anyhow::Result<()> {
        let stick = |value: f32| (value.clamp(-1.0, 1.0) * 32767.0) as i16;
        let trigger = |value: f32| (value.clamp(0.0, 1.0) * 255.0) as u8;

        // vigem-client wants us to or together all button flags
        let b = &report.buttons;
        let mut button_flags: u16 = 0;
        for (pressed, flag) in [
            (b.a, XButtons::A),
            (b.b, XButtons::B),
            (b.x, XButtons::X),
            (b.y, XButtons::Y),
            (b.left_bumper, XButtons::LB),
            (b.right_bumper, XButtons::RB),
            (b.back, XButtons::BACK),
            (b.start, XButtons::START),
            (b.guide, XButtons::GUIDE),
            (b.left_thumb, XButtons::LTHUMB),
            (b.right_thumb, XButtons::RTHUMB),
            (b.dpad_up, XButtons::UP),
            (b.dpad_down, XButtons::DOWN),
            (b.dpad_left, XButtons::LEFT),
            (b.dpad_right, XButtons::RIGHT),
        ] {
            if pressed {
                button_flags |= flag;
            }
        }

        let gamepad = XGamepad {
            buttons: XButtons { raw: button_flags },
            left_trigger: trigger(report.left_trigger),
            right_trigger: trigger(report.right_trigger),
            thumb_lx: stick(report.left_stick_x),
            thumb_ly: stick(report.left_stick_y),
            thumb_rx: stick(report.right_stick_x),
            thumb_ry: stick(report.right_stick_y),
        };

        self.target
            .update(&gamepad)
            .map_err(|e| anyhow::anyhow!("Failed to update controller: {:?}", e))
    }
}

impl Drop for VigemXboxController {
    fn drop(&mut self) {
        // Unplugging ends the notification thread
        if let Err(e) = self.target.unplug() {
            log::warn!("Failed to unplug Xbox 360 controller: {:?}", e);
        }
        if let Some(thread) = self.notification_thread.take() {
            if thread.join().is_err() {
                log::error!("Notification thread panicked");
            }
        }
    }
}

pub struct VigemDs4Controller {
    target: DualShock4Wired<Client>,
}

impl VigemDs4Controller {
    pub fn new() -> anyhow::Result<Self> {
        let client = connect_client()?;
        let mut target = DualShock4Wired::new(client, TargetId::DUALSHOCK4_WIRED);

        target
            .plugin()
            .map_err(|e| anyhow::anyhow!("Failed to plug in virtual DS4: {:?}", e))?;
        target
            .wait_ready()
            .map_err(|e| anyhow::anyhow!("DS4 not ready: {:?}", e))?;

        log::info!("Virtual DualShock 4 controller created via ViGEmBus");
        // vigem-client only offers notifications for the Xbox 360 target
        log::debug!("DS4 rumble and lightbar are not forwarded on this platform");
        Ok(Self { target })
    }

    fn dpad_nibble(direction: DpadDirection) -> u16 {
        match direction {
            DpadDirection::North => 0,
            DpadDirection::NorthEast => 1,
            DpadDirection::East => 2,
            DpadDirection::SouthEast => 3,
            DpadDirection::South => 4,
            DpadDirection::SouthWest => 5,
            DpadDirection::West => 6,
            DpadDirection::NorthWest => 7,
            DpadDirection::Neutral => 8,
        }
    }
}

impl VirtualController for VigemDs4Controller {
    fn mode(&self) -> Mode {
        Mode::Ds4
    }

    fn update(&mut self, report: &PadReport) -> anyhow::Result<()> {
        // DS4 sticks rest at 0x80
        let stick = |value: f32| ((value.clamp(-1.0, 1.0) + 1.0) * 127.5).round() as u8;
        let trigger = |value: f32| (value.clamp(0.0, 1.0) * 255.0) as u8;

        let b = &report.buttons;
        let mut buttons = Self::dpad_nibble(report.dpad);
        for (pressed, flag) in [
            (b.a, DS4_BUTTON_CROSS),
            (b.b, DS4_BUTTON_CIRCLE),
            (b.x, DS4_BUTTON_SQUARE),
            (b.y, DS4_BUTTON_TRIANGLE),
            (b.left_bumper, DS4_BUTTON_SHOULDER_LEFT),
            (b.right_bumper, DS4_BUTTON_SHOULDER_RIGHT),
            (b.back, DS4_BUTTON_SHARE),
            (b.start, DS4_BUTTON_OPTIONS),
            (b.left_thumb, DS4_BUTTON_THUMB_LEFT),
            (b.right_thumb, DS4_BUTTON_THUMB_RIGHT),
        ] {
            if pressed {
                buttons |= flag;
            }
        }

        let ds4 = DS4Report {
            thumb_lx: stick(report.left_stick_x),
            thumb_ly: stick(report.left_stick_y),
            thumb_rx: stick(report.right_stick_x),
            thumb_ry: stick(report.right_stick_y),
            buttons,
            special: if b.guide { DS4_SPECIAL_BUTTON_PS } else { 0 },
            trigger_l: trigger(report.left_trigger),
            trigger_r: trigger(report.right_trigger),
        };

        self.target
            .update(&ds4)
            .map_err(|e| anyhow::anyhow!("Failed to update DS4: {:?}", e))
    }
}

impl Drop for VigemDs4Controller {
    fn drop(&mut self) {
        if let Err(e) = self.target.unplug() {
            log::warn!("Failed to unplug DS4 controller: {:?}", e);
        }
    }
}
