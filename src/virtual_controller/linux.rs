use super::uinput_ffi::*;
use super::{Feedback, Mode, PadReport, VirtualController};
use crate::bridge::FeedbackSender;
use std::collections::HashMap;
use std::fs::{File, OpenOptions};
use std::io::Write;
use std::os::unix::io::AsRawFd;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;

pub struct UinputController {
    mode: Mode,
    identity: &'static DeviceIdentity,
    uinput_file: Option<File>,
    ff_thread_handle: Option<JoinHandle<()>>,
    ff_thread_running: Arc<AtomicBool>,
}

impl UinputController {
    pub fn new(mode: Mode, feedback: FeedbackSender) -> anyhow::Result<Self> {
        let identity = match mode {
            Mode::Xbox => &XBOX360_IDENTITY,
            Mode::Ds4 => &DS4_IDENTITY,
        };
        let mut controller = Self {
            mode,
            identity,
            uinput_file: None,
            ff_thread_handle: None,
            ff_thread_running: Arc::new(AtomicBool::new(false)),
        };

        controller.connect()?;
        controller.start_ff_polling_thread(feedback)?;
        Ok(controller)
    }

    fn connect(&mut self) -> anyhow::Result<()> {
        let uinput_file = OpenOptions::new()
            .read(true)
            .write(true)
            .open(UINPUT_PATH)
            .map_err(|e| {
                anyhow::anyhow!(
                    "Failed to open {}: {}. Try: sudo chmod 666 /dev/uinput",
                    UINPUT_PATH,
                    e
                )
            })?;

        let uinput_fd = uinput_file.as_raw_fd();
        let identity = self.identity;

        // The FF poller must never block on an empty queue
        unsafe {
            let flags = libc::fcntl(uinput_fd, libc::F_GETFL);
            if flags < 0 {
                return Err(anyhow::anyhow!("Failed to get uinput file flags"));
            }
            if libc::fcntl(uinput_fd, libc::F_SETFL, flags | libc::O_NONBLOCK) < 0 {
                return Err(anyhow::anyhow!("Failed to set uinput non-blocking mode"));
            }
        }

        unsafe {
            for ev in [EV_KEY, EV_ABS, EV_SYN, EV_FF] {
                if libc::ioctl(uinput_fd, UI_SET_EVBIT, ev as libc::c_int) < 0 {
                    return Err(anyhow::anyhow!("Failed to enable event type {:#x}", ev));
                }
            }

            for btn in GAMEPAD_BUTTONS {
                if libc::ioctl(uinput_fd, UI_SET_KEYBIT, btn as libc::c_int) < 0 {
                    return Err(anyhow::anyhow!("Failed to set button {:#x}", btn));
                }
            }

            for axis in STICK_AXES.iter().chain(&TRIGGER_AXES).chain(&HAT_AXES) {
                if libc::ioctl(uinput_fd, UI_SET_ABSBIT, *axis as libc::c_int) < 0 {
                    return Err(anyhow::anyhow!("Failed to set axis {:#x}", axis));
                }
            }

            if libc::ioctl(uinput_fd, UI_SET_FFBIT, FF_RUMBLE as libc::c_int) < 0 {
                return Err(anyhow::anyhow!("Failed to set FF_RUMBLE"));
            }

            let mut dev: UinputUserDev = std::mem::zeroed();
            let name_len = identity.name.len().min(dev.name.len() - 1);
            dev.name[..name_len].copy_from_slice(&identity.name[..name_len]);
            dev.id.bustype = BUS_USB;
            dev.id.vendor = identity.vendor;
            dev.id.product = identity.product;
            dev.id.version = identity.version;
            dev.ff_effects_max = 16;

            for axis in STICK_AXES {
                dev.absmin[axis as usize] = identity.stick_min;
                dev.absmax[axis as usize] = identity.stick_max;
            }
            for axis in TRIGGER_AXES {
                dev.absmin[axis as usize] = 0;
                dev.absmax[axis as usize] = identity.trigger_max;
            }
            for axis in HAT_AXES {
                dev.absmin[axis as usize] = -1;
                dev.absmax[axis as usize] = 1;
            }

            let dev_bytes = std::slice::from_raw_parts(
                &dev as *const _ as *const u8,
                std::mem::size_of::<UinputUserDev>(),
            );

            if libc::write(
                uinput_fd,
                dev_bytes.as_ptr() as *const libc::c_void,
                dev_bytes.len(),
            ) < 0
            {
                return Err(anyhow::anyhow!("Failed to write device struct"));
            }

            if libc::ioctl(uinput_fd, UI_DEV_CREATE) < 0 {
                return Err(anyhow::anyhow!(
                    "Failed to create device: {}",
                    std::io::Error::last_os_error()
                ));
            }
        }

        self.uinput_file = Some(uinput_file);

        log::info!("Uinput {} gamepad created", self.mode);
        Ok(())
    }

    fn start_ff_polling_thread(&mut self, feedback: FeedbackSender) -> anyhow::Result<()> {
        let fd = match self.uinput_file.as_ref() {
            Some(f) => f.as_raw_fd(),
            None => return Err(anyhow::anyhow!("No uinput file available")),
        };

        // The poller owns a duplicate so closing it never races the writer
        let thread_fd = unsafe { libc::dup(fd) };
        if thread_fd < 0 {
            return Err(anyhow::anyhow!(
                "Failed to duplicate uinput fd: {}",
                std::io::Error::last_os_error()
            ));
        }

        let running = Arc::clone(&self.ff_thread_running);
        running.store(true, Ordering::SeqCst);

        let handle = std::thread::Builder::new()
            .name("uinput-ff".to_string())
            .spawn(move || {
                log::debug!("FF polling thread started with fd={}", thread_fd);
                let mut poller = FfPoller {
                    fd: thread_fd,
                    effects: HashMap::new(),
                    feedback,
                };
                while running.load(Ordering::SeqCst) {
                    if !poller.poll_once() {
                        break;
                    }
                }
                unsafe {
                    libc::close(thread_fd);
                }
                log::debug!("FF polling stopped");
            })?;

        self.ff_thread_handle = Some(handle);
        Ok(())
    }

    fn write_event(&mut self, type_: u16, code: u16, value: i32) -> anyhow::Result<()> {
        if let Some(ref mut file) = self.uinput_file {
            let event = InputEvent::new(type_, code, value);
            let bytes = unsafe {
                std::slice::from_raw_parts(
                    &event as *const _ as *const u8,
                    std::mem::size_of::<InputEvent>(),
                )
            };
            file.write_all(bytes)?;
        }
        Ok(())
    }

    fn sync(&mut self) -> anyhow::Result<()> {
        self.write_event(EV_SYN, SYN_REPORT, 0)?;
        if let Some(ref mut file) = self.uinput_file {
            file.flush()?;
        }
        Ok(())
    }

    fn hat(&self, report: &PadReport) -> (i32, i32) {
        match self.mode {
            Mode::Ds4 => {
                let (x, y) = report.dpad.offsets();
                (i32::from(x), i32::from(y))
            }
            Mode::Xbox => {
                let buttons = &report.buttons;
                let x = match (buttons.dpad_left, buttons.dpad_right) {
                    (true, false) => -1,
                    (false, true) => 1,
                    _ => 0,
                };
                let y = match (buttons.dpad_up, buttons.dpad_down) {
                    (true, false) => -1,
                    (false, true) => 1,
                    _ => 0,
                };
                (x, y)
            }
        }
    }
}

/// Services force-feedback requests the kernel queues on the uinput fd
struct FfPoller {
    fd: libc::c_int,
    effects: HashMap<i16, FFRumbleEffect>,
    feedback: FeedbackSender,
}

impl FfPoller {
    /// Wait up to 100ms for events and drain them. Returns `false` on a fatal error.
    fn poll_once(&mut self) -> bool {
        let mut pollfd = libc::pollfd {
            fd: self.fd,
            events: libc::POLLIN,
            revents: 0,
        };

        let poll_result = unsafe { libc::poll(&mut pollfd as *mut libc::pollfd, 1, 100) };
        if poll_result < 0 {
            let err = std::io::Error::last_os_error();
            if err.kind() != std::io::ErrorKind::Interrupted {
                log::error!("Poll error in FF thread: {}", err);
                return false;
            }
            return true;
        }
        if poll_result == 0 {
            return true;
        }

        let mut buffer = [0u8; std::mem::size_of::<InputEvent>()];
        loop {
            let result = unsafe {
                libc::read(
                    self.fd,
                    buffer.as_mut_ptr() as *mut libc::c_void,
                    buffer.len(),
                )
            };

            if result < 0 {
                let err = std::io::Error::last_os_error();
                if err.kind() != std::io::ErrorKind::WouldBlock {
                    log::warn!("Error reading FF events: {}", err);
                }
                return true;
            }
            if result != buffer.len() as isize {
                return true;
            }

            let event = unsafe { std::ptr::read_unaligned(buffer.as_ptr() as *const InputEvent) };
            match event.type_ {
                EV_UINPUT if event.code == UI_FF_UPLOAD => self.upload(event.value),
                EV_UINPUT if event.code == UI_FF_ERASE => self.erase(event.value),
                EV_FF => self.play(event.code, event.value),
                _ => {}
            }
        }
    }

    fn upload(&mut self, request_id: i32) {
        let mut upload: UinputFFUpload = unsafe { std::mem::zeroed() };
        upload.request_id = request_id as u32;

        if unsafe { libc::ioctl(self.fd, UI_BEGIN_FF_UPLOAD, &mut upload as *mut _) } < 0 {
            log::error!(
                "UI_BEGIN_FF_UPLOAD failed: {}",
                std::io::Error::last_os_error()
            );
            return;
        }

        upload.retval = 0;
        if upload.effect.type_ == FF_RUMBLE {
            let rumble: FFRumbleEffect = unsafe {
                std::ptr::read_unaligned(upload.effect.u.as_ptr() as *const FFRumbleEffect)
            };
            log::debug!(
                "Stored FF effect {} strong={} weak={}",
                upload.effect.id,
                rumble.strong_magnitude,
                rumble.weak_magnitude
            );
            self.effects.insert(upload.effect.id, rumble);
        } else {
            log::warn!("Ignoring non-rumble FF effect type {}", upload.effect.type_);
        }

        if unsafe { libc::ioctl(self.fd, UI_END_FF_UPLOAD, &upload as *const _) } < 0 {
            log::error!("UI_END_FF_UPLOAD failed: {}", std::io::Error::last_os_error());
        }
    }

    fn erase(&mut self, request_id: i32) {
        let mut erase: UinputFFErase = unsafe { std::mem::zeroed() };
        erase.request_id = request_id as u32;

        if unsafe { libc::ioctl(self.fd, UI_BEGIN_FF_ERASE, &mut erase as *mut _) } < 0 {
            log::error!("UI_BEGIN_FF_ERASE failed: {}", std::io::Error::last_os_error());
            return;
        }

        self.effects.remove(&(erase.effect_id as i16));
        erase.retval = 0;

        if unsafe { libc::ioctl(self.fd, UI_END_FF_ERASE, &erase as *const _) } < 0 {
            log::error!("UI_END_FF_ERASE failed: {}", std::io::Error::last_os_error());
        }
    }

    fn play(&mut self, effect_id: u16, count: i32) {
        let feedback = if count > 0 {
            match self.effects.get(&(effect_id as i16)) {
                Some(rumble) => Feedback {
                    large_motor: f32::from(rumble.strong_magnitude) / f32::from(u16::MAX),
                    small_motor: f32::from(rumble.weak_magnitude) / f32::from(u16::MAX),
                    led_number: 0,
                },
                None => {
                    log::warn!("EV_FF play event for unknown effect ID {}", effect_id);
                    return;
                }
            }
        } else {
            Feedback::default()
        };

        log::trace!(
            "FF effect {}: large={:.2} small={:.2}",
            effect_id,
            feedback.large_motor,
            feedback.small_motor
        );
        if !self.feedback.notify(feedback) {
            log::trace!("Feedback for closed session dropped");
        }
    }
}

impl Drop for UinputController {
    fn drop(&mut self) {
        self.ff_thread_running.store(false, Ordering::SeqCst);

        if let Some(handle) = self.ff_thread_handle.take() {
            if handle.join().is_err() {
                log::error!("FF polling thread panicked");
            }
        }

        if let Some(ref file) = self.uinput_file {
            unsafe {
                libc::ioctl(file.as_raw_fd(), UI_DEV_DESTROY);
            }
        }
        log::info!("Uinput {} gamepad destroyed", self.mode);
    }
}

impl VirtualController for UinputController {
    fn mode(&self) -> Mode {
        self.mode
    }

    fn update(&mut self, report: &PadReport) -> anyhow::Result<()> {
        let identity = self.identity;
        let axes = [
            (ABS_X, identity.stick(report.left_stick_x)),
            (ABS_Y, identity.stick(report.left_stick_y)),
            (ABS_RX, identity.stick(report.right_stick_x)),
            (ABS_RY, identity.stick(report.right_stick_y)),
            (ABS_Z, identity.trigger(report.left_trigger)),
            (ABS_RZ, identity.trigger(report.right_trigger)),
        ];
        for (code, value) in axes {
            self.write_event(EV_ABS, code, value)?;
        }

        let buttons = &report.buttons;
        let keys = [
            (BTN_SOUTH, buttons.a),
            (BTN_EAST, buttons.b),
            (BTN_NORTH, buttons.x),
            (BTN_WEST, buttons.y),
            (BTN_TL, buttons.left_bumper),
            (BTN_TR, buttons.right_bumper),
            (BTN_SELECT, buttons.back),
            (BTN_START, buttons.start),
            (BTN_MODE, buttons.guide),
            (BTN_THUMBL, buttons.left_thumb),
            (BTN_THUMBR, buttons.right_thumb),
        ];
        for (code, pressed) in keys {
            self.write_event(EV_KEY, code, i32::from(pressed))?;
        }

        let (hat_x, hat_y) = self.hat(report);
        self.write_event(EV_ABS, ABS_HAT0X, hat_x)?;
        self.write_event(EV_ABS, ABS_HAT0Y, hat_y)?;

        self.sync()
    }
}
