pub const UINPUT_PATH: &str = "/dev/uinput";

// Event types
pub const EV_SYN: u16 = 0x00;
pub const EV_KEY: u16 = 0x01;
pub const EV_ABS: u16 = 0x03;
pub const EV_FF: u16 = 0x15;
pub const EV_UINPUT: u16 = 0x0101;

pub const SYN_REPORT: u16 = 0x00;

pub const FF_RUMBLE: u16 = 0x50;

pub const UI_FF_UPLOAD: u16 = 1;
pub const UI_FF_ERASE: u16 = 2;

pub const BUS_USB: u16 = 0x03;

// Gamepad buttons (BTN_SOUTH/EAST/NORTH/WEST share codes with A/B/X/Y)
pub const BTN_SOUTH: u16 = 0x130;
pub const BTN_EAST: u16 = 0x131;
pub const BTN_NORTH: u16 = 0x133;
pub const BTN_WEST: u16 = 0x134;
pub const BTN_TL: u16 = 0x136;
pub const BTN_TR: u16 = 0x137;
pub const BTN_SELECT: u16 = 0x13a;
pub const BTN_START: u16 = 0x13b;
pub const BTN_MODE: u16 = 0x13c;
pub const BTN_THUMBL: u16 = 0x13d;
pub const BTN_THUMBR: u16 = 0x13e;

pub const GAMEPAD_BUTTONS: [u16; 11] = [
    BTN_SOUTH, BTN_EAST, BTN_NORTH, BTN_WEST, BTN_TL, BTN_TR, BTN_SELECT, BTN_START, BTN_MODE,
    BTN_THUMBL, BTN_THUMBR,
];

// Absolute axes
pub const ABS_X: u16 = 0x00;
pub const ABS_Y: u16 = 0x01;
pub const ABS_Z: u16 = 0x02;
pub const ABS_RX: u16 = 0x03;
pub const ABS_RY: u16 = 0x04;
pub const ABS_RZ: u16 = 0x05;
pub const ABS_HAT0X: u16 = 0x10;
pub const ABS_HAT0Y: u16 = 0x11;

pub const STICK_AXES: [u16; 4] = [ABS_X, ABS_Y, ABS_RX, ABS_RY];
pub const TRIGGER_AXES: [u16; 2] = [ABS_Z, ABS_RZ];
pub const HAT_AXES: [u16; 2] = [ABS_HAT0X, ABS_HAT0Y];

// uinput ioctl codes (x86_64)
pub const UI_DEV_CREATE: libc::c_ulong = 0x5501;
pub const UI_DEV_DESTROY: libc::c_ulong = 0x5502;
pub const UI_SET_EVBIT: libc::c_ulong = 0x40045564;
pub const UI_SET_KEYBIT: libc::c_ulong = 0x40045565;
pub const UI_SET_ABSBIT: libc::c_ulong = 0x40045567;
pub const UI_SET_FFBIT: libc::c_ulong = 0x4004556b;

pub const UI_BEGIN_FF_UPLOAD: libc::c_ulong = 0xc06855c8;
pub const UI_END_FF_UPLOAD: libc::c_ulong = 0x406855c9;
pub const UI_BEGIN_FF_ERASE: libc::c_ulong = 0xc00455ca;
pub const UI_END_FF_ERASE: libc::c_ulong = 0x400455cb;

/// How a personality presents itself to the kernel
pub struct DeviceIdentity {
    pub name: &'static [u8],
    pub vendor: u16,
    pub product: u16,
    pub version: u16,
    pub stick_min: i32,
    pub stick_max: i32,
    pub trigger_max: i32,
}

pub const XBOX360_IDENTITY: DeviceIdentity = DeviceIdentity {
    name: b"padlink Virtual Xbox 360 Controller",
    vendor: 0x045e,
    product: 0x028e,
    version: 0x0110,
    stick_min: -32768,
    stick_max: 32767,
    trigger_max: 255,
};

// hid-sony reports DS4 sticks as 0-255 with 128 at rest
pub const DS4_IDENTITY: DeviceIdentity = DeviceIdentity {
    name: b"padlink Virtual DualShock 4",
    vendor: 0x054c,
    product: 0x05c4,
    version: 0x0100,
    stick_min: 0,
    stick_max: 255,
    trigger_max: 255,
};

impl DeviceIdentity {
    /// Scale -1.0..1.0 onto the stick range
    pub fn stick(&self, value: f32) -> i32 {
        let value = value.clamp(-1.0, 1.0);
        if self.stick_min < 0 {
            // Centered range, keep 0.0 at rest and let -1.0 reach the extra negative step
            if value <= -1.0 {
                return self.stick_min;
            }
            return (value * self.stick_max as f32).round() as i32;
        }
        let span = (self.stick_max - self.stick_min) as f32;
        ((value + 1.0) / 2.0 * span + self.stick_min as f32).round() as i32
    }

    pub fn trigger(&self, value: f32) -> i32 {
        (value.clamp(0.0, 1.0) * self.trigger_max as f32).round() as i32
    }
}

#[repr(C)]
pub struct InputEvent {
    pub tv_sec: libc::time_t,
    pub tv_usec: libc::suseconds_t,
    pub type_: u16,
    pub code: u16,
    pub value: i32,
}

impl InputEvent {
    pub fn new(type_: u16, code: u16, value: i32) -> Self {
        Self {
            tv_sec: 0,
            tv_usec: 0,
            type_,
            code,
            value,
        }
    }
}

#[repr(C)]
pub struct UinputUserDev {
    pub name: [u8; 80],
    pub id: InputId,
    pub ff_effects_max: u32,
    pub absmax: [i32; 64],
    pub absmin: [i32; 64],
    pub absfuzz: [i32; 64],
    pub absflat: [i32; 64],
}

#[repr(C)]
#[derive(Default)]
pub struct InputId {
    pub bustype: u16,
    pub vendor: u16,
    pub product: u16,
    pub version: u16,
}

// Only the rumble variant of the effect union is decoded
#[repr(C)]
pub struct FFEffect {
    pub type_: u16,
    pub id: i16,
    pub direction: u16,
    pub trigger: [u8; 4],
    pub replay: [u8; 4],
    pub _pad: [u8; 2],
    pub u: [u8; 48],
}

#[repr(C)]
#[derive(Debug, Clone, Copy, Default)]
pub struct FFRumbleEffect {
    pub strong_magnitude: u16,
    pub weak_magnitude: u16,
}

#[repr(C)]
pub struct UinputFFUpload {
    pub request_id: u32,
    pub retval: i32,
    pub effect: FFEffect,
    pub old: FFEffect,
}

#[repr(C)]
pub struct UinputFFErase {
    pub request_id: u32,
    pub retval: i32,
    pub effect_id: u32,
}
