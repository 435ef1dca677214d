//! Device catalog: the parameter layout of every known smart sensor type.
//!
//! A sensor's subscription bitmap and DEVICE_DATA/DEVICE_WRITE payloads are
//! only meaningful against its layout.  Bit `i` of a bitmap selects
//! `params[i]`, and packed values appear in ascending bit order, each taking
//! exactly [`ParamType::size`] bytes.

use serde::Serialize;

/// Maximum number of parameters a device may declare (one per bitmap bit).
pub const MAX_PARAMS: usize = 16;

// ── Scalar types ──────────────────────────────────────────────────────────────

/// Scalar type of a parameter slot.  All values are little-endian on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ParamType {
    Bool,
    U8,
    I8,
    U16,
    I16,
    U32,
    I32,
    U64,
    I64,
    F32,
    F64,
}

impl ParamType {
    /// Encoded size in bytes.
    pub const fn size(self) -> usize {
        match self {
            ParamType::Bool | ParamType::U8 | ParamType::I8 => 1,
            ParamType::U16 | ParamType::I16 => 2,
            ParamType::U32 | ParamType::I32 | ParamType::F32 => 4,
            ParamType::U64 | ParamType::I64 | ParamType::F64 => 8,
        }
    }

    /// The zero value used for fresh and reset buffers.
    pub fn default_value(self) -> ParamValue {
        match self {
            ParamType::Bool => ParamValue::Bool(false),
            ParamType::U8 => ParamValue::U8(0),
            ParamType::I8 => ParamValue::I8(0),
            ParamType::U16 => ParamValue::U16(0),
            ParamType::I16 => ParamValue::I16(0),
            ParamType::U32 => ParamValue::U32(0),
            ParamType::I32 => ParamValue::I32(0),
            ParamType::U64 => ParamValue::U64(0),
            ParamType::I64 => ParamValue::I64(0),
            ParamType::F32 => ParamValue::F32(0.0),
            ParamType::F64 => ParamValue::F64(0.0),
        }
    }

    /// Decodes one value; returns `None` unless `bytes` is exactly [`size`](Self::size) long.
    pub fn decode(self, bytes: &[u8]) -> Option<ParamValue> {
        if bytes.len() != self.size() {
            return None;
        }
        let value = match self {
            ParamType::Bool => ParamValue::Bool(bytes[0] != 0),
            ParamType::U8 => ParamValue::U8(bytes[0]),
            ParamType::I8 => ParamValue::I8(i8::from_le_bytes([bytes[0]])),
            ParamType::U16 => ParamValue::U16(u16::from_le_bytes(bytes.try_into().ok()?)),
            ParamType::I16 => ParamValue::I16(i16::from_le_bytes(bytes.try_into().ok()?)),
            ParamType::U32 => ParamValue::U32(u32::from_le_bytes(bytes.try_into().ok()?)),
            ParamType::I32 => ParamValue::I32(i32::from_le_bytes(bytes.try_into().ok()?)),
            ParamType::U64 => ParamValue::U64(u64::from_le_bytes(bytes.try_into().ok()?)),
            ParamType::I64 => ParamValue::I64(i64::from_le_bytes(bytes.try_into().ok()?)),
            ParamType::F32 => ParamValue::F32(f32::from_le_bytes(bytes.try_into().ok()?)),
            ParamType::F64 => ParamValue::F64(f64::from_le_bytes(bytes.try_into().ok()?)),
        };
        Some(value)
    }
}

/// A typed parameter value.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
#[serde(untagged)]
pub enum ParamValue {
    Bool(bool),
    U8(u8),
    I8(i8),
    U16(u16),
    I16(i16),
    U32(u32),
    I32(i32),
    U64(u64),
    I64(i64),
    F32(f32),
    F64(f64),
}

impl ParamValue {
    pub fn param_type(&self) -> ParamType {
        match self {
            ParamValue::Bool(_) => ParamType::Bool,
            ParamValue::U8(_) => ParamType::U8,
            ParamValue::I8(_) => ParamType::I8,
            ParamValue::U16(_) => ParamType::U16,
            ParamValue::I16(_) => ParamType::I16,
            ParamValue::U32(_) => ParamType::U32,
            ParamValue::I32(_) => ParamType::I32,
            ParamValue::U64(_) => ParamType::U64,
            ParamValue::I64(_) => ParamType::I64,
            ParamValue::F32(_) => ParamType::F32,
            ParamValue::F64(_) => ParamType::F64,
        }
    }

    /// Appends the little-endian encoding of this value to `buf`.
    pub fn encode_into(&self, buf: &mut Vec<u8>) {
        match self {
            ParamValue::Bool(v) => buf.push(u8::from(*v)),
            ParamValue::U8(v) => buf.push(*v),
            ParamValue::I8(v) => buf.extend_from_slice(&v.to_le_bytes()),
            ParamValue::U16(v) => buf.extend_from_slice(&v.to_le_bytes()),
            ParamValue::I16(v) => buf.extend_from_slice(&v.to_le_bytes()),
            ParamValue::U32(v) => buf.extend_from_slice(&v.to_le_bytes()),
            ParamValue::I32(v) => buf.extend_from_slice(&v.to_le_bytes()),
            ParamValue::U64(v) => buf.extend_from_slice(&v.to_le_bytes()),
            ParamValue::I64(v) => buf.extend_from_slice(&v.to_le_bytes()),
            ParamValue::F32(v) => buf.extend_from_slice(&v.to_le_bytes()),
            ParamValue::F64(v) => buf.extend_from_slice(&v.to_le_bytes()),
        }
    }
}

// ── Device layouts ────────────────────────────────────────────────────────────

/// One parameter slot of a device.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ParamSpec {
    pub name: &'static str,
    pub ty: ParamType,
    /// The sensor reports this parameter in DEVICE_DATA.
    pub readable: bool,
    /// The host may set this parameter with DEVICE_WRITE.
    pub writeable: bool,
}

/// A device type and its ordered parameter layout.
#[derive(Debug, PartialEq, Eq)]
pub struct DeviceType {
    pub id: u16,
    pub name: &'static str,
    pub params: &'static [ParamSpec],
}

impl DeviceType {
    /// Bitmap with one bit set per declared parameter.
    pub fn all_params(&self) -> u16 {
        if self.params.len() >= MAX_PARAMS {
            u16::MAX
        } else {
            (1u16 << self.params.len()) - 1
        }
    }

    /// Index of the parameter called `name`.
    pub fn param_index(&self, name: &str) -> Option<usize> {
        self.params.iter().position(|p| p.name == name)
    }

    /// Parameters selected by `bitmap`, in bitmap order, with their indices.
    pub fn params_in(&self, bitmap: u16) -> impl Iterator<Item = (usize, &'static ParamSpec)> + '_ {
        self.params
            .iter()
            .enumerate()
            .filter(move |(i, _)| bitmap & (1 << i) != 0)
    }

    /// Total encoded size of the parameters selected by `bitmap`.
    pub fn packed_size(&self, bitmap: u16) -> usize {
        self.params_in(bitmap).map(|(_, p)| p.ty.size()).sum()
    }
}

const fn read_only(name: &'static str, ty: ParamType) -> ParamSpec {
    ParamSpec {
        name,
        ty,
        readable: true,
        writeable: false,
    }
}

const fn read_write(name: &'static str, ty: ParamType) -> ParamSpec {
    ParamSpec {
        name,
        ty,
        readable: true,
        writeable: true,
    }
}

pub static LIMIT_SWITCH: DeviceType = DeviceType {
    id: 0x00,
    name: "LimitSwitch",
    params: &[
        read_only("switch0", ParamType::Bool),
        read_only("switch1", ParamType::Bool),
        read_only("switch2", ParamType::Bool),
    ],
};

pub static POLAR_BEAR: DeviceType = DeviceType {
    id: 0x01,
    name: "PolarBear",
    params: &[
        read_write("duty_cycle", ParamType::F32),
        read_only("motor_current", ParamType::F32),
        read_write("deadband", ParamType::F32),
        read_write("drive_mode", ParamType::U8),
        read_only("enc_pos", ParamType::I32),
        read_only("enc_vel", ParamType::F32),
    ],
};

pub static LINE_FOLLOWER: DeviceType = DeviceType {
    id: 0x02,
    name: "LineFollower",
    params: &[
        read_only("left", ParamType::F32),
        read_only("center", ParamType::F32),
        read_only("right", ParamType::F32),
    ],
};

pub static BATTERY_BUZZER: DeviceType = DeviceType {
    id: 0x03,
    name: "BatteryBuzzer",
    params: &[
        read_only("is_unsafe", ParamType::Bool),
        read_only("calibrated", ParamType::Bool),
        read_only("v_cell1", ParamType::F32),
        read_only("v_cell2", ParamType::F32),
        read_only("v_cell3", ParamType::F32),
        read_only("v_batt", ParamType::F32),
        read_only("dv_cell2", ParamType::F32),
        read_only("dv_cell3", ParamType::F32),
        read_write("vref_guess", ParamType::F32),
    ],
};

pub static TEAM_FLAG: DeviceType = DeviceType {
    id: 0x04,
    name: "TeamFlag",
    params: &[
        read_write("mode", ParamType::Bool),
        read_write("blue", ParamType::Bool),
        read_write("yellow", ParamType::Bool),
        read_write("led1", ParamType::Bool),
        read_write("led2", ParamType::Bool),
        read_write("led3", ParamType::Bool),
        read_write("led4", ParamType::Bool),
    ],
};

pub static RFID: DeviceType = DeviceType {
    id: 0x05,
    name: "Rfid",
    params: &[
        read_only("id", ParamType::U32),
        read_only("detect_tag", ParamType::U8),
    ],
};

pub static SERVO_CONTROL: DeviceType = DeviceType {
    id: 0x06,
    name: "ServoControl",
    params: &[
        read_write("servo0", ParamType::F32),
        read_write("servo1", ParamType::F32),
    ],
};

pub static COLOR_SENSOR: DeviceType = DeviceType {
    id: 0x07,
    name: "ColorSensor",
    params: &[
        read_only("red", ParamType::U16),
        read_only("green", ParamType::U16),
        read_only("blue", ParamType::U16),
        read_only("luminosity", ParamType::U16),
        read_only("hue", ParamType::F32),
        read_write("led_enabled", ParamType::Bool),
    ],
};

pub static EXAMPLE_DEVICE: DeviceType = DeviceType {
    id: 0xFF,
    name: "ExampleDevice",
    params: &[
        read_write("kumiko", ParamType::Bool),
        read_write("hazuki", ParamType::U8),
        read_write("sapphire", ParamType::I8),
        read_write("reina", ParamType::U16),
        read_write("asuka", ParamType::I16),
        read_write("haruka", ParamType::U32),
        read_write("kousaka", ParamType::I32),
        read_write("mizore", ParamType::U64),
        read_write("nozomi", ParamType::I64),
        read_only("shirase", ParamType::F32),
        read_only("kanade", ParamType::F64),
    ],
};

static CATALOG: [&DeviceType; 9] = [
    &LIMIT_SWITCH,
    &POLAR_BEAR,
    &LINE_FOLLOWER,
    &BATTERY_BUZZER,
    &TEAM_FLAG,
    &RFID,
    &SERVO_CONTROL,
    &COLOR_SENSOR,
    &EXAMPLE_DEVICE,
];

/// Looks up a device type by the ID reported in its UID.
pub fn lookup(device_type: u16) -> Option<&'static DeviceType> {
    CATALOG.iter().copied().find(|d| d.id == device_type)
}

/// Every known device type.
pub fn all() -> &'static [&'static DeviceType] {
    &CATALOG
}

// ── Tests ─────────────────────────────────────────────────────────────────────
