//! The operation table.
//!
//! Hosts address operations by integer opcode. [`Operation::decode`] is the
//! single place that convention is read: it validates the positional call
//! arguments and produces a typed [`Operation`] carrying only the fields that
//! operation uses. Everything downstream matches on the variant.

use crate::error::{BridgeError, Result};
use crate::value::HostValue;
use serde::Serialize;

/// Number of positional arguments a host call carries
pub const CALL_ARITY: usize = 5;

/// Shape of an operation's result slot
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum ResultKind {
    /// Native integer (often a `TELLSTICK_*` result code)
    Integer,
    /// Native boolean
    Boolean,
    /// Native-owned string, released after conversion
    Text,
    /// Ordered list of device records
    DeviceList,
    /// No native return value; reported to the host as `true`
    SyntheticBoolean,
}

impl ResultKind {
    /// Kind name for diagnostics
    pub fn name(&self) -> &'static str {
        match self {
            ResultKind::Integer => "integer",
            ResultKind::Boolean => "boolean",
            ResultKind::Text => "string",
            ResultKind::DeviceList => "record-list",
            ResultKind::SyntheticBoolean => "synthetic-boolean",
        }
    }
}

/// Positional arguments of a host call, already copied out of host memory
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CallArgs {
    /// Operation code
    pub opcode: i32,
    /// Device id, device index, callback id or error code, per opcode
    pub device_ref: i32,
    /// Numeric argument (dim level)
    pub numeric_arg: i32,
    /// First string argument
    pub string_arg_1: String,
    /// Second string argument
    pub string_arg_2: String,
}

impl CallArgs {
    /// Build call arguments from already-typed values
    pub fn new(
        opcode: i32,
        device_ref: i32,
        numeric_arg: i32,
        string_arg_1: impl Into<String>,
        string_arg_2: impl Into<String>,
    ) -> Self {
        Self {
            opcode,
            device_ref,
            numeric_arg,
            string_arg_1: string_arg_1.into(),
            string_arg_2: string_arg_2.into(),
        }
    }

    /// Shorthand for calls that use no string arguments
    pub fn numeric(opcode: i32, device_ref: i32, numeric_arg: i32) -> Self {
        Self::new(opcode, device_ref, numeric_arg, "", "")
    }

    /// Validate and copy positional host values.
    ///
    /// Positions 0-2 must be integral numbers within `i32`, positions 3-4
    /// strings. Nothing is coerced.
    pub fn from_host(args: &[HostValue]) -> Result<Self> {
        if args.len() != CALL_ARITY {
            return Err(BridgeError::invalid_argument(
                args.len().min(CALL_ARITY),
                "exactly 5 arguments (opcode, deviceRef, numericArg, string1, string2)",
                format!("{} arguments", args.len()),
            ));
        }

        let args = Self {
            opcode: host_int(&args[0], 0)?,
            device_ref: host_int(&args[1], 1)?,
            numeric_arg: host_int(&args[2], 2)?,
            string_arg_1: host_string(&args[3], 3)?,
            string_arg_2: host_string(&args[4], 4)?,
        };
        args.validate()?;
        Ok(args)
    }

    /// Check string arguments can cross into the native library
    pub fn validate(&self) -> Result<()> {
        for (position, s) in [(3, &self.string_arg_1), (4, &self.string_arg_2)] {
            if s.contains('\0') {
                return Err(BridgeError::invalid_argument(
                    position,
                    "string without NUL bytes",
                    "string containing NUL",
                ));
            }
        }
        Ok(())
    }
}

fn host_int(value: &HostValue, position: usize) -> Result<i32> {
    let n = value
        .as_number()
        .ok_or_else(|| BridgeError::invalid_argument(position, "number", value.kind()))?;
    value
        .as_i64()
        .and_then(|n| i32::try_from(n).ok())
        .ok_or_else(|| BridgeError::invalid_argument(position, "32-bit integer", n.to_string()))
}

fn host_string(value: &HostValue, position: usize) -> Result<String> {
    value
        .as_str()
        .map(str::to_owned)
        .ok_or_else(|| BridgeError::invalid_argument(position, "string", value.kind()))
}

/// One request against the native library
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Operation {
    /// 0: `tdTurnOn`
    TurnOn {
        /// Target device
        device_id: i32,
    },
    /// 1: `tdTurnOff`
    TurnOff {
        /// Target device
        device_id: i32,
    },
    /// 2: `tdDim`
    Dim {
        /// Target device
        device_id: i32,
        /// Dim level, 0..=255
        level: u8,
    },
    /// 3: `tdLearn`
    Learn {
        /// Target device
        device_id: i32,
    },
    /// 4: `tdAddDevice`
    AddDevice,
    /// 5: `tdSetName`
    SetName {
        /// Target device
        device_id: i32,
        /// New device name
        name: String,
    },
    /// 6: `tdGetName`
    GetName {
        /// Target device
        device_id: i32,
    },
    /// 7: `tdSetProtocol`
    SetProtocol {
        /// Target device
        device_id: i32,
        /// New protocol name
        protocol: String,
    },
    /// 8: `tdGetProtocol`
    GetProtocol {
        /// Target device
        device_id: i32,
    },
    /// 9: `tdSetModel`
    SetModel {
        /// Target device
        device_id: i32,
        /// New model name
        model: String,
    },
    /// 10: `tdGetModel`
    GetModel {
        /// Target device
        device_id: i32,
    },
    /// 11: `tdGetDeviceType`
    GetDeviceType {
        /// Target device
        device_id: i32,
    },
    /// 12: `tdRemoveDevice`
    RemoveDevice {
        /// Target device
        device_id: i32,
    },
    /// 13: `tdUnregisterCallback`
    UnregisterCallback {
        /// Id returned when the callback was registered
        callback_id: i32,
    },
    /// 14: `tdGetErrorString`
    GetErrorString {
        /// Native result code to describe
        error_code: i32,
    },
    /// 15: `tdInit`
    Init,
    /// 16: `tdClose`
    Close,
    /// 17: `tdGetNumberOfDevices`
    DeviceCount,
    /// 18: `tdStop`
    Stop {
        /// Target device
        device_id: i32,
    },
    /// 19: `tdBell`
    Bell {
        /// Target device
        device_id: i32,
    },
    /// 20: `tdGetDeviceId`
    DeviceIdForIndex {
        /// Zero-based enumeration index
        index: i32,
    },
    /// 21: `tdGetDeviceParameter`
    GetDeviceParameter {
        /// Target device
        device_id: i32,
        /// Parameter name
        name: String,
        /// Returned when the parameter is unset
        default: String,
    },
    /// 22: `tdSetDeviceParameter`
    SetDeviceParameter {
        /// Target device
        device_id: i32,
        /// Parameter name
        name: String,
        /// New parameter value
        value: String,
    },
    /// 23: `tdExecute`
    Execute {
        /// Target device
        device_id: i32,
    },
    /// 24: `tdUp`
    Up {
        /// Target device
        device_id: i32,
    },
    /// 25: `tdDown`
    Down {
        /// Target device
        device_id: i32,
    },
    /// 26: enumerate every device
    ListDevices,
}

impl Operation {
    /// Decode host call arguments into an operation
    pub fn decode(args: CallArgs) -> Result<Self> {
        args.validate()?;
        let CallArgs {
            opcode,
            device_ref,
            numeric_arg,
            string_arg_1,
            string_arg_2,
        } = args;
        let device_id = device_ref;

        let op = match opcode {
            0 => Operation::TurnOn { device_id },
            1 => Operation::TurnOff { device_id },
            2 => Operation::Dim {
                device_id,
                level: u8::try_from(numeric_arg).map_err(|_| {
                    BridgeError::invalid_argument(2, "dim level 0-255", numeric_arg.to_string())
                })?,
            },
            3 => Operation::Learn { device_id },
            4 => Operation::AddDevice,
            5 => Operation::SetName {
                device_id,
                name: string_arg_1,
            },
            6 => Operation::GetName { device_id },
            7 => Operation::SetProtocol {
                device_id,
                protocol: string_arg_1,
            },
            8 => Operation::GetProtocol { device_id },
            9 => Operation::SetModel {
                device_id,
                model: string_arg_1,
            },
            10 => Operation::GetModel { device_id },
            11 => Operation::GetDeviceType { device_id },
            12 => Operation::RemoveDevice { device_id },
            13 => Operation::UnregisterCallback {
                callback_id: device_ref,
            },
            14 => Operation::GetErrorString {
                error_code: device_ref,
            },
            15 => Operation::Init,
            16 => Operation::Close,
            17 => Operation::DeviceCount,
            18 => Operation::Stop { device_id },
            19 => Operation::Bell { device_id },
            20 => Operation::DeviceIdForIndex { index: device_ref },
            21 => Operation::GetDeviceParameter {
                device_id,
                name: string_arg_1,
                default: string_arg_2,
            },
            22 => Operation::SetDeviceParameter {
                device_id,
                name: string_arg_1,
                value: string_arg_2,
            },
            23 => Operation::Execute { device_id },
            24 => Operation::Up { device_id },
            25 => Operation::Down { device_id },
            26 => Operation::ListDevices,
            other => return Err(BridgeError::UnknownOpcode(other as i64)),
        };
        Ok(op)
    }

    /// The opcode hosts use for this operation
    pub fn opcode(&self) -> i32 {
        match self {
            Operation::TurnOn { .. } => 0,
            Operation::TurnOff { .. } => 1,
            Operation::Dim { .. } => 2,
            Operation::Learn { .. } => 3,
            Operation::AddDevice => 4,
            Operation::SetName { .. } => 5,
            Operation::GetName { .. } => 6,
            Operation::SetProtocol { .. } => 7,
            Operation::GetProtocol { .. } => 8,
            Operation::SetModel { .. } => 9,
            Operation::GetModel { .. } => 10,
            Operation::GetDeviceType { .. } => 11,
            Operation::RemoveDevice { .. } => 12,
            Operation::UnregisterCallback { .. } => 13,
            Operation::GetErrorString { .. } => 14,
            Operation::Init => 15,
            Operation::Close => 16,
            Operation::DeviceCount => 17,
            Operation::Stop { .. } => 18,
            Operation::Bell { .. } => 19,
            Operation::DeviceIdForIndex { .. } => 20,
            Operation::GetDeviceParameter { .. } => 21,
            Operation::SetDeviceParameter { .. } => 22,
            Operation::Execute { .. } => 23,
            Operation::Up { .. } => 24,
            Operation::Down { .. } => 25,
            Operation::ListDevices => 26,
        }
    }

    /// The result slot this operation fills
    pub fn result_kind(&self) -> ResultKind {
        match self {
            Operation::TurnOn { .. }
            | Operation::TurnOff { .. }
            | Operation::Dim { .. }
            | Operation::Learn { .. }
            | Operation::AddDevice
            | Operation::GetDeviceType { .. }
            | Operation::UnregisterCallback { .. }
            | Operation::DeviceCount
            | Operation::Stop { .. }
            | Operation::Bell { .. }
            | Operation::DeviceIdForIndex { .. }
            | Operation::Execute { .. }
            | Operation::Up { .. }
            | Operation::Down { .. } => ResultKind::Integer,

            Operation::SetName { .. }
            | Operation::SetProtocol { .. }
            | Operation::SetModel { .. }
            | Operation::RemoveDevice { .. }
            | Operation::SetDeviceParameter { .. } => ResultKind::Boolean,

            Operation::GetName { .. }
            | Operation::GetProtocol { .. }
            | Operation::GetModel { .. }
            | Operation::GetErrorString { .. }
            | Operation::GetDeviceParameter { .. } => ResultKind::Text,

            Operation::Init | Operation::Close => ResultKind::SyntheticBoolean,

            Operation::ListDevices => ResultKind::DeviceList,
        }
    }

    /// Native function (or composite) the operation runs
    pub fn native_name(&self) -> &'static str {
        match self {
            Operation::TurnOn { .. } => "tdTurnOn",
            Operation::TurnOff { .. } => "tdTurnOff",
            Operation::Dim { .. } => "tdDim",
            Operation::Learn { .. } => "tdLearn",
            Operation::AddDevice => "tdAddDevice",
            Operation::SetName { .. } => "tdSetName",
            Operation::GetName { .. } => "tdGetName",
            Operation::SetProtocol { .. } => "tdSetProtocol",
            Operation::GetProtocol { .. } => "tdGetProtocol",
            Operation::SetModel { .. } => "tdSetModel",
            Operation::GetModel { .. } => "tdGetModel",
            Operation::GetDeviceType { .. } => "tdGetDeviceType",
            Operation::RemoveDevice { .. } => "tdRemoveDevice",
            Operation::UnregisterCallback { .. } => "tdUnregisterCallback",
            Operation::GetErrorString { .. } => "tdGetErrorString",
            Operation::Init => "tdInit",
            Operation::Close => "tdClose",
            Operation::DeviceCount => "tdGetNumberOfDevices",
            Operation::Stop { .. } => "tdStop",
            Operation::Bell { .. } => "tdBell",
            Operation::DeviceIdForIndex { .. } => "tdGetDeviceId",
            Operation::GetDeviceParameter { .. } => "tdGetDeviceParameter",
            Operation::SetDeviceParameter { .. } => "tdSetDeviceParameter",
            Operation::Execute { .. } => "tdExecute",
            Operation::Up { .. } => "tdUp",
            Operation::Down { .. } => "tdDown",
            Operation::ListDevices => "getDevices",
        }
    }
}

impl TryFrom<CallArgs> for Operation {
    type Error = BridgeError;

    fn try_from(args: CallArgs) -> Result<Self> {
        Operation::decode(args)
    }
}
