// MIT License - Copyright (c) 2026 Peter Wright

use serde::{Deserialize, Serialize};

use crate::conn::{Conn, ACTION_PATH};
use crate::error::{BridgeError, Result};

/// Door command codes understood by the basestation.
///
/// Code ranges:
///   - 2-7: basic door operations (open, close, partial opens)
///   - 16-21: light and auxiliary controls, remote-control lockout
///   - 32-50: percentage-based door positions (5% to 95%)
///   - 257-258: phone lockout
///   - 321-322: cycle testing
///   - 352-355: camera alarm controls
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Command {
    Open = 2,
    Stop = 3,
    Close = 4,
    PartOpen1 = 5,
    PartOpen2 = 6,
    PartOpen3 = 7,
    LightOn = 16,
    LightOff = 17,
    AuxOn = 18,
    AuxOff = 19,
    RemoteControlLockoutOn = 20,
    RemoteControlLockoutOff = 21,
    OpenPercent05 = 32,
    OpenPercent10 = 33,
    OpenPercent15 = 34,
    OpenPercent20 = 35,
    OpenPercent25 = 36,
    OpenPercent30 = 37,
    OpenPercent35 = 38,
    OpenPercent40 = 39,
    OpenPercent45 = 40,
    OpenPercent50 = 41,
    OpenPercent55 = 42,
    OpenPercent60 = 43,
    OpenPercent65 = 44,
    OpenPercent70 = 45,
    OpenPercent75 = 46,
    OpenPercent80 = 47,
    OpenPercent85 = 48,
    OpenPercent90 = 49,
    OpenPercent95 = 50,
    PhoneLockoutOff = 257,
    PhoneLockoutOn = 258,
    EnableCycleTest = 321,
    DisableCycleTest = 322,
    CameraMotionAlarmEnable = 352,
    CameraMotionAlarmDisable = 353,
    CameraAudioAlarmEnable = 354,
    CameraAudioAlarmDisable = 355,
}

impl Command {
    /// The integer code sent to the device.
    pub fn code(self) -> i32 {
        self as i32
    }

    /// Look up a command by its snake_case alias.
    pub fn from_alias(alias: &str) -> Option<Command> {
        use Command::*;
        Some(match alias {
            "open" => Open,
            "stop" => Stop,
            "close" => Close,
            "part_open_1" => PartOpen1,
            "part_open_2" => PartOpen2,
            "part_open_3" => PartOpen3,
            "light_on" => LightOn,
            "light_off" => LightOff,
            "aux_on" => AuxOn,
            "aux_off" => AuxOff,
            "remote_control_lockout_on" => RemoteControlLockoutOn,
            "remote_control_lockout_off" => RemoteControlLockoutOff,
            "open_percent_05" => OpenPercent05,
            "open_percent_10" => OpenPercent10,
            "open_percent_15" => OpenPercent15,
            "open_percent_20" => OpenPercent20,
            "open_percent_25" => OpenPercent25,
            "open_percent_30" => OpenPercent30,
            "open_percent_35" => OpenPercent35,
            "open_percent_40" => OpenPercent40,
            "open_percent_45" => OpenPercent45,
            "open_percent_50" => OpenPercent50,
            "open_percent_55" => OpenPercent55,
            "open_percent_60" => OpenPercent60,
            "open_percent_65" => OpenPercent65,
            "open_percent_70" => OpenPercent70,
            "open_percent_75" => OpenPercent75,
            "open_percent_80" => OpenPercent80,
            "open_percent_85" => OpenPercent85,
            "open_percent_90" => OpenPercent90,
            "open_percent_95" => OpenPercent95,
            "phone_lockout_off" => PhoneLockoutOff,
            "phone_lockout_on" => PhoneLockoutOn,
            "enable_cycle_test" => EnableCycleTest,
            "disable_cycle_test" => DisableCycleTest,
            "camera_motion_alarm_enable" => CameraMotionAlarmEnable,
            "camera_motion_alarm_disable" => CameraMotionAlarmDisable,
            "camera_audio_alarm_enable" => CameraAudioAlarmEnable,
            "camera_audio_alarm_disable" => CameraAudioAlarmDisable,
            _ => return None,
        })
    }
}

/// Parse a command given either an integer literal or a known alias.
pub fn parse_command(input: &str) -> Result<i32> {
    if let Ok(code) = input.parse::<i32>() {
        return Ok(code);
    }
    Command::from_alias(input)
        .map(Command::code)
        .ok_or_else(|| BridgeError::UnknownCommand(input.to_string()))
}

/// The door command for a reported position ratio.
///
/// This might not return the command that produced the position if the
/// door was moved by other means.
pub fn command_for_ratio(position: i32) -> Command {
    if position <= 0 {
        Command::Close
    } else if position <= 20 {
        Command::PartOpen2 // pet: 10%
    } else if position <= 68 {
        Command::PartOpen3 // parcel: 34%
    } else {
        Command::Open
    }
}

/// The command driving the door to a 0-100 position setpoint.
///
/// Positions clamp to [0, 100]; 0 closes, anything above 95 fully opens,
/// and everything in between rounds up to the next 5% bucket.
pub fn command_for_position(position: i32) -> Command {
    let position = position.clamp(0, 100);
    if position == 0 {
        return Command::Close;
    }
    if position > 95 {
        return Command::Open;
    }
    let bucket = (position + 4) / 5; // 1..=19
    let code = 31 + bucket;
    percent_command_for_code(code)
}

fn percent_command_for_code(code: i32) -> Command {
    use Command::*;
    match code {
        32 => OpenPercent05,
        33 => OpenPercent10,
        34 => OpenPercent15,
        35 => OpenPercent20,
        36 => OpenPercent25,
        37 => OpenPercent30,
        38 => OpenPercent35,
        39 => OpenPercent40,
        40 => OpenPercent45,
        41 => OpenPercent50,
        42 => OpenPercent55,
        43 => OpenPercent60,
        44 => OpenPercent65,
        45 => OpenPercent70,
        46 => OpenPercent75,
        47 => OpenPercent80,
        48 => OpenPercent85,
        49 => OpenPercent90,
        _ => OpenPercent95,
    }
}

/// Input body for `/app/res/action`.
#[derive(Debug, Clone, Default, Serialize)]
pub struct CommandInput {
    pub action: CommandAction,
    #[serde(rename = "deviceId")]
    pub device_id: String,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct CommandAction {
    pub cmd: i32,
}

/// Reply body for `/app/res/action`.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct CommandOutput {
    pub value: String,
}

/// Send a door command to a device over the signed RPC channel.
pub async fn send_command(conn: &Conn, device_id: &str, command: Command) -> Result<CommandOutput> {
    tracing::info!(device = device_id, command = command.code(), "sending command");
    let input = CommandInput {
        action: CommandAction {
            cmd: command.code(),
        },
        device_id: device_id.to_string(),
    };
    conn.rpc(ACTION_PATH, Some(&input)).await
}
