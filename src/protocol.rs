// MIT License - Copyright (c) 2026 Peter Wright
// Outgoing commands and response helpers

use crate::constants::program;

/// Arm type for area arming commands.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArmType {
    /// Full/away arm (`ARMAREA`)
    Away,
    /// Stay/home arm (`STAYAREA`)
    Stay,
}

/// Keypad-initiated alarm kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum KeypadAlarm {
    Panic,
    Fire,
    Medical,
}

impl KeypadAlarm {
    pub fn name(&self) -> &'static str {
        match self {
            Self::Panic => "Panic",
            Self::Fire => "Fire",
            Self::Medical => "Medical",
        }
    }
}

/// Commands that can be sent to the panel.
///
/// Every command is a single ASCII line. The panel answers most commands
/// with an `OK ...` line; status changes caused by a command arrive
/// separately as unsolicited messages, with no ordering guarantee relative
/// to the acknowledgement.
///
/// # Connection sequence (ECi)
///
/// ```text
/// [login: / password: prompt, if the IP module has one]
/// STATUS          probe when no prompt is shown
/// VERSION         -> OK Version "ECi F/W Ver. 10.3.50"
/// MODE 4          only when firmware >= 10.3.50
/// P74E? / P76E?   area arm / stay provisioning
/// STATUS          full status dump
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    /// `STATUS` - request a full status dump. Also the keep-alive probe.
    Status,
    /// `VERSION` - query firmware version.
    Version,
    /// `MODE <n>` - switch protocol mode (4 = enhanced).
    Mode { mode: u8 },
    /// `<location>?` - read a program location, e.g. `P74E?`.
    ReadProgram { location: String },
    /// `ARMAREA <n>` - away arm one area.
    ArmArea { area: u8 },
    /// `STAYAREA <n>` - stay arm one area.
    StayArea { area: u8 },
    /// `DISARM <user> <pin>`.
    Disarm { user: u16, pin: String },
    /// `BYPASS <zzz>` - zone number zero-padded to 3 digits.
    Bypass { zone: u16 },
    /// `UNBYPASS <zzz>`.
    Unbypass { zone: u16 },
    /// `OUTPUTON <n> [<seconds>]`.
    OutputOn { output: u16, seconds: Option<u32> },
    /// `OUTPUTOFF <n>`.
    OutputOff { output: u16 },
    /// `KPANICALARM` / `KFIREALARM` / `KMEDICALARM`.
    KeypadAlarm(KeypadAlarm),
    /// Passthrough command text.
    Raw(String),
}

impl Command {
    /// Convert the command to its wire string representation (no terminator).
    pub fn to_wire_string(&self) -> String {
        match self {
            Command::Status => "STATUS".to_string(),
            Command::Version => "VERSION".to_string(),
            Command::Mode { mode } => format!("MODE {}", mode),
            Command::ReadProgram { location } => format!("{}?", location),
            Command::ArmArea { area } => format!("ARMAREA {}", area),
            Command::StayArea { area } => format!("STAYAREA {}", area),
            Command::Disarm { user, pin } => format!("DISARM {} {}", user, pin),
            Command::Bypass { zone } => format!("BYPASS {:03}", zone),
            Command::Unbypass { zone } => format!("UNBYPASS {:03}", zone),
            Command::OutputOn { output, seconds: Some(secs) } if *secs > 0 => {
                format!("OUTPUTON {} {}", output, secs)
            }
            Command::OutputOn { output, .. } => format!("OUTPUTON {}", output),
            Command::OutputOff { output } => format!("OUTPUTOFF {}", output),
            Command::KeypadAlarm(kind) => match kind {
                KeypadAlarm::Panic => "KPANICALARM".to_string(),
                KeypadAlarm::Fire => "KFIREALARM".to_string(),
                KeypadAlarm::Medical => "KMEDICALARM".to_string(),
            },
            Command::Raw(s) => s.clone(),
        }
    }

    /// Text safe to put in logs. DISARM carries a PIN.
    pub fn log_string(&self) -> String {
        match self {
            Command::Disarm { user, .. } => format!("DISARM {} ****", user),
            other => other.to_wire_string(),
        }
    }

    /// Create an arm command from an ArmType enum.
    pub fn arm(area: u8, arm_type: ArmType) -> Self {
        match arm_type {
            ArmType::Away => Command::ArmArea { area },
            ArmType::Stay => Command::StayArea { area },
        }
    }

    pub fn read_program(location: impl Into<String>) -> Self {
        Command::ReadProgram {
            location: location.into(),
        }
    }

    /// `P4076E1?` - active areas.
    pub fn active_areas() -> Self {
        Self::read_program(program::ACTIVE_AREAS)
    }

    /// `P4075E<area>?` - zones assigned to an area.
    pub fn area_zones(area: u8) -> Self {
        Self::read_program(format!("{}{}", program::AREA_ZONES, area))
    }

    /// Whether this command expects an `OK`-style acknowledgement.
    pub fn expects_ack(&self) -> bool {
        !matches!(
            self,
            Command::Status | Command::ReadProgram { .. } | Command::Raw(_)
        )
    }
}

/// Parse a response string to extract the value after '='.
/// e.g., "P74E=1" → "1"
pub fn parse_value_after_eq(response: &str) -> &str {
    match response.find('=') {
        Some(pos) => &response[pos + 1..],
        None => response,
    }
}

/// Check if a response is a positive acknowledgement.
pub fn is_ok(response: &str) -> bool {
    response == "OK" || response.starts_with("OK ")
}

/// Check if a response is an error report.
pub fn is_error(response: &str) -> bool {
    response.starts_with("ERR") || response.starts_with("ERROR")
}

/// Whether a program-location read reports the feature as provisioned:
/// any non-empty value other than `0`.
pub fn is_provisioned(response: &str) -> bool {
    let value = parse_value_after_eq(response).trim();
    !value.is_empty() && value != "0"
}

/// Parse a comma separated number list such as `P4076E1=1,2` → [1, 2].
///
/// `0` means "none". Entries that are not numbers are skipped.
pub fn parse_number_list(response: &str) -> Vec<u16> {
    let value = parse_value_after_eq(response).trim();
    if value.is_empty() || value == "0" {
        return Vec::new();
    }
    value
        .split(',')
        .filter_map(|s| s.trim().parse::<u16>().ok())
        .filter(|n| *n > 0)
        .collect()
}

/// Extract the quoted version string from `OK Version "ECi F/W Ver. 10.3.50"`.
pub fn parse_version_response(response: &str) -> Option<&str> {
    let rest = response.strip_prefix("OK Version")?.trim();
    let unquoted = rest.trim_matches('"').trim();
    (!unquoted.is_empty()).then_some(unquoted)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_command_wire_strings() {
        assert_eq!(Command::Status.to_wire_string(), "STATUS");
        assert_eq!(Command::Mode { mode: 4 }.to_wire_string(), "MODE 4");
        assert_eq!(Command::read_program("P74E").to_wire_string(), "P74E?");
        assert_eq!(Command::ArmArea { area: 2 }.to_wire_string(), "ARMAREA 2");
        assert_eq!(Command::StayArea { area: 32 }.to_wire_string(), "STAYAREA 32");
        assert_eq!(
            Command::Disarm { user: 1, pin: "123".into() }.to_wire_string(),
            "DISARM 1 123"
        );
        assert_eq!(Command::active_areas().to_wire_string(), "P4076E1?");
        assert_eq!(Command::area_zones(3).to_wire_string(), "P4075E3?");
    }

    #[test]
    fn test_bypass_zero_padding() {
        assert_eq!(Command::Bypass { zone: 1 }.to_wire_string(), "BYPASS 001");
        assert_eq!(Command::Bypass { zone: 248 }.to_wire_string(), "BYPASS 248");
        assert_eq!(Command::Unbypass { zone: 12 }.to_wire_string(), "UNBYPASS 012");
    }

    #[test]
    fn test_output_commands() {
        assert_eq!(
            Command::OutputOn { output: 3, seconds: None }.to_wire_string(),
            "OUTPUTON 3"
        );
        assert_eq!(
            Command::OutputOn { output: 3, seconds: Some(0) }.to_wire_string(),
            "OUTPUTON 3"
        );
        assert_eq!(
            Command::OutputOn { output: 3, seconds: Some(30) }.to_wire_string(),
            "OUTPUTON 3 30"
        );
        assert_eq!(Command::OutputOff { output: 3 }.to_wire_string(), "OUTPUTOFF 3");
    }

    #[test]
    fn test_keypad_alarm_commands() {
        assert_eq!(Command::KeypadAlarm(KeypadAlarm::Panic).to_wire_string(), "KPANICALARM");
        assert_eq!(Command::KeypadAlarm(KeypadAlarm::Fire).to_wire_string(), "KFIREALARM");
        assert_eq!(Command::KeypadAlarm(KeypadAlarm::Medical).to_wire_string(), "KMEDICALARM");
    }

    #[test]
    fn test_log_string_masks_pin() {
        let cmd = Command::Disarm { user: 4, pin: "9876".into() };
        assert_eq!(cmd.log_string(), "DISARM 4 ****");
        assert_eq!(Command::Status.log_string(), "STATUS");
    }

    #[test]
    fn test_is_ok() {
        assert!(is_ok("OK"));
        assert!(is_ok("OK ArmAway"));
        assert!(!is_ok("OKAY"));
        assert!(!is_ok("ERR 2"));
        assert!(is_error("ERR 2"));
    }

    #[test]
    fn test_is_provisioned() {
        assert!(is_provisioned("P74E=1"));
        assert!(is_provisioned("P76E=1,2"));
        assert!(!is_provisioned("P74E=0"));
        assert!(!is_provisioned("P74E="));
    }

    #[test]
    fn test_parse_number_list() {
        assert_eq!(parse_number_list("P4076E1=1,2"), vec![1, 2]);
        assert_eq!(parse_number_list("P4075E1=1, 2,x,4"), vec![1, 2, 4]);
        assert!(parse_number_list("P4075E2=0").is_empty());
        assert!(parse_number_list("P4075E2=").is_empty());
    }

    #[test]
    fn test_parse_version_response() {
        assert_eq!(
            parse_version_response("OK Version \"ECi F/W Ver. 10.3.50\""),
            Some("ECi F/W Ver. 10.3.50")
        );
        assert_eq!(parse_version_response("OK Version"), None);
        assert_eq!(parse_version_response("OK ArmAway"), None);
    }
}
