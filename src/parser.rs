// MIT License - Copyright (c) 2026 Peter Wright
// Inbound message classification

use crate::constants::{MAX_AREA, MAX_ZONE};
use crate::devices::zone::ENTRY_DELAY_CODE;
use crate::devices::{SystemCode, ZoneStatusFlags};
use crate::protocol::KeypadAlarm;
use crate::state::LiveState;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AreaAction {
    Arm,
    Stay,
    Disarm,
}

impl AreaAction {
    fn from_prefix(c: u8) -> Option<Self> {
        match c {
            b'A' => Some(Self::Arm),
            b'S' => Some(Self::Stay),
            b'D' => Some(Self::Disarm),
            _ => None,
        }
    }

    pub fn describe(&self) -> &'static str {
        match self {
            Self::Arm => "Armed",
            Self::Stay => "Stay Armed",
            Self::Disarm => "Disarmed",
        }
    }
}

/// Whole-panel acknowledgements.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AckKind {
    ArmAway,
    ArmStay,
    Disarm,
}

/// A recognized inbound line.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PanelMessage {
    /// `A<n>-U<u>` / `S<n>-U<u>` / `D<n>-U<u>` (enhanced)
    AreaUser { action: AreaAction, area: u8, user: u16 },
    /// `KPA`/`KPR`, `KFA`/`KFR`, `KMA`/`KMR` (enhanced)
    KeypadAlarm { kind: KeypadAlarm, active: bool },
    /// `EX<n>-<seconds>` (enhanced)
    ExitDelay { area: u8, seconds: u16 },
    /// Exact-match system code such as `MF` or `RO`
    System(&'static SystemCode),
    /// `A<n>` / `S<n>` / `D<n>`
    Area { action: AreaAction, area: u8 },
    /// `<code><zone>[-<timing>]`, e.g. `ZO007`, `ZBYR12`
    Zone { flag: ZoneStatusFlags, set: bool, zone: u16 },
    /// `ZED<zone>-<seconds>` (enhanced)
    EntryDelay { zone: u16, seconds: u16 },
    /// `OO<n>` / `OR<n>`
    Output { output: u16, on: bool },
    /// `OK ArmAway` / `OK ArmStay` / `OK Disarm`
    Ack(AckKind),
}

/// Classify one trimmed line. Matchers run in priority order and the first
/// one that fully matches wins; anything else is `None`.
pub fn classify(line: &str) -> Option<PanelMessage> {
    parse_enhanced(line)
        .or_else(|| SystemCode::lookup(line).map(PanelMessage::System))
        .or_else(|| parse_area(line))
        .or_else(|| parse_zone(line))
        .or_else(|| parse_output(line))
        .or_else(|| parse_ack(line))
}

/// Classify `line` and apply it to `state`. Returns true if the line was
/// recognized and applies to this panel. Never fails.
pub fn apply(line: &str, state: &mut LiveState) -> bool {
    classify(line).is_some_and(|message| state.apply(&message))
}

/// Parse an all-digit string of bounded length.
fn number<T: std::str::FromStr>(s: &str, max_len: usize) -> Option<T> {
    if s.is_empty() || s.len() > max_len || !s.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    s.parse().ok()
}

fn area_number(s: &str) -> Option<u8> {
    number::<u8>(s, 2).filter(|a| (1..=MAX_AREA).contains(a))
}

fn zone_number(s: &str) -> Option<u16> {
    number::<u16>(s, 3).filter(|z| (1..=MAX_ZONE).contains(z))
}

fn parse_enhanced(line: &str) -> Option<PanelMessage> {
    let keypad = match line {
        "KPA" => Some((KeypadAlarm::Panic, true)),
        "KPR" => Some((KeypadAlarm::Panic, false)),
        "KFA" => Some((KeypadAlarm::Fire, true)),
        "KFR" => Some((KeypadAlarm::Fire, false)),
        "KMA" => Some((KeypadAlarm::Medical, true)),
        "KMR" => Some((KeypadAlarm::Medical, false)),
        _ => None,
    };
    if let Some((kind, active)) = keypad {
        return Some(PanelMessage::KeypadAlarm { kind, active });
    }

    if let Some(rest) = line.strip_prefix("EX")
        && let Some((area, secs)) = rest.split_once('-')
        && let (Some(area), Some(seconds)) = (area_number(area), number::<u16>(secs, 4))
    {
        return Some(PanelMessage::ExitDelay { area, seconds });
    }

    let action = AreaAction::from_prefix(*line.as_bytes().first()?)?;
    let (area, user) = line[1..].split_once("-U")?;
    Some(PanelMessage::AreaUser {
        action,
        area: area_number(area)?,
        user: number(user, 3)?,
    })
}

fn parse_area(line: &str) -> Option<PanelMessage> {
    let action = AreaAction::from_prefix(*line.as_bytes().first()?)?;
    let area = area_number(&line[1..])?;
    Some(PanelMessage::Area { action, area })
}

fn parse_zone(line: &str) -> Option<PanelMessage> {
    let prefix_len = line.bytes().take_while(u8::is_ascii_uppercase).count();
    if !(2..=5).contains(&prefix_len) {
        return None;
    }
    let (code, rest) = line.split_at(prefix_len);
    let (digits, timing) = match rest.split_once('-') {
        Some((d, t)) => (d, Some(t)),
        None => (rest, None),
    };
    let zone = zone_number(digits)?;

    if code == ENTRY_DELAY_CODE {
        let seconds = number(timing?, 4)?;
        return Some(PanelMessage::EntryDelay { zone, seconds });
    }
    let (flag, set) = ZoneStatusFlags::from_code(code)?;
    // Timing suffix is accepted and ignored on the other zone codes.
    if let Some(t) = timing {
        number::<u16>(t, 4)?;
    }
    Some(PanelMessage::Zone { flag, set, zone })
}

fn parse_output(line: &str) -> Option<PanelMessage> {
    let on = match line.get(..2)? {
        "OO" => true,
        "OR" => false,
        _ => return None,
    };
    let output = number::<u16>(&line[2..], 2).filter(|n| *n > 0)?;
    Some(PanelMessage::Output { output, on })
}

fn parse_ack(line: &str) -> Option<PanelMessage> {
    let kind = if line.starts_with("OK ArmAway") {
        AckKind::ArmAway
    } else if line.starts_with("OK ArmStay") {
        AckKind::ArmStay
    } else if line.starts_with("OK Disarm") {
        AckKind::Disarm
    } else {
        return None;
    };
    Some(PanelMessage::Ack(kind))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{PanelConfig, PanelType};
    use crate::devices::{SystemField, SystemStatusFlags};

    #[test]
    fn test_classify_enhanced() {
        assert_eq!(
            classify("A3-U7"),
            Some(PanelMessage::AreaUser { action: AreaAction::Arm, area: 3, user: 7 })
        );
        assert_eq!(
            classify("S12-U105"),
            Some(PanelMessage::AreaUser { action: AreaAction::Stay, area: 12, user: 105 })
        );
        assert_eq!(
            classify("KFA"),
            Some(PanelMessage::KeypadAlarm { kind: KeypadAlarm::Fire, active: true })
        );
        assert_eq!(classify("EX2-45"), Some(PanelMessage::ExitDelay { area: 2, seconds: 45 }));
    }

    #[test]
    fn test_classify_area_vs_enhanced() {
        assert_eq!(classify("D4"), Some(PanelMessage::Area { action: AreaAction::Disarm, area: 4 }));
        assert_eq!(classify("A32"), Some(PanelMessage::Area { action: AreaAction::Arm, area: 32 }));
        assert_eq!(classify("A33"), None);
        assert_eq!(classify("A0"), None);
        assert_eq!(classify("A123"), None);
        assert_eq!(classify("A1-Ux"), None);
    }

    #[test]
    fn test_classify_system_before_zone() {
        let Some(PanelMessage::System(code)) = classify("ZBL") else {
            panic!("ZBL should be a system code");
        };
        assert_eq!(code.field, SystemField::Flag(SystemStatusFlags::RF_BATTERY_LOW));
        assert!(matches!(classify("DF"), Some(PanelMessage::System(_))));
        // "DR" is dialer restore, not disarm of area "R"
        assert!(matches!(classify("DR"), Some(PanelMessage::System(_))));
    }

    #[test]
    fn test_classify_zone_codes() {
        assert_eq!(
            classify("ZO007"),
            Some(PanelMessage::Zone { flag: ZoneStatusFlags::OPEN, set: true, zone: 7 })
        );
        assert_eq!(
            classify("ZBYR248"),
            Some(PanelMessage::Zone { flag: ZoneStatusFlags::BYPASSED, set: false, zone: 248 })
        );
        assert_eq!(
            classify("ZA12-30"),
            Some(PanelMessage::Zone { flag: ZoneStatusFlags::ALARM, set: true, zone: 12 })
        );
        assert_eq!(classify("ZED5-20"), Some(PanelMessage::EntryDelay { zone: 5, seconds: 20 }));
        assert_eq!(classify("ZED5"), None);
        assert_eq!(classify("ZO249"), None);
        assert_eq!(classify("ZO0"), None);
        assert_eq!(classify("ZO1x"), None);
        assert_eq!(classify("ZQ5"), None);
    }

    #[test]
    fn test_classify_outputs() {
        assert_eq!(classify("OO3"), Some(PanelMessage::Output { output: 3, on: true }));
        assert_eq!(classify("OR12"), Some(PanelMessage::Output { output: 12, on: false }));
        assert_eq!(classify("OO"), None);
        assert_eq!(classify("OO123"), None);
    }

    #[test]
    fn test_classify_acks() {
        assert_eq!(classify("OK ArmAway"), Some(PanelMessage::Ack(AckKind::ArmAway)));
        assert_eq!(classify("OK ArmStay 1"), Some(PanelMessage::Ack(AckKind::ArmStay)));
        assert_eq!(classify("OK Disarm"), Some(PanelMessage::Ack(AckKind::Disarm)));
        assert_eq!(classify("OK"), None);
        assert_eq!(classify("OK Version \"10.3.50\""), None);
    }

    #[test]
    fn test_unrecognized_lines_leave_state_unchanged() {
        let config = PanelConfig::builder().panel_type(PanelType::Eci).build();
        let mut state = LiveState::new(&config);
        apply("ZO3", &mut state);
        let before = state.clone();
        for line in ["", "HELLO", "Z", "ZZ999", "OK", "P4076E1=1,2", "A", "EX-", "\u{fffd}\u{fffd}", "ZO3-"] {
            assert!(!apply(line, &mut state), "{line:?} should not be recognized");
        }
        assert_eq!(state, before);
    }
}
