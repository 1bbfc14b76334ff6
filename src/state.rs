// MIT License - Copyright (c) 2026 Peter Wright
// Live panel state model

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

use bitflags::bitflags;
use chrono::{DateTime, Utc};

use crate::config::{FirmwareVersion, PanelConfig, PanelType, ProtocolMode};
use crate::devices::{Area, Output, SystemField, Zone, ZoneStatusFlags};
use crate::devices::SystemStatusFlags;
use crate::parser::{AckKind, AreaAction, PanelMessage};
use crate::protocol::KeypadAlarm;

/// Session lifecycle as driven by the connection supervisor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum ConnectionState {
    #[default]
    Disconnected,
    Connecting,
    Authenticating,
    NegotiatingMode,
    Connected,
    Reconnecting,
    Error,
}

impl ConnectionState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Disconnected => "disconnected",
            Self::Connecting => "connecting",
            Self::Authenticating => "authenticating",
            Self::NegotiatingMode => "negotiating_mode",
            Self::Connected => "connected",
            Self::Reconnecting => "reconnecting",
            Self::Error => "error",
        }
    }

    pub fn is_connected(&self) -> bool {
        matches!(self, Self::Connected)
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

bitflags! {
    /// Keypad-initiated alarms (enhanced mode). Tracked apart from zone alarms.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct KeypadAlarmFlags: u8 {
        const PANIC   = 0b001;
        const FIRE    = 0b010;
        const MEDICAL = 0b100;
    }
}

impl From<KeypadAlarm> for KeypadAlarmFlags {
    fn from(kind: KeypadAlarm) -> Self {
        match kind {
            KeypadAlarm::Panic => Self::PANIC,
            KeypadAlarm::Fire => Self::FIRE,
            KeypadAlarm::Medical => Self::MEDICAL,
        }
    }
}

/// Snapshot-able model of everything the panel has told us.
///
/// Written only by the read loop (through [`LiveState::apply`]), by the
/// session for connection and capability fields, and by narrow optimistic
/// updates after a successful command. Everything else reads clones.
#[derive(Debug, Clone, PartialEq)]
pub struct LiveState {
    pub panel_type: PanelType,
    pub connection_state: ConnectionState,

    pub armed: bool,
    pub arming: bool,
    pub stay_mode: bool,
    pub alarm: bool,
    pub ready_to_arm: bool,

    pub areas: BTreeMap<u8, Area>,
    pub zones: BTreeMap<u16, Zone>,
    pub outputs: BTreeMap<u16, Output>,
    /// Known zone → area membership, from layout detection.
    pub zone_areas: BTreeMap<u16, u8>,

    pub system: SystemStatusFlags,
    pub keypad_alarms: KeypadAlarmFlags,

    pub firmware_version: Option<FirmwareVersion>,
    pub version_string: Option<String>,
    pub protocol_mode: ProtocolMode,
    pub supports_enhanced_mode: bool,
    pub enhanced_mode_active: bool,
    /// `None` until checked; ESX panels are never checked.
    pub area_arm_provisioned: Option<bool>,
    pub area_stay_provisioned: Option<bool>,

    pub status_message: String,
    pub communication_errors: u64,
    pub last_update: Option<DateTime<Utc>>,
}

impl LiveState {
    /// Blank state with configured outputs, the initial zone range and area 1.
    pub fn new(config: &PanelConfig) -> Self {
        let zones = (1..=config.effective_zone_count())
            .map(|id| (id, Zone::new(id)))
            .collect();
        let outputs = (1..=config.effective_output_count())
            .map(|id| (id, Output::new(id)))
            .collect();
        let mut areas = BTreeMap::new();
        areas.insert(1, Area::new(1));

        Self {
            panel_type: config.panel_type,
            connection_state: ConnectionState::Disconnected,
            armed: false,
            arming: false,
            stay_mode: false,
            alarm: false,
            ready_to_arm: false,
            areas,
            zones,
            outputs,
            zone_areas: BTreeMap::new(),
            system: SystemStatusFlags::empty(),
            keypad_alarms: KeypadAlarmFlags::empty(),
            firmware_version: None,
            version_string: None,
            protocol_mode: ProtocolMode::Mode1,
            supports_enhanced_mode: false,
            enhanced_mode_active: false,
            area_arm_provisioned: None,
            area_stay_provisioned: None,
            status_message: String::new(),
            communication_errors: 0,
            last_update: None,
        }
    }

    /// Clear panel-reported status for a fresh session, keeping configured
    /// keys, zone membership and the error counter.
    pub fn reset_for_new_session(&mut self) {
        self.armed = false;
        self.arming = false;
        self.stay_mode = false;
        self.alarm = false;
        self.ready_to_arm = false;
        for area in self.areas.values_mut() {
            let id = area.id;
            *area = Area::new(id);
        }
        for zone in self.zones.values_mut() {
            let id = zone.id;
            *zone = Zone::new(id);
        }
        for output in self.outputs.values_mut() {
            output.active = false;
        }
        self.system = SystemStatusFlags::empty();
        self.keypad_alarms = KeypadAlarmFlags::empty();
        self.firmware_version = None;
        self.version_string = None;
        self.protocol_mode = ProtocolMode::Mode1;
        self.supports_enhanced_mode = false;
        self.enhanced_mode_active = false;
        self.area_arm_provisioned = None;
        self.area_stay_provisioned = None;
    }

    /// Apply one classified message. Returns false if the message does not
    /// apply to this panel (RF codes on ECi, unconfigured outputs).
    pub fn apply(&mut self, message: &PanelMessage) -> bool {
        match *message {
            PanelMessage::AreaUser { action, area, user } => {
                self.apply_area(action, area, Some(user));
                self.status_message = format!("Area {} {} by user {}", area, action.describe(), user);
            }
            PanelMessage::Area { action, area } => {
                self.apply_area(action, area, None);
                self.status_message = format!("Area {} {}", area, action.describe());
            }
            PanelMessage::KeypadAlarm { kind, active } => {
                self.keypad_alarms.set(kind.into(), active);
                self.status_message = if active {
                    format!("Keypad {} Alarm", kind.name())
                } else {
                    format!("Keypad {} Alarm Restored", kind.name())
                };
            }
            PanelMessage::ExitDelay { area, seconds } => {
                self.area_mut(area).set_exit_delay(seconds);
                self.arming = self.areas.values().any(|a| a.exit_delay.is_some());
                self.status_message = format!("Area {} Exit Delay {}s", area, seconds);
            }
            PanelMessage::System(code) => {
                if code.is_rf_only() && !self.panel_type.supports_rf() {
                    return false;
                }
                match code.field {
                    SystemField::ReadyToArm => self.ready_to_arm = code.value,
                    SystemField::Flag(flag) => self.system.set(flag, code.value),
                }
                self.status_message = code.description.to_string();
            }
            PanelMessage::Zone { flag, set, zone } => {
                if flag.is_rf_only() && !self.panel_type.supports_rf() {
                    return false;
                }
                self.zone_mut(zone).set_flag(flag, set);
                if flag == ZoneStatusFlags::ALARM {
                    self.recompute_alarm();
                }
                self.status_message = format!("Zone {} {}", zone, ZoneStatusFlags::describe(flag, set));
            }
            PanelMessage::EntryDelay { zone, seconds } => {
                self.zone_mut(zone).set_entry_delay(seconds);
                self.status_message = format!("Zone {} Entry Delay {}s", zone, seconds);
            }
            PanelMessage::Output { output, on } => {
                let Some(out) = self.outputs.get_mut(&output) else {
                    return false;
                };
                out.set_active(on);
                self.status_message = format!("Output {} {}", output, if on { "On" } else { "Off" });
            }
            PanelMessage::Ack(kind) => self.apply_ack(kind),
        }
        true
    }

    fn apply_area(&mut self, action: AreaAction, area: u8, user: Option<u16>) {
        let (armed, stay) = match action {
            AreaAction::Arm => (true, false),
            AreaAction::Stay => (true, true),
            AreaAction::Disarm => (false, false),
        };
        self.area_mut(area).set_armed(armed, stay, user);
        self.stay_mode = self.areas.values().any(|a| a.armed && a.stay);
        self.recompute_armed();
        self.arming = self.areas.values().any(|a| a.exit_delay.is_some());
    }

    fn apply_ack(&mut self, kind: AckKind) {
        match kind {
            AckKind::ArmAway | AckKind::ArmStay => {
                let stay = kind == AckKind::ArmStay;
                for area in self.areas.values_mut() {
                    area.set_armed(true, stay, None);
                }
                self.armed = true;
                self.arming = false;
                self.stay_mode = stay;
                self.status_message = if stay { "Armed Stay" } else { "Armed Away" }.to_string();
            }
            AckKind::Disarm => {
                for area in self.areas.values_mut() {
                    area.set_armed(false, false, None);
                }
                self.armed = false;
                self.arming = false;
                self.stay_mode = false;
                self.alarm = false;
                self.status_message = "Disarmed".to_string();
            }
        }
    }

    fn area_mut(&mut self, id: u8) -> &mut Area {
        self.areas.entry(id).or_insert_with(|| Area::new(id))
    }

    fn zone_mut(&mut self, id: u16) -> &mut Zone {
        self.zones.entry(id).or_insert_with(|| Zone::new(id))
    }

    fn recompute_armed(&mut self) {
        self.armed = self.areas.values().any(|a| a.armed);
    }

    /// Global alarm is the OR of zone alarms; areas owning an alarmed zone
    /// are marked as well.
    fn recompute_alarm(&mut self) {
        self.alarm = self.zones.values().any(Zone::is_alarm);
        let alarmed: BTreeSet<u8> = self
            .zones
            .values()
            .filter(|z| z.is_alarm())
            .filter_map(|z| self.zone_areas.get(&z.id).copied())
            .collect();
        for area in self.areas.values_mut() {
            area.alarm_active = alarmed.contains(&area.id);
        }
    }

    /// Record zone membership for an area (from layout detection).
    pub fn assign_zones(&mut self, area: u8, zones: &[u16]) {
        self.area_mut(area);
        for &zone in zones {
            self.zone_mut(zone);
            self.zone_areas.insert(zone, area);
        }
        self.recompute_alarm();
    }

    /// Zone ids that belong to `area`.
    pub fn zones_in_area(&self, area: u8) -> Vec<u16> {
        self.zone_areas
            .iter()
            .filter(|(_, a)| **a == area)
            .map(|(z, _)| *z)
            .collect()
    }

    /// Optimistic update after an accepted arm command.
    pub(crate) fn mark_arming(&mut self) {
        self.arming = true;
    }

    /// Zone ids with any alarm flag set.
    pub fn alarmed_zones(&self) -> Vec<u16> {
        self.zones.values().filter(|z| z.is_alarm()).map(|z| z.id).collect()
    }

    pub fn open_zones(&self) -> Vec<u16> {
        self.zones.values().filter(|z| z.is_open()).map(|z| z.id).collect()
    }

    pub fn bypassed_zones(&self) -> Vec<u16> {
        self.zones.values().filter(|z| z.is_bypassed()).map(|z| z.id).collect()
    }
}
