// MIT License - Copyright (c) 2026 Peter Wright
// Panel-wide status codes

use bitflags::bitflags;

bitflags! {
    /// Panel-wide fault and activity conditions. An empty set means
    /// everything is healthy.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct SystemStatusFlags: u16 {
        const MAINS_FAIL         = 1 << 0;
        const BATTERY_FAIL       = 1 << 1;
        const TAMPER_ALARM       = 1 << 2;
        const LINE_FAIL          = 1 << 3;
        const DIALER_FAIL        = 1 << 4;
        const FUSE_FAIL          = 1 << 5;
        const DIALER_ACTIVE      = 1 << 6;
        /// RF receiver failure (ESX)
        const RECEIVER_FAIL      = 1 << 7;
        /// RF sensor battery low (ESX)
        const RF_BATTERY_LOW     = 1 << 8;
        /// Sensor-watch alarm (ESX)
        const SENSOR_WATCH_ALARM = 1 << 9;

        const RF_ONLY = Self::RECEIVER_FAIL.bits()
            | Self::RF_BATTERY_LOW.bits()
            | Self::SENSOR_WATCH_ALARM.bits();
    }
}

impl SystemStatusFlags {
    pub fn mains_ok(&self) -> bool { !self.contains(Self::MAINS_FAIL) }
    pub fn battery_ok(&self) -> bool { !self.contains(Self::BATTERY_FAIL) }
    pub fn tamper_alarm(&self) -> bool { self.contains(Self::TAMPER_ALARM) }
    pub fn line_ok(&self) -> bool { !self.contains(Self::LINE_FAIL) }
    pub fn dialer_ok(&self) -> bool { !self.contains(Self::DIALER_FAIL) }
    pub fn fuse_ok(&self) -> bool { !self.contains(Self::FUSE_FAIL) }
    pub fn dialer_active(&self) -> bool { self.contains(Self::DIALER_ACTIVE) }
    pub fn receiver_ok(&self) -> bool { !self.contains(Self::RECEIVER_FAIL) }
    pub fn rf_battery_low(&self) -> bool { self.contains(Self::RF_BATTERY_LOW) }
    pub fn sensor_watch_alarm(&self) -> bool { self.contains(Self::SENSOR_WATCH_ALARM) }
}

/// What a system code changes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SystemField {
    ReadyToArm,
    Flag(SystemStatusFlags),
}

/// One entry of the fixed system code table.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SystemCode {
    pub code: &'static str,
    pub field: SystemField,
    /// New value of the field (for flags: whether the condition is present)
    pub value: bool,
    pub description: &'static str,
}

const fn flag(
    code: &'static str,
    f: SystemStatusFlags,
    value: bool,
    description: &'static str,
) -> SystemCode {
    SystemCode { code, field: SystemField::Flag(f), value, description }
}

const SYSTEM_CODES: [SystemCode; 22] = [
    SystemCode { code: "RO", field: SystemField::ReadyToArm, value: true, description: "Ready to Arm" },
    SystemCode { code: "NR", field: SystemField::ReadyToArm, value: false, description: "Not Ready" },
    flag("MF", SystemStatusFlags::MAINS_FAIL, true, "Mains Power Fail"),
    flag("MR", SystemStatusFlags::MAINS_FAIL, false, "Mains Power OK"),
    flag("BF", SystemStatusFlags::BATTERY_FAIL, true, "Battery Fail"),
    flag("BR", SystemStatusFlags::BATTERY_FAIL, false, "Battery OK"),
    flag("TA", SystemStatusFlags::TAMPER_ALARM, true, "Panel Tamper Alarm"),
    flag("TR", SystemStatusFlags::TAMPER_ALARM, false, "Panel Tamper Restored"),
    flag("LF", SystemStatusFlags::LINE_FAIL, true, "Telephone Line Fail"),
    flag("LR", SystemStatusFlags::LINE_FAIL, false, "Telephone Line Restored"),
    flag("DF", SystemStatusFlags::DIALER_FAIL, true, "Dialer Fail"),
    flag("DR", SystemStatusFlags::DIALER_FAIL, false, "Dialer Restored"),
    flag("FF", SystemStatusFlags::FUSE_FAIL, true, "Fuse/Output Fail"),
    flag("FR", SystemStatusFlags::FUSE_FAIL, false, "Fuse/Output Restored"),
    flag("CAL", SystemStatusFlags::DIALER_ACTIVE, true, "Dialer Active"),
    flag("CLF", SystemStatusFlags::DIALER_ACTIVE, false, "Call Finished"),
    flag("RIF", SystemStatusFlags::RECEIVER_FAIL, true, "Receiver Fail"),
    flag("RIR", SystemStatusFlags::RECEIVER_FAIL, false, "Receiver Restored"),
    flag("ZBL", SystemStatusFlags::RF_BATTERY_LOW, true, "RF Zone Battery Low"),
    flag("ZBR", SystemStatusFlags::RF_BATTERY_LOW, false, "RF Zone Battery OK"),
    flag("ZIA", SystemStatusFlags::SENSOR_WATCH_ALARM, true, "Zone Sensor-Watch Alarm"),
    flag("ZIR", SystemStatusFlags::SENSOR_WATCH_ALARM, false, "Zone Sensor-Watch OK"),
];

impl SystemCode {
    /// Exact-match lookup in the system code table.
    pub fn lookup(line: &str) -> Option<&'static SystemCode> {
        SYSTEM_CODES.iter().find(|c| c.code == line)
    }

    pub fn is_rf_only(&self) -> bool {
        match self.field {
            SystemField::Flag(f) => SystemStatusFlags::RF_ONLY.contains(f),
            SystemField::ReadyToArm => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_lookup_exact_only() {
        let code = SystemCode::lookup("MF").unwrap();
        assert_eq!(code.field, SystemField::Flag(SystemStatusFlags::MAINS_FAIL));
        assert!(code.value);
        assert!(SystemCode::lookup("MF1").is_none());
        assert!(SystemCode::lookup("mf").is_none());
        assert!(SystemCode::lookup("").is_none());
    }

    #[test]
    fn test_rf_only_codes() {
        assert!(SystemCode::lookup("RIF").unwrap().is_rf_only());
        assert!(SystemCode::lookup("ZBL").unwrap().is_rf_only());
        assert!(!SystemCode::lookup("RO").unwrap().is_rf_only());
        assert!(!SystemCode::lookup("CAL").unwrap().is_rf_only());
    }

    #[test]
    fn test_empty_flags_are_healthy() {
        let flags = SystemStatusFlags::empty();
        assert!(flags.mains_ok() && flags.battery_ok() && flags.line_ok());
        assert!(!flags.tamper_alarm());
        assert!(!flags.dialer_active());
        assert!(flags.receiver_ok());
    }
}
