// MIT License - Copyright (c) 2026 Peter Wright
// Zone state and zone message codes

use bitflags::bitflags;

bitflags! {
    /// Independent per-zone conditions. A zone can be open, bypassed and in
    /// alarm at the same time.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct ZoneStatusFlags: u8 {
        /// ZO / ZC
        const OPEN             = 0b0000_0001;
        /// ZA / ZR
        const ALARM            = 0b0000_0010;
        /// ZT / ZTR
        const TROUBLE          = 0b0000_0100;
        /// ZBY / ZBYR
        const BYPASSED         = 0b0000_1000;
        /// ZSA / ZSR (RF supervision, ESX only)
        const SUPERVISION_FAIL = 0b0001_0000;
    }
}

/// Zone message prefixes and the flag each one sets (true) or clears (false).
const ZONE_CODES: [(&str, ZoneStatusFlags, bool); 10] = [
    ("ZO", ZoneStatusFlags::OPEN, true),
    ("ZC", ZoneStatusFlags::OPEN, false),
    ("ZA", ZoneStatusFlags::ALARM, true),
    ("ZR", ZoneStatusFlags::ALARM, false),
    ("ZT", ZoneStatusFlags::TROUBLE, true),
    ("ZTR", ZoneStatusFlags::TROUBLE, false),
    ("ZBY", ZoneStatusFlags::BYPASSED, true),
    ("ZBYR", ZoneStatusFlags::BYPASSED, false),
    ("ZSA", ZoneStatusFlags::SUPERVISION_FAIL, true),
    ("ZSR", ZoneStatusFlags::SUPERVISION_FAIL, false),
];

/// Prefix of the enhanced-mode entry delay timer (`ZED<zone>-<seconds>`).
pub const ENTRY_DELAY_CODE: &str = "ZED";

impl ZoneStatusFlags {
    /// Look up a zone message prefix. Returns the flag and whether the code sets it.
    pub fn from_code(code: &str) -> Option<(Self, bool)> {
        ZONE_CODES
            .iter()
            .find(|(c, _, _)| *c == code)
            .map(|(_, flag, set)| (*flag, *set))
    }

    /// Whether this flag only exists on panels with RF supervision.
    pub fn is_rf_only(&self) -> bool {
        self.contains(Self::SUPERVISION_FAIL)
    }

    /// Human-readable description of a flag transition.
    pub fn describe(flag: Self, set: bool) -> &'static str {
        match (flag, set) {
            (f, true) if f == Self::OPEN => "Open",
            (f, false) if f == Self::OPEN => "Closed",
            (f, true) if f == Self::ALARM => "Alarm",
            (f, false) if f == Self::ALARM => "Alarm Restored",
            (f, true) if f == Self::TROUBLE => "Trouble",
            (f, false) if f == Self::TROUBLE => "Trouble Restored",
            (f, true) if f == Self::BYPASSED => "Bypassed",
            (f, false) if f == Self::BYPASSED => "Bypass Restored",
            (f, true) if f == Self::SUPERVISION_FAIL => "RF Supervise Fail",
            (f, false) if f == Self::SUPERVISION_FAIL => "RF Supervise OK",
            _ => "Changed",
        }
    }
}

/// A single alarm zone.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Zone {
    pub id: u16,
    pub status: ZoneStatusFlags,
    /// Remaining entry delay in seconds (enhanced mode only)
    pub entry_delay: Option<u16>,
}

impl Zone {
    pub fn new(id: u16) -> Self {
        Self {
            id,
            status: ZoneStatusFlags::empty(),
            entry_delay: None,
        }
    }

    /// Set or clear one flag. Returns true if the status changed.
    pub fn set_flag(&mut self, flag: ZoneStatusFlags, on: bool) -> bool {
        let before = self.status;
        self.status.set(flag, on);
        before != self.status
    }

    /// Record the entry delay timer; 0 clears it. Returns true if it changed.
    pub fn set_entry_delay(&mut self, seconds: u16) -> bool {
        let next = (seconds > 0).then_some(seconds);
        let changed = self.entry_delay != next;
        self.entry_delay = next;
        changed
    }

    pub fn is_open(&self) -> bool { self.status.contains(ZoneStatusFlags::OPEN) }
    pub fn is_alarm(&self) -> bool { self.status.contains(ZoneStatusFlags::ALARM) }
    pub fn is_trouble(&self) -> bool { self.status.contains(ZoneStatusFlags::TROUBLE) }
    pub fn is_bypassed(&self) -> bool { self.status.contains(ZoneStatusFlags::BYPASSED) }
    pub fn is_supervision_fail(&self) -> bool { self.status.contains(ZoneStatusFlags::SUPERVISION_FAIL) }
}
