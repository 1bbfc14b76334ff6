// MIT License - Copyright (c) 2026 Peter Wright
// Area (partition) state

/// A single alarm area.
///
/// Areas are keyed by their protocol number (1-32) everywhere. The letter
/// form (1 = 'a' ... 26 = 'z') is only a display convention and does not
/// exist for areas 27-32.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Area {
    pub id: u8,
    pub armed: bool,
    /// Armed in stay (home) mode
    pub stay: bool,
    /// A zone belonging to this area is in alarm
    pub alarm_active: bool,
    /// User who last armed or disarmed the area (enhanced mode)
    pub armed_by_user: Option<u16>,
    /// Remaining exit delay in seconds (enhanced mode)
    pub exit_delay: Option<u16>,
}

impl Area {
    pub fn new(id: u8) -> Self {
        Self {
            id,
            armed: false,
            stay: false,
            alarm_active: false,
            armed_by_user: None,
            exit_delay: None,
        }
    }

    /// Display letter for areas 1-26.
    pub fn letter(&self) -> Option<char> {
        (1..=26)
            .contains(&self.id)
            .then(|| char::from(b'a' + self.id - 1))
    }

    /// Apply an arm, stay or disarm transition. Returns true if anything changed.
    pub fn set_armed(&mut self, armed: bool, stay: bool, user: Option<u16>) -> bool {
        let before = self.clone();
        self.armed = armed;
        self.stay = armed && stay;
        if user.is_some() {
            self.armed_by_user = user;
        }
        self.exit_delay = None;
        if !armed {
            self.alarm_active = false;
        }
        before != *self
    }

    /// Record the exit delay timer; 0 clears it. Returns true if it changed.
    pub fn set_exit_delay(&mut self, seconds: u16) -> bool {
        let next = (seconds > 0).then_some(seconds);
        let changed = self.exit_delay != next;
        self.exit_delay = next;
        changed
    }
}
