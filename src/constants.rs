// MIT License - Copyright (c) 2026 Peter Wright
// Protocol constants

use std::ops::RangeInclusive;
use std::time::Duration;

/// Default TCP port of the panel's IP module.
pub const DEFAULT_PORT: u16 = 9000;
pub const DEFAULT_USER_PIN: &str = "1 123";
pub const DEFAULT_USERNAME: &str = "admin";
pub const DEFAULT_PASSWORD: &str = "admin";

/// Highest zone number the protocol can address (ECi).
pub const MAX_ZONE: u16 = 248;
/// Highest area number the protocol can address.
pub const MAX_AREA: u8 = 32;

/// Line terminator for outgoing commands.
pub const LINE_TERMINATOR: &str = "\n";

/// Floor for the keep-alive interval and read-idle timeout. Zero would
/// panic the interval timer or spin the read loop.
pub const MIN_TIMER_PERIOD: Duration = Duration::from_millis(10);

/// Pause between consecutive commands of a bulk bypass.
pub const BULK_BYPASS_PAUSE_MS: u64 = 500;

/// ECi program locations queried at connect and during layout detection.
pub mod program {
    /// Area arming provisioning.
    pub const AREA_ARM: &str = "P74E";
    /// Area stay-arming provisioning.
    pub const AREA_STAY: &str = "P76E";
    /// Active areas list (`P4076E1?`).
    pub const ACTIVE_AREAS: &str = "P4076E1";
    /// Zones-in-area list, followed by the area number (`P4075E<n>?`).
    pub const AREA_ZONES: &str = "P4075E";
}

/// Zone range of the main panel board.
pub const MAIN_PANEL_ZONES: RangeInclusive<u16> = 1..=16;

/// Zone ranges of the ECi zone expanders, indexed by expander number - 1.
///
/// Each expander adds 16 zones after the main board; the 15th only reaches 248.
pub const ZONE_EXPANDER_RANGES: [RangeInclusive<u16>; 15] = [
    17..=32,
    33..=48,
    49..=64,
    65..=80,
    81..=96,
    97..=112,
    113..=128,
    129..=144,
    145..=160,
    161..=176,
    177..=192,
    193..=208,
    209..=224,
    225..=240,
    241..=248,
];

/// Response tokens the panel sends after a successful login.
pub const LOGIN_WELCOME_TOKENS: [&str; 3] = ["welcome", "ready", "ok"];

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_expander_ranges_are_contiguous() {
        let mut next = *MAIN_PANEL_ZONES.end() + 1;
        for range in &ZONE_EXPANDER_RANGES {
            assert_eq!(*range.start(), next);
            next = *range.end() + 1;
        }
        assert_eq!(next - 1, MAX_ZONE);
    }
}
