// MIT License - Copyright (c) 2026 Peter Wright
// Setup-time discovery of areas, zones and expander modules (ECi)

use std::collections::{BTreeMap, BTreeSet};
use std::ops::RangeInclusive;

use tokio::time::{sleep, Duration};
use tracing::{debug, info, warn};

use crate::constants::{program, MAIN_PANEL_ZONES, MAX_AREA, MAX_ZONE, ZONE_EXPANDER_RANGES};
use crate::error::{ErrorKind, Result};
use crate::protocol::{self, Command};
use crate::transport::correlator::ResponseMatch;

/// Default pause after `STATUS` before the snapshot is read.
pub const STATUS_SETTLE: Duration = Duration::from_secs(3);

/// The command/response primitive the detector needs.
///
/// Implemented by `ArrowheadPanel`; tests supply a scripted channel.
#[allow(async_fn_in_trait)]
pub trait CommandChannel: Send + Sync {
    /// Send a command and return the line matching `matcher`.
    async fn query(&self, command: Command, matcher: ResponseMatch) -> Result<String>;

    /// Send a command without waiting for a response.
    async fn send(&self, command: Command) -> Result<()>;

    /// Zone ids currently present in the live state.
    async fn known_zones(&self) -> Vec<u16>;
}

/// How a layout was obtained.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DetectionMethod {
    /// `P4076E1?` answered; zones came from `P4075E<n>?`
    ActiveAreasQuery,
    /// Program reads failed; zones taken from the status snapshot
    StatusParsing,
    /// Built from user settings without talking to the panel
    Manual,
    /// Detection failed outright
    Fallback,
}

impl DetectionMethod {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::ActiveAreasQuery => "active_areas_query",
            Self::StatusParsing => "status_parsing",
            Self::Manual => "manual",
            Self::Fallback => "exception_fallback",
        }
    }
}

/// A zone expander module inferred from the zones in its range.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExpanderModule {
    /// 1-based expander number
    pub index: u8,
    pub range: RangeInclusive<u16>,
    pub zones: BTreeSet<u16>,
}

/// Areas, zones and expanders of one panel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PanelLayout {
    pub active_areas: BTreeSet<u8>,
    pub zones_in_areas: BTreeMap<u8, BTreeSet<u16>>,
    pub detected_zones: BTreeSet<u16>,
    pub max_zone: u16,
    pub expanders: Vec<ExpanderModule>,
    pub method: DetectionMethod,
}

impl PanelLayout {
    /// Safe default: main panel zones in area 1.
    pub fn fallback() -> Self {
        let zones: BTreeSet<u16> = MAIN_PANEL_ZONES.collect();
        Self {
            active_areas: BTreeSet::from([1]),
            zones_in_areas: BTreeMap::from([(1, zones.clone())]),
            detected_zones: zones,
            max_zone: *MAIN_PANEL_ZONES.end(),
            expanders: Vec::new(),
            method: DetectionMethod::Fallback,
        }
    }

    /// Layout from user settings only: `max_zones` (default 16) split evenly
    /// across `areas` (default {1}), the last area taking the remainder.
    pub fn manual(max_zones: Option<u16>, areas: Option<&BTreeSet<u8>>) -> Self {
        let max_zone = max_zones.unwrap_or(*MAIN_PANEL_ZONES.end()).clamp(1, MAX_ZONE);
        let areas: BTreeSet<u8> = match areas {
            Some(a) if !a.is_empty() => a.clone(),
            _ => BTreeSet::from([1]),
        };

        let per_area = (max_zone / areas.len() as u16).max(1);
        let mut zones_in_areas = BTreeMap::new();
        let last = areas.len() - 1;
        for (i, &area) in areas.iter().enumerate() {
            let start = i as u16 * per_area + 1;
            let end = if i == last { max_zone } else { ((i as u16 + 1) * per_area).min(max_zone) };
            zones_in_areas.insert(area, (start..=end).collect::<BTreeSet<u16>>());
        }
        let detected_zones = zones_in_areas.values().flatten().copied().collect();

        Self {
            active_areas: areas,
            zones_in_areas,
            detected_zones,
            max_zone,
            expanders: Vec::new(),
            method: DetectionMethod::Manual,
        }
    }

    pub fn total_zones(&self) -> usize {
        self.detected_zones.len()
    }

    /// Clamp to user limits: zones above `max_zones` are dropped and
    /// `areas` replaces the detected area set.
    pub fn apply_overrides(&mut self, overrides: &LayoutOverrides) {
        if let Some(limit) = overrides.max_zones {
            self.max_zone = self.max_zone.min(limit);
            self.detected_zones.retain(|z| *z <= limit);
            for zones in self.zones_in_areas.values_mut() {
                zones.retain(|z| *z <= limit);
            }
        }
        if let Some(areas) = &overrides.areas
            && !areas.is_empty()
        {
            self.active_areas = areas.clone();
        }
    }

    /// Fill gaps and enforce the protocol limits.
    fn sanitize(&mut self) {
        self.detected_zones.retain(|z| (1..=MAX_ZONE).contains(z));
        if self.detected_zones.is_empty() {
            self.detected_zones = MAIN_PANEL_ZONES.collect();
        }
        if self.active_areas.is_empty() {
            self.active_areas.insert(1);
        }
        if self.zones_in_areas.is_empty() {
            self.zones_in_areas.insert(1, self.detected_zones.clone());
        }
        if self.max_zone == 0 {
            self.max_zone = *MAIN_PANEL_ZONES.end();
        }
        self.max_zone = self.max_zone.min(MAX_ZONE);
        self.expanders = expanders_for(&self.detected_zones);
    }
}

/// User preferences applied on top of detection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LayoutOverrides {
    /// Skip detection and use `PanelLayout::manual`
    pub auto_detect: bool,
    pub max_zones: Option<u16>,
    pub areas: Option<BTreeSet<u8>>,
}

impl Default for LayoutOverrides {
    fn default() -> Self {
        Self {
            auto_detect: true,
            max_zones: None,
            areas: None,
        }
    }
}

/// Expander modules that have at least one zone in their range.
pub fn expanders_for(zones: &BTreeSet<u16>) -> Vec<ExpanderModule> {
    ZONE_EXPANDER_RANGES
        .iter()
        .enumerate()
        .filter_map(|(i, range)| {
            let in_range: BTreeSet<u16> = zones.range(range.clone()).copied().collect();
            (!in_range.is_empty()).then(|| ExpanderModule {
                index: i as u8 + 1,
                range: range.clone(),
                zones: in_range,
            })
        })
        .collect()
}

/// Runs the detection sequence against a `CommandChannel`.
pub struct ZoneDetector<'a, C> {
    channel: &'a C,
    status_settle: Duration,
}

impl<'a, C: CommandChannel> ZoneDetector<'a, C> {
    pub fn new(channel: &'a C) -> Self {
        Self {
            channel,
            status_settle: STATUS_SETTLE,
        }
    }

    pub fn status_settle(mut self, settle: Duration) -> Self {
        self.status_settle = settle;
        self
    }

    /// Detect the layout, apply `overrides` and sanitize. Never fails: a
    /// lost connection yields `PanelLayout::fallback()`.
    pub async fn resolve(&self, overrides: &LayoutOverrides) -> PanelLayout {
        let mut layout = if overrides.auto_detect {
            let mut detected = self.detect().await;
            detected.apply_overrides(overrides);
            detected
        } else {
            PanelLayout::manual(overrides.max_zones, overrides.areas.as_ref())
        };
        layout.sanitize();
        info!(
            "Panel layout: {} zones (max {}), areas {:?}, {} expander(s), method {}",
            layout.total_zones(),
            layout.max_zone,
            layout.active_areas,
            layout.expanders.len(),
            layout.method.as_str()
        );
        layout
    }

    /// Raw detection without overrides.
    pub async fn detect(&self) -> PanelLayout {
        match self.try_detect().await {
            Ok(layout) => layout,
            Err(e) => {
                warn!("Layout detection failed: {}; using fallback layout", e);
                PanelLayout::fallback()
            }
        }
    }

    async fn try_detect(&self) -> Result<PanelLayout> {
        let mut active_areas = BTreeSet::new();
        let mut zones_in_areas = BTreeMap::new();
        let mut detected_zones = BTreeSet::new();
        let mut method = DetectionMethod::StatusParsing;

        if let Some(areas) = self.query_active_areas().await? {
            method = DetectionMethod::ActiveAreasQuery;
            for &area in &areas {
                if let Some(zones) = self.query_area_zones(area).await? {
                    debug!("Area {} zones: {:?}", area, zones);
                    detected_zones.extend(zones.iter().copied());
                    zones_in_areas.insert(area, zones);
                }
            }
            active_areas = areas;
        }

        if detected_zones.is_empty() {
            let from_status = self.zones_from_status().await?;
            detected_zones.extend(from_status);
            if active_areas.is_empty() {
                method = DetectionMethod::StatusParsing;
                active_areas.insert(1);
            }
        }

        let max_zone = detected_zones.last().copied().unwrap_or(*MAIN_PANEL_ZONES.end());
        let expanders = expanders_for(&detected_zones);
        Ok(PanelLayout {
            active_areas,
            zones_in_areas,
            detected_zones,
            max_zone,
            expanders,
            method,
        })
    }

    /// `P4076E1?`. `Ok(None)` if the panel gave no usable answer.
    async fn query_active_areas(&self) -> Result<Option<BTreeSet<u8>>> {
        let Some(response) = self.read_location(program::ACTIVE_AREAS).await? else {
            return Ok(None);
        };
        let mut areas: BTreeSet<u8> = protocol::parse_number_list(&response)
            .into_iter()
            .filter_map(|n| u8::try_from(n).ok())
            .filter(|a| (1..=MAX_AREA).contains(a))
            .collect();
        if areas.is_empty() {
            debug!("No areas configured, defaulting to area 1");
            areas.insert(1);
        }
        Ok(Some(areas))
    }

    /// `P4075E<area>?`. `Ok(None)` if the panel gave no usable answer.
    async fn query_area_zones(&self, area: u8) -> Result<Option<BTreeSet<u16>>> {
        let location = format!("{}{}", program::AREA_ZONES, area);
        let Some(response) = self.read_location(&location).await? else {
            return Ok(None);
        };
        Ok(Some(
            protocol::parse_number_list(&response)
                .into_iter()
                .filter(|z| (1..=MAX_ZONE).contains(z))
                .collect(),
        ))
    }

    /// Read one program location. Transport failures abort detection;
    /// timeouts and odd answers just mean "no data".
    async fn read_location(&self, location: &str) -> Result<Option<String>> {
        let command = Command::read_program(location);
        let matcher = ResponseMatch::Prefix(location.to_string());
        let expected = format!("{}=", location);
        match self.channel.query(command, matcher).await {
            Ok(response) if response.starts_with(&expected) => Ok(Some(response)),
            Ok(response) => {
                warn!("Unexpected answer to {}?: {}", location, response);
                Ok(None)
            }
            Err(e) if e.kind() == ErrorKind::Transport => Err(e),
            Err(e) => {
                warn!("Reading {} failed: {}", location, e);
                Ok(None)
            }
        }
    }

    /// Request a full status push and collect zone ids from the live state.
    async fn zones_from_status(&self) -> Result<BTreeSet<u16>> {
        self.channel.send(Command::Status).await?;
        sleep(self.status_settle).await;
        let zones: BTreeSet<u16> = self
            .channel
            .known_zones()
            .await
            .into_iter()
            .filter(|z| (1..=MAX_ZONE).contains(z))
            .collect();
        debug!("Zones from status snapshot: {:?}", zones);
        Ok(zones)
    }
}

/// Convenience wrapper: detect with default settings.
pub async fn detect_layout<C: CommandChannel>(channel: &C, overrides: &LayoutOverrides) -> PanelLayout {
    ZoneDetector::new(channel).resolve(overrides).await
}
