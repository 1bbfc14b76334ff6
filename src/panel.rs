// MIT License - Copyright (c) 2026 Peter Wright
// Public panel client: connection control and command operations

use std::sync::{Arc, Mutex as StdMutex};

use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tokio::time::{sleep, Duration};
use tracing::{debug, info, warn};

use crate::config::PanelConfig;
use crate::constants::{program, BULK_BYPASS_PAUSE_MS, MAX_ZONE};
use crate::devices::{Area, Zone};
use crate::detection::{self, CommandChannel, LayoutOverrides, PanelLayout};
use crate::error::{ArrowheadError, Result};
use crate::event::{event_channel, EventReceiver};
use crate::protocol::{self, ArmType, Command, KeypadAlarm};
use crate::session::{run_supervisor, Session, SIGNAL_QUEUE};
use crate::state::{ConnectionState, LiveState};
use crate::transport::connection::{Connection, SupervisorSignal};
use crate::transport::correlator::ResponseMatch;

/// Derived per-area view.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AreaStatus {
    pub area: u8,
    /// Display letter, `a`..`z` for areas 1-26
    pub letter: Option<char>,
    pub armed: bool,
    pub stay: bool,
    pub alarm_active: bool,
    pub armed_by_user: Option<u16>,
    pub exit_delay: Option<u16>,
    pub zones: Vec<u16>,
    pub open_zones: usize,
    pub alarmed_zones: usize,
    pub bypassed_zones: usize,
}

/// The main public API for interacting with an Arrowhead ESX/ECi panel.
///
/// Commands are serialized: the protocol has no request ids, so at most one
/// command is on the wire at a time. Link failures are handled by a
/// background supervisor that reconnects with exponential backoff.
///
/// # Example
///
/// ```no_run
/// use arrowhead_lan_bridge::{ArrowheadPanel, PanelConfig, PanelType};
///
/// #[tokio::main]
/// async fn main() -> anyhow::Result<()> {
///     let config = PanelConfig::builder()
///         .panel_type(PanelType::Eci)
///         .host("192.168.0.100")
///         .user_pin("1 123")
///         .build();
///
///     let panel = ArrowheadPanel::new(config);
///     let mut events = panel.subscribe();
///     tokio::spawn(async move {
///         while let Ok(event) = events.recv().await {
///             println!("Event: {:?}", event);
///         }
///     });
///
///     panel.connect().await?;
///     panel.arm_area(1).await?;
///
///     let state = panel.snapshot().await;
///     println!("armed={} open zones={:?}", state.armed, state.open_zones());
///
///     tokio::signal::ctrl_c().await?;
///     panel.disconnect().await?;
///     Ok(())
/// }
/// ```
pub struct ArrowheadPanel {
    session: Arc<Session>,
    signals_rx: StdMutex<Option<mpsc::Receiver<SupervisorSignal>>>,
    supervisor: StdMutex<Option<JoinHandle<()>>>,
    command_lock: Mutex<()>,
}

impl ArrowheadPanel {
    pub fn new(config: PanelConfig) -> Self {
        let (events, _) = event_channel(256);
        let (signals, signals_rx) = mpsc::channel(SIGNAL_QUEUE);
        Self {
            session: Arc::new(Session::new(config, events, signals)),
            signals_rx: StdMutex::new(Some(signals_rx)),
            supervisor: StdMutex::new(None),
            command_lock: Mutex::new(()),
        }
    }

    pub fn config(&self) -> &PanelConfig {
        &self.session.config
    }

    /// Subscribe to panel events.
    pub fn subscribe(&self) -> EventReceiver {
        self.session.events.subscribe()
    }

    // --- Connection ---

    /// Connect, authenticate and negotiate.
    ///
    /// On a retryable failure the supervisor keeps trying in the background
    /// and the error is still returned, so the host can tell "not ready yet"
    /// (`is_retryable()`) from a fatal misconfiguration.
    pub async fn connect(&self) -> Result<()> {
        self.session.set_stopped(false);
        self.ensure_supervisor();

        if self.session.connection_state().await.is_connected() {
            debug!("Already connected");
            return Ok(());
        }

        match self.session.establish().await {
            Ok(()) => Ok(()),
            Err(ArrowheadError::ConnectInProgress) => Err(ArrowheadError::ConnectInProgress),
            Err(e) => {
                if e.is_retryable() && !self.session.is_stopped() {
                    self.session.signal(SupervisorSignal::ConnectFailed);
                }
                Err(e)
            }
        }
    }

    /// Stop background work and close the socket. Safe to call in any state.
    pub async fn disconnect(&self) -> Result<()> {
        info!("Disconnecting from panel");
        self.session.set_stopped(true);
        self.session.teardown().await;
        Ok(())
    }

    fn ensure_supervisor(&self) {
        let Ok(mut rx) = self.signals_rx.lock() else {
            return;
        };
        if let Some(rx) = rx.take() {
            let handle = tokio::spawn(run_supervisor(self.session.clone(), rx));
            if let Ok(mut slot) = self.supervisor.lock() {
                *slot = Some(handle);
            }
        }
    }

    // --- State views ---

    /// Immutable copy of the live state.
    pub async fn snapshot(&self) -> LiveState {
        self.session.state.read().await.clone()
    }

    pub async fn connection_state(&self) -> ConnectionState {
        self.session.connection_state().await
    }

    pub async fn is_connected(&self) -> bool {
        self.connection_state().await.is_connected()
    }

    /// Ask the panel for a full status push and return the current state.
    ///
    /// When disconnected, prompts the supervisor to retry and fails with
    /// `NotConnected`.
    pub async fn refresh(&self) -> Result<LiveState> {
        let link = match self.require_link().await {
            Ok(link) => link,
            Err(e) => {
                self.session.signal(SupervisorSignal::Nudge);
                return Err(e);
            }
        };
        link.send(&Command::Status).await?;
        Ok(self.snapshot().await)
    }

    pub async fn area_status(&self, area: u8) -> Result<AreaStatus> {
        self.validate_area(area)?;
        let state = self.session.state.read().await;
        let zones = state.zones_in_area(area);
        let count = |pred: fn(&Zone) -> bool| {
            zones
                .iter()
                .filter_map(|z| state.zones.get(z))
                .filter(|z| pred(z))
                .count()
        };
        let open_zones = count(Zone::is_open);
        let alarmed_zones = count(Zone::is_alarm);
        let bypassed_zones = count(Zone::is_bypassed);

        let a = state.areas.get(&area).cloned().unwrap_or_else(|| Area::new(area));
        Ok(AreaStatus {
            area,
            letter: a.letter(),
            armed: a.armed,
            stay: a.stay,
            alarm_active: a.alarm_active,
            armed_by_user: a.armed_by_user,
            exit_delay: a.exit_delay,
            open_zones,
            alarmed_zones,
            bypassed_zones,
            zones,
        })
    }

    /// Record which zones belong to `area`, so zone alarms mark it.
    pub async fn assign_zones_to_area(&self, area: u8, zones: &[u16]) -> Result<()> {
        self.validate_area(area)?;
        for &zone in zones {
            self.validate_zone(zone)?;
        }
        self.session.state.write().await.assign_zones(area, zones);
        Ok(())
    }

    /// Detect areas and zones (ECi program reads) and record the result.
    pub async fn detect_layout(&self, overrides: &LayoutOverrides) -> PanelLayout {
        let layout = detection::detect_layout(self, overrides).await;
        self.apply_layout(&layout).await;
        layout
    }

    /// Record zone membership from a layout. Zones beyond the panel's limit
    /// are skipped.
    pub async fn apply_layout(&self, layout: &PanelLayout) {
        let max_area = self.config().panel_type.max_areas();
        let max_zone = self.max_zone();
        let mut state = self.session.state.write().await;
        for (&area, zones) in &layout.zones_in_areas {
            if !(1..=max_area).contains(&area) {
                warn!("Skipping layout area {} (panel has {})", area, max_area);
                continue;
            }
            let zones: Vec<u16> = zones.iter().copied().filter(|z| *z <= max_zone).collect();
            state.assign_zones(area, &zones);
        }
    }

    // --- Arm / disarm ---

    /// Arm an area (`ARMAREA n`).
    pub async fn arm_area(&self, area: u8) -> Result<()> {
        self.arm(area, ArmType::Away).await
    }

    /// Stay-arm an area (`STAYAREA n`).
    pub async fn stay_area(&self, area: u8) -> Result<()> {
        self.arm(area, ArmType::Stay).await
    }

    async fn arm(&self, area: u8, arm_type: ArmType) -> Result<()> {
        self.validate_area(area)?;
        self.check_provisioning(arm_type).await?;
        info!("Arming area {} ({:?})", area, arm_type);
        self.execute(Command::arm(area, arm_type)).await?;
        self.session.state.write().await.mark_arming();
        self.settle().await;
        Ok(())
    }

    /// Disarm with the configured user credential (`DISARM user pin`).
    ///
    /// The panel disarms every area the user may access; `area` is checked
    /// against the panel's range only.
    pub async fn disarm_area(&self, area: u8) -> Result<()> {
        let credential = self.config().credential()?;
        self.validate_area(area)?;
        info!("Disarming area {} as user {}", area, credential.user);
        self.execute(Command::Disarm {
            user: credential.user,
            pin: credential.pin().to_string(),
        })
        .await?;
        self.settle().await;
        Ok(())
    }

    #[deprecated(note = "use arm_area")]
    pub async fn arm_away(&self) -> Result<()> {
        self.arm_area(1).await
    }

    #[deprecated(note = "use stay_area")]
    pub async fn arm_stay(&self) -> Result<()> {
        self.stay_area(1).await
    }

    #[deprecated(note = "use disarm_area")]
    pub async fn disarm(&self) -> Result<()> {
        self.disarm_area(1).await
    }

    // --- Zones ---

    pub async fn bypass_zone(&self, zone: u16) -> Result<()> {
        self.validate_zone(zone)?;
        self.execute(Command::Bypass { zone }).await.map(|_| ())
    }

    pub async fn unbypass_zone(&self, zone: u16) -> Result<()> {
        self.validate_zone(zone)?;
        self.execute(Command::Unbypass { zone }).await.map(|_| ())
    }

    /// Bypass (or unbypass) several zones, one command at a time.
    ///
    /// Every zone is validated before anything is sent. Returns the outcome
    /// for each zone in input order.
    pub async fn bulk_bypass(&self, zones: &[u16], bypass: bool) -> Result<Vec<(u16, Result<()>)>> {
        for &zone in zones {
            self.validate_zone(zone)?;
        }
        let mut results = Vec::with_capacity(zones.len());
        for (i, &zone) in zones.iter().enumerate() {
            if i > 0 {
                sleep(Duration::from_millis(BULK_BYPASS_PAUSE_MS)).await;
            }
            let command = if bypass {
                Command::Bypass { zone }
            } else {
                Command::Unbypass { zone }
            };
            let result = self.execute(command).await.map(|_| ());
            if let Err(e) = &result {
                warn!("Bulk {} of zone {} failed: {}", if bypass { "bypass" } else { "unbypass" }, zone, e);
            }
            results.push((zone, result));
        }
        Ok(results)
    }

    // --- Outputs ---

    /// Switch an output on, optionally for a number of seconds.
    pub async fn output_on(&self, output: u16, seconds: Option<u32>) -> Result<()> {
        self.validate_output(output)?;
        self.execute(Command::OutputOn { output, seconds }).await.map(|_| ())
    }

    pub async fn output_off(&self, output: u16) -> Result<()> {
        self.validate_output(output)?;
        self.execute(Command::OutputOff { output }).await.map(|_| ())
    }

    /// Pulse an output for `seconds` (0 means latch on).
    pub async fn trigger_output(&self, output: u16, seconds: u32) -> Result<()> {
        self.output_on(output, Some(seconds)).await
    }

    // --- Alarms and passthrough ---

    pub async fn keypad_alarm(&self, kind: KeypadAlarm) -> Result<()> {
        warn!("Triggering keypad {} alarm", kind.name());
        self.execute(Command::KeypadAlarm(kind)).await.map(|_| ())
    }

    /// Send a raw command and return the next line from the panel.
    pub async fn send_custom_command(&self, text: &str) -> Result<String> {
        let text = text.trim();
        if text.is_empty() {
            return Err(ArrowheadError::InvalidCommand {
                reason: "empty command".to_string(),
            });
        }
        if text.contains(['\r', '\n']) {
            return Err(ArrowheadError::InvalidCommand {
                reason: "command must be a single line".to_string(),
            });
        }
        let _turn = self.command_lock.lock().await;
        let link = self.require_link().await?;
        link.request(
            &Command::Raw(text.to_string()),
            ResponseMatch::AnyLine,
            self.config().command_timeout,
        )
        .await
    }

    // --- Internals ---

    /// Send one command and require an `OK` answer (or any line for
    /// commands without an acknowledgement).
    async fn execute(&self, command: Command) -> Result<String> {
        let _turn = self.command_lock.lock().await;
        let link = self.require_link().await?;
        let matcher = if command.expects_ack() {
            ResponseMatch::Ack
        } else {
            ResponseMatch::AnyLine
        };
        let response = link
            .request(&command, matcher, self.config().command_timeout)
            .await?;
        if command.expects_ack() && !protocol::is_ok(&response) {
            warn!("{} rejected: {}", command.log_string(), response);
            return Err(ArrowheadError::CommandRejected {
                command: command.log_string(),
                response,
            });
        }
        Ok(response)
    }

    async fn require_link(&self) -> Result<Arc<Connection>> {
        let state = self.session.connection_state().await;
        match self.session.link().await {
            Some(link) if state.is_connected() => Ok(link),
            _ => Err(ArrowheadError::NotConnected { state }),
        }
    }

    async fn check_provisioning(&self, arm_type: ArmType) -> Result<()> {
        let state = self.session.state.read().await;
        let (provisioned, feature, location) = match arm_type {
            ArmType::Away => (state.area_arm_provisioned, "area arming", program::AREA_ARM),
            ArmType::Stay => (state.area_stay_provisioned, "area stay arming", program::AREA_STAY),
        };
        if provisioned == Some(false) {
            return Err(ArrowheadError::NotProvisioned { feature, location });
        }
        Ok(())
    }

    async fn settle(&self) {
        let delay = self.config().settle_delay;
        if !delay.is_zero() {
            sleep(delay).await;
        }
    }

    fn max_zone(&self) -> u16 {
        self.config().panel_type.max_zones().min(MAX_ZONE)
    }

    fn validate_area(&self, area: u8) -> Result<()> {
        let max = self.config().panel_type.max_areas();
        if area == 0 || area > max {
            return Err(ArrowheadError::InvalidArea {
                area: area as u32,
                max: max as u32,
            });
        }
        Ok(())
    }

    fn validate_zone(&self, zone: u16) -> Result<()> {
        let max = self.max_zone();
        if zone == 0 || zone > max {
            return Err(ArrowheadError::InvalidZone {
                zone: zone as u32,
                max: max as u32,
            });
        }
        Ok(())
    }

    fn validate_output(&self, output: u16) -> Result<()> {
        let max = self.config().effective_output_count();
        if output == 0 || output > max {
            return Err(ArrowheadError::InvalidOutput {
                output: output as u32,
                max: max as u32,
            });
        }
        Ok(())
    }
}

impl CommandChannel for ArrowheadPanel {
    async fn query(&self, command: Command, matcher: ResponseMatch) -> Result<String> {
        let _turn = self.command_lock.lock().await;
        let link = self.require_link().await?;
        link.request(&command, matcher, self.config().command_timeout).await
    }

    async fn send(&self, command: Command) -> Result<()> {
        let link = self.require_link().await?;
        link.send(&command).await
    }

    async fn known_zones(&self) -> Vec<u16> {
        self.session.state.read().await.zones.keys().copied().collect()
    }
}

impl Drop for ArrowheadPanel {
    fn drop(&mut self) {
        self.session.set_stopped(true);
        if let Ok(mut slot) = self.supervisor.lock()
            && let Some(handle) = slot.take()
        {
            handle.abort();
        }
    }
}
