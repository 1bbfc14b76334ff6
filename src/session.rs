// MIT License - Copyright (c) 2026 Peter Wright
// Session lifecycle: handshake, mode negotiation and the reconnect supervisor

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use tokio::sync::{mpsc, watch, Mutex, RwLock};
use tokio::time::{sleep, Duration};
use tracing::{debug, error, info, warn};

use crate::config::{FirmwareVersion, PanelConfig, ProtocolMode, MIN_ENHANCED_FIRMWARE};
use crate::constants::{program, LOGIN_WELCOME_TOKENS};
use crate::error::{ArrowheadError, Result};
use crate::event::{EventSender, PanelEvent};
use crate::protocol::{self, Command};
use crate::state::{ConnectionState, LiveState};
use crate::transport::connection::{Connection, LinkContext, SupervisorSignal};
use crate::transport::correlator::{wait_for_line, ResponseMatch};

/// Capacity of the supervisor signal queue.
pub(crate) const SIGNAL_QUEUE: usize = 16;

/// Shared core of a panel client: configuration, live state and the
/// currently installed connection.
pub(crate) struct Session {
    pub config: PanelConfig,
    pub state: Arc<RwLock<LiveState>>,
    pub events: EventSender,
    signals: mpsc::Sender<SupervisorSignal>,
    link: RwLock<Option<Arc<Connection>>>,
    generation: AtomicU64,
    connect_lock: Mutex<()>,
    stopped: watch::Sender<bool>,
}

impl Session {
    pub fn new(
        config: PanelConfig,
        events: EventSender,
        signals: mpsc::Sender<SupervisorSignal>,
    ) -> Self {
        let state = LiveState::new(&config);
        let (stopped, _) = watch::channel(false);
        Self {
            config,
            state: Arc::new(RwLock::new(state)),
            events,
            signals,
            link: RwLock::new(None),
            generation: AtomicU64::new(0),
            connect_lock: Mutex::new(()),
            stopped,
        }
    }

    /// The installed connection, if the session is up.
    pub async fn link(&self) -> Option<Arc<Connection>> {
        self.link.read().await.clone()
    }

    pub async fn connection_state(&self) -> ConnectionState {
        self.state.read().await.connection_state
    }

    pub fn signal(&self, signal: SupervisorSignal) {
        let _ = self.signals.try_send(signal);
    }

    pub fn set_stopped(&self, stopped: bool) {
        self.stopped.send_replace(stopped);
    }

    pub fn is_stopped(&self) -> bool {
        *self.stopped.borrow()
    }

    /// Move to `new` and announce it if it differs from the current state.
    pub async fn set_state(&self, new: ConnectionState) {
        let old = {
            let mut state = self.state.write().await;
            let old = state.connection_state;
            state.connection_state = new;
            old
        };
        if old != new {
            info!("Connection state: {} -> {}", old, new);
            let _ = self.events.send(PanelEvent::ConnectionStateChanged { old, new });
        }
    }

    /// Run one full connection attempt: open, authenticate, negotiate, verify.
    ///
    /// Only one attempt runs at a time; a concurrent call fails with
    /// `ConnectInProgress`.
    pub async fn establish(&self) -> Result<()> {
        let _guard = self
            .connect_lock
            .try_lock()
            .map_err(|_| ArrowheadError::ConnectInProgress)?;

        if let Some(old) = self.link.write().await.take() {
            old.shutdown().await;
        }
        self.state.write().await.reset_for_new_session();
        self.set_state(ConnectionState::Connecting).await;

        let generation = self.generation.fetch_add(1, Ordering::AcqRel) + 1;
        let ctx = LinkContext {
            state: self.state.clone(),
            events: self.events.clone(),
            signals: self.signals.clone(),
        };

        let conn = match Connection::open(&self.config, ctx, generation).await {
            Ok(conn) => conn,
            Err(e) => return Err(self.fail_attempt(e).await),
        };

        if let Err(e) = self.handshake(&conn).await {
            conn.shutdown().await;
            return Err(self.fail_attempt(e).await);
        }

        if self.is_stopped() {
            conn.shutdown().await;
            self.set_state(ConnectionState::Disconnected).await;
            return Err(ArrowheadError::ConnectionClosed);
        }

        *self.link.write().await = Some(conn.clone());
        self.set_state(ConnectionState::Connected).await;
        conn.start_keep_alive(
            self.config.keep_alive_interval(),
            self.config.keep_alive_threshold(),
        );

        // Prime the live state.
        if let Err(e) = conn.send(&Command::Status).await {
            warn!("Initial STATUS request failed: {}", e);
        }
        info!("Panel session ready (generation {})", generation);
        Ok(())
    }

    async fn handshake(&self, conn: &Connection) -> Result<()> {
        self.set_state(ConnectionState::Authenticating).await;
        self.authenticate(conn).await?;
        self.set_state(ConnectionState::NegotiatingMode).await;
        self.negotiate(conn).await
    }

    async fn fail_attempt(&self, e: ArrowheadError) -> ArrowheadError {
        warn!("Connection attempt failed: {}", e);
        self.state.write().await.communication_errors += 1;
        self.set_state(ConnectionState::Error).await;
        e
    }

    /// Login-prompt flow if the panel greets with one, direct STATUS probe
    /// otherwise.
    async fn authenticate(&self, conn: &Connection) -> Result<()> {
        let mut lines = conn.subscribe_lines();
        let prompt_wait = self.config.login_prompt_timeout();
        let greeting = wait_for_line(&mut lines, prompt_wait, |_| true).await;

        match greeting {
            Some(line) if line.to_lowercase().contains("login") => {
                debug!("Login prompt received");
                self.login(conn, &mut lines).await
            }
            other => {
                if let Some(line) = other {
                    debug!("No login prompt (first line {:?}), probing directly", line);
                } else {
                    debug!("No login prompt within {:?}, probing directly", prompt_wait);
                }
                conn.request(&Command::Status, ResponseMatch::AnyLine, self.config.command_timeout)
                    .await?;
                Ok(())
            }
        }
    }

    async fn login(
        &self,
        conn: &Connection,
        lines: &mut watch::Receiver<Option<String>>,
    ) -> Result<()> {
        let limit = self.config.command_timeout;

        conn.send_secret(&self.config.username).await?;
        let prompt = wait_for_line(lines, limit, |_| true).await;
        if !prompt.is_some_and(|l| l.to_lowercase().contains("password")) {
            return Err(ArrowheadError::AuthenticationFailed {
                reason: "no password prompt after username".to_string(),
            });
        }

        conn.send_secret(&self.config.password).await?;
        let welcome = wait_for_line(lines, limit, |_| true).await.ok_or_else(|| {
            ArrowheadError::AuthenticationFailed {
                reason: "no response after password".to_string(),
            }
        })?;
        let lower = welcome.to_lowercase();
        if LOGIN_WELCOME_TOKENS.iter().any(|t| lower.contains(t)) {
            info!("Logged in to panel");
            Ok(())
        } else {
            Err(ArrowheadError::AuthenticationFailed {
                reason: format!("unexpected login response: {}", welcome),
            })
        }
    }

    /// Firmware check, MODE 4 request and provisioning checks (ECi only).
    async fn negotiate(&self, conn: &Connection) -> Result<()> {
        if !self.config.panel_type.negotiates_mode() {
            debug!("{} panel: no mode negotiation", self.config.panel_type);
            return Ok(());
        }
        let limit = self.config.command_timeout;

        let response = conn
            .request(&Command::Version, ResponseMatch::Prefix("OK Version".into()), limit)
            .await?;
        let version_text = protocol::parse_version_response(&response).ok_or_else(|| {
            ArrowheadError::InvalidResponse {
                details: format!("VERSION: {}", response),
            }
        })?;
        let firmware = FirmwareVersion::parse(version_text).ok_or_else(|| {
            ArrowheadError::InvalidResponse {
                details: format!("unparseable firmware version: {}", version_text),
            }
        })?;
        let supported = firmware.supports_enhanced_mode();
        info!("Panel firmware {} ({})", firmware, version_text);
        {
            let mut state = self.state.write().await;
            state.firmware_version = Some(firmware);
            state.version_string = Some(version_text.to_string());
            state.supports_enhanced_mode = supported;
        }

        if supported {
            let mode = ProtocolMode::Mode4;
            let response = conn
                .request(&Command::Mode { mode: mode.number() }, ResponseMatch::Ack, limit)
                .await?;
            if !protocol::is_ok(&response) {
                return Err(ArrowheadError::ModeSwitchRejected {
                    mode: mode.number(),
                    response,
                });
            }
            let mut state = self.state.write().await;
            state.protocol_mode = mode;
            state.enhanced_mode_active = mode.is_enhanced();
            info!("Enhanced protocol mode {} active", mode.number());
        } else if self.config.require_enhanced_mode {
            return Err(ArrowheadError::EnhancedModeUnsupported {
                version: firmware.to_string(),
                minimum: MIN_ENHANCED_FIRMWARE.to_string(),
            });
        } else {
            warn!(
                "Firmware {} is older than {}, staying in protocol mode 1",
                firmware, MIN_ENHANCED_FIRMWARE
            );
        }

        let arm = self.check_provisioned(conn, program::AREA_ARM).await?;
        let stay = self.check_provisioned(conn, program::AREA_STAY).await?;
        let mut state = self.state.write().await;
        state.area_arm_provisioned = Some(arm);
        state.area_stay_provisioned = Some(stay);
        Ok(())
    }

    /// Read one program location. Only link failures are fatal; anything
    /// else counts as "not provisioned".
    async fn check_provisioned(&self, conn: &Connection, location: &str) -> Result<bool> {
        let command = Command::read_program(location);
        let matcher = ResponseMatch::Prefix(location.to_string());
        match conn.request(&command, matcher, self.config.command_timeout).await {
            Ok(response) if protocol::is_provisioned(&response) => {
                debug!("{} provisioned: {}", location, response);
                Ok(true)
            }
            Ok(response) => {
                warn!("{} not provisioned ({}); related commands will be refused", location, response);
                Ok(false)
            }
            Err(e) if e.breaks_link() => Err(e),
            Err(e) => {
                warn!("Could not read {}: {}; treating as not provisioned", location, e);
                Ok(false)
            }
        }
    }

    /// Drop the current link after a failure and mark the session errored.
    pub async fn record_link_loss(&self, reason: String) {
        if let Some(conn) = self.link.write().await.take() {
            conn.shutdown().await;
        }
        self.state.write().await.communication_errors += 1;
        self.set_state(ConnectionState::Error).await;
        let _ = self.events.send(PanelEvent::LinkLost { reason });
    }

    /// Explicit teardown. Idempotent. Waits for an attempt that is already
    /// running so it cannot install a link afterwards.
    pub async fn teardown(&self) {
        let _guard = self.connect_lock.lock().await;
        if let Some(conn) = self.link.write().await.take() {
            conn.shutdown().await;
        }
        self.set_state(ConnectionState::Disconnected).await;
    }

    async fn current_generation(&self) -> Option<u64> {
        self.link.read().await.as_ref().map(|c| c.generation())
    }
}

/// Reconnect supervisor.
///
/// The only task that reacts to link failures: it retires the failed link
/// and retries `establish` with exponential backoff until it succeeds, the
/// attempt budget runs out, or the session is stopped.
pub(crate) async fn run_supervisor(
    session: Arc<Session>,
    mut signals: mpsc::Receiver<SupervisorSignal>,
) {
    let mut stop = session.stopped.subscribe();
    let max_attempts = session.config.max_reconnect_attempts;
    let mut attempts: u32 = 0;

    while let Some(signal) = signals.recv().await {
        if session.is_stopped() {
            continue;
        }
        match signal {
            SupervisorSignal::LinkDown { generation, reason } => {
                if session.current_generation().await != Some(generation) {
                    debug!("Ignoring stale link-down for generation {}", generation);
                    continue;
                }
                attempts = 0;
                session.record_link_loss(reason).await;
            }
            SupervisorSignal::ConnectFailed => {}
            SupervisorSignal::Nudge => {
                if attempts >= max_attempts {
                    attempts = 0;
                }
            }
        }

        if session.connection_state().await.is_connected() {
            continue;
        }

        loop {
            if attempts >= max_attempts {
                error!("Giving up after {} reconnect attempts", attempts);
                session.set_state(ConnectionState::Error).await;
                let _ = session.events.send(PanelEvent::ReconnectExhausted { attempts });
                break;
            }
            attempts += 1;
            let delay = session.config.reconnect_delay(attempts);
            session.set_state(ConnectionState::Reconnecting).await;
            info!("Reconnect attempt {}/{} in {:?}", attempts, max_attempts, delay);

            tokio::select! {
                _ = sleep(delay) => {}
                _ = stop.wait_for(|s| *s) => {
                    debug!("Supervisor: stop requested during backoff");
                    break;
                }
            }
            if session.is_stopped() {
                break;
            }

            match session.establish().await {
                Ok(()) => {
                    info!("Reconnected after {} attempt(s)", attempts);
                    attempts = 0;
                    break;
                }
                Err(ArrowheadError::ConnectInProgress) => break,
                Err(e) if !e.is_retryable() => {
                    error!("Reconnect stopped: {}", e);
                    break;
                }
                Err(e) => debug!("Reconnect attempt {} failed: {}", attempts, e),
            }
        }
    }
    debug!("Supervisor exiting");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::event_channel;

    fn session() -> Session {
        let (events, _) = event_channel(16);
        let (signals, _rx) = mpsc::channel(SIGNAL_QUEUE);
        Session::new(PanelConfig::default(), events, signals)
    }

    #[tokio::test]
    async fn test_set_state_emits_only_on_change() {
        let s = session();
        let mut rx = s.events.subscribe();
        s.set_state(ConnectionState::Connecting).await;
        s.set_state(ConnectionState::Connecting).await;
        let event = rx.try_recv().unwrap();
        assert!(matches!(
            event,
            PanelEvent::ConnectionStateChanged {
                old: ConnectionState::Disconnected,
                new: ConnectionState::Connecting
            }
        ));
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_record_link_loss_counts_errors() {
        let s = session();
        let mut rx = s.events.subscribe();
        s.record_link_loss("Server closed connection".into()).await;
        let state = s.state.read().await;
        assert_eq!(state.communication_errors, 1);
        assert_eq!(state.connection_state, ConnectionState::Error);
        drop(state);
        let mut saw_link_lost = false;
        while let Ok(event) = rx.try_recv() {
            saw_link_lost |= matches!(event, PanelEvent::LinkLost { .. });
        }
        assert!(saw_link_lost);
    }

    #[tokio::test]
    async fn test_teardown_is_idempotent() {
        let s = session();
        s.teardown().await;
        s.teardown().await;
        assert_eq!(s.connection_state().await, ConnectionState::Disconnected);
        assert!(s.link().await.is_none());
    }
}
