// MIT License - Copyright (c) 2026 Peter Wright
// MQTT bridge

use std::collections::{BTreeSet, HashMap};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use anyhow::{Context, Result};
use chrono::Utc;
use clap::Parser;
use rumqttc::{AsyncClient, Event, EventLoop, MqttOptions, Packet, QoS};
use serde::{Deserialize, Serialize};
use tokio::signal::unix::{signal, SignalKind};
use tokio::sync::broadcast::error::RecvError;
use tokio::time::{interval, sleep, Duration};
use tracing::{debug, error, info, warn};

use arrowhead_lan_bridge::devices::SystemField;
use arrowhead_lan_bridge::{
    AreaAction, ArrowheadPanel, ConnectionState, EventReceiver, KeypadAlarm, KeypadAlarmFlags,
    LayoutOverrides, LiveState, PanelConfig, PanelEvent, PanelLayout, PanelMessage, PanelType, ZoneStatusFlags,
};

// ---------------------------------------------------------------------------
// CLI
// ---------------------------------------------------------------------------

#[derive(Parser)]
#[command(name = "arrowhead2mqtt")]
#[command(about = "Bridge between an Arrowhead ESX/ECi alarm panel and MQTT")]
struct Cli {
    /// Path to the TOML configuration file
    #[arg(long, default_value = "config.toml")]
    config: String,
}

// ---------------------------------------------------------------------------
// Config
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
struct Config {
    panel: PanelToml,
    mqtt: MqttToml,
    #[serde(default, deserialize_with = "deserialize_zone_names")]
    zone_names: HashMap<u16, String>,
}

fn deserialize_zone_names<'de, D>(deserializer: D) -> Result<HashMap<u16, String>, D::Error>
where
    D: serde::Deserializer<'de>,
{
    let string_map: HashMap<String, String> = HashMap::deserialize(deserializer)?;
    string_map
        .into_iter()
        .map(|(k, v)| {
            k.parse::<u16>()
                .map(|id| (id, v))
                .map_err(|_| serde::de::Error::custom(format!("invalid zone ID: {k}")))
        })
        .collect()
}

#[derive(Debug, Deserialize)]
struct PanelToml {
    /// "esx" or "eci"
    #[serde(default = "default_panel_type")]
    panel_type: String,
    host: String,
    #[serde(default = "default_panel_port")]
    port: u16,
    /// "<user> <pin>", used for DISARM
    #[serde(default = "default_user_pin")]
    user_pin: String,
    #[serde(default = "default_login")]
    username: String,
    #[serde(default = "default_login")]
    password: String,
    #[serde(default = "default_output_count")]
    output_count: u16,
    #[serde(default = "default_zone_count")]
    zone_count: u16,
    #[serde(default = "default_connect_timeout")]
    connect_timeout_secs: u64,
    #[serde(default = "default_command_timeout")]
    command_timeout_secs: u64,
    #[serde(default = "default_reconnect_delay")]
    reconnect_delay_secs: u64,
    #[serde(default = "default_max_reconnect_delay")]
    max_reconnect_delay_secs: u64,
    #[serde(default = "default_max_reconnect_attempts")]
    max_reconnect_attempts: u32,
    #[serde(default = "default_settle_delay")]
    settle_delay_ms: u64,
    #[serde(default)]
    require_enhanced_mode: bool,
    /// Read areas and zones from the panel after connecting (ECi only)
    #[serde(default = "default_true")]
    detect_layout: bool,
    #[serde(default)]
    max_zones: Option<u16>,
    #[serde(default)]
    areas: Option<Vec<u8>>,
}

fn default_panel_type() -> String {
    "esx".to_string()
}
fn default_panel_port() -> u16 {
    9000
}
fn default_user_pin() -> String {
    "1 123".to_string()
}
fn default_login() -> String {
    "admin".to_string()
}
fn default_output_count() -> u16 {
    4
}
fn default_zone_count() -> u16 {
    16
}
fn default_connect_timeout() -> u64 {
    10
}
fn default_command_timeout() -> u64 {
    5
}
fn default_reconnect_delay() -> u64 {
    30
}
fn default_max_reconnect_delay() -> u64 {
    300
}
fn default_max_reconnect_attempts() -> u32 {
    5
}
fn default_settle_delay() -> u64 {
    2000
}
fn default_true() -> bool {
    true
}

#[derive(Debug, Deserialize)]
struct MqttToml {
    url: String,
    #[serde(default = "default_client_id")]
    client_id: String,
    #[serde(default = "default_subscribe_topic")]
    subscribe_topic: String,
    #[serde(default = "default_publish_topic")]
    publish_topic: String,
    #[serde(default = "default_snapshot_interval")]
    snapshot_interval_secs: u64,
}

fn default_client_id() -> String {
    "arrowhead-bridge".to_string()
}
fn default_subscribe_topic() -> String {
    "arrowhead/cmd".to_string()
}
fn default_publish_topic() -> String {
    "arrowhead".to_string()
}
fn default_snapshot_interval() -> u64 {
    60
}

fn build_panel_config(toml: &PanelToml) -> Result<PanelConfig> {
    let panel_type = PanelType::from_name(&toml.panel_type)
        .with_context(|| format!("Unknown panel type: {}", toml.panel_type))?;
    let config = PanelConfig::builder()
        .panel_type(panel_type)
        .host(&toml.host)
        .port(toml.port)
        .user_pin(&toml.user_pin)
        .username(&toml.username)
        .password(&toml.password)
        .output_count(toml.output_count)
        .initial_zone_count(toml.zone_count)
        .connect_timeout(Duration::from_secs(toml.connect_timeout_secs))
        .command_timeout(Duration::from_secs(toml.command_timeout_secs))
        .reconnect_delays(
            Duration::from_secs(toml.reconnect_delay_secs),
            Duration::from_secs(toml.max_reconnect_delay_secs),
        )
        .max_reconnect_attempts(toml.max_reconnect_attempts)
        .settle_delay(Duration::from_millis(toml.settle_delay_ms))
        .require_enhanced_mode(toml.require_enhanced_mode)
        .build();
    // Fail on a malformed credential now rather than at the first DISARM.
    config.credential().context("Invalid panel.user_pin")?;
    Ok(config)
}

fn layout_overrides(toml: &PanelToml) -> LayoutOverrides {
    LayoutOverrides {
        auto_detect: toml.detect_layout,
        max_zones: toml.max_zones,
        areas: toml.areas.as_ref().map(|a| a.iter().copied().collect::<BTreeSet<u8>>()),
    }
}

// ---------------------------------------------------------------------------
// MQTT JSON types
// ---------------------------------------------------------------------------

// Published messages share a flat {now, op, ...} structure

#[derive(Serialize)]
struct MqttSnapshot {
    now: u64,
    op: String,
    state: MqttSnapshotState,
}

#[derive(Serialize)]
struct MqttSnapshotState {
    connection: String,
    armed: bool,
    arming: bool,
    #[serde(rename = "stayMode")]
    stay_mode: bool,
    alarm: bool,
    #[serde(rename = "readyToArm")]
    ready_to_arm: bool,
    #[serde(rename = "enhancedMode")]
    enhanced_mode: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    firmware: Option<String>,
    areas: Vec<MqttAreaState>,
    zones: Vec<MqttZoneState>,
    outputs: Vec<MqttOutputState>,
    system: MqttSystemState,
}

#[derive(Serialize)]
struct MqttAreaState {
    id: u8,
    armed: bool,
    stay: bool,
    alarm: bool,
    #[serde(rename = "armedByUser", skip_serializing_if = "Option::is_none")]
    armed_by_user: Option<u16>,
    #[serde(rename = "exitDelay", skip_serializing_if = "Option::is_none")]
    exit_delay: Option<u16>,
}

#[derive(Serialize)]
struct MqttZoneState {
    id: u16,
    name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    area: Option<u8>,
    open: bool,
    alarm: bool,
    trouble: bool,
    bypass: bool,
    #[serde(rename = "supervisionFail")]
    supervision_fail: bool,
    #[serde(rename = "entryDelay", skip_serializing_if = "Option::is_none")]
    entry_delay: Option<u16>,
}

#[derive(Serialize)]
struct MqttOutputState {
    id: u16,
    on: bool,
}

#[derive(Serialize)]
struct MqttSystemState {
    #[serde(rename = "mainsOk")]
    mains_ok: bool,
    #[serde(rename = "batteryOk")]
    battery_ok: bool,
    tamper: bool,
    #[serde(rename = "lineOk")]
    line_ok: bool,
    #[serde(rename = "dialerOk")]
    dialer_ok: bool,
    #[serde(rename = "fuseOk")]
    fuse_ok: bool,
    #[serde(rename = "receiverOk")]
    receiver_ok: bool,
    #[serde(rename = "rfBatteryLow")]
    rf_battery_low: bool,
    #[serde(rename = "sensorWatch")]
    sensor_watch: bool,
    panic: bool,
    fire: bool,
    medical: bool,
}

// Zone events: {now, op, zone, name} or with seconds for entry delay
#[derive(Serialize)]
struct MqttZoneEvent {
    now: u64,
    op: String,
    zone: u16,
    name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    seconds: Option<u16>,
}

// Area events: {now, op, area} plus user / seconds when known
#[derive(Serialize)]
struct MqttAreaEvent {
    now: u64,
    op: String,
    area: u8,
    #[serde(skip_serializing_if = "Option::is_none")]
    user: Option<u16>,
    #[serde(skip_serializing_if = "Option::is_none")]
    seconds: Option<u16>,
}

#[derive(Serialize)]
struct MqttOutputEvent {
    now: u64,
    op: String,
    output: u16,
}

#[derive(Serialize)]
struct MqttSystemEvent {
    now: u64,
    op: String,
    code: String,
    #[serde(rename = "eventStr")]
    event_str: String,
}

#[derive(Serialize)]
struct MqttConnectionEvent {
    now: u64,
    op: String,
    state: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    reason: Option<String>,
}

// CMD_ACK response
#[derive(Serialize)]
struct MqttCmdAck {
    now: u64,
    op: String,
    success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    src: Option<serde_json::Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    data: Option<serde_json::Value>,
}

// Simple event with just {now, op}
#[derive(Serialize)]
struct MqttSimpleEvent {
    now: u64,
    op: String,
}

// Inbound command (subscribed)
#[derive(Debug, Deserialize)]
struct MqttCommand {
    op: String,
    #[serde(default)]
    #[allow(dead_code)]
    op_id: Option<String>,
    #[serde(default)]
    area: Option<u8>,
    #[serde(default)]
    zone: Option<u16>,
    #[serde(default)]
    zones: Option<Vec<u16>>,
    #[serde(default)]
    output: Option<u16>,
    #[serde(default)]
    seconds: Option<u32>,
    #[serde(default)]
    command: Option<String>,
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

fn now_epoch_ms() -> u64 {
    Utc::now().timestamp_millis() as u64
}

fn zone_label(zone_id: u16, overrides: &HashMap<u16, String>) -> String {
    match overrides.get(&zone_id) {
        Some(name) => name.clone(),
        None => format!("Zone {zone_id}"),
    }
}

fn build_snapshot(state: &LiveState, zone_names: &HashMap<u16, String>) -> MqttSnapshot {
    let areas = state
        .areas
        .values()
        .map(|a| MqttAreaState {
            id: a.id,
            armed: a.armed,
            stay: a.stay,
            alarm: a.alarm_active,
            armed_by_user: a.armed_by_user,
            exit_delay: a.exit_delay,
        })
        .collect();

    let zones = state
        .zones
        .values()
        .map(|z| MqttZoneState {
            id: z.id,
            name: zone_label(z.id, zone_names),
            area: state.zone_areas.get(&z.id).copied(),
            open: z.is_open(),
            alarm: z.is_alarm(),
            trouble: z.is_trouble(),
            bypass: z.is_bypassed(),
            supervision_fail: z.is_supervision_fail(),
            entry_delay: z.entry_delay,
        })
        .collect();

    let outputs = state
        .outputs
        .values()
        .map(|o| MqttOutputState { id: o.id, on: o.active })
        .collect();

    let sys = state.system;
    let keypad = state.keypad_alarms;
    let system = MqttSystemState {
        mains_ok: sys.mains_ok(),
        battery_ok: sys.battery_ok(),
        tamper: sys.tamper_alarm(),
        line_ok: sys.line_ok(),
        dialer_ok: sys.dialer_ok(),
        fuse_ok: sys.fuse_ok(),
        receiver_ok: sys.receiver_ok(),
        rf_battery_low: sys.rf_battery_low(),
        sensor_watch: sys.sensor_watch_alarm(),
        panic: keypad.contains(KeypadAlarmFlags::PANIC),
        fire: keypad.contains(KeypadAlarmFlags::FIRE),
        medical: keypad.contains(KeypadAlarmFlags::MEDICAL),
    };

    MqttSnapshot {
        now: now_epoch_ms(),
        op: "SNAPSHOT".to_string(),
        state: MqttSnapshotState {
            connection: state.connection_state.as_str().to_string(),
            armed: state.armed,
            arming: state.arming,
            stay_mode: state.stay_mode,
            alarm: state.alarm,
            ready_to_arm: state.ready_to_arm,
            enhanced_mode: state.enhanced_mode_active,
            firmware: state.version_string.clone(),
            areas,
            zones,
            outputs,
            system,
        },
    }
}


// ---------------------------------------------------------------------------
// Panel event → MQTT
// ---------------------------------------------------------------------------

fn zone_op(flag: ZoneStatusFlags, set: bool) -> Option<&'static str> {
    let op = match (flag, set) {
        (f, true) if f == ZoneStatusFlags::OPEN => "ZONE_OPEN",
        (f, false) if f == ZoneStatusFlags::OPEN => "ZONE_CLOSE",
        (f, true) if f == ZoneStatusFlags::ALARM => "ZONE_ALARM",
        (f, false) if f == ZoneStatusFlags::ALARM => "ZONE_STANDBY",
        (f, true) if f == ZoneStatusFlags::TROUBLE => "ZONE_TROUBLE",
        (f, false) if f == ZoneStatusFlags::TROUBLE => "ZONE_TROUBLE_OK",
        (f, true) if f == ZoneStatusFlags::BYPASSED => "ZONE_BYPASSED",
        (f, false) if f == ZoneStatusFlags::BYPASSED => "ZONE_UNBYPASSED",
        (f, true) if f == ZoneStatusFlags::SUPERVISION_FAIL => "ZONE_SUPERVISION_FAIL",
        (f, false) if f == ZoneStatusFlags::SUPERVISION_FAIL => "ZONE_SUPERVISION_OK",
        _ => return None,
    };
    Some(op)
}

fn area_op(action: AreaAction) -> &'static str {
    match action {
        AreaAction::Arm => "AREA_ARMED",
        AreaAction::Stay => "AREA_ARMED_STAY",
        AreaAction::Disarm => "AREA_DISARMED",
    }
}

fn keypad_op(kind: KeypadAlarm, active: bool) -> &'static str {
    match (kind, active) {
        (KeypadAlarm::Panic, true) => "KEYPAD_PANIC",
        (KeypadAlarm::Panic, false) => "KEYPAD_PANIC_RESTORE",
        (KeypadAlarm::Fire, true) => "KEYPAD_FIRE",
        (KeypadAlarm::Fire, false) => "KEYPAD_FIRE_RESTORE",
        (KeypadAlarm::Medical, true) => "KEYPAD_MEDICAL",
        (KeypadAlarm::Medical, false) => "KEYPAD_MEDICAL_RESTORE",
    }
}


// ---------------------------------------------------------------------------
// Bridge
// ---------------------------------------------------------------------------

type CmdOutcome = std::result::Result<Option<serde_json::Value>, String>;

/// State shared by the panel, MQTT and snapshot tasks of one bridge run.
struct Bridge {
    panel: ArrowheadPanel,
    client: AsyncClient,
    topic: String,
    zone_names: HashMap<u16, String>,
    overrides: LayoutOverrides,
    layout_done: AtomicBool,
}

impl Bridge {
    async fn publish(&self, payload: &impl Serialize, retain: bool) {
        let json = match serde_json::to_string(payload) {
            Ok(json) => json,
            Err(e) => {
                error!("Cannot encode MQTT payload: {e}");
                return;
            }
        };
        if let Err(e) = self.client.publish(&self.topic, QoS::AtLeastOnce, retain, json).await {
            error!("Publish to {} failed: {e}", self.topic);
        }
    }

    async fn publish_op(&self, op: &str) {
        let msg = MqttSimpleEvent { now: now_epoch_ms(), op: op.to_string() };
        self.publish(&msg, false).await;
    }

    async fn publish_snapshot(&self) -> MqttSnapshot {
        let snapshot = build_snapshot(&self.panel.snapshot().await, &self.zone_names);
        self.publish(&snapshot, true).await;
        snapshot
    }

    async fn publish_connection(&self, state: &str, reason: Option<String>) {
        let msg = MqttConnectionEvent {
            now: now_epoch_ms(),
            op: "CONNECTION".to_string(),
            state: state.to_string(),
            reason,
        };
        self.publish(&msg, false).await;
    }

    // --- panel → MQTT ---

    async fn on_event(self: &Arc<Self>, event: PanelEvent) {
        match event {
            PanelEvent::Message { message, raw } => self.on_message(message, &raw).await,

            PanelEvent::ConnectionStateChanged { new, .. } => {
                self.publish_connection(new.as_str(), None).await;
                if new == ConnectionState::Connected {
                    info!("Panel connected, publishing snapshot");
                    self.publish_snapshot().await;
                    if !self.layout_done.load(Ordering::Acquire) {
                        // Detection issues commands, so it cannot run on the event task.
                        let bridge = Arc::clone(self);
                        tokio::spawn(async move { bridge.detect_layout_once().await });
                    }
                }
            }

            PanelEvent::LinkLost { reason } => {
                warn!("Panel link lost: {reason}");
                self.publish_connection("link_lost", Some(reason)).await;
            }

            PanelEvent::ReconnectExhausted { attempts } => {
                error!("Panel reconnection gave up after {attempts} attempts");
                self.publish_op("RECONNECT_EXHAUSTED").await;
            }

            PanelEvent::Unrecognized(line) => debug!("Unrecognized panel line: {line}"),
        }
    }

    async fn on_message(&self, message: PanelMessage, raw: &str) {
        let now = now_epoch_ms();
        match message {
            PanelMessage::Zone { flag, set, zone } => {
                let Some(op) = zone_op(flag, set) else {
                    return;
                };
                let name = zone_label(zone, &self.zone_names);
                info!("Zone {zone} ({name}): {}", ZoneStatusFlags::describe(flag, set));
                let msg = MqttZoneEvent { now, op: op.to_string(), zone, name, seconds: None };
                self.publish(&msg, false).await;
            }
            PanelMessage::EntryDelay { zone, seconds } => {
                let msg = MqttZoneEvent {
                    now,
                    op: "ZONE_ENTRY_DELAY".to_string(),
                    zone,
                    name: zone_label(zone, &self.zone_names),
                    seconds: Some(seconds),
                };
                self.publish(&msg, false).await;
            }
            PanelMessage::Area { action, area } | PanelMessage::AreaUser { action, area, .. } => {
                let user = match message {
                    PanelMessage::AreaUser { user, .. } => Some(user),
                    _ => None,
                };
                match user {
                    Some(user) => info!("Area {area} {} by user {user}", action.describe()),
                    None => info!("Area {area} {}", action.describe()),
                }
                let msg = MqttAreaEvent { now, op: area_op(action).to_string(), area, user, seconds: None };
                self.publish(&msg, false).await;
            }
            PanelMessage::ExitDelay { area, seconds } => {
                let msg = MqttAreaEvent {
                    now,
                    op: "AREA_EXIT_DELAY".to_string(),
                    area,
                    user: None,
                    seconds: Some(seconds),
                };
                self.publish(&msg, false).await;
            }
            PanelMessage::Output { output, on } => {
                let op = if on { "OUTPUT_ON" } else { "OUTPUT_OFF" };
                self.publish(&MqttOutputEvent { now, op: op.to_string(), output }, false).await;
            }
            PanelMessage::System(code) => {
                match code.field {
                    SystemField::ReadyToArm => debug!("System: {}", code.description),
                    SystemField::Flag(_) => info!("System: {}", code.description),
                }
                let msg = MqttSystemEvent {
                    now,
                    op: "SYSTEM_STATUS".to_string(),
                    code: raw.to_string(),
                    event_str: code.description.to_string(),
                };
                self.publish(&msg, false).await;
            }
            PanelMessage::KeypadAlarm { kind, active } => {
                warn!("Keypad {} alarm {}", kind.name(), if active { "active" } else { "restored" });
                self.publish_op(keypad_op(kind, active)).await;
            }
            PanelMessage::Ack(kind) => debug!("Panel acknowledged {kind:?}"),
        }
    }

    /// Layout detection (ECi) or the configured manual layout, once per run.
    async fn detect_layout_once(&self) {
        if self.layout_done.swap(true, Ordering::AcqRel) {
            return;
        }
        let overrides = &self.overrides;
        let layout = if self.panel.config().panel_type.negotiates_mode() && overrides.auto_detect {
            self.panel.detect_layout(overrides).await
        } else if overrides.max_zones.is_some() || overrides.areas.is_some() {
            let layout = PanelLayout::manual(overrides.max_zones, overrides.areas.as_ref());
            self.panel.apply_layout(&layout).await;
            layout
        } else {
            return;
        };
        info!(
            "Zone layout ({}): {} zones across areas {:?}",
            layout.method.as_str(),
            layout.total_zones(),
            layout.active_areas
        );
    }

    // --- MQTT → panel ---

    async fn on_command(&self, payload: &str) {
        let cmd = match serde_json::from_str::<MqttCommand>(payload) {
            Ok(cmd) => cmd,
            Err(e) => {
                warn!("Ignoring malformed MQTT command: {e}");
                return;
            }
        };
        if matches!(cmd.op.as_str(), "SNAPSHOT" | "PING") {
            debug!("MQTT command: {}", cmd.op);
        } else {
            // Only the op is logged: CUSTOM may carry a PIN.
            info!("MQTT command: {}", cmd.op);
        }

        let outcome = self.run_command(cmd).await;
        let (success, data, error) = match outcome {
            Ok(data) => (true, data, None),
            Err(e) => (false, None, Some(e)),
        };
        let ack = MqttCmdAck {
            now: now_epoch_ms(),
            op: "CMD_ACK".to_string(),
            success,
            error,
            src: serde_json::from_str::<serde_json::Value>(payload).ok(),
            data,
        };
        self.publish(&ack, false).await;
    }

    async fn run_command(&self, cmd: MqttCommand) -> CmdOutcome {
        let panel = &self.panel;
        let op = cmd.op.as_str();
        match op {
            "SNAPSHOT" => {
                let snapshot = self.publish_snapshot().await;
                Ok(serde_json::to_value(&snapshot).ok())
            }
            "PING" => Ok(None),

            "ARM_AWAY" | "ARM_STAY" | "DISARM" => {
                let area = cmd.area.unwrap_or(1);
                let label = format!("area {area}");
                let result = match op {
                    "ARM_AWAY" => logged(op, &label, panel.arm_area(area)).await,
                    "ARM_STAY" => logged(op, &label, panel.stay_area(area)).await,
                    _ => logged(op, &label, panel.disarm_area(area)).await,
                };
                result.map(|_| None)
            }

            "BYPASS" | "UNBYPASS" => {
                let bypass = op == "BYPASS";
                if let Some(zones) = cmd.zones {
                    let results = logged(op, &format!("zones {zones:?}"), panel.bulk_bypass(&zones, bypass)).await?;
                    let failed: Vec<u16> = results.iter().filter(|(_, r)| r.is_err()).map(|(z, _)| *z).collect();
                    return if failed.is_empty() { Ok(None) } else { Err(format!("failed zones: {failed:?}")) };
                }
                let zone = required(op, "zone", cmd.zone)?;
                let label = format!("zone {zone}");
                let result = if bypass {
                    logged(op, &label, panel.bypass_zone(zone)).await
                } else {
                    logged(op, &label, panel.unbypass_zone(zone)).await
                };
                result.map(|_| None)
            }

            "OUTPUT_ON" | "OUTPUT_OFF" => {
                let output = required(op, "output", cmd.output)?;
                let label = format!("output {output}");
                let result = if op == "OUTPUT_ON" {
                    logged(op, &label, panel.output_on(output, cmd.seconds)).await
                } else {
                    logged(op, &label, panel.output_off(output)).await
                };
                result.map(|_| None)
            }

            "PANIC" | "FIRE" | "MEDICAL" => {
                let kind = match op {
                    "PANIC" => KeypadAlarm::Panic,
                    "FIRE" => KeypadAlarm::Fire,
                    _ => KeypadAlarm::Medical,
                };
                logged(op, "keypad", panel.keypad_alarm(kind)).await.map(|_| None)
            }

            "CUSTOM" => {
                let text = required(op, "command", cmd.command)?;
                let response = logged(op, "command", panel.send_custom_command(&text)).await?;
                Ok(Some(serde_json::Value::String(response)))
            }

            other => {
                warn!("Unknown command: {other}");
                Err(format!("unknown op {other}"))
            }
        }
    }
}

/// Await a panel operation, log how it went and flatten the error to text.
async fn logged<T>(
    op: &str,
    label: &str,
    fut: impl std::future::Future<Output = arrowhead_lan_bridge::Result<T>>,
) -> std::result::Result<T, String> {
    fut.await
        .inspect(|_| info!("{op} {label}: done"))
        .map_err(|e| {
            error!("{op} {label} failed: {e}");
            e.to_string()
        })
}

fn required<T>(op: &str, field: &str, value: Option<T>) -> std::result::Result<T, String> {
    value.ok_or_else(|| {
        warn!("{op}: missing {field}");
        format!("missing {field}")
    })
}

// ---------------------------------------------------------------------------
// Tasks
// ---------------------------------------------------------------------------

async fn forward_panel_events(bridge: Arc<Bridge>, mut events: EventReceiver) {
    loop {
        match events.recv().await {
            Ok(event) => bridge.on_event(event).await,
            Err(RecvError::Lagged(n)) => warn!("Panel event stream lagged, {n} events dropped"),
            Err(RecvError::Closed) => {
                info!("Panel event stream closed");
                return;
            }
        }
    }
}

async fn serve_mqtt(bridge: Arc<Bridge>, mut eventloop: EventLoop, command_topic: String) {
    loop {
        match eventloop.poll().await {
            // The broker forgets our subscription on reconnect.
            Ok(Event::Incoming(Packet::ConnAck(_))) => {
                info!("MQTT connected, subscribing to {command_topic}");
                if let Err(e) = bridge.client.subscribe(&command_topic, QoS::AtLeastOnce).await {
                    error!("Subscribe to {command_topic} failed: {e}");
                }
            }
            Ok(Event::Incoming(Packet::Publish(msg))) if msg.topic == command_topic => {
                bridge.on_command(&String::from_utf8_lossy(&msg.payload)).await;
            }
            Ok(_) => {}
            Err(e) => {
                error!("MQTT connection error: {e}");
                sleep(Duration::from_secs(1)).await;
            }
        }
    }
}

/// Poller: ask the panel for fresh status, then publish the retained snapshot.
async fn snapshot_ticker(bridge: Arc<Bridge>, every: Duration) {
    let mut ticker = interval(every);
    ticker.tick().await;
    loop {
        ticker.tick().await;
        if let Err(e) = bridge.panel.refresh().await {
            warn!("Status refresh failed: {e}");
        }
        bridge.publish_snapshot().await;
    }
}

// ---------------------------------------------------------------------------
// Main
// ---------------------------------------------------------------------------

#[tokio::main]
async fn main() -> Result<()> {
    // RUST_LOG controls verbosity, e.g. RUST_LOG=arrowhead_lan_bridge=debug. Default: info.
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));

    // journald stamps every line itself
    if std::env::var_os("JOURNAL_STREAM").is_some() {
        tracing_subscriber::fmt().without_time().with_env_filter(env_filter).init();
    } else {
        tracing_subscriber::fmt().with_env_filter(env_filter).init();
    }

    let cli = Cli::parse();
    let mut config = load_config(&cli.config)?;
    let mut panel_config = build_panel_config(&config.panel)?;
    let mut broker = parse_mqtt_url(&config.mqtt.url)?;

    let mut sighup = signal(SignalKind::hangup())?;
    let mut sigterm = signal(SignalKind::terminate())?;

    loop {
        let mut mqtt_opts = MqttOptions::new(&config.mqtt.client_id, &broker.0, broker.1);
        mqtt_opts.set_keep_alive(Duration::from_secs(30));
        let (client, eventloop) = AsyncClient::new(mqtt_opts, 256);

        let bridge = Arc::new(Bridge {
            panel: ArrowheadPanel::new(panel_config.clone()),
            client: client.clone(),
            topic: config.mqtt.publish_topic.clone(),
            zone_names: config.zone_names.clone(),
            overrides: layout_overrides(&config.panel),
            layout_done: AtomicBool::new(false),
        });

        // Subscribe before connecting so the first Connected transition is seen.
        let mut tasks = vec![tokio::spawn(forward_panel_events(bridge.clone(), bridge.panel.subscribe()))];

        info!("Connecting to {} panel at {}", panel_config.panel_type, panel_config.address());
        match bridge.panel.connect().await {
            Ok(()) => {}
            // The panel's supervisor keeps retrying these in the background.
            Err(e) if e.is_retryable() => warn!("Panel not reachable yet ({e}), retrying in the background"),
            Err(e) => {
                tasks.iter().for_each(|t| t.abort());
                return Err(e).context("Panel connection failed");
            }
        }

        tasks.push(tokio::spawn(serve_mqtt(bridge.clone(), eventloop, config.mqtt.subscribe_topic.clone())));
        let every = Duration::from_secs(config.mqtt.snapshot_interval_secs.max(1));
        tasks.push(tokio::spawn(snapshot_ticker(bridge.clone(), every)));

        info!("Bridge running. SIGHUP reloads the config, SIGINT/SIGTERM stop.");
        let reload = tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!("SIGINT received, stopping");
                false
            }
            _ = sigterm.recv() => {
                info!("SIGTERM received, stopping");
                false
            }
            _ = sighup.recv() => {
                info!("SIGHUP received, reloading");
                true
            }
        };

        tasks.iter().for_each(|t| t.abort());
        if let Err(e) = bridge.panel.disconnect().await {
            warn!("Panel disconnect failed: {e}");
        }
        if let Err(e) = client.disconnect().await {
            debug!("MQTT disconnect: {e}");
        }

        if !reload {
            break;
        }

        // A bad file keeps the running configuration.
        match reload_config(&cli.config) {
            Ok((new_config, new_panel_config, new_broker)) => {
                config = new_config;
                panel_config = new_panel_config;
                broker = new_broker;
                info!("Configuration reloaded from {}", cli.config);
            }
            Err(e) => warn!("Keeping previous configuration: {e:#}"),
        }
    }

    info!("Shutdown complete");
    Ok(())
}

fn reload_config(path: &str) -> Result<(Config, PanelConfig, (String, u16))> {
    let config = load_config(path)?;
    let panel_config = build_panel_config(&config.panel)?;
    let broker = parse_mqtt_url(&config.mqtt.url)?;
    Ok((config, panel_config, broker))
}

fn load_config(path: &str) -> Result<Config> {
    let text = std::fs::read_to_string(path).context("Failed to read config file")?;
    toml::from_str(&text).context("Failed to parse config file")
}

/// Parse an MQTT URL like "mqtt://host:port" into (host, port).
fn parse_mqtt_url(url: &str) -> Result<(String, u16)> {
    let stripped = url
        .strip_prefix("mqtt://")
        .or_else(|| url.strip_prefix("tcp://"))
        .unwrap_or(url);

    let (host, port_str) = stripped
        .rsplit_once(':')
        .context("MQTT URL must be in format mqtt://host:port")?;

    let port: u16 = port_str.parse().context("Invalid MQTT port number")?;

    Ok((host.to_string(), port))
}

#[cfg(test)]
mod tests {
    use super::*;
    use arrowhead_lan_bridge::parser;
    use serde_json::json;

    const MINIMAL: &str = r#"
        [panel]
        host = "10.0.0.5"

        [mqtt]
        url = "mqtt://broker:1883"
    "#;

    #[test]
    fn test_minimal_config_defaults() {
        let config: Config = toml::from_str(MINIMAL).unwrap();
        assert_eq!(config.panel.port, 9000);
        assert_eq!(config.panel.user_pin, "1 123");
        assert_eq!(config.mqtt.publish_topic, "arrowhead");
        assert!(config.zone_names.is_empty());

        let panel = build_panel_config(&config.panel).unwrap();
        assert_eq!(panel.panel_type, PanelType::Esx);
        assert_eq!(panel.address(), "10.0.0.5:9000");
        assert_eq!(panel.settle_delay, Duration::from_secs(2));
    }

    #[test]
    fn test_config_rejects_bad_values() {
        let text = MINIMAL.replace("[panel]", "[panel]\npanel_type = \"vista\"");
        let config: Config = toml::from_str(&text).unwrap();
        assert!(build_panel_config(&config.panel).is_err());

        let text = MINIMAL.replace("[panel]", "[panel]\nuser_pin = \"123\"");
        let config: Config = toml::from_str(&text).unwrap();
        assert!(build_panel_config(&config.panel).is_err());

        let text = format!("{MINIMAL}\n[zone_names]\nfront = \"Front Door\"\n");
        assert!(toml::from_str::<Config>(&text).is_err());
    }

    #[test]
    fn test_zone_names_and_overrides() {
        let text = format!(
            "{}\n[zone_names]\n1 = \"Front Door\"\n",
            MINIMAL.replace("[panel]", "[panel]\npanel_type = \"eci\"\nareas = [1, 2]\nmax_zones = 24")
        );
        let config: Config = toml::from_str(&text).unwrap();
        assert_eq!(zone_label(1, &config.zone_names), "Front Door");
        assert_eq!(zone_label(2, &config.zone_names), "Zone 2");
        let overrides = layout_overrides(&config.panel);
        assert!(overrides.auto_detect);
        assert_eq!(overrides.max_zones, Some(24));
        assert_eq!(overrides.areas, Some(BTreeSet::from([1, 2])));
    }

    #[test]
    fn test_parse_mqtt_url() {
        assert_eq!(parse_mqtt_url("mqtt://broker:1883").unwrap(), ("broker".to_string(), 1883));
        assert_eq!(parse_mqtt_url("tcp://10.0.0.2:8883").unwrap(), ("10.0.0.2".to_string(), 8883));
        assert!(parse_mqtt_url("mqtt://broker").is_err());
    }

    #[test]
    fn test_snapshot_wire_format() {
        let config = PanelConfig::builder().output_count(1).initial_zone_count(2).build();
        let mut state = LiveState::new(&config);
        parser::apply("ZO1", &mut state);
        parser::apply("A1-U3", &mut state);
        parser::apply("MF", &mut state);

        let mut names = HashMap::new();
        names.insert(1, "Hall".to_string());
        let mut value = serde_json::to_value(build_snapshot(&state, &names)).unwrap();
        value["now"] = json!(0);

        assert_eq!(value["op"], "SNAPSHOT");
        assert_eq!(value["state"]["armed"], true);
        assert_eq!(value["state"]["stayMode"], false);
        assert_eq!(value["state"]["areas"][0], json!({"id": 1, "armed": true, "stay": false, "alarm": false, "armedByUser": 3}));
        assert_eq!(
            value["state"]["zones"][0],
            json!({"id": 1, "name": "Hall", "open": true, "alarm": false, "trouble": false, "bypass": false, "supervisionFail": false})
        );
        assert_eq!(value["state"]["zones"][1]["name"], "Zone 2");
        assert_eq!(value["state"]["outputs"], json!([{"id": 1, "on": false}]));
        assert_eq!(value["state"]["system"]["mainsOk"], false);
        assert!(value["state"].get("firmware").is_none());
    }

    #[test]
    fn test_command_parsing() {
        let cmd: MqttCommand =
            serde_json::from_str(r#"{"op": "BYPASS", "zones": [1, 2, 3]}"#).unwrap();
        assert_eq!(cmd.zones, Some(vec![1, 2, 3]));
        assert_eq!(cmd.zone, None);

        let cmd: MqttCommand =
            serde_json::from_str(r#"{"op": "OUTPUT_ON", "output": 2, "seconds": 30, "op_id": "x"}"#).unwrap();
        assert_eq!(cmd.output, Some(2));
        assert_eq!(cmd.seconds, Some(30));

        assert!(serde_json::from_str::<MqttCommand>(r#"{"zone": 1}"#).is_err());
    }

    #[test]
    fn test_cmd_ack_wire_format() {
        let ack = MqttCmdAck {
            now: 1,
            op: "CMD_ACK".to_string(),
            success: false,
            error: Some("missing zone".to_string()),
            src: Some(json!({"op": "BYPASS"})),
            data: None,
        };
        assert_eq!(
            serde_json::to_value(&ack).unwrap(),
            json!({"now": 1, "op": "CMD_ACK", "success": false, "error": "missing zone", "src": {"op": "BYPASS"}})
        );
    }

    fn bridge() -> Bridge {
        let (client, _eventloop) = AsyncClient::new(MqttOptions::new("test", "localhost", 1883), 8);
        Bridge {
            panel: ArrowheadPanel::new(PanelConfig::default()),
            client,
            topic: "arrowhead".to_string(),
            zone_names: HashMap::new(),
            overrides: LayoutOverrides::default(),
            layout_done: AtomicBool::new(false),
        }
    }

    fn command(json: &str) -> MqttCommand {
        serde_json::from_str(json).unwrap()
    }

    #[tokio::test]
    async fn test_run_command_validation() {
        let bridge = bridge();
        assert_eq!(bridge.run_command(command(r#"{"op": "PING"}"#)).await, Ok(None));
        assert_eq!(
            bridge.run_command(command(r#"{"op": "BYPASS"}"#)).await,
            Err("missing zone".to_string())
        );
        assert_eq!(
            bridge.run_command(command(r#"{"op": "OUTPUT_OFF"}"#)).await,
            Err("missing output".to_string())
        );
        assert_eq!(
            bridge.run_command(command(r#"{"op": "REBOOT"}"#)).await,
            Err("unknown op REBOOT".to_string())
        );
        // Validation runs before the connection check
        let err = bridge.run_command(command(r#"{"op": "BYPASS", "zone": 99}"#)).await.unwrap_err();
        assert!(err.contains("99"), "{err}");
        assert!(bridge.run_command(command(r#"{"op": "ARM_AWAY", "area": 1}"#)).await.is_err());
    }

    #[test]
    fn test_event_ops() {
        assert_eq!(zone_op(ZoneStatusFlags::OPEN, true), Some("ZONE_OPEN"));
        assert_eq!(zone_op(ZoneStatusFlags::BYPASSED, false), Some("ZONE_UNBYPASSED"));
        assert_eq!(zone_op(ZoneStatusFlags::empty(), true), None);
        assert_eq!(area_op(AreaAction::Stay), "AREA_ARMED_STAY");
        assert_eq!(keypad_op(KeypadAlarm::Fire, false), "KEYPAD_FIRE_RESTORE");
    }
}
