// MIT License - Copyright (c) 2026 Peter Wright
// End-to-end session tests against a scripted panel on a local socket

use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, TcpStream};
use tokio::time::{sleep, timeout, Duration};

use arrowhead_lan_bridge::{
    ArrowheadError, ArrowheadPanel, ConnectionState, DetectionMethod, LayoutOverrides, PanelConfig,
    PanelConfigBuilder, PanelEvent, PanelType, ProtocolMode,
};

/// How the fake panel behaves.
#[derive(Clone)]
struct Script {
    greeting: Option<&'static str>,
    /// Expected username and password when `greeting` is a login prompt
    credentials: Option<(&'static str, &'static str)>,
    welcome: &'static str,
    firmware: &'static str,
    p74e: &'static str,
    p76e: &'static str,
    /// Answer to `MODE 4`
    mode_reply: &'static str,
    /// Close the first connection this long after accepting it
    drop_first_after: Option<Duration>,
}

impl Default for Script {
    fn default() -> Self {
        Self {
            greeting: None,
            credentials: None,
            welcome: "Welcome",
            firmware: "10.3.50",
            p74e: "1",
            p76e: "1",
            mode_reply: "OK MODE 4",
            drop_first_after: None,
        }
    }
}

impl Script {
    fn respond(&self, line: &str) -> Vec<String> {
        match line {
            "STATUS" => vec!["RO".into(), "ZO3".into()],
            "VERSION" => vec![format!("OK Version \"ECi F/W Ver. {}\"", self.firmware)],
            "MODE 4" => vec![self.mode_reply.into()],
            "P74E?" => vec![format!("P74E={}", self.p74e)],
            "P76E?" => vec![format!("P76E={}", self.p76e)],
            "P4076E1?" => vec!["P4076E1=1,2".into()],
            "P4075E1?" => vec!["P4075E1=1,2,3".into()],
            "P4075E2?" => vec!["P4075E2=17".into()],
            l if l.starts_with("ARMAREA ") => vec!["OK ArmArea".into(), format!("A{}", &l[8..])],
            l if l.starts_with("STAYAREA ") => vec!["OK StayArea".into(), format!("S{}", &l[9..])],
            l if l.starts_with("DISARM ") => vec!["OK Disarm".into()],
            l if l.starts_with("BYPASS ") => vec!["OK Bypass".into(), format!("ZBY{}", &l[7..])],
            l if l.starts_with("UNBYPASS ") => vec!["OK Unbypass".into()],
            _ => vec!["ERR 1".into()],
        }
    }
}

struct MockPanel {
    addr: SocketAddr,
    received: Arc<Mutex<Vec<String>>>,
    accepts: Arc<AtomicUsize>,
}

impl MockPanel {
    async fn start(script: Script) -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let received = Arc::new(Mutex::new(Vec::new()));
        let accepts = Arc::new(AtomicUsize::new(0));

        let rx = received.clone();
        let count = accepts.clone();
        tokio::spawn(async move {
            while let Ok((stream, _)) = listener.accept().await {
                let index = count.fetch_add(1, Ordering::SeqCst);
                let lifetime = if index == 0 { script.drop_first_after } else { None };
                tokio::spawn(serve(stream, script.clone(), rx.clone(), lifetime));
            }
        });

        Self { addr, received, accepts }
    }

    fn received(&self) -> Vec<String> {
        self.received.lock().unwrap().clone()
    }

    fn saw(&self, line: &str) -> bool {
        self.received().iter().any(|l| l == line)
    }

    fn count(&self, line: &str) -> usize {
        self.received().iter().filter(|l| *l == line).count()
    }

    fn accepts(&self) -> usize {
        self.accepts.load(Ordering::SeqCst)
    }

    fn config(&self, panel_type: PanelType) -> PanelConfigBuilder {
        PanelConfig::builder()
            .panel_type(panel_type)
            .host("127.0.0.1")
            .port(self.addr.port())
            .user_pin("1 123")
            .username("installer")
            .password("s3cret")
            .connect_timeout(Duration::from_secs(1))
            .command_timeout(Duration::from_millis(500))
            .login_prompt_timeout(Duration::from_millis(100))
            .reconnect_delays(Duration::from_millis(20), Duration::from_millis(100))
            .max_reconnect_attempts(3)
            .settle_delay(Duration::ZERO)
    }
}

async fn serve(
    stream: TcpStream,
    script: Script,
    received: Arc<Mutex<Vec<String>>>,
    lifetime: Option<Duration>,
) {
    let (reader, mut writer) = stream.into_split();
    let mut lines = BufReader::new(reader).lines();

    if let Some(greeting) = script.greeting {
        let _ = writer.write_all(format!("{greeting}\r\n").as_bytes()).await;
    }
    // 0 = expecting username, 1 = expecting password, 2 = command mode
    let mut login_step = if script.credentials.is_some() { 0 } else { 2 };

    let deadline = sleep(lifetime.unwrap_or(Duration::from_secs(3600)));
    tokio::pin!(deadline);

    loop {
        let line = tokio::select! {
            line = lines.next_line() => match line {
                Ok(Some(line)) => line.trim().to_string(),
                _ => return,
            },
            _ = &mut deadline => return,
        };
        received.lock().unwrap().push(line.clone());

        let replies = match (login_step, script.credentials) {
            (0, Some((user, _))) => {
                login_step = 1;
                if line == user { vec!["Password:".to_string()] } else { vec!["Login incorrect".to_string()] }
            }
            (1, Some((_, pass))) => {
                login_step = 2;
                if line == pass { vec![script.welcome.to_string()] } else { vec!["Access denied".to_string()] }
            }
            _ => script.respond(&line),
        };
        for reply in replies {
            if writer.write_all(format!("{reply}\r\n").as_bytes()).await.is_err() {
                return;
            }
        }
    }
}

async fn wait_for_state(panel: &ArrowheadPanel, want: ConnectionState) -> bool {
    for _ in 0..150 {
        if panel.connection_state().await == want {
            return true;
        }
        sleep(Duration::from_millis(20)).await;
    }
    false
}

#[tokio::test]
async fn test_direct_probe_without_login_prompt() {
    let mock = MockPanel::start(Script::default()).await;
    let panel = ArrowheadPanel::new(mock.config(PanelType::Esx).build());

    panel.connect().await.unwrap();
    assert!(panel.is_connected().await);
    assert_eq!(mock.received().first().map(String::as_str), Some("STATUS"));
    // ESX never negotiates
    assert!(!mock.saw("VERSION"));
    assert!(!mock.saw("MODE 4"));

    panel.disconnect().await.unwrap();
}

#[tokio::test]
async fn test_login_prompt_flow() {
    let mock = MockPanel::start(Script {
        greeting: Some("login:"),
        credentials: Some(("installer", "s3cret")),
        ..Default::default()
    })
    .await;
    let panel = ArrowheadPanel::new(mock.config(PanelType::Esx).build());

    panel.connect().await.unwrap();
    let received = mock.received();
    assert_eq!(received[0], "installer");
    assert_eq!(received[1], "s3cret");
    assert_eq!(panel.connection_state().await, ConnectionState::Connected);

    panel.disconnect().await.unwrap();
}

#[tokio::test]
async fn test_login_rejected_is_fatal() {
    let mock = MockPanel::start(Script {
        greeting: Some("login:"),
        credentials: Some(("installer", "other")),
        ..Default::default()
    })
    .await;
    let panel = ArrowheadPanel::new(mock.config(PanelType::Esx).build());

    let err = panel.connect().await.unwrap_err();
    assert!(matches!(err, ArrowheadError::AuthenticationFailed { .. }), "{err:?}");
    assert!(!err.is_retryable());
    assert_eq!(panel.connection_state().await, ConnectionState::Error);
    assert_eq!(panel.snapshot().await.communication_errors, 1);

    // No background retry for a fatal error
    sleep(Duration::from_millis(150)).await;
    assert_eq!(mock.accepts(), 1);
    panel.disconnect().await.unwrap();
}

#[tokio::test]
async fn test_eci_enhanced_mode_negotiated() {
    let mock = MockPanel::start(Script::default()).await;
    let panel = ArrowheadPanel::new(mock.config(PanelType::Eci).build());

    panel.connect().await.unwrap();
    assert!(mock.saw("VERSION"));
    assert!(mock.saw("MODE 4"));

    let state = panel.snapshot().await;
    assert!(state.supports_enhanced_mode);
    assert!(state.enhanced_mode_active);
    assert_eq!(state.protocol_mode, ProtocolMode::Mode4);
    assert_eq!(state.version_string.as_deref(), Some("ECi F/W Ver. 10.3.50"));
    assert_eq!(state.area_arm_provisioned, Some(true));
    assert_eq!(state.area_stay_provisioned, Some(true));

    panel.disconnect().await.unwrap();
}

#[tokio::test]
async fn test_old_firmware_stays_in_basic_mode() {
    let mock = MockPanel::start(Script { firmware: "10.3.49", ..Default::default() }).await;
    let panel = ArrowheadPanel::new(mock.config(PanelType::Eci).build());

    panel.connect().await.unwrap();
    assert!(!mock.saw("MODE 4"));
    let state = panel.snapshot().await;
    assert!(!state.supports_enhanced_mode);
    assert!(!state.enhanced_mode_active);
    assert_eq!(state.protocol_mode, ProtocolMode::Mode1);
    assert!(panel.is_connected().await);

    panel.disconnect().await.unwrap();
}

#[tokio::test]
async fn test_old_firmware_rejected_when_enhanced_required() {
    let mock = MockPanel::start(Script { firmware: "10.3.49", ..Default::default() }).await;
    let panel = ArrowheadPanel::new(mock.config(PanelType::Eci).require_enhanced_mode(true).build());

    let err = panel.connect().await.unwrap_err();
    assert!(matches!(err, ArrowheadError::EnhancedModeUnsupported { .. }), "{err:?}");
    assert!(!err.is_retryable());
    assert!(!panel.is_connected().await);

    panel.disconnect().await.unwrap();
}

#[tokio::test]
async fn test_mode_switch_rejected() {
    let mock = MockPanel::start(Script { mode_reply: "ERR 3", ..Default::default() }).await;
    let panel = ArrowheadPanel::new(mock.config(PanelType::Eci).build());

    let err = panel.connect().await.unwrap_err();
    assert!(
        matches!(&err, ArrowheadError::ModeSwitchRejected { mode: 4, response } if response == "ERR 3"),
        "{err:?}"
    );
    assert!(!err.is_retryable());
    assert!(mock.saw("MODE 4"));
    assert!(!panel.is_connected().await);
    assert!(!panel.snapshot().await.enhanced_mode_active);

    panel.disconnect().await.unwrap();
}

#[tokio::test]
async fn test_unprovisioned_area_arming_refused() {
    let mock = MockPanel::start(Script { p74e: "0", ..Default::default() }).await;
    let panel = ArrowheadPanel::new(mock.config(PanelType::Eci).build());
    panel.connect().await.unwrap();

    let err = panel.arm_area(1).await.unwrap_err();
    assert!(matches!(err, ArrowheadError::NotProvisioned { location: "P74E", .. }), "{err:?}");
    assert!(!mock.saw("ARMAREA 1"));

    panel.stay_area(1).await.unwrap();
    assert!(mock.saw("STAYAREA 1"));

    panel.disconnect().await.unwrap();
}

#[tokio::test]
async fn test_zone_commands_on_the_wire() {
    let mock = MockPanel::start(Script::default()).await;
    let panel = ArrowheadPanel::new(mock.config(PanelType::Eci).build());
    panel.connect().await.unwrap();

    panel.bypass_zone(1).await.unwrap();
    assert!(mock.saw("BYPASS 001"));
    panel.unbypass_zone(42).await.unwrap();
    assert!(mock.saw("UNBYPASS 042"));

    let err = panel.bypass_zone(249).await.unwrap_err();
    assert!(matches!(err, ArrowheadError::InvalidZone { zone: 249, max: 248 }), "{err:?}");
    assert!(!mock.saw("BYPASS 249"));

    // The ZBY001 that follows the acknowledgement lands in the live state
    let mut bypassed = false;
    for _ in 0..50 {
        if panel.snapshot().await.bypassed_zones() == vec![1] {
            bypassed = true;
            break;
        }
        sleep(Duration::from_millis(10)).await;
    }
    assert!(bypassed);

    panel.disconnect().await.unwrap();
}

#[tokio::test]
async fn test_arm_and_disarm() {
    let mock = MockPanel::start(Script::default()).await;
    let panel = ArrowheadPanel::new(mock.config(PanelType::Esx).build());
    panel.connect().await.unwrap();

    panel.arm_area(2).await.unwrap();
    assert!(mock.saw("ARMAREA 2"));
    panel.disarm_area(2).await.unwrap();
    assert!(mock.saw("DISARM 1 123"));

    let err = panel.arm_area(33).await.unwrap_err();
    assert!(matches!(err, ArrowheadError::InvalidArea { area: 33, .. }), "{err:?}");

    panel.disconnect().await.unwrap();
}

#[tokio::test]
async fn test_rejected_command() {
    let mock = MockPanel::start(Script::default()).await;
    let panel = ArrowheadPanel::new(mock.config(PanelType::Esx).output_count(2).build());
    panel.connect().await.unwrap();

    // The script answers OUTPUTON with ERR
    let err = panel.output_on(1, Some(5)).await.unwrap_err();
    assert!(matches!(err, ArrowheadError::CommandRejected { .. }), "{err:?}");
    assert!(mock.saw("OUTPUTON 1 5"));
    assert!(panel.is_connected().await);

    panel.disconnect().await.unwrap();
}

#[tokio::test]
async fn test_layout_detection_over_the_link() {
    let mock = MockPanel::start(Script::default()).await;
    let panel = ArrowheadPanel::new(mock.config(PanelType::Eci).build());
    panel.connect().await.unwrap();

    let layout = panel.detect_layout(&LayoutOverrides::default()).await;
    assert_eq!(layout.method, DetectionMethod::ActiveAreasQuery);
    assert_eq!(layout.active_areas.iter().copied().collect::<Vec<_>>(), vec![1, 2]);
    assert_eq!(layout.detected_zones.iter().copied().collect::<Vec<_>>(), vec![1, 2, 3, 17]);
    assert_eq!(layout.max_zone, 17);

    let status = panel.area_status(2).await.unwrap();
    assert_eq!(status.zones, vec![17]);
    assert_eq!(panel.snapshot().await.zone_areas.get(&3), Some(&1));

    let raw = panel.send_custom_command("P4076E1?").await.unwrap();
    assert_eq!(raw, "P4076E1=1,2");

    panel.disconnect().await.unwrap();
}

#[tokio::test]
async fn test_reconnects_after_link_loss() {
    let mock = MockPanel::start(Script {
        drop_first_after: Some(Duration::from_millis(200)),
        ..Default::default()
    })
    .await;
    let panel = ArrowheadPanel::new(mock.config(PanelType::Esx).build());
    let mut events = panel.subscribe();
    panel.connect().await.unwrap();

    let lost = timeout(Duration::from_secs(3), async {
        loop {
            match events.recv().await {
                Ok(PanelEvent::LinkLost { .. }) => return true,
                Ok(_) => continue,
                Err(_) => return false,
            }
        }
    })
    .await
    .unwrap_or(false);
    assert!(lost);

    // Wait for the second accept so the state check is not racing the first session
    for _ in 0..150 {
        if mock.accepts() >= 2 {
            break;
        }
        sleep(Duration::from_millis(20)).await;
    }
    assert!(mock.accepts() >= 2);
    assert!(wait_for_state(&panel, ConnectionState::Connected).await);
    assert!(panel.snapshot().await.communication_errors >= 1);

    panel.disconnect().await.unwrap();
}

#[tokio::test]
async fn test_idle_reader_probes_with_status() {
    let mock = MockPanel::start(Script::default()).await;
    let config = mock
        .config(PanelType::Esx)
        .read_idle_timeout(Duration::from_millis(100))
        .keep_alive(Duration::from_secs(60), Duration::from_secs(60))
        .build();
    let panel = ArrowheadPanel::new(config);
    panel.connect().await.unwrap();

    // Let the connect-time STATUS replies arrive first
    sleep(Duration::from_millis(50)).await;
    let before = mock.count("STATUS");
    sleep(Duration::from_millis(500)).await;
    assert!(mock.count("STATUS") > before);
    assert!(panel.is_connected().await);

    panel.disconnect().await.unwrap();
}

#[tokio::test]
async fn test_keep_alive_after_silence() {
    let mock = MockPanel::start(Script::default()).await;
    let config = mock
        .config(PanelType::Esx)
        .read_idle_timeout(Duration::from_secs(60))
        .keep_alive(Duration::from_millis(50), Duration::from_millis(100))
        .build();
    let panel = ArrowheadPanel::new(config);
    panel.connect().await.unwrap();

    sleep(Duration::from_millis(50)).await;
    let before = mock.count("STATUS");
    sleep(Duration::from_millis(500)).await;
    assert!(mock.count("STATUS") > before);
    assert!(panel.is_connected().await);

    panel.disconnect().await.unwrap();
}

#[tokio::test]
async fn test_disconnect_is_idempotent() {
    let mock = MockPanel::start(Script::default()).await;
    let panel = ArrowheadPanel::new(mock.config(PanelType::Esx).build());
    panel.connect().await.unwrap();

    panel.disconnect().await.unwrap();
    panel.disconnect().await.unwrap();
    assert_eq!(panel.connection_state().await, ConnectionState::Disconnected);

    let err = panel.bypass_zone(1).await.unwrap_err();
    assert!(matches!(err, ArrowheadError::NotConnected { .. }), "{err:?}");

    // Stopped: no reconnect behind the caller's back
    sleep(Duration::from_millis(150)).await;
    assert_eq!(mock.accepts(), 1);
    assert_eq!(panel.connection_state().await, ConnectionState::Disconnected);
}

#[tokio::test]
async fn test_unreachable_panel_is_retryable() {
    // Bind then drop to get a port nothing listens on
    let port = {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        listener.local_addr().unwrap().port()
    };
    let config = PanelConfig::builder()
        .host("127.0.0.1")
        .port(port)
        .connect_timeout(Duration::from_millis(300))
        .reconnect_delays(Duration::from_millis(10), Duration::from_millis(20))
        .max_reconnect_attempts(2)
        .build();
    let panel = ArrowheadPanel::new(config);
    let mut events = panel.subscribe();

    let err = panel.connect().await.unwrap_err();
    assert!(err.is_retryable(), "{err:?}");

    let exhausted = timeout(Duration::from_secs(3), async {
        loop {
            match events.recv().await {
                Ok(PanelEvent::ReconnectExhausted { attempts }) => return Some(attempts),
                Ok(_) => continue,
                Err(_) => return None,
            }
        }
    })
    .await
    .ok()
    .flatten();
    assert_eq!(exhausted, Some(2));

    panel.disconnect().await.unwrap();
}
