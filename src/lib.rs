// MIT License - Copyright (c) 2026 Peter Wright
// Client library for Arrowhead ESX/ECi alarm panels
//
//! # arrowhead-lan-bridge
//!
//! Direct TCP/IP communication with Arrowhead ESX and ECi alarm panels over
//! their line-based serial-over-IP protocol.
//!
//! The client keeps one persistent session per panel: it logs in (or probes
//! directly when no login prompt is offered), negotiates the enhanced
//! protocol mode on capable ECi firmware, parses the unsolicited status
//! stream into a [`LiveState`], correlates command acknowledgements, and
//! reconnects with exponential backoff when the link drops.
//!
//! ## Quick Start
//!
//! ```no_run
//! use arrowhead_lan_bridge::{ArrowheadPanel, PanelConfig, PanelType};
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let config = PanelConfig::builder()
//!         .panel_type(PanelType::Eci)
//!         .host("192.168.0.100")
//!         .user_pin("1 123")
//!         .build();
//!
//!     let panel = ArrowheadPanel::new(config);
//!     panel.connect().await?;
//!
//!     let mut events = panel.subscribe();
//!     tokio::spawn(async move {
//!         while let Ok(event) = events.recv().await {
//!             println!("Event: {:?}", event);
//!         }
//!     });
//!
//!     panel.bypass_zone(7).await?;
//!     panel.stay_area(1).await?;
//!
//!     tokio::signal::ctrl_c().await?;
//!     panel.disconnect().await?;
//!     Ok(())
//! }
//! ```

pub mod config;
pub mod constants;
pub mod detection;
pub mod devices;
pub mod error;
pub mod event;
pub mod panel;
pub mod parser;
pub mod protocol;
mod session;
pub mod state;
pub mod transport;

// Re-exports for convenience
pub use config::{FirmwareVersion, PanelConfig, PanelConfigBuilder, PanelType, ProtocolMode, UserCredential};
pub use detection::{CommandChannel, DetectionMethod, LayoutOverrides, PanelLayout, ZoneDetector};
pub use devices::{Area, Output, SystemStatusFlags, Zone, ZoneStatusFlags};
pub use error::{ArrowheadError, ErrorKind, Result};
pub use event::{EventReceiver, PanelEvent};
pub use panel::{ArrowheadPanel, AreaStatus};
pub use parser::{AckKind, AreaAction, PanelMessage};
pub use protocol::{ArmType, Command, KeypadAlarm};
pub use state::{ConnectionState, KeypadAlarmFlags, LiveState};
