// MIT License - Copyright (c) 2026 Peter Wright
// Panel event stream

use crate::parser::PanelMessage;
use crate::state::ConnectionState;

/// All events that can be emitted by the panel client.
///
/// Users subscribe via `panel.subscribe()` to receive a
/// `tokio::sync::broadcast::Receiver<PanelEvent>`. A subscriber that falls
/// behind loses the oldest events; the read loop never waits for it.
#[derive(Debug, Clone)]
pub enum PanelEvent {
    /// Session moved between lifecycle states
    ConnectionStateChanged {
        old: ConnectionState,
        new: ConnectionState,
    },
    /// A recognized inbound line, after it was applied to the live state
    Message { message: PanelMessage, raw: String },
    /// An inbound line no matcher recognized (responses, diagnostics)
    Unrecognized(String),
    /// The socket failed or closed; the supervisor will retry if allowed
    LinkLost { reason: String },
    /// The supervisor stopped retrying after too many failures
    ReconnectExhausted { attempts: u32 },
}

/// Type alias for the broadcast sender.
pub type EventSender = tokio::sync::broadcast::Sender<PanelEvent>;

/// Type alias for the broadcast receiver.
pub type EventReceiver = tokio::sync::broadcast::Receiver<PanelEvent>;

/// Create a new event channel with the given capacity.
pub fn event_channel(capacity: usize) -> (EventSender, EventReceiver) {
    tokio::sync::broadcast::channel(capacity)
}
