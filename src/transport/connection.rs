// MIT License - Copyright (c) 2026 Peter Wright
// Socket ownership, read loop and keep-alive for one panel connection

use std::sync::{Arc, Mutex as StdMutex};

use chrono::Utc;
use tokio::io::AsyncWriteExt;
use tokio::net::TcpStream;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::sync::{mpsc, watch, Mutex, RwLock};
use tokio::task::JoinHandle;
use tokio::time::{timeout, Duration, Instant};
use tracing::{debug, info, trace, warn};

use crate::config::PanelConfig;
use crate::constants;
use crate::error::{ArrowheadError, Result};
use crate::event::{EventSender, PanelEvent};
use crate::parser;
use crate::protocol::Command;
use crate::state::LiveState;
use crate::transport::correlator::{ResponseCorrelator, ResponseMatch};
use crate::transport::framer::{self, LineReader};

/// Messages to the reconnect supervisor. Nothing else drives reconnection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum SupervisorSignal {
    /// The link of the given generation failed
    LinkDown { generation: u64, reason: String },
    /// A connect attempt failed with a retryable error
    ConnectFailed,
    /// A caller found the panel disconnected and wants a retry
    Nudge,
}

/// Shared handles a connection needs from its owner.
#[derive(Clone)]
pub(crate) struct LinkContext {
    pub state: Arc<RwLock<LiveState>>,
    pub events: EventSender,
    pub signals: mpsc::Sender<SupervisorSignal>,
}

impl LinkContext {
    fn link_down(&self, generation: u64, reason: String) {
        warn!("Panel link lost: {}", reason);
        // A full queue already holds a signal that will trigger recovery.
        let _ = self
            .signals
            .try_send(SupervisorSignal::LinkDown { generation, reason });
    }
}

/// Writer half plus the bits the background tasks share with it.
#[derive(Clone)]
struct LinkIo {
    writer: Arc<Mutex<OwnedWriteHalf>>,
    correlator: Arc<ResponseCorrelator>,
    last_rx: Arc<Mutex<Instant>>,
    write_timeout: Duration,
}

impl LinkIo {
    async fn write_line(&self, line: &str) -> Result<()> {
        let bytes = framer::encode(line);
        let mut writer = self.writer.lock().await;
        match timeout(self.write_timeout, writer.write_all(&bytes)).await {
            Ok(result) => result.map_err(ArrowheadError::Io),
            Err(_) => Err(ArrowheadError::ConnectionTimeout),
        }
    }
}

/// One TCP session with the panel.
///
/// Owns the socket and its two background tasks. A connection is never
/// reused: after a failure the supervisor opens a new one with a new
/// generation number.
pub struct Connection {
    generation: u64,
    io: LinkIo,
    ctx: LinkContext,
    tasks: StdMutex<Vec<JoinHandle<()>>>,
}

impl Connection {
    /// Open the socket within the connect timeout and start the read loop.
    pub(crate) async fn open(
        config: &PanelConfig,
        ctx: LinkContext,
        generation: u64,
    ) -> Result<Arc<Self>> {
        let addr = config.address();
        info!("Connecting to panel at {}", addr);

        let stream = match timeout(config.connect_timeout, TcpStream::connect(&addr)).await {
            Ok(Ok(stream)) => stream,
            Ok(Err(e)) => {
                warn!("TCP connect to {} failed: {}", addr, e);
                return Err(ArrowheadError::Io(e));
            }
            Err(_) => {
                warn!("TCP connect to {} timed out after {:?}", addr, config.connect_timeout);
                return Err(ArrowheadError::ConnectionTimeout);
            }
        };
        let _ = stream.set_nodelay(true);
        debug!("TCP socket connected (generation {})", generation);

        let (reader, writer) = stream.into_split();
        let io = LinkIo {
            writer: Arc::new(Mutex::new(writer)),
            correlator: Arc::new(ResponseCorrelator::new()),
            last_rx: Arc::new(Mutex::new(Instant::now())),
            write_timeout: config.command_timeout,
        };

        let reader_handle = spawn_reader_task(
            LineReader::new(reader),
            io.clone(),
            ctx.clone(),
            generation,
            config.read_idle_timeout.max(constants::MIN_TIMER_PERIOD),
        );

        Ok(Arc::new(Self {
            generation,
            io,
            ctx,
            tasks: StdMutex::new(vec![reader_handle]),
        }))
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    /// Write one command line without waiting for an answer.
    pub async fn send(&self, command: &Command) -> Result<()> {
        debug!("Sending command: {}", command.log_string());
        self.write_checked(&command.to_wire_string()).await
    }

    /// Write a login credential. Never logged.
    pub(crate) async fn send_secret(&self, text: &str) -> Result<()> {
        self.write_checked(text).await
    }

    /// Write a command and wait for the line that answers it.
    pub async fn request(
        &self,
        command: &Command,
        matcher: ResponseMatch,
        limit: Duration,
    ) -> Result<String> {
        let pending = self.io.correlator.expect(matcher).await?;
        self.send(command).await?;
        let response = self
            .io
            .correlator
            .wait(pending, limit, &command.log_string())
            .await?;
        debug!("Response to {}: {}", command.log_string(), response);
        Ok(response)
    }

    /// Rolling last-line receiver for the login flow.
    pub(crate) fn subscribe_lines(&self) -> watch::Receiver<Option<String>> {
        self.io.correlator.subscribe_lines()
    }

    /// Start the keep-alive loop: every `interval`, probe with STATUS if
    /// nothing has been received for longer than `threshold`.
    pub(crate) fn start_keep_alive(&self, interval: Duration, threshold: Duration) {
        let io = self.io.clone();
        let ctx = self.ctx.clone();
        let generation = self.generation;
        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval_at(Instant::now() + interval, interval);
            loop {
                ticker.tick().await;
                if !ctx.state.read().await.connection_state.is_connected() {
                    continue;
                }
                let silent_for = io.last_rx.lock().await.elapsed();
                if silent_for <= threshold {
                    continue;
                }
                debug!("Keep-alive: no data for {:?}, sending STATUS", silent_for);
                if let Err(e) = io.write_line(&Command::Status.to_wire_string()).await {
                    ctx.link_down(generation, format!("Keep-alive write failed: {}", e));
                    break;
                }
            }
        });
        if let Ok(mut tasks) = self.tasks.lock() {
            tasks.push(handle);
        }
    }

    /// Stop background tasks, fail pending waits and close the socket.
    pub(crate) async fn shutdown(&self) {
        self.abort_tasks();
        self.io.correlator.close().await;
        let mut writer = self.io.writer.lock().await;
        let _ = timeout(Duration::from_secs(1), writer.shutdown()).await;
        debug!("Connection generation {} closed", self.generation);
    }

    fn abort_tasks(&self) {
        if let Ok(mut tasks) = self.tasks.lock() {
            for task in tasks.drain(..) {
                task.abort();
            }
        }
    }

    async fn write_checked(&self, line: &str) -> Result<()> {
        let result = self.io.write_line(line).await;
        if let Err(e) = &result
            && e.breaks_link()
        {
            self.ctx.link_down(self.generation, format!("Write failed: {}", e));
        }
        result
    }
}

impl Drop for Connection {
    fn drop(&mut self) {
        self.abort_tasks();
    }
}

/// Spawn the reader task that feeds every inbound line through the parser,
/// the correlator and the event channel.
fn spawn_reader_task(
    mut lines: LineReader<OwnedReadHalf>,
    io: LinkIo,
    ctx: LinkContext,
    generation: u64,
    idle: Duration,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            match timeout(idle, lines.next_line()).await {
                Err(_) => {
                    if !ctx.state.read().await.connection_state.is_connected() {
                        continue;
                    }
                    debug!("Reader: idle for {:?}, probing with STATUS", idle);
                    if let Err(e) = io.write_line(&Command::Status.to_wire_string()).await {
                        ctx.link_down(generation, format!("Probe write failed: {}", e));
                        break;
                    }
                }
                Ok(Ok(Some(line))) => process_line(&line, &io, &ctx).await,
                Ok(Ok(None)) => {
                    debug!("Reader: connection closed");
                    ctx.link_down(generation, "Server closed connection".to_string());
                    break;
                }
                Ok(Err(e)) => {
                    ctx.link_down(generation, format!("Read error: {}", e));
                    break;
                }
            }
        }
        io.correlator.close().await;
    })
}

/// Handle one inbound line: parse into state, then correlate, then broadcast.
async fn process_line(line: &str, io: &LinkIo, ctx: &LinkContext) {
    trace!("Received: {}", line);
    *io.last_rx.lock().await = Instant::now();

    let message = parser::classify(line);
    let applied = {
        let mut state = ctx.state.write().await;
        state.last_update = Some(Utc::now());
        message.is_some_and(|m| state.apply(&m))
    };

    io.correlator.publish(line).await;

    let event = match message {
        Some(message) if applied => PanelEvent::Message {
            message,
            raw: line.to_string(),
        },
        _ => PanelEvent::Unrecognized(line.to_string()),
    };
    let _ = ctx.events.send(event);
}
