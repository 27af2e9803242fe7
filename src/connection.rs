//! Channel connection manager
//!
//! Owns the single WebSocket to the sensor-processing service. The manager
//! is an explicit instance owned by the session — no process-wide socket,
//! no global callback arrays. Subscribers get a broadcast receiver;
//! dropping it is the unsubscribe.
//!
//! Reconnection is fixed-backoff with exactly one pending retry at any
//! time: every unclean close schedules a token-tagged retry that cancels
//! and replaces whatever retry was already pending, and a retry whose
//! token is no longer current is inert.

use crate::error::SessionError;
use crate::protocol::{encode_command, parse_service_envelope, ClientCommand, Envelope, ServiceEvent};
use futures_util::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::sync::{broadcast, mpsc, watch};
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tracing::{error, info, warn};
use uuid::Uuid;

/// Connectivity status of the channel
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LinkStatus {
    Disconnected,
    Connecting,
    Connected,
    Error,
}

/// What subscribers receive from the channel
#[derive(Debug, Clone)]
pub enum ChannelEvent {
    Status(LinkStatus),
    Message(Envelope<ServiceEvent>),
}

/// Connection parameters
#[derive(Debug, Clone)]
pub struct ConnectionConfig {
    /// Service endpoint, e.g. `ws://localhost:8000/assess`
    pub endpoint: String,
    /// Opaque session identifier embedded in the connection target
    pub session_id: Uuid,
    /// Fixed delay before the single reconnect attempt
    pub reconnect_delay: Duration,
}

impl ConnectionConfig {
    pub fn new(endpoint: impl Into<String>, reconnect_delay: Duration) -> Self {
        Self {
            endpoint: endpoint.into(),
            session_id: Uuid::new_v4(),
            reconnect_delay,
        }
    }

    /// Full connection target with the session identifier appended
    pub fn url(&self) -> String {
        format!(
            "{}/{}",
            self.endpoint.trim_end_matches('/'),
            self.session_id
        )
    }
}

/// Pending-retry bookkeeping.
///
/// The only mutable cell is the current token; a retry that fires with a
/// superseded token is a no-op, so two pending retries can never stack.
#[derive(Debug)]
struct ReconnectSchedule {
    delay: Duration,
    next_token: u64,
    pending: Option<u64>,
}

impl ReconnectSchedule {
    fn new(delay: Duration) -> Self {
        Self {
            delay,
            next_token: 0,
            pending: None,
        }
    }

    /// Schedule a retry, cancelling and replacing any pending one
    fn schedule(&mut self) -> u64 {
        self.next_token += 1;
        self.pending = Some(self.next_token);
        self.next_token
    }

    /// True iff `token` is still the pending retry; consumes it
    fn should_fire(&mut self, token: u64) -> bool {
        if self.pending == Some(token) {
            self.pending = None;
            true
        } else {
            false
        }
    }

    fn cancel(&mut self) {
        self.pending = None;
    }

    #[cfg(test)]
    fn has_pending(&self) -> bool {
        self.pending.is_some()
    }

    fn delay(&self) -> Duration {
        self.delay
    }
}

/// Handle to the channel owned by the active session
pub struct ConnectionManager {
    commands: mpsc::Sender<ClientCommand>,
    events: broadcast::Sender<ChannelEvent>,
    shutdown: watch::Sender<bool>,
    supervisor: JoinHandle<()>,
}

impl ConnectionManager {
    /// Open the channel and start supervising it. Returns immediately;
    /// connectivity progress arrives as `ChannelEvent::Status` events.
    pub fn connect(config: ConnectionConfig) -> Self {
        let (commands_tx, commands_rx) = mpsc::channel(32);
        let (events_tx, _) = broadcast::channel(256);
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let supervisor = tokio::spawn(supervise(
            config,
            commands_rx,
            events_tx.clone(),
            shutdown_rx,
        ));

        Self {
            commands: commands_tx,
            events: events_tx,
            shutdown: shutdown_tx,
            supervisor,
        }
    }

    /// Queue a command for the sensor service
    pub async fn send(&self, command: ClientCommand) -> Result<(), SessionError> {
        self.commands
            .send(command)
            .await
            .map_err(|_| SessionError::Connectivity("command channel closed".to_string()))
    }

    /// Clone of the command queue, for drivers that own their own loop
    pub fn command_sender(&self) -> mpsc::Sender<ClientCommand> {
        self.commands.clone()
    }

    /// Subscribe to channel events. Dropping the receiver unsubscribes.
    pub fn subscribe(&self) -> broadcast::Receiver<ChannelEvent> {
        self.events.subscribe()
    }

    /// Close the channel cleanly: cancels any pending reconnect, sends a
    /// close frame and waits for the supervisor to wind down.
    pub async fn disconnect(self) {
        let _ = self.shutdown.send(true);
        let _ = self.supervisor.await;
    }
}

enum CloseOutcome {
    /// Shutdown was requested locally
    Requested,
    /// The socket closed or errored out from under us
    Unclean,
}

async fn supervise(
    config: ConnectionConfig,
    mut commands: mpsc::Receiver<ClientCommand>,
    events: broadcast::Sender<ChannelEvent>,
    mut shutdown: watch::Receiver<bool>,
) {
    let url = config.url();
    let mut schedule = ReconnectSchedule::new(config.reconnect_delay);

    loop {
        if *shutdown.borrow() {
            break;
        }

        let _ = events.send(ChannelEvent::Status(LinkStatus::Connecting));
        match connect_async(url.as_str()).await {
            Ok((stream, _)) => {
                info!(url = %url, "channel connected");
                let _ = events.send(ChannelEvent::Status(LinkStatus::Connected));
                match run_channel(stream, &mut commands, &events, &mut shutdown).await {
                    CloseOutcome::Requested => break,
                    CloseOutcome::Unclean => {
                        warn!("channel closed uncleanly");
                        let _ = events.send(ChannelEvent::Status(LinkStatus::Disconnected));
                    }
                }
            }
            Err(e) => {
                warn!(url = %url, "connect failed: {}", e);
                let _ = events.send(ChannelEvent::Status(LinkStatus::Error));
            }
        }

        let token = schedule.schedule();
        tokio::select! {
            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() {
                    schedule.cancel();
                    break;
                }
            }
            _ = tokio::time::sleep(schedule.delay()) => {
                if !schedule.should_fire(token) {
                    continue;
                }
            }
        }
    }

    let _ = events.send(ChannelEvent::Status(LinkStatus::Disconnected));
}

async fn run_channel(
    stream: WebSocketStream<MaybeTlsStream<TcpStream>>,
    commands: &mut mpsc::Receiver<ClientCommand>,
    events: &broadcast::Sender<ChannelEvent>,
    shutdown: &mut watch::Receiver<bool>,
) -> CloseOutcome {
    let (mut write, mut read) = stream.split();

    loop {
        tokio::select! {
            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() {
                    let _ = write.send(Message::Close(None)).await;
                    return CloseOutcome::Requested;
                }
            }
            command = commands.recv() => {
                let Some(command) = command else {
                    // Every handle is gone; nobody can use this channel again
                    return CloseOutcome::Requested;
                };
                let kind = command.kind();
                match encode_command(command) {
                    Ok(frame) => {
                        if let Err(e) = write.send(Message::Text(frame)).await {
                            warn!(command = kind, "send failed: {}", e);
                            return CloseOutcome::Unclean;
                        }
                        info!(command = kind, "command sent");
                    }
                    Err(e) => error!(command = kind, "failed to encode command: {}", e),
                }
            }
            frame = read.next() => {
                match frame {
                    Some(Ok(Message::Text(text))) => {
                        match parse_service_envelope(&text) {
                            Ok(envelope) => {
                                let _ = events.send(ChannelEvent::Message(envelope));
                            }
                            // Malformed frame: log, drop, keep the session alive
                            Err(e) => warn!("dropping unparseable frame: {}", e),
                        }
                    }
                    Some(Ok(Message::Ping(data))) => {
                        let _ = write.send(Message::Pong(data)).await;
                    }
                    Some(Ok(Message::Close(_))) => {
                        info!("channel closed by service");
                        return CloseOutcome::Unclean;
                    }
                    Some(Ok(_)) => {}
                    Some(Err(e)) => {
                        warn!("channel error: {}", e);
                        return CloseOutcome::Unclean;
                    }
                    None => return CloseOutcome::Unclean,
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_reconnect_schedule_single_pending_retry() {
        let mut schedule = ReconnectSchedule::new(Duration::from_secs(4));
        assert!(!schedule.has_pending());

        let token = schedule.schedule();
        assert!(schedule.has_pending());
        assert!(schedule.should_fire(token));
        assert!(!schedule.has_pending());
    }

    #[test]
    fn test_second_close_replaces_pending_retry() {
        let mut schedule = ReconnectSchedule::new(Duration::from_secs(4));

        // First unclean close schedules a retry; a second close before it
        // fires replaces it rather than stacking a second one.
        let first = schedule.schedule();
        let second = schedule.schedule();

        assert!(!schedule.should_fire(first));
        assert!(schedule.has_pending());
        assert!(schedule.should_fire(second));
        assert!(!schedule.has_pending());
    }

    #[test]
    fn test_cancel_clears_pending_retry() {
        let mut schedule = ReconnectSchedule::new(Duration::from_secs(4));
        let token = schedule.schedule();
        schedule.cancel();
        assert!(!schedule.should_fire(token));
    }

    #[test]
    fn test_consumed_token_cannot_fire_twice() {
        let mut schedule = ReconnectSchedule::new(Duration::from_secs(4));
        let token = schedule.schedule();
        assert!(schedule.should_fire(token));
        assert!(!schedule.should_fire(token));
    }

    #[test]
    fn test_connection_url_embeds_session_id() {
        let config = ConnectionConfig::new("ws://localhost:8000/assess/", Duration::from_secs(4));
        let url = config.url();
        assert_eq!(
            url,
            format!("ws://localhost:8000/assess/{}", config.session_id)
        );
    }
}
