//! Session coordinator driver
//!
//! Wires the pure state machine to the live world: the channel
//! subscription, a 1 Hz countdown ticker and user actions all funnel into
//! one driver task that owns the machine, applies its effects and
//! publishes a fresh snapshot after every transition.
//!
//! Tearing the coordinator down cancels the ticker and drops the channel
//! subscription before the handle is released, so a new session never
//! inherits a stale timer or a duplicate subscription.

use crate::baseline::ReferenceBaseline;
use crate::config::SessionConfig;
use crate::connection::{ChannelEvent, ConnectionManager};
use crate::error::SessionError;
use crate::protocol::ClientCommand;
use crate::session::{Effect, SessionMachine, SessionSnapshot};
use std::time::Duration;
use tokio::sync::{broadcast, mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::{interval, Interval, MissedTickBehavior};
use tracing::{debug, warn};

enum Action {
    Start(oneshot::Sender<Result<(), SessionError>>),
    ConfirmAdvance(oneshot::Sender<Result<(), SessionError>>),
    Restart,
    Shutdown,
}

/// Handle to a running assessment session
pub struct SessionCoordinator {
    actions: mpsc::Sender<Action>,
    snapshots: watch::Receiver<SessionSnapshot>,
    driver: JoinHandle<()>,
}

impl SessionCoordinator {
    /// Spawn a coordinator on an established connection
    pub fn spawn(
        config: SessionConfig,
        baseline: ReferenceBaseline,
        connection: &ConnectionManager,
    ) -> Result<Self, SessionError> {
        Self::spawn_with(
            config,
            baseline,
            connection.command_sender(),
            connection.subscribe(),
        )
    }

    /// Spawn a coordinator on raw channel plumbing. The seam tests use.
    pub fn spawn_with(
        config: SessionConfig,
        baseline: ReferenceBaseline,
        commands: mpsc::Sender<ClientCommand>,
        events: broadcast::Receiver<ChannelEvent>,
    ) -> Result<Self, SessionError> {
        let machine = SessionMachine::new(config, baseline)?;
        let (actions_tx, actions_rx) = mpsc::channel(16);
        let (snapshots_tx, snapshots_rx) = watch::channel(machine.snapshot());

        let driver = tokio::spawn(drive(machine, commands, events, actions_rx, snapshots_tx));

        Ok(Self {
            actions: actions_tx,
            snapshots: snapshots_rx,
            driver,
        })
    }

    /// Begin the session (link must be connected)
    pub async fn start(&self) -> Result<(), SessionError> {
        self.roundtrip(Action::Start).await
    }

    /// Explicitly confirm a pending prompt, resume or scoring retry
    pub async fn confirm_advance(&self) -> Result<(), SessionError> {
        self.roundtrip(Action::ConfirmAdvance).await
    }

    /// Reset the session to idle, cancelling all pending timers
    pub async fn restart(&self) -> Result<(), SessionError> {
        self.actions
            .send(Action::Restart)
            .await
            .map_err(|_| SessionError::Connectivity("coordinator stopped".to_string()))
    }

    /// Watch session snapshots; a new one is published on every transition
    pub fn watch(&self) -> watch::Receiver<SessionSnapshot> {
        self.snapshots.clone()
    }

    /// The most recent snapshot
    pub fn snapshot(&self) -> SessionSnapshot {
        self.snapshots.borrow().clone()
    }

    /// Stop the driver: cancels the countdown ticker and drops the channel
    /// subscription before returning.
    pub async fn shutdown(self) {
        let _ = self.actions.send(Action::Shutdown).await;
        let _ = self.driver.await;
    }

    async fn roundtrip(
        &self,
        make: impl FnOnce(oneshot::Sender<Result<(), SessionError>>) -> Action,
    ) -> Result<(), SessionError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.actions
            .send(make(reply_tx))
            .await
            .map_err(|_| SessionError::Connectivity("coordinator stopped".to_string()))?;
        reply_rx
            .await
            .map_err(|_| SessionError::Connectivity("coordinator stopped".to_string()))?
    }
}

async fn drive(
    mut machine: SessionMachine,
    commands: mpsc::Sender<ClientCommand>,
    mut events: broadcast::Receiver<ChannelEvent>,
    mut actions: mpsc::Receiver<Action>,
    snapshots: watch::Sender<SessionSnapshot>,
) {
    let mut ticker = interval(Duration::from_secs(1));
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
    // Generation of the countdown currently being ticked, if any
    let mut countdown: Option<u64> = None;

    loop {
        tokio::select! {
            action = actions.recv() => {
                let Some(action) = action else { break };
                let effects = match action {
                    Action::Start(reply) => {
                        let outcome = machine.start();
                        unpack(outcome, reply)
                    }
                    Action::ConfirmAdvance(reply) => {
                        let outcome = machine.confirm_advance();
                        unpack(outcome, reply)
                    }
                    Action::Restart => machine.restart(),
                    Action::Shutdown => break,
                };
                apply(effects, &commands, &mut countdown, &mut ticker).await;
                let _ = snapshots.send(machine.snapshot());
            }
            event = events.recv() => {
                let effects = match event {
                    Ok(ChannelEvent::Status(status)) => machine.on_link(status),
                    Ok(ChannelEvent::Message(envelope)) => {
                        debug!(kind = envelope.message.kind(), "service event");
                        machine.on_event(envelope.message)
                    }
                    Err(broadcast::error::RecvError::Lagged(missed)) => {
                        warn!(missed, "event subscriber lagged; continuing");
                        continue;
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                };
                apply(effects, &commands, &mut countdown, &mut ticker).await;
                let _ = snapshots.send(machine.snapshot());
            }
            _ = ticker.tick(), if countdown.is_some() => {
                let generation = countdown.unwrap_or_default();
                let effects = machine.on_tick(generation);
                apply(effects, &commands, &mut countdown, &mut ticker).await;
                let _ = snapshots.send(machine.snapshot());
            }
        }
    }
}

fn unpack(
    outcome: Result<Vec<Effect>, SessionError>,
    reply: oneshot::Sender<Result<(), SessionError>>,
) -> Vec<Effect> {
    match outcome {
        Ok(effects) => {
            let _ = reply.send(Ok(()));
            effects
        }
        Err(e) => {
            let _ = reply.send(Err(e));
            vec![]
        }
    }
}

async fn apply(
    effects: Vec<Effect>,
    commands: &mpsc::Sender<ClientCommand>,
    countdown: &mut Option<u64>,
    ticker: &mut Interval,
) {
    for effect in effects {
        match effect {
            Effect::Send(command) => {
                if commands.send(command).await.is_err() {
                    // The channel layer is gone; the machine will hear
                    // about it through a status event.
                    warn!("command queue closed; dropping command");
                }
            }
            Effect::StartCountdown { generation, .. } => {
                *countdown = Some(generation);
                ticker.reset();
            }
            Effect::CancelCountdown => {
                *countdown = None;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connection::LinkStatus;
    use crate::protocol::parse_service_envelope;
    use crate::session::SessionPhase;
    use crate::types::StatisticBundle;
    use pretty_assertions::assert_eq;

    fn message(json: &str) -> ChannelEvent {
        ChannelEvent::Message(parse_service_envelope(json).unwrap())
    }

    fn reference_task_result() -> ChannelEvent {
        let baseline = ReferenceBaseline::normative();
        let bundle = StatisticBundle {
            recording_info: None,
            left_flexion: Some(baseline.left_flexion),
            right_flexion: Some(baseline.right_flexion),
            left_abduction: Some(baseline.left_abduction),
            right_abduction: Some(baseline.right_abduction),
            symmetry_metrics: None,
        };
        let frame = serde_json::json!({
            "type": "task_result",
            "payload": serde_json::to_value(&bundle).unwrap(),
        });
        message(&frame.to_string())
    }

    async fn wait_for(
        snapshots: &mut watch::Receiver<SessionSnapshot>,
        predicate: impl Fn(&SessionSnapshot) -> bool,
    ) {
        tokio::time::timeout(Duration::from_secs(120), async {
            loop {
                if predicate(&snapshots.borrow()) {
                    return;
                }
                snapshots.changed().await.expect("driver stopped");
            }
        })
        .await
        .expect("condition never reached");
    }

    #[tokio::test(start_paused = true)]
    async fn test_coordinator_drives_a_full_session() {
        let (commands_tx, mut commands_rx) = mpsc::channel(8);
        let (events_tx, events_rx) = broadcast::channel(64);
        let coordinator = SessionCoordinator::spawn_with(
            SessionConfig::jump_landing(),
            ReferenceBaseline::normative(),
            commands_tx,
            events_rx,
        )
        .unwrap();
        let mut snapshots = coordinator.watch();

        events_tx
            .send(ChannelEvent::Status(LinkStatus::Connected))
            .unwrap();
        wait_for(&mut snapshots, |s| s.link == LinkStatus::Connected).await;

        coordinator.start().await.unwrap();
        let command = commands_rx.recv().await.unwrap();
        assert_eq!(command, ClientCommand::StartCalibration {});

        events_tx
            .send(message(
                r#"{"type": "calibration_status", "payload": {"status": "complete"}}"#,
            ))
            .unwrap();
        wait_for(&mut snapshots, |s| s.step_index == 1).await;
        let command = commands_rx.recv().await.unwrap();
        assert_eq!(command, ClientCommand::StartFlexionCalibration {});

        events_tx
            .send(message(r#"{"type": "calibration_done", "payload": {}}"#))
            .unwrap();
        wait_for(&mut snapshots, |s| s.step_index == 2).await;
        let command = commands_rx.recv().await.unwrap();
        assert!(matches!(command, ClientCommand::StartTask { .. }));

        events_tx.send(reference_task_result()).unwrap();
        wait_for(&mut snapshots, |s| s.phase == SessionPhase::Finished).await;

        let snapshot = coordinator.snapshot();
        let result = snapshot.result.unwrap();
        assert_eq!(result.overall_risk, 0);

        coordinator.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_start_rejected_while_disconnected() {
        let (commands_tx, _commands_rx) = mpsc::channel(8);
        let (_events_tx, events_rx) = broadcast::channel(64);
        let coordinator = SessionCoordinator::spawn_with(
            SessionConfig::jump_landing(),
            ReferenceBaseline::normative(),
            commands_tx,
            events_rx,
        )
        .unwrap();

        let err = coordinator.start().await.unwrap_err();
        assert!(matches!(err, SessionError::NotAllowed(_)));

        coordinator.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_shutdown_releases_the_command_queue() {
        let (commands_tx, mut commands_rx) = mpsc::channel(8);
        let (_events_tx, events_rx) = broadcast::channel(64);
        let coordinator = SessionCoordinator::spawn_with(
            SessionConfig::jump_landing(),
            ReferenceBaseline::normative(),
            commands_tx,
            events_rx,
        )
        .unwrap();

        coordinator.shutdown().await;
        // The driver held the only sender; after shutdown the queue closes
        assert!(commands_rx.recv().await.is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_restart_resets_the_published_snapshot() {
        let (commands_tx, mut commands_rx) = mpsc::channel(8);
        let (events_tx, events_rx) = broadcast::channel(64);
        let coordinator = SessionCoordinator::spawn_with(
            SessionConfig::jump_landing(),
            ReferenceBaseline::normative(),
            commands_tx,
            events_rx,
        )
        .unwrap();
        let mut snapshots = coordinator.watch();

        events_tx
            .send(ChannelEvent::Status(LinkStatus::Connected))
            .unwrap();
        wait_for(&mut snapshots, |s| s.link == LinkStatus::Connected).await;
        coordinator.start().await.unwrap();
        let _ = commands_rx.recv().await.unwrap();

        coordinator.restart().await.unwrap();
        wait_for(&mut snapshots, |s| s.phase == SessionPhase::Idle).await;
        assert!(coordinator.snapshot().result.is_none());

        coordinator.shutdown().await;
    }
}
