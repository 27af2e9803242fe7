//! Session state machine
//!
//! Deterministically sequences the configured steps, reconciling two
//! independent completion sources — local countdowns and externally
//! delivered confirmation events — without double-advancing or stalling.
//!
//! The machine is pure and synchronous: every operation mutates state and
//! returns the effects (commands to send, countdowns to start or cancel)
//! for the async driver to carry out. Countdown ticks are tagged with the
//! generation they were started for; a tick or signal aimed at a
//! since-advanced step is inert. That tag, not callback identity, is what
//! keeps late asynchronous callbacks from corrupting the sequence.

use crate::baseline::ReferenceBaseline;
use crate::config::{AdvanceMode, RequiredSignal, SessionConfig, StepDescriptor};
use crate::connection::LinkStatus;
use crate::error::SessionError;
use crate::protocol::{ClientCommand, ServiceEvent};
use crate::scoring::RiskEngine;
use crate::types::{RiskResult, StatisticBundle};
use serde::{Deserialize, Serialize};

/// Overall progress of a session
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionPhase {
    Idle,
    InProgress,
    Finished,
}

/// Progress of the active step
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepStatus {
    NotStarted,
    Running,
    AwaitingConfirmation,
    Complete,
}

/// Why the machine is holding in `AwaitingConfirmation`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Waiting {
    /// Countdown ended but the required external signal has not arrived
    ExternalSignal,
    /// Manual advance mode: the user must explicitly start the next step
    ManualConfirm,
    /// A completion signal arrived but the upright hold is not satisfied
    UprightHold,
    /// The link dropped mid-step; the user must explicitly resume
    ResumeRequired,
    /// Scoring the final task failed; retry once a usable result arrives
    ScoringRetry,
}

/// Side effects for the async driver to perform
#[derive(Debug, Clone, PartialEq)]
pub enum Effect {
    /// Send a command to the sensor service
    Send(ClientCommand),
    /// Begin a 1 Hz countdown tagged with the issuing generation
    StartCountdown { generation: u64, seconds: u64 },
    /// Stop the running countdown, if any
    CancelCountdown,
}

/// Externally visible session state
#[derive(Debug, Clone, Serialize)]
pub struct SessionSnapshot {
    pub link: LinkStatus,
    pub phase: SessionPhase,
    pub step_index: usize,
    pub step_count: usize,
    pub step_id: Option<String>,
    pub step_title: Option<String>,
    pub instruction: Option<String>,
    pub step_status: StepStatus,
    pub time_remaining_secs: Option<u64>,
    pub waiting: Option<Waiting>,
    pub paused: bool,
    pub is_upright: Option<bool>,
    pub last_event: Option<String>,
    pub last_service_error: Option<String>,
    pub scoring_error: Option<String>,
    pub result: Option<RiskResult>,
}

/// The assessment session state machine
pub struct SessionMachine {
    config: SessionConfig,
    baseline: ReferenceBaseline,
    link: LinkStatus,
    phase: SessionPhase,
    step_index: usize,
    step_status: StepStatus,
    generation: u64,
    time_remaining_secs: Option<u64>,
    paused: bool,
    waiting: Option<Waiting>,
    is_upright: Option<bool>,
    upright_hold_secs: u64,
    completion_pending: bool,
    last_event: Option<&'static str>,
    last_service_error: Option<String>,
    scoring_error: Option<String>,
    latest_task_result: Option<StatisticBundle>,
    computed: Option<RiskResult>,
}

impl SessionMachine {
    pub fn new(
        config: SessionConfig,
        baseline: ReferenceBaseline,
    ) -> Result<Self, SessionError> {
        config.validate()?;
        Ok(Self {
            config,
            baseline,
            link: LinkStatus::Disconnected,
            phase: SessionPhase::Idle,
            step_index: 0,
            step_status: StepStatus::NotStarted,
            generation: 0,
            time_remaining_secs: None,
            paused: false,
            waiting: None,
            is_upright: None,
            upright_hold_secs: 0,
            completion_pending: false,
            last_event: None,
            last_service_error: None,
            scoring_error: None,
            latest_task_result: None,
            computed: None,
        })
    }

    fn active_step(&self) -> &StepDescriptor {
        &self.config.steps[self.step_index]
    }

    /// Begin the session. Requires a connected link and an idle machine.
    pub fn start(&mut self) -> Result<Vec<Effect>, SessionError> {
        if self.link != LinkStatus::Connected {
            return Err(SessionError::NotAllowed(
                "cannot start while the sensor link is down".to_string(),
            ));
        }
        if self.phase != SessionPhase::Idle {
            return Err(SessionError::NotAllowed(
                "session already started; restart first".to_string(),
            ));
        }

        self.phase = SessionPhase::InProgress;
        self.step_index = 0;
        self.computed = None;
        self.scoring_error = None;
        self.latest_task_result = None;
        Ok(self.activate_step())
    }

    /// Connectivity transition from the channel layer.
    ///
    /// Link loss mid-step suspends the countdown and pauses the step; the
    /// machine never re-issues a start command on its own after
    /// reconnection, because the backend may already be mid-collection.
    /// Reconnection raises a resume-required condition instead.
    pub fn on_link(&mut self, status: LinkStatus) -> Vec<Effect> {
        self.link = status;

        match status {
            LinkStatus::Connected => {
                if self.paused {
                    self.step_status = StepStatus::AwaitingConfirmation;
                    self.waiting = Some(Waiting::ResumeRequired);
                }
                vec![]
            }
            LinkStatus::Disconnected | LinkStatus::Error => {
                // Only waits that depend on the backend get suspended; a
                // manual prompt or scoring retry survives the outage as is.
                let backend_dependent = self.step_status == StepStatus::Running
                    || matches!(
                        self.waiting,
                        Some(Waiting::ExternalSignal) | Some(Waiting::UprightHold)
                    );
                if self.phase == SessionPhase::InProgress && backend_dependent && !self.paused {
                    self.paused = true;
                    return vec![Effect::CancelCountdown];
                }
                vec![]
            }
            LinkStatus::Connecting => vec![],
        }
    }

    /// Dispatch an inbound service event.
    ///
    /// Posture and progress events only update observation fields. A
    /// completion signal advances the active step iff it matches that
    /// step's required signal; anything else — a repeat of an already
    /// consumed signal, a signal for a past step — is silently ignored.
    pub fn on_event(&mut self, event: ServiceEvent) -> Vec<Effect> {
        self.last_event = Some(event.kind());

        match &event {
            ServiceEvent::PostureStatus { upright } => {
                self.is_upright = Some(*upright);
                if !*upright {
                    self.upright_hold_secs = 0;
                }
                return vec![];
            }
            ServiceEvent::Error { message } => {
                self.last_service_error = Some(message.clone());
                return vec![];
            }
            _ => {}
        }

        let completion = event.completion();
        if let ServiceEvent::TaskResult(payload) = event {
            self.latest_task_result = Some(payload.into_bundle());
        }

        let Some(signal) = completion else {
            return vec![];
        };
        if self.phase != SessionPhase::InProgress || self.paused {
            return vec![];
        }
        let step = self.active_step();
        let required_signal = step.required_signal;
        let upright_hold = step.upright_hold_secs;
        if required_signal != RequiredSignal::Event(signal) {
            return vec![];
        }
        if !matches!(
            self.step_status,
            StepStatus::Running | StepStatus::AwaitingConfirmation
        ) {
            return vec![];
        }

        if let Some(hold) = upright_hold {
            if self.upright_hold_secs < hold {
                self.completion_pending = true;
                self.step_status = StepStatus::AwaitingConfirmation;
                self.waiting = Some(Waiting::UprightHold);
                return vec![];
            }
        }

        self.complete_and_advance()
    }

    /// One second of countdown elapsed for the given generation.
    ///
    /// Ticks from a previous generation are no-ops; so are ticks while
    /// paused. Reaching zero never advances a step whose required signal
    /// is an external event — slow backends must not be outrun.
    pub fn on_tick(&mut self, generation: u64) -> Vec<Effect> {
        if generation != self.generation
            || self.paused
            || self.phase != SessionPhase::InProgress
        {
            return vec![];
        }

        if self.is_upright == Some(true) {
            self.upright_hold_secs += 1;
        }

        let step = self.active_step();
        let required_signal = step.required_signal;
        let advance_mode = step.advance_mode;
        let upright_hold = step.upright_hold_secs;

        // A completion held back by the upright gate fires as soon as the
        // hold is satisfied.
        if self.completion_pending {
            let satisfied = upright_hold.map_or(true, |hold| self.upright_hold_secs >= hold);
            if satisfied {
                return self.complete_and_advance();
            }
        }

        if self.step_status != StepStatus::Running {
            return vec![];
        }
        let Some(remaining) = self.time_remaining_secs else {
            return vec![];
        };
        let remaining = remaining.saturating_sub(1);
        self.time_remaining_secs = Some(remaining);
        if remaining > 0 {
            return vec![];
        }

        match (required_signal, advance_mode) {
            (RequiredSignal::Timer, AdvanceMode::AutoOnSignal) => {
                if let Some(hold) = upright_hold {
                    if self.upright_hold_secs < hold {
                        self.completion_pending = true;
                        self.step_status = StepStatus::AwaitingConfirmation;
                        self.waiting = Some(Waiting::UprightHold);
                        // keep the ticker alive: the gate needs a clock
                        return vec![];
                    }
                }
                self.complete_and_advance()
            }
            (RequiredSignal::Event(_), AdvanceMode::AutoOnSignal) => {
                self.step_status = StepStatus::AwaitingConfirmation;
                self.waiting = Some(Waiting::ExternalSignal);
                // With an upright gate the ticker stays alive so the gate
                // can still be satisfied after the countdown ends.
                if upright_hold.is_some() {
                    vec![]
                } else {
                    vec![Effect::CancelCountdown]
                }
            }
            (_, AdvanceMode::ManualPromptAfterTimer) => {
                self.step_status = StepStatus::AwaitingConfirmation;
                self.waiting = Some(Waiting::ManualConfirm);
                vec![Effect::CancelCountdown]
            }
        }
    }

    /// Explicit user confirmation. Valid only while a manual prompt, a
    /// resume-required condition or a scoring retry is pending.
    pub fn confirm_advance(&mut self) -> Result<Vec<Effect>, SessionError> {
        if self.link != LinkStatus::Connected {
            return Err(SessionError::NotAllowed(
                "cannot confirm while the sensor link is down".to_string(),
            ));
        }
        match self.waiting {
            Some(Waiting::ManualConfirm) => {
                self.waiting = None;
                Ok(self.complete_and_advance())
            }
            // Re-activate the current step under explicit user control:
            // fresh generation, command re-issued, full countdown.
            Some(Waiting::ResumeRequired) => Ok(self.activate_step()),
            Some(Waiting::ScoringRetry) => Ok(self.complete_and_advance()),
            _ => Err(SessionError::Sequencing(
                "no confirmation pending".to_string(),
            )),
        }
    }

    /// Reset to `Idle`, cancelling the countdown. The link status is the
    /// channel's business and survives the reset.
    pub fn restart(&mut self) -> Vec<Effect> {
        self.generation += 1;
        self.phase = SessionPhase::Idle;
        self.step_index = 0;
        self.step_status = StepStatus::NotStarted;
        self.time_remaining_secs = None;
        self.paused = false;
        self.waiting = None;
        self.upright_hold_secs = 0;
        self.completion_pending = false;
        self.last_event = None;
        self.last_service_error = None;
        self.scoring_error = None;
        self.latest_task_result = None;
        self.computed = None;
        vec![Effect::CancelCountdown]
    }

    fn activate_step(&mut self) -> Vec<Effect> {
        self.generation += 1;
        self.step_status = StepStatus::Running;
        self.paused = false;
        self.waiting = None;
        self.completion_pending = false;
        self.upright_hold_secs = 0;

        let step = self.active_step();
        let seconds = step.nominal_duration_secs;
        let command = step.command.clone();
        self.time_remaining_secs = Some(seconds);
        vec![
            Effect::Send(command),
            Effect::StartCountdown {
                generation: self.generation,
                seconds,
            },
        ]
    }

    fn complete_and_advance(&mut self) -> Vec<Effect> {
        self.step_status = StepStatus::Complete;
        self.waiting = None;
        self.completion_pending = false;

        if self.step_index + 1 < self.config.steps.len() {
            self.step_index += 1;
            let mut effects = vec![Effect::CancelCountdown];
            effects.extend(self.activate_step());
            return effects;
        }

        // Final step: score it if it is the designated task, then finish.
        if self.active_step().scored {
            let scored = match self.latest_task_result.as_ref() {
                Some(bundle) => {
                    RiskEngine::score(bundle, &self.baseline, &self.config.thresholds)
                }
                None => Err(SessionError::ScoringInput(
                    "no task result was delivered for the scored step".to_string(),
                )),
            };
            match scored {
                Ok(result) => {
                    self.computed = Some(result);
                    self.scoring_error = None;
                }
                Err(e) => {
                    self.step_status = StepStatus::AwaitingConfirmation;
                    self.waiting = Some(Waiting::ScoringRetry);
                    self.scoring_error = Some(e.to_string());
                    return vec![Effect::CancelCountdown];
                }
            }
        }

        self.phase = SessionPhase::Finished;
        self.time_remaining_secs = None;
        vec![Effect::CancelCountdown]
    }

    /// Project the current state for observers
    pub fn snapshot(&self) -> SessionSnapshot {
        let step = (self.phase != SessionPhase::Idle).then(|| self.active_step());
        SessionSnapshot {
            link: self.link,
            phase: self.phase,
            step_index: self.step_index,
            step_count: self.config.steps.len(),
            step_id: step.map(|s| s.id.clone()),
            step_title: step.map(|s| s.title.clone()),
            instruction: step.map(|s| s.instruction.clone()),
            step_status: self.step_status,
            time_remaining_secs: self.time_remaining_secs,
            waiting: self.waiting,
            paused: self.paused,
            is_upright: self.is_upright,
            last_event: self.last_event.map(str::to_string),
            last_service_error: self.last_service_error.clone(),
            scoring_error: self.scoring_error.clone(),
            result: self.computed.clone(),
        }
    }

    /// The last computed risk result, if the session has one
    pub fn result(&self) -> Option<&RiskResult> {
        self.computed.as_ref()
    }
}
