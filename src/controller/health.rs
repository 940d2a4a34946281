use super::{
    error::OperationError,
    events::{Bus as EventBus, Event},
};
use crate::{
    config::HealthConfig,
    mediamtx::api,
    util::{
        async_flag, event_bus,
        runnable::{Exited, Runnable},
    },
};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::{future::FutureExt, select};
use parking_lot::Mutex;
use std::{
    fmt,
    sync::Arc,
    time::{Duration, Instant},
};

#[derive(derive_more::Display, Clone, Copy, PartialEq, Eq, Debug)]
pub enum HealthStatus {
    #[display("HEALTHY")]
    Healthy,
    #[display("UNHEALTHY")]
    Unhealthy,
    #[display("DISABLED")]
    Disabled,
}

#[derive(derive_more::Display, Clone, Copy, PartialEq, Eq, Debug)]
pub enum CircuitState {
    #[display("CLOSED")]
    Closed,
    #[display("HALF_OPEN")]
    HalfOpen,
    #[display("OPEN")]
    Open,
}

/// Externally visible health metrics.
#[derive(Clone, Debug)]
pub struct StateSnapshot {
    pub status: HealthStatus,
    pub circuit_state: CircuitState,
    pub failure_count: u32,
    pub last_check: Option<DateTime<Utc>>,
    pub last_success: Option<DateTime<Utc>>,
    pub last_failure: Option<DateTime<Utc>>,
    pub check_interval: Duration,
}

#[derive(Debug)]
struct State {
    status: HealthStatus,
    circuit: CircuitState,
    failure_count: u32,
    opened_at: Option<Instant>,
    last_check: Option<DateTime<Utc>>,
    last_success: Option<DateTime<Utc>>,
    last_failure: Option<DateTime<Utc>>,
}
impl State {
    fn new(status: HealthStatus) -> Self {
        Self {
            status,
            circuit: CircuitState::Closed,
            failure_count: 0,
            opened_at: None,
            last_check: None,
            last_success: None,
            last_failure: None,
        }
    }

    /// OPEN moves to HALF_OPEN once the recovery timeout elapsed; the next
    /// probe is the trial. The only entry into HALF_OPEN.
    fn trial_advance(
        &mut self,
        now: Instant,
        recovery_timeout: Duration,
    ) {
        if self.circuit == CircuitState::Open
            && self
                .opened_at
                .is_some_and(|opened_at| now.duration_since(opened_at) >= recovery_timeout)
        {
            self.circuit = CircuitState::HalfOpen;
        }
    }

    /// Applies one probe result. Returns the new status when it changed,
    /// suppressing duplicate transitions.
    fn probe_apply(
        &mut self,
        success: bool,
        failure_threshold: u32,
        now: Instant,
        now_utc: DateTime<Utc>,
    ) -> Option<HealthStatus> {
        self.last_check = Some(now_utc);

        let status = if success {
            self.failure_count = 0;
            self.last_success = Some(now_utc);

            if self.circuit == CircuitState::HalfOpen {
                self.circuit = CircuitState::Closed;
                self.opened_at = None;
            }

            HealthStatus::Healthy
        } else {
            self.failure_count += 1;
            self.last_failure = Some(now_utc);

            match self.circuit {
                CircuitState::Closed if self.failure_count >= failure_threshold => {
                    self.circuit = CircuitState::Open;
                    self.opened_at = Some(now);
                }
                CircuitState::HalfOpen => {
                    self.circuit = CircuitState::Open;
                    self.opened_at = Some(now);
                }
                _ => {}
            }

            HealthStatus::Unhealthy
        };

        if status != self.status {
            self.status = status;
            Some(status)
        } else {
            None
        }
    }
}

/// Periodic server prober and circuit breaker. Probes run on a single
/// loop, so state transitions are totally ordered; regular outbound calls
/// consult [`Monitor::server_guard`] and never mutate breaker state.
#[derive(Debug)]
pub struct Monitor {
    config: HealthConfig,
    api: Arc<api::Client>,

    state: Mutex<State>,

    health_bus: event_bus::Bus<StateSnapshot>,
    events: Arc<EventBus>,
}
impl Monitor {
    pub fn new(
        config: HealthConfig,
        api: Arc<api::Client>,
        events: Arc<EventBus>,
    ) -> Self {
        let status_initial = if config.enabled {
            HealthStatus::Unhealthy
        } else {
            HealthStatus::Disabled
        };
        let state = State::new(status_initial);
        let state = Mutex::new(state);

        let health_bus = event_bus::Bus::new(16);

        Self {
            config,
            api,

            state,

            health_bus,
            events,
        }
    }

    pub fn snapshot(&self) -> StateSnapshot {
        let state = self.state.lock();
        StateSnapshot {
            status: state.status,
            circuit_state: state.circuit,
            failure_count: state.failure_count,
            last_check: state.last_check,
            last_success: state.last_success,
            last_failure: state.last_failure,
            check_interval: self.config.check_interval,
        }
    }

    /// Gate for outbound server calls. While the circuit is not CLOSED,
    /// calls short-circuit without touching the network.
    pub fn server_guard(&self) -> Result<(), OperationError> {
        if !self.config.enabled {
            return Ok(());
        }

        match self.state.lock().circuit {
            CircuitState::Closed => Ok(()),
            circuit => Err(OperationError::ServerUnavailable {
                message: format!("circuit {circuit}"),
            }),
        }
    }

    /// Non-blocking notifications on status transitions; slow consumers
    /// miss snapshots, they never block the monitor.
    pub fn subscribe(&self) -> event_bus::Subscriber<StateSnapshot> {
        self.health_bus.subscribe()
    }

    async fn probe_once(&self) -> bool {
        let probe = self.api.healthcheck();
        match tokio::time::timeout(self.config.probe_timeout, probe).await {
            Ok(Ok(())) => true,
            Ok(Err(error)) => {
                log::debug!("{}: probe failed: {}", self, error);
                false
            }
            Err(_) => {
                log::debug!("{}: probe timed out", self);
                false
            }
        }
    }

    async fn run(
        &self,
        mut exit_flag: async_flag::Receiver,
    ) -> Exited {
        if !self.config.enabled {
            exit_flag.await;
            return Exited;
        }

        loop {
            self.state
                .lock()
                .trial_advance(Instant::now(), self.config.recovery_timeout);

            let success = self.probe_once().await;

            let status_changed = self.state.lock().probe_apply(
                success,
                self.config.failure_threshold,
                Instant::now(),
                Utc::now(),
            );

            if let Some(status) = status_changed {
                let snapshot = self.snapshot();
                log::info!(
                    "{}: status {} (circuit {})",
                    self,
                    status,
                    snapshot.circuit_state
                );
                self.health_bus.publish(snapshot.clone());
                self.events.publish(Event::HealthChanged {
                    status,
                    details: format!(
                        "circuit {}, consecutive failures {}",
                        snapshot.circuit_state, snapshot.failure_count
                    ),
                    timestamp: Utc::now(),
                });
            }

            select! {
                () = tokio::time::sleep(self.config.check_interval).fuse() => {},
                () = exit_flag => break,
            }
        }

        Exited
    }
}
#[async_trait]
impl Runnable for Monitor {
    async fn run(
        &self,
        exit_flag: async_flag::Receiver,
    ) -> Exited {
        self.run(exit_flag).await
    }
}
impl fmt::Display for Monitor {
    fn fmt(
        &self,
        f: &mut fmt::Formatter<'_>,
    ) -> fmt::Result {
        write!(f, "health::Monitor")
    }
}

#[cfg(test)]
mod tests_state {
    use super::{CircuitState, HealthStatus, State};
    use chrono::Utc;
    use std::time::{Duration, Instant};

    const THRESHOLD: u32 = 3;
    const RECOVERY: Duration = Duration::from_secs(30);

    fn probe(
        state: &mut State,
        success: bool,
    ) -> Option<HealthStatus> {
        state.probe_apply(success, THRESHOLD, Instant::now(), Utc::now())
    }

    #[test]
    fn opens_after_threshold_failures() {
        let mut state = State::new(HealthStatus::Unhealthy);

        assert_eq!(probe(&mut state, true), Some(HealthStatus::Healthy));
        assert_eq!(state.circuit, CircuitState::Closed);

        assert_eq!(probe(&mut state, false), Some(HealthStatus::Unhealthy));
        assert_eq!(probe(&mut state, false), None);
        assert_eq!(state.circuit, CircuitState::Closed);

        assert_eq!(probe(&mut state, false), None);
        assert_eq!(state.circuit, CircuitState::Open);
        assert_eq!(state.failure_count, 3);
    }

    #[test]
    fn full_cycle_is_monotonic() {
        let mut state = State::new(HealthStatus::Unhealthy);

        for _ in 0..THRESHOLD {
            probe(&mut state, false);
        }
        assert_eq!(state.circuit, CircuitState::Open);

        // recovery not elapsed: stays OPEN
        state.trial_advance(Instant::now(), RECOVERY);
        assert_eq!(state.circuit, CircuitState::Open);

        // recovery elapsed: OPEN -> HALF_OPEN
        let later = Instant::now() + RECOVERY;
        state.trial_advance(later, RECOVERY);
        assert_eq!(state.circuit, CircuitState::HalfOpen);

        // trial success: HALF_OPEN -> CLOSED
        assert_eq!(probe(&mut state, true), Some(HealthStatus::Healthy));
        assert_eq!(state.circuit, CircuitState::Closed);
        assert_eq!(state.failure_count, 0);
    }

    #[test]
    fn half_open_failure_reopens() {
        let mut state = State::new(HealthStatus::Unhealthy);

        for _ in 0..THRESHOLD {
            probe(&mut state, false);
        }
        let later = Instant::now() + RECOVERY;
        state.trial_advance(later, RECOVERY);
        assert_eq!(state.circuit, CircuitState::HalfOpen);

        probe(&mut state, false);
        assert_eq!(state.circuit, CircuitState::Open);
        assert_eq!(state.failure_count, THRESHOLD + 1);
    }

    #[test]
    fn success_while_open_does_not_skip_states() {
        let mut state = State::new(HealthStatus::Unhealthy);

        for _ in 0..THRESHOLD {
            probe(&mut state, false);
        }
        assert_eq!(state.circuit, CircuitState::Open);

        // a stray success before the recovery timeout must not close the
        // circuit directly
        probe(&mut state, true);
        assert_eq!(state.circuit, CircuitState::Open);
    }
}
