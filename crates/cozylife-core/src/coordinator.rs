use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::{watch, Mutex};
use tokio::time::{interval, timeout, Instant, MissedTickBehavior};
use tracing::{debug, info, info_span, warn, Instrument, Span};

use crate::availability::Availability;
use crate::client::SwitchDriver;
use crate::config::CoordinatorConfig;
use crate::snapshot::{DeviceSnapshot, SnapshotError};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PollState {
    Idle,
    Polling,
    BackoffSkip,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PollQuality {
    pub polls_ok: u64,
    pub polls_err: u64,
    pub polls_skipped: u64,
    pub last_poll_ms: u128,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CoordinatorStatus {
    pub device: String,
    pub state: PollState,
    pub available: bool,
    pub consecutive_failures: u32,
    pub failure_threshold: u32,
    pub snapshot: Option<DeviceSnapshot>,
    pub last_error: Option<String>,
    pub last_poll: Option<DateTime<Utc>>,
    pub quality: PollQuality,
}

#[derive(Debug, Error)]
pub enum RefreshError {
    #[error("refresh exceeded {}ms", .0.as_millis())]
    Timeout(Duration),
    #[error("no data returned from device")]
    NoData,
    #[error("no data and no previous state during connect backoff")]
    NoDataDuringBackoff,
    #[error("parse failed: {0}")]
    Parse(#[from] SnapshotError),
}

enum Outcome {
    Updated(DeviceSnapshot),
    Skipped(DeviceSnapshot),
    Unparsable(SnapshotError),
    Failed(RefreshError),
}

pub struct PollingCoordinator<D: SwitchDriver> {
    driver: Arc<D>,
    config: CoordinatorConfig,
    availability: Mutex<Availability>,
    status: watch::Sender<CoordinatorStatus>,
    span: Span,
}

impl<D: SwitchDriver> PollingCoordinator<D> {
    pub fn new(driver: Arc<D>, config: CoordinatorConfig, device: impl Into<String>) -> Self {
        let device = device.into();
        let availability = Availability::new(config.failure_threshold);
        let (status, _) = watch::channel(CoordinatorStatus {
            device: device.clone(),
            state: PollState::Idle,
            available: availability.is_available(),
            consecutive_failures: 0,
            failure_threshold: availability.threshold(),
            snapshot: None,
            last_error: None,
            last_poll: None,
            quality: PollQuality::default(),
        });

        Self {
            driver,
            config,
            availability: Mutex::new(availability),
            status,
            span: info_span!("coordinator", %device),
        }
    }

    pub fn with_span(mut self, span: Span) -> Self {
        self.span = span;
        self
    }

    pub fn driver(&self) -> &Arc<D> {
        &self.driver
    }

    pub fn config(&self) -> &CoordinatorConfig {
        &self.config
    }

    pub fn status(&self) -> CoordinatorStatus {
        self.status.borrow().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<CoordinatorStatus> {
        self.status.subscribe()
    }

    pub fn snapshot(&self) -> Option<DeviceSnapshot> {
        self.status.borrow().snapshot.clone()
    }

    pub fn available(&self) -> bool {
        self.status.borrow().available
    }

    // First tick fires immediately.
    pub async fn run(&self) {
        let mut ticker = interval(self.config.poll_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            ticker.tick().await;
            let _ = self.refresh().await;
        }
    }

    pub async fn request_refresh(&self) {
        if let Err(err) = self.refresh().await {
            debug!(parent: &self.span, %err, "requested refresh failed");
        }
    }

    pub async fn set_power(&self, on: bool) -> bool {
        let ok = self.driver.send_command(on).instrument(self.span.clone()).await;
        if ok {
            info!(parent: &self.span, on, "switched");
            self.request_refresh().await;
        } else {
            warn!(parent: &self.span, on, "switch command failed");
        }
        ok
    }

    pub async fn refresh(&self) -> Result<DeviceSnapshot, RefreshError> {
        self.poll_cycle().instrument(self.span.clone()).await
    }

    async fn poll_cycle(&self) -> Result<DeviceSnapshot, RefreshError> {
        let mut availability = self.availability.lock().await;
        self.status.send_modify(|status| status.state = PollState::Polling);

        let started = Instant::now();
        let outcome = self.poll_once().await;
        let elapsed_ms = started.elapsed().as_millis();
        let now = Utc::now();

        match outcome {
            Outcome::Updated(snapshot) => {
                if availability.record_success() {
                    info!("device available again");
                }
                self.status.send_modify(|status| {
                    status.state = PollState::Idle;
                    status.snapshot = Some(snapshot.clone());
                    status.last_error = None;
                    status.last_poll = Some(now);
                    status.quality.polls_ok += 1;
                    status.quality.last_poll_ms = elapsed_ms;
                    Self::copy_availability(status, &availability);
                });
                Ok(snapshot)
            }
            Outcome::Skipped(previous) => {
                debug!("skipping poll during connect backoff");
                self.status.send_modify(|status| {
                    status.state = PollState::BackoffSkip;
                    status.last_poll = Some(now);
                    status.quality.polls_skipped += 1;
                    status.quality.last_poll_ms = elapsed_ms;
                });
                Ok(previous)
            }
            // The plug answered, so any earlier streak ends before this one counts.
            Outcome::Unparsable(err) => {
                availability.record_success();
                Err(self.record_failure(&mut availability, err.into(), now, elapsed_ms))
            }
            Outcome::Failed(err) => Err(self.record_failure(&mut availability, err, now, elapsed_ms)),
        }
    }

    fn record_failure(
        &self,
        availability: &mut Availability,
        err: RefreshError,
        now: DateTime<Utc>,
        elapsed_ms: u128,
    ) -> RefreshError {
        if availability.record_failure() {
            warn!(
                failures = availability.consecutive_failures(),
                threshold = availability.threshold(),
                %err,
                "device marked unavailable"
            );
        } else {
            debug!(failures = availability.consecutive_failures(), %err, "poll failed");
        }
        self.status.send_modify(|status| {
            status.state = PollState::Idle;
            status.last_error = Some(err.to_string());
            status.last_poll = Some(now);
            status.quality.polls_err += 1;
            status.quality.last_poll_ms = elapsed_ms;
            Self::copy_availability(status, availability);
        });
        err
    }

    async fn poll_once(&self) -> Outcome {
        let state = match timeout(self.config.refresh_timeout, self.driver.query_state()).await {
            Ok(state) => state,
            Err(_) => return Outcome::Failed(RefreshError::Timeout(self.config.refresh_timeout)),
        };

        match state {
            Some(raw) => match DeviceSnapshot::from_attributes(raw) {
                Ok(snapshot) => Outcome::Updated(snapshot),
                Err(err) => Outcome::Unparsable(err),
            },
            None if self.driver.is_backing_off() => match self.snapshot() {
                Some(previous) => Outcome::Skipped(previous),
                None => Outcome::Failed(RefreshError::NoDataDuringBackoff),
            },
            None => Outcome::Failed(RefreshError::NoData),
        }
    }

    fn copy_availability(status: &mut CoordinatorStatus, availability: &Availability) {
        status.available = availability.is_available();
        status.consecutive_failures = availability.consecutive_failures();
        status.failure_threshold = availability.threshold();
    }
}
