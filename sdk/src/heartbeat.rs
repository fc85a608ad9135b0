//! Control-channel liveness checks and latency measurement.
//!
//! The schedule runs as a ticker task that posts [`HeartbeatTick`]s back to the
//! owning control channel. Each schedule has a generation; [`HeartbeatTimer::reset`]
//! and [`HeartbeatTimer::set_interval`] abort the previous ticker and bump the
//! generation, so a tick that was already queued is ignored by `on_tick`.

use async_channel::Sender;
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use voicegate_protocol::Outbound;

use crate::config::MissedAckPolicy;
use crate::error::SdkError;
use crate::event::EventSink;
use crate::transport::ControlLink;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HeartbeatTick {
    pub(crate) generation: u64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TickOutcome {
    Sent,
    /// Tick from a cancelled schedule, or no connection to send on.
    Stale,
    /// Too many consecutive heartbeats went unacknowledged.
    MissedAckLimit { missed: u32 },
    Failed(SdkError),
}

pub struct HeartbeatTimer {
    interval: Option<Duration>,
    last_sent: Option<Instant>,
    acked: bool,
    latency: Option<Duration>,
    missed: u32,
    generation: u64,
    schedule: Option<JoinHandle<()>>,
    ticks: Sender<HeartbeatTick>,
    policy: MissedAckPolicy,
    events: EventSink,
}

impl HeartbeatTimer {
    pub fn new(ticks: Sender<HeartbeatTick>, policy: MissedAckPolicy, events: EventSink) -> Self {
        Self {
            interval: None,
            last_sent: None,
            acked: false,
            latency: None,
            missed: 0,
            generation: 0,
            schedule: None,
            ticks,
            policy,
            events,
        }
    }

    /// Replaces any running schedule with one ticking every `interval`.
    /// The first tick fires one full interval from now.
    pub fn set_interval(&mut self, interval: Duration) -> Result<(), SdkError> {
        if interval.is_zero() {
            return Err(SdkError::InvalidInterval);
        }

        self.cancel_schedule();
        self.interval = Some(interval);
        self.events.debug(format!(
            "[heartbeat] Now sending a heartbeat every {} ms",
            interval.as_millis()
        ));

        let ticks = self.ticks.clone();
        let generation = self.generation;
        self.schedule = Some(tokio::spawn(async move {
            let mut ticker = tokio::time::interval_at(Instant::now() + interval, interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                if ticks.send(HeartbeatTick { generation }).await.is_err() {
                    break;
                }
            }
        }));

        Ok(())
    }

    /// Handles one scheduled tick.
    pub(crate) fn on_tick(&mut self, tick: HeartbeatTick, link: Option<&ControlLink>) -> TickOutcome {
        if tick.generation != self.generation || self.interval.is_none() {
            return TickOutcome::Stale;
        }
        let Some(link) = link else {
            return TickOutcome::Stale;
        };

        if self.last_sent.is_some() && !self.acked {
            self.missed += 1;
            self.events.debug(format!(
                "[heartbeat] Previous heartbeat unacknowledged ({} missed)",
                self.missed
            ));
            if let MissedAckPolicy::Reconnect { after } = self.policy {
                if self.missed >= after {
                    return TickOutcome::MissedAckLimit { missed: self.missed };
                }
            }
        }

        match self.send(link, "interval") {
            Ok(()) => TickOutcome::Sent,
            Err(e) => TickOutcome::Failed(e),
        }
    }

    /// Sends one heartbeat carrying the current Unix time in milliseconds.
    pub(crate) fn send(&mut self, link: &ControlLink, reason: &str) -> Result<(), SdkError> {
        if self.interval.is_none() {
            return Err(SdkError::HeartbeatUnscheduled);
        }

        self.events
            .debug(format!("[heartbeat] <{reason}> Sending a heartbeat"));
        link.send(&Outbound::Heartbeat { nonce: unix_millis() })?;
        self.acked = false;
        self.last_sent = Some(Instant::now());
        Ok(())
    }

    /// Records an acknowledgment. Returns the round-trip latency, or `None` if
    /// no heartbeat was in flight; a previous measurement is then kept.
    pub fn ack(&mut self) -> Option<Duration> {
        self.acked = true;
        self.missed = 0;

        let Some(sent) = self.last_sent else {
            self.events
                .debug("[heartbeat] Acknowledgment received with no heartbeat in flight");
            return None;
        };

        let latency = sent.elapsed();
        self.latency = Some(latency);
        self.events.debug(format!(
            "[heartbeat] Gateway acknowledged our heartbeat, latency: {} ms",
            latency.as_millis()
        ));
        Some(latency)
    }

    /// Cancels the schedule and clears interval, timestamps and ack state.
    pub fn reset(&mut self) {
        self.cancel_schedule();
        self.interval = None;
        self.last_sent = None;
        self.acked = false;
        self.missed = 0;
    }

    fn cancel_schedule(&mut self) {
        if let Some(schedule) = self.schedule.take() {
            schedule.abort();
        }
        self.generation += 1;
    }

    pub fn interval(&self) -> Option<Duration> {
        self.interval
    }

    pub fn is_acked(&self) -> bool {
        self.acked
    }

    pub fn latency(&self) -> Option<Duration> {
        self.latency
    }

    pub fn is_scheduled(&self) -> bool {
        self.schedule.as_ref().is_some_and(|s| !s.is_finished())
    }
}

impl Drop for HeartbeatTimer {
    fn drop(&mut self) {
        self.cancel_schedule();
    }
}

fn unix_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map_or(0, |d| u64::try_from(d.as_millis()).unwrap_or(u64::MAX))
}
