use serde::{Deserialize, Serialize};
use std::{fmt, time::Duration};
use tokio_util::sync::CancellationToken;

/// Returned by every wait that was interrupted by the cancellation token.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Cancelled;

impl fmt::Display for Cancelled {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "experiment cancelled")
    }
}

impl std::error::Error for Cancelled {}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    ControllerStartup,
    Settle,
    ServiceWarmup,
    PreGenerator,
    Stagger,
    Hold,
}
impl Phase {
    pub const ALL: [Phase; 6] = [
        Phase::ControllerStartup,
        Phase::Settle,
        Phase::ServiceWarmup,
        Phase::PreGenerator,
        Phase::Stagger,
        Phase::Hold,
    ];
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Phase::ControllerStartup => "controller startup",
            Phase::Settle => "settle",
            Phase::ServiceWarmup => "service warmup",
            Phase::PreGenerator => "pre-generator delay",
            Phase::Stagger => "generator stagger",
            Phase::Hold => "hold",
        };
        write!(f, "{}", name)
    }
}

/// Fixed waits of an experiment, in seconds.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
#[serde(default)]
pub struct Timeline {
    pub controller_startup: u64,
    pub settle: u64,
    pub service_warmup: u64,
    pub pre_generator: u64,
    pub stagger: u64,
    pub hold: u64,
}
impl Default for Timeline {
    fn default() -> Self {
        Timeline {
            controller_startup: 5,
            settle: 15,
            service_warmup: 10,
            pre_generator: 70,
            stagger: 10,
            hold: 600,
        }
    }
}
impl Timeline {
    /// A timeline without any waits, used for dry runs.
    pub fn instant() -> Self {
        Timeline {
            controller_startup: 0,
            settle: 0,
            service_warmup: 0,
            pre_generator: 0,
            stagger: 0,
            hold: 0,
        }
    }

    pub fn duration(&self, phase: Phase) -> Duration {
        let secs = match phase {
            Phase::ControllerStartup => self.controller_startup,
            Phase::Settle => self.settle,
            Phase::ServiceWarmup => self.service_warmup,
            Phase::PreGenerator => self.pre_generator,
            Phase::Stagger => self.stagger,
            Phase::Hold => self.hold,
        };
        Duration::from_secs(secs)
    }

    /// Time from the start of a run until shutdown begins, assuming every process starts
    /// immediately.
    ///
    /// # Arguments
    ///
    /// * generators - Number of load generators (the stagger sits between consecutive ones)
    /// * launches_controller - Whether the controller is started by the run itself
    pub fn scripted_duration(&self, generators: usize, launches_controller: bool) -> Duration {
        let mut total = self.duration(Phase::Settle)
            + self.duration(Phase::ServiceWarmup)
            + self.duration(Phase::PreGenerator)
            + self.duration(Phase::Hold)
            + self.duration(Phase::Stagger) * generators.saturating_sub(1) as u32;
        if launches_controller {
            total += self.duration(Phase::ControllerStartup);
        }
        total
    }

    pub fn phases(&self) -> impl Iterator<Item = (Phase, Duration)> + '_ {
        Phase::ALL
            .into_iter()
            .map(move |phase| (phase, self.duration(phase)))
    }

    pub async fn wait(&self, phase: Phase, token: &CancellationToken) -> Result<(), Cancelled> {
        pause(self.duration(phase), token).await
    }
}

/// Sleeps for `duration` unless the token is cancelled first.
pub async fn pause(duration: Duration, token: &CancellationToken) -> Result<(), Cancelled> {
    if token.is_cancelled() {
        return Err(Cancelled);
    }
    if duration.is_zero() {
        return Ok(());
    }

    tokio::select! {
        _ = tokio::time::sleep(duration) => Ok(()),
        _ = token.cancelled() => Err(Cancelled),
    }
}
