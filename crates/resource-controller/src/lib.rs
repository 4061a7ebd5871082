use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use serde::Serialize;
use thiserror::Error;
use tokio::sync::watch;
use tokio::time::sleep;
use tracing::{debug, info, warn};

use types::ResourceState;

const MILLIS_PER_HOUR: f64 = 3_600_000.0;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ControlError {
    #[error("invalid power setpoint '{input}': expected a non-negative integer number of watts")]
    InvalidWatts { input: String },
}

/// Parses a setpoint from its textual form.
pub fn parse_watts(input: &str) -> Result<u32, ControlError> {
    input
        .trim()
        .parse::<u32>()
        .map_err(|_| ControlError::InvalidWatts {
            input: input.to_string(),
        })
}

/// Power flow derived from the current setpoints.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum FlowMode {
    NoFlow,
    Importing,
    Exporting,
    Both,
}

impl FlowMode {
    pub fn from_state(state: &ResourceState) -> Self {
        match (state.import_watts > 0, state.export_watts > 0) {
            (false, false) => FlowMode::NoFlow,
            (true, false) => FlowMode::Importing,
            (false, true) => FlowMode::Exporting,
            (true, true) => FlowMode::Both,
        }
    }
}

/// Owns the import/export setpoints and the energy they have moved so far.
///
/// All four fields sit behind one lock, so `tick`, the setters and `snapshot` never
/// observe each other half-way.
#[derive(Debug, Default)]
pub struct ResourceController {
    state: Mutex<ResourceState>,
}

impl ResourceController {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_setpoints(import_watts: u32, export_watts: u32) -> Self {
        Self {
            state: Mutex::new(ResourceState {
                import_watts,
                export_watts,
                ..ResourceState::default()
            }),
        }
    }

    pub fn set_import_watts(&self, watts: u32) {
        self.lock().import_watts = watts;
        info!(watts, "import setpoint changed");
    }

    pub fn set_export_watts(&self, watts: u32) {
        self.lock().export_watts = watts;
        info!(watts, "export setpoint changed");
    }

    pub fn set_import_watts_str(&self, input: &str) -> Result<u32, ControlError> {
        let watts = parse_watts(input)?;
        self.set_import_watts(watts);
        Ok(watts)
    }

    pub fn set_export_watts_str(&self, input: &str) -> Result<u32, ControlError> {
        let watts = parse_watts(input)?;
        self.set_export_watts(watts);
        Ok(watts)
    }

    /// Integrates energy over `elapsed_ms` at the setpoints in force now.
    pub fn tick(&self, elapsed_ms: u64) -> ResourceState {
        let mut state = self.lock();
        if elapsed_ms > 0 {
            let hours = elapsed_ms as f64 / MILLIS_PER_HOUR;
            state.import_energy_wh += f64::from(state.import_watts) * hours;
            state.export_energy_wh += f64::from(state.export_watts) * hours;
        }
        *state
    }

    pub fn snapshot(&self) -> ResourceState {
        *self.lock()
    }

    pub fn mode(&self) -> FlowMode {
        FlowMode::from_state(&self.lock())
    }

    pub fn import_watts(&self) -> u32 {
        self.lock().import_watts
    }

    pub fn export_watts(&self) -> u32 {
        self.lock().export_watts
    }

    pub fn import_energy_wh(&self) -> f64 {
        self.lock().import_energy_wh
    }

    pub fn export_energy_wh(&self) -> f64 {
        self.lock().export_energy_wh
    }

    fn lock(&self) -> MutexGuard<'_, ResourceState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[derive(Debug, Clone)]
pub struct LoopConfig {
    pub tick_interval: Duration,
}

impl Default for LoopConfig {
    fn default() -> Self {
        Self {
            tick_interval: Duration::from_millis(500),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct LoopStats {
    pub ticks: u64,
    pub overruns: u64,
    pub integrated_ms: u64,
}

/// Remaining part of the cycle budget after `spent`; never negative.
pub fn remaining_budget(period: Duration, spent: Duration) -> Duration {
    period.saturating_sub(spent)
}

/// Hands out whole elapsed milliseconds, carrying the sub-millisecond remainder forward.
#[derive(Debug)]
struct TickClock {
    last: Instant,
}

impl TickClock {
    fn new(start: Instant) -> Self {
        Self { last: start }
    }

    fn advance(&mut self, now: Instant) -> u64 {
        let elapsed_ms = now.saturating_duration_since(self.last).as_millis() as u64;
        self.last += Duration::from_millis(elapsed_ms);
        elapsed_ms
    }
}

/// Timer task driving [`ResourceController::tick`] on a self-correcting cadence.
pub struct ControlLoop {
    controller: Arc<ResourceController>,
    shutdown: watch::Receiver<bool>,
    config: LoopConfig,
}

impl ControlLoop {
    pub fn new(
        controller: Arc<ResourceController>,
        shutdown: watch::Receiver<bool>,
        config: LoopConfig,
    ) -> Self {
        Self {
            controller,
            shutdown,
            config,
        }
    }

    pub async fn run(mut self) -> LoopStats {
        let period = self.config.tick_interval;
        let mut clock = TickClock::new(Instant::now());
        let mut stats = LoopStats::default();

        loop {
            if *self.shutdown.borrow() {
                info!("control loop shutdown requested");
                break;
            }

            let cycle_start = Instant::now();
            let elapsed_ms = clock.advance(cycle_start);
            let state = self.controller.tick(elapsed_ms);
            record(&mut stats, elapsed_ms, &state);

            let spent = cycle_start.elapsed();
            let delay = remaining_budget(period, spent);
            if spent > period {
                stats.overruns += 1;
                metrics::counter!("der_tick_overruns_total").increment(1);
                warn!(
                    spent_ms = spent.as_millis(),
                    period_ms = period.as_millis(),
                    "control tick overran its period"
                );
            }
            debug!(
                elapsed_ms,
                spent_us = spent.as_micros(),
                delay_ms = delay.as_millis(),
                import_energy_wh = state.import_energy_wh,
                export_energy_wh = state.export_energy_wh,
                "control tick complete"
            );

            if self.sleep_or_shutdown(delay).await {
                info!("control loop shutdown requested");
                break;
            }
        }

        // settle the partial interval since the last tick
        let elapsed_ms = clock.advance(Instant::now());
        let state = self.controller.tick(elapsed_ms);
        record(&mut stats, elapsed_ms, &state);
        info!(
            ticks = stats.ticks,
            overruns = stats.overruns,
            integrated_ms = stats.integrated_ms,
            "control loop stopped"
        );
        stats
    }

    /// Sleeps for `delay` unless shutdown is raised first. A watch update that leaves the
    /// flag unset keeps the original deadline. Returns `true` on shutdown.
    async fn sleep_or_shutdown(&mut self, delay: Duration) -> bool {
        let wake = sleep(delay);
        tokio::pin!(wake);
        loop {
            tokio::select! {
                _ = &mut wake => return false,
                changed = self.shutdown.changed() => {
                    if changed.is_err() || *self.shutdown.borrow() {
                        return true;
                    }
                }
            }
        }
    }
}

fn record(stats: &mut LoopStats, elapsed_ms: u64, state: &ResourceState) {
    stats.ticks += 1;
    stats.integrated_ms += elapsed_ms;
    metrics::counter!("der_ticks_total").increment(1);
    metrics::gauge!("der_import_energy_wh").set(state.import_energy_wh);
    metrics::gauge!("der_export_energy_wh").set(state.export_energy_wh);
}
