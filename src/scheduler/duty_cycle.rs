/// Phase bookkeeping for the aerator duty cycle
///
/// Each ON or OFF phase gets exactly three reads, at 1/3, 2/3 and 3/3 of the
/// nominal phase duration, all anchored to the phase start. A relay flip
/// starts a fresh phase; a phase that overruns never gets a fourth read.
use std::time::Duration;

use tokio::time::Instant;

use crate::utils::scale_duration;

pub const READS_PER_PHASE: u8 = 3;

#[derive(Debug, Clone, PartialEq)]
pub struct DutyCycleState {
    pub relay_state: bool,
    pub phase_start_time: Instant,
    pub read_count: u8,
    pub read_interval: Duration,
    pub next_target_time: Instant,
    speed_factor: f64,
}

impl DutyCycleState {
    fn target_for(&self, read_index: u8) -> Instant {
        self.phase_start_time + self.read_interval * u32::from(read_index + 1)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TickOutcome {
    /// First observation; a phase was opened.
    Started { relay_state: bool },
    /// Relay flipped; counters were reset for the new phase.
    PhaseChanged { relay_state: bool },
    /// A read is due now. `read_index` is 1-based within the phase.
    Capture { relay_state: bool, read_index: u8 },
    Idle,
}

#[derive(Debug, Clone)]
pub struct DutyCycle {
    on_duration: Duration,
    off_duration: Duration,
    state: Option<DutyCycleState>,
}

impl DutyCycle {
    /// Nominal (speed factor 1.0) durations of the ON and OFF phases.
    pub fn new(on_duration: Duration, off_duration: Duration) -> Self {
        DutyCycle {
            on_duration,
            off_duration,
            state: None,
        }
    }

    pub fn state(&self) -> Option<&DutyCycleState> {
        self.state.as_ref()
    }

    fn read_interval(&self, relay_state: bool, speed_factor: f64) -> Duration {
        let base = if relay_state {
            self.on_duration
        } else {
            self.off_duration
        };
        scale_duration(base, speed_factor) / u32::from(READS_PER_PHASE)
    }

    fn begin_phase(&mut self, relay_state: bool, now: Instant, speed_factor: f64) {
        let read_interval = self.read_interval(relay_state, speed_factor);
        self.state = Some(DutyCycleState {
            relay_state,
            phase_start_time: now,
            read_count: 0,
            read_interval,
            next_target_time: now + read_interval,
            speed_factor,
        });
    }

    /// Feed one relay sample. At most one read is due per tick.
    pub fn tick(&mut self, relay_state: bool, now: Instant, speed_factor: f64) -> TickOutcome {
        let Some(current) = self.state.as_ref() else {
            self.begin_phase(relay_state, now, speed_factor);
            return TickOutcome::Started { relay_state };
        };
        if current.relay_state != relay_state {
            self.begin_phase(relay_state, now, speed_factor);
            return TickOutcome::PhaseChanged { relay_state };
        }

        let read_interval = self.read_interval(relay_state, speed_factor);
        let Some(state) = self.state.as_mut() else {
            return TickOutcome::Idle;
        };

        // speed factor changed mid-phase: re-anchor the remaining targets
        if state.speed_factor != speed_factor {
            state.speed_factor = speed_factor;
            state.read_interval = read_interval;
            if state.read_count < READS_PER_PHASE {
                state.next_target_time = state.target_for(state.read_count);
            }
        }

        if state.read_count >= READS_PER_PHASE || now < state.next_target_time {
            return TickOutcome::Idle;
        }

        state.read_count += 1;
        if state.read_count < READS_PER_PHASE {
            state.next_target_time = state.target_for(state.read_count);
        }
        TickOutcome::Capture {
            relay_state,
            read_index: state.read_count,
        }
    }
}
