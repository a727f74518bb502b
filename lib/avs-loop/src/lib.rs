// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Adaptive voltage scaling calibration.
//!
//! A hardware comparator loop (the AVS sampler) can watch a voltage domain
//! and count oscillation events, signs that the domain is not stable at
//! its present voltage. This engine runs the calibration protocol on top
//! of that: open a sampling window, wait it out, read the counters, and
//! either accept the sampled voltage as the domain's calibrated value or
//! retry. A domain that never produces a clean window within
//! [`MAX_TRIGGERS`] rounds is declared oscillating and falls back to its
//! nominal voltage, which is always safe.
//!
//! The engine owns no timer. It keeps a deadline per in-flight domain and
//! the caller feeds time into [`Calibrator::poll`]; `poll` returns the
//! outcomes that became terminal at that tick. That makes the whole state
//! machine synchronous: [`Calibrator::disable`] removes the work item and
//! quiesces the sampler before returning, so no stale round can fire
//! afterwards.
//!
//! Sampler faults never escalate out of the engine. A failed counter or
//! voltage read degrades the round to "not clean", which retries and, on
//! the last round, falls back to nominal. A boot never hangs or dies on a
//! flaky comparator.

#![cfg_attr(not(test), no_std)]

use drv_dvfs_api::{AvsSampler, Hertz, Microvolts, PmError};
use heapless::Vec;
use tracebuf::TraceBuf;

/// Interval between hardware samples within one window, in milliseconds.
pub const SAMPLING_DELAY_MS: u64 = 1;

/// Samples that must agree before a window is considered stable.
pub const STABLE_SAMPLES: u64 = 5;

/// Timer rounds before an uncooperative domain is declared oscillating.
pub const MAX_TRIGGERS: u8 = 5;

/// Length of one sampling window.
const SAMPLING_WINDOW_MS: u64 = SAMPLING_DELAY_MS * STABLE_SAMPLES;

const TRACE_DEPTH: usize = 32;

/// Calibration state of one domain.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum CalState {
    /// Work item exists but no round is in flight.
    Idle,
    /// A sampling window is open; a deadline is pending.
    Sampling,
    /// Terminal: a clean window was observed and the sampled voltage
    /// accepted. Reported in outcomes; the stored item returns to `Idle`.
    Converged,
    /// Terminal: every round saw oscillation; nominal voltage accepted.
    Oscillating,
    /// No work item exists for the domain.
    Disabled,
}

/// What to calibrate: one operating point of one domain.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct CalTarget {
    pub domain: &'static str,
    pub freq: Hertz,
    pub volt_nominal: Microvolts,
    /// Already-settled voltage, zero if none. A nonzero value makes
    /// [`Calibrator::enable`] a no-op.
    pub volt_calibrated: Microvolts,
}

/// A finished calibration: `state` is `Converged` or `Oscillating` and
/// `volt` is the voltage to record for the operating point.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct CalOutcome {
    pub domain: &'static str,
    pub freq: Hertz,
    pub state: CalState,
    pub volt: Microvolts,
}

#[derive(Copy, Clone, Debug, PartialEq)]
enum Trace {
    Started(&'static str),
    WindowOpened(&'static str),
    DirtyWindow(&'static str),
    SamplerFault(&'static str),
    Converged(&'static str, Microvolts),
    Oscillating(&'static str, Microvolts),
    Cancelled(&'static str),
}

#[derive(Debug)]
struct WorkItem {
    state: CalState,
    domain: &'static str,
    freq: Hertz,
    volt_nominal: Microvolts,
    deadline: u64,
    num_triggers: u8,
    num_osc_samples: u8,
}

/// The calibration engine: up to `D` domains over sampler `S`.
pub struct Calibrator<S, const D: usize> {
    sampler: S,
    items: Vec<WorkItem, D>,
    trace: TraceBuf<Trace, TRACE_DEPTH>,
}

impl<S: AvsSampler, const D: usize> Calibrator<S, D> {
    pub fn new(sampler: S) -> Self {
        Self {
            sampler,
            items: Vec::new(),
            trace: TraceBuf::new(),
        }
    }

    /// Starts (or restarts) calibration of `target`'s operating point.
    ///
    /// Returns `Ok(false)` without touching hardware when the point
    /// already has a calibrated voltage. Sampler trouble while enabling is
    /// traced, not surfaced: the retry protocol will either recover or
    /// settle on nominal.
    pub fn enable(
        &mut self,
        target: CalTarget,
        now: u64,
    ) -> Result<bool, PmError> {
        if target.volt_calibrated.0 != 0 {
            return Ok(false);
        }

        if self
            .sampler
            .enable(target.domain, target.volt_nominal)
            .is_err()
        {
            self.trace.record(Trace::SamplerFault(target.domain));
        }

        let deadline = now + SAMPLING_WINDOW_MS;
        if let Some(item) = self.item_mut(target.domain) {
            item.state = CalState::Sampling;
            item.freq = target.freq;
            item.volt_nominal = target.volt_nominal;
            item.deadline = deadline;
            item.num_triggers = 0;
            item.num_osc_samples = 0;
        } else {
            self.items
                .push(WorkItem {
                    state: CalState::Sampling,
                    domain: target.domain,
                    freq: target.freq,
                    volt_nominal: target.volt_nominal,
                    deadline,
                    num_triggers: 0,
                    num_osc_samples: 0,
                })
                .map_err(|_| PmError::TableFull)?;
        }
        self.trace.record(Trace::Started(target.domain));
        Ok(true)
    }

    /// Stops calibration of `domain` and destroys its work item, pending
    /// deadline included, before returning. The sampler is quiesced only
    /// if a round was actually in flight. Any partially-converged result
    /// is discarded; calibrated voltages already written stand.
    ///
    /// Returns whether a round was in flight.
    pub fn disable(&mut self, domain: &str) -> bool {
        let Some(pos) =
            self.items.iter().position(|i| i.domain == domain)
        else {
            return false;
        };
        let in_flight = self.items[pos].state == CalState::Sampling;
        if in_flight {
            let name = self.items[pos].domain;
            if self.sampler.disable(name).is_err() {
                self.trace.record(Trace::SamplerFault(name));
            }
            self.trace.record(Trace::Cancelled(name));
        }
        self.items[pos..].rotate_left(1);
        self.items.pop();
        in_flight
    }

    fn item_mut(&mut self, domain: &str) -> Option<&mut WorkItem> {
        self.items.iter_mut().find(|i| i.domain == domain)
    }

    /// Calibration state of `domain`.
    pub fn state(&self, domain: &str) -> CalState {
        self.items
            .iter()
            .find(|i| i.domain == domain)
            .map_or(CalState::Disabled, |i| i.state)
    }

    /// Earliest pending deadline, for callers that want to sleep rather
    /// than tick blindly.
    pub fn next_deadline(&self) -> Option<u64> {
        self.items
            .iter()
            .filter(|i| i.state == CalState::Sampling)
            .map(|i| i.deadline)
            .min()
    }

    /// Feeds time into the engine, running one protocol round for every
    /// domain whose deadline has elapsed. Returns the outcomes that became
    /// terminal at this tick.
    pub fn poll(&mut self, now: u64) -> Vec<CalOutcome, D> {
        let mut out: Vec<CalOutcome, D> = Vec::new();
        for i in 0..self.items.len() {
            if self.items[i].state != CalState::Sampling
                || self.items[i].deadline > now
            {
                continue;
            }
            if let Some(outcome) = self.step(i, now) {
                // Cannot fail: at most one outcome per item.
                let _ = out.push(outcome);
            }
        }
        out
    }

    /// One timer round for item `i`.
    fn step(&mut self, i: usize, now: u64) -> Option<CalOutcome> {
        let domain = self.items[i].domain;
        self.items[i].num_triggers =
            self.items[i].num_triggers.saturating_add(1);

        // The first round only opens the window: clear anything pending
        // and start counting from a known state.
        if self.items[i].num_triggers == 1 {
            self.items[i].num_osc_samples = 0;
            self.open_window(i, now);
            return None;
        }

        if self.sampler.pause(domain).is_err() {
            self.trace.record(Trace::SamplerFault(domain));
        }

        // A failed counter read is indistinguishable from a dirty window,
        // and is treated as one.
        let clean = match self.sampler.oscillation_events(domain) {
            Ok(0) => true,
            Ok(_) => false,
            Err(_) => {
                self.trace.record(Trace::SamplerFault(domain));
                false
            }
        };

        if clean {
            match self.sampler.sampled_voltage(domain) {
                Ok(volt) => {
                    return Some(self.finish(
                        i,
                        CalState::Converged,
                        volt,
                    ));
                }
                Err(_) => {
                    // Stable, but we can't tell at what voltage; retry
                    // rather than record a guess.
                    self.trace.record(Trace::SamplerFault(domain));
                }
            }
        }

        self.items[i].num_osc_samples =
            self.items[i].num_osc_samples.saturating_add(1);
        self.trace.record(Trace::DirtyWindow(domain));

        if self.items[i].num_triggers >= MAX_TRIGGERS {
            let nominal = self.items[i].volt_nominal;
            return Some(self.finish(i, CalState::Oscillating, nominal));
        }

        self.open_window(i, now);
        None
    }

    fn open_window(&mut self, i: usize, now: u64) {
        let domain = self.items[i].domain;
        if self.sampler.rearm(domain).is_err() {
            self.trace.record(Trace::SamplerFault(domain));
        }
        self.items[i].deadline = now + SAMPLING_WINDOW_MS;
        self.trace.record(Trace::WindowOpened(domain));
    }

    /// Terminal transition: quiesce the sampler, return the item to
    /// `Idle`, and hand the accepted voltage to the caller.
    fn finish(
        &mut self,
        i: usize,
        state: CalState,
        volt: Microvolts,
    ) -> CalOutcome {
        let domain = self.items[i].domain;
        if self.sampler.disable(domain).is_err() {
            self.trace.record(Trace::SamplerFault(domain));
        }
        self.items[i].state = CalState::Idle;
        self.trace.record(match state {
            CalState::Oscillating => Trace::Oscillating(domain, volt),
            _ => Trace::Converged(domain, volt),
        });
        CalOutcome {
            domain,
            freq: self.items[i].freq,
            state,
            volt,
        }
    }
}
