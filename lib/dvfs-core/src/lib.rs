// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! The DVFS coordinator.
//!
//! This crate ties the four engines together into the flow a cpufreq-style
//! policy layer actually calls:
//!
//! 1. a frequency request resolves to an operating point
//!    ([`opp_table::OppTable::find_ceil`]);
//! 2. the voltage engine moves the domain (and any supporting domains, in
//!    dependency order) to the point's operating voltage, before the clock
//!    commit when raising, after it when lowering;
//! 3. the clock tree commits the rate and propagates it to dependent
//!    clocks with pre/post notifications;
//! 4. if the point has no calibrated voltage yet, the AVS engine starts
//!    calibrating it; once a verdict lands, [`Dvfs::poll`] writes the
//!    settled voltage back into the operating-point table and nudges the
//!    rail onto it, so every later transition to that point uses the
//!    calibrated value.
//!
//! The whole coordinator is one owned value. `&mut self` is the lock:
//! rate changes, voltage moves, and calibration rounds are serialized by
//! construction, while calibration of different domains still interleaves
//! freely across ticks.

#![cfg_attr(not(test), no_std)]

pub use avs_loop::{CalOutcome, CalState, Calibrator, CalTarget};
pub use clock_tree::{
    ClockId, ClockTree, RateEvent, RateObserver, RatePhase, Recompute,
};
pub use opp_table::{OppEntry, OppTable};
pub use volt_scale::VoltScale;

use drv_dvfs_api::{
    AvsSampler, ClockBackend, Hertz, Microvolts, PmError, VoltageRail,
};
use heapless::Vec;
use tracebuf::TraceBuf;

pub const MAX_CLOCKS: usize = 32;
pub const MAX_OPPS: usize = 48;
pub const MAX_DOMAINS: usize = 8;
pub const MAX_DEP_EDGES: usize = 8;

const TRACE_DEPTH: usize = 32;

#[derive(Copy, Clone, Debug, PartialEq)]
enum Trace {
    Committed(&'static str, Hertz, Microvolts),
    Calibrated(&'static str, Microvolts),
    WritebackMiss(&'static str),
    PostCalScaleFailed(&'static str),
}

#[derive(Copy, Clone, Debug)]
struct Binding {
    domain: &'static str,
    clock: ClockId,
    /// Frequency of the operating point the domain currently runs at.
    active: Option<Hertz>,
}

/// The assembled subsystem: clock tree over `C`, rails over `R`, AVS
/// sampler `S`.
pub struct Dvfs<C, R, S> {
    clocks: ClockTree<C, MAX_CLOCKS>,
    opps: OppTable<MAX_OPPS>,
    volt: VoltScale<R, MAX_DOMAINS, MAX_DEP_EDGES>,
    cal: Calibrator<S, MAX_DOMAINS>,
    bindings: Vec<Binding, MAX_DOMAINS>,
    trace: TraceBuf<Trace, TRACE_DEPTH>,
}

impl<C, R, S> Dvfs<C, R, S>
where
    C: ClockBackend,
    R: VoltageRail,
    S: AvsSampler,
{
    pub fn new(clock_backend: C, rail: R, sampler: S) -> Self {
        Self {
            clocks: ClockTree::new(clock_backend),
            opps: OppTable::new(),
            volt: VoltScale::new(rail),
            cal: Calibrator::new(sampler),
            bindings: Vec::new(),
            trace: TraceBuf::new(),
        }
    }

    // --- board-init registration surface ---

    pub fn register_clock(
        &mut self,
        name: &'static str,
        parent: Option<ClockId>,
        rule: Recompute,
    ) -> Result<ClockId, PmError> {
        self.clocks.register(name, parent, rule)
    }

    pub fn add_opp(
        &mut self,
        domain: &'static str,
        freq: Hertz,
        volt_nominal: Microvolts,
        available: bool,
    ) -> Result<(), PmError> {
        self.opps.add(domain, freq, volt_nominal, available)
    }

    pub fn add_dependency(
        &mut self,
        main: &'static str,
        dep: &'static str,
        table: &'static [(Microvolts, Microvolts)],
    ) -> Result<(), PmError> {
        self.volt.add_edge(main, dep, table)
    }

    /// Ties a voltage domain to the clock that carries its operating
    /// frequency.
    pub fn bind_domain(
        &mut self,
        domain: &'static str,
        clock: ClockId,
    ) -> Result<(), PmError> {
        if self.binding_index(domain).is_some() {
            return Err(PmError::DuplicateName);
        }
        self.bindings
            .push(Binding {
                domain,
                clock,
                active: None,
            })
            .map_err(|_| PmError::TableFull)
    }

    /// Speed-binning hook, forwarded to the operating-point table.
    pub fn set_opp_available(
        &mut self,
        domain: &str,
        freq: Hertz,
        available: bool,
    ) -> Result<(), PmError> {
        self.opps.set_available(domain, freq, available)
    }

    pub fn subscribe(
        &mut self,
        clock: ClockId,
        token: u32,
    ) -> Result<(), PmError> {
        self.clocks.subscribe(clock, token)
    }

    pub fn unsubscribe(
        &mut self,
        clock: ClockId,
        token: u32,
    ) -> Result<(), PmError> {
        self.clocks.unsubscribe(clock, token)
    }

    pub fn enable_clock(&mut self, id: ClockId) -> Result<(), PmError> {
        self.clocks.enable(id)
    }

    pub fn disable_clock(&mut self, id: ClockId) -> Result<(), PmError> {
        self.clocks.disable(id)
    }

    // --- runtime surface ---

    /// The DVFS entry point: moves `domain` to the cheapest operating
    /// point at or above `min_freq` and returns the committed frequency.
    ///
    /// Raising transitions scale voltage before the rate commit; lowering
    /// transitions commit the rate first. Either way the voltage engine
    /// orders supporting-domain moves around the main commit. On the first
    /// transition to a not-yet-calibrated point, AVS calibration starts
    /// for it; feed [`Dvfs::poll`] to let it settle.
    ///
    /// On failure the domain stays wherever the last successful commit
    /// left it; callers log and keep running at the previous point.
    pub fn request(
        &mut self,
        domain: &'static str,
        min_freq: Hertz,
        now: u64,
        observer: &mut dyn RateObserver,
    ) -> Result<Hertz, PmError> {
        let b = self.binding_index(domain).ok_or(PmError::NotFound)?;
        let clock = self.bindings[b].clock;

        let opp = self
            .opps
            .find_ceil(domain, min_freq)
            .ok_or(PmError::NotFound)?;
        let freq = opp.freq;
        let volt = opp.operating_voltage();
        let target = CalTarget {
            domain,
            freq,
            volt_nominal: opp.volt_nominal,
            volt_calibrated: opp.volt_calibrated,
        };

        let raising =
            self.volt.current(domain).map_or(true, |cur| volt >= cur);
        if raising {
            self.volt.scale(domain, volt)?;
            self.clocks.set_rate(clock, freq, observer)?;
        } else {
            self.clocks.set_rate(clock, freq, observer)?;
            self.volt.scale(domain, volt)?;
        }
        self.trace.record(Trace::Committed(domain, freq, volt));

        if self.bindings[b].active != Some(freq) {
            // New operating point: whatever round was in flight for the
            // old one is meaningless now.
            self.cal.disable(domain);
            self.cal.enable(target, now)?;
            self.bindings[b].active = Some(freq);
        }
        Ok(freq)
    }

    /// Drives calibration. Every terminal outcome is written back into
    /// the operating-point table, and if the settled voltage differs from
    /// what the rail currently holds, one dependency-ordered transition
    /// moves it there. Calibration trouble is traced, never returned.
    pub fn poll(&mut self, now: u64) -> Vec<CalOutcome, MAX_DOMAINS> {
        let outcomes = self.cal.poll(now);
        for out in &outcomes {
            if self
                .opps
                .set_calibrated_voltage(out.domain, out.freq, out.volt)
                .is_err()
            {
                self.trace.record(Trace::WritebackMiss(out.domain));
                continue;
            }
            self.trace.record(Trace::Calibrated(out.domain, out.volt));
            if self.volt.current(out.domain) != Some(out.volt)
                && self.volt.scale(out.domain, out.volt).is_err()
            {
                self.trace.record(Trace::PostCalScaleFailed(out.domain));
            }
        }
        outcomes
    }

    /// Throws away `domain`'s calibrated voltages and, if an operating
    /// point is active, calibrates it afresh. Periodic recalibration uses
    /// this to chase aging and temperature drift.
    pub fn recalibrate(
        &mut self,
        domain: &'static str,
        now: u64,
    ) -> Result<(), PmError> {
        let b = self.binding_index(domain).ok_or(PmError::NotFound)?;
        self.opps.invalidate_calibration(domain);
        if let Some(freq) = self.bindings[b].active {
            let opp = self
                .opps
                .find_exact(domain, freq)
                .ok_or(PmError::NotFound)?;
            let target = CalTarget {
                domain,
                freq,
                volt_nominal: opp.volt_nominal,
                volt_calibrated: opp.volt_calibrated,
            };
            self.cal.disable(domain);
            self.cal.enable(target, now)?;
        }
        Ok(())
    }

    /// Earliest pending calibration deadline, if any.
    pub fn next_cal_deadline(&self) -> Option<u64> {
        self.cal.next_deadline()
    }

    // --- read-only views ---

    pub fn active_opp(&self, domain: &str) -> Option<Hertz> {
        self.bindings
            .iter()
            .find(|b| b.domain == domain)
            .and_then(|b| b.active)
    }

    pub fn rail_voltage(&self, domain: &str) -> Option<Microvolts> {
        self.volt.current(domain)
    }

    pub fn clock_rate(&self, id: ClockId) -> Hertz {
        self.clocks.rate(id)
    }

    pub fn cal_state(&self, domain: &str) -> CalState {
        self.cal.state(domain)
    }

    pub fn opp_table(&self) -> &OppTable<MAX_OPPS> {
        &self.opps
    }

    fn binding_index(&self, domain: &str) -> Option<usize> {
        self.bindings.iter().position(|b| b.domain == domain)
    }
}
