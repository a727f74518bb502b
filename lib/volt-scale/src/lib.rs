// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Dependency-ordered voltage scaling.
//!
//! Some voltage domains cannot run at a given voltage unless a supporting
//! domain is at least at some floor of its own. On OMAP-class parts the
//! MPU domain's upper operating points require the CORE interconnect domain
//! to hold a minimum voltage. Those constraints are dependency edges: for a
//! main domain, an ordered table of `(main voltage, dependent voltage)`
//! breakpoints, matched by nearest ceiling on the main voltage.
//!
//! [`VoltScale::scale`] commits a transition so the constraint holds at
//! every instant:
//!
//! - dependent domains that must *rise* are committed before the main
//!   domain moves;
//! - dependent domains that may *relax* are committed after.
//!
//! A failed rail commit aborts the remaining commits and surfaces the first
//! error; domains already committed stay where they are. Callers recover by
//! staying at the last-known-good operating point, so an unwind here would
//! only add a second chance to fail.

#![cfg_attr(not(test), no_std)]

use drv_dvfs_api::{Microvolts, PmError, VoltageRail};
use heapless::Vec;
use tracebuf::TraceBuf;

const TRACE_DEPTH: usize = 16;

/// A voltage-dependency edge: while `main` runs at a given voltage,
/// `dep` must hold at least the mapped voltage.
#[derive(Copy, Clone, Debug)]
pub struct DepEdge {
    pub main: &'static str,
    pub dep: &'static str,
    /// `(main voltage, dependent floor)` breakpoints, strictly increasing
    /// in the main voltage.
    pub table: &'static [(Microvolts, Microvolts)],
}

#[derive(Copy, Clone, Debug, PartialEq)]
enum Trace {
    Committed(&'static str, Microvolts),
    CommitFailed(&'static str),
    ClampedAboveTable(&'static str),
}

/// Voltage scaling engine over rail backend `R`: up to `D` tracked domains
/// and `E` dependency edges.
pub struct VoltScale<R, const D: usize, const E: usize> {
    rail: R,
    edges: Vec<DepEdge, E>,
    /// Last voltage committed per domain. Domains we have never touched
    /// are absent, and their first transition is treated as a raise.
    current: Vec<(&'static str, Microvolts), D>,
    trace: TraceBuf<Trace, TRACE_DEPTH>,
}

impl<R: VoltageRail, const D: usize, const E: usize> VoltScale<R, D, E> {
    pub fn new(rail: R) -> Self {
        Self {
            rail,
            edges: Vec::new(),
            current: Vec::new(),
            trace: TraceBuf::new(),
        }
    }

    /// Registers a dependency edge. The breakpoint table must be nonempty
    /// and strictly increasing in its main voltage.
    pub fn add_edge(
        &mut self,
        main: &'static str,
        dep: &'static str,
        table: &'static [(Microvolts, Microvolts)],
    ) -> Result<(), PmError> {
        if table.is_empty()
            || table.windows(2).any(|w| w[0].0 >= w[1].0)
        {
            return Err(PmError::BadArg);
        }
        if self
            .edges
            .iter()
            .any(|e| e.main == main && e.dep == dep)
        {
            return Err(PmError::DuplicateName);
        }
        self.edges
            .push(DepEdge { main, dep, table })
            .map_err(|_| PmError::TableFull)
    }

    /// Last committed voltage of `domain`, if any transition has run.
    pub fn current(&self, domain: &str) -> Option<Microvolts> {
        self.current
            .iter()
            .find(|&&(d, _)| d == domain)
            .map(|&(_, v)| v)
    }

    /// Moves `domain` to `target`, first raising any dependent domains to
    /// their new floors and afterwards relaxing the ones that may drop.
    pub fn scale(
        &mut self,
        domain: &'static str,
        target: Microvolts,
    ) -> Result<(), PmError> {
        // Raises of supporting domains come first: the constraint must
        // hold while the main domain moves up.
        for i in 0..self.edges.len() {
            let edge = self.edges[i];
            if edge.main != domain {
                continue;
            }
            let required = self.dependent_floor(&edge, target);
            if self.current(edge.dep).map_or(true, |cur| required > cur) {
                self.commit(edge.dep, required)?;
            }
        }

        if self.current(domain) != Some(target) {
            self.commit(domain, target)?;
        }

        // Now that the main domain is down (or unchanged), supporting
        // domains may relax.
        for i in 0..self.edges.len() {
            let edge = self.edges[i];
            if edge.main != domain {
                continue;
            }
            let required = self.dependent_floor(&edge, target);
            if self
                .current(edge.dep)
                .is_some_and(|cur| required < cur)
            {
                self.commit(edge.dep, required)?;
            }
        }

        Ok(())
    }

    fn dependent_floor(
        &mut self,
        edge: &DepEdge,
        main_volt: Microvolts,
    ) -> Microvolts {
        match edge.table.iter().find(|&&(main, _)| main >= main_volt) {
            Some(&(_, dep)) => dep,
            None => {
                // Above the last breakpoint: hold the highest floor the
                // table knows about.
                self.trace.record(Trace::ClampedAboveTable(edge.dep));
                edge.table[edge.table.len() - 1].1
            }
        }
    }

    fn commit(
        &mut self,
        domain: &'static str,
        volt: Microvolts,
    ) -> Result<(), PmError> {
        if let Err(e) = self.rail.set_voltage(domain, volt) {
            self.trace.record(Trace::CommitFailed(domain));
            return Err(e);
        }
        self.trace.record(Trace::Committed(domain, volt));
        if let Some(slot) = self
            .current
            .iter_mut()
            .find(|&&mut (d, _)| d == domain)
        {
            slot.1 = volt;
            return Ok(());
        }
        self.current
            .push((domain, volt))
            .map_err(|_| PmError::TableFull)
    }
}
