// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Operating-point tables.
//!
//! An operating point (OPP) pairs a frequency with the voltage a domain
//! needs to run there. The table keeps one flat array sorted by
//! `(domain, frequency)`, so per-domain lookups are a binary search to the
//! boundary plus a short scan over that domain's contiguous run.
//!
//! Two fields on each entry are mutated after init: `available`, flipped
//! once per chip revision by speed-binning code, and `volt_calibrated`,
//! written only by the AVS calibration engine once it has settled a safe
//! voltage for the point. Frequency lookups skip unavailable entries.

#![cfg_attr(not(test), no_std)]

use drv_dvfs_api::{Hertz, Microvolts, PmError};
use heapless::Vec;

/// One operating point of one domain.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct OppEntry {
    pub domain: &'static str,
    pub freq: Hertz,
    pub volt_nominal: Microvolts,
    /// Zero until the calibration engine writes a settled voltage.
    pub volt_calibrated: Microvolts,
    pub available: bool,
}

impl OppEntry {
    /// The voltage transitions should use: calibrated when known,
    /// nominal otherwise.
    pub fn operating_voltage(&self) -> Microvolts {
        if self.volt_calibrated.0 != 0 {
            self.volt_calibrated
        } else {
            self.volt_nominal
        }
    }
}

/// Up to `N` operating points across all domains.
#[derive(Debug, Default)]
pub struct OppTable<const N: usize> {
    entries: Vec<OppEntry, N>,
}

impl<const N: usize> OppTable<N> {
    pub const fn new() -> Self {
        Self {
            entries: Vec::new(),
        }
    }

    /// Adds an operating point, keeping the table sorted by
    /// `(domain, frequency)`. One entry per `(domain, frequency)`: exact
    /// duplicates would make the exact-match mutators ambiguous.
    pub fn add(
        &mut self,
        domain: &'static str,
        freq: Hertz,
        volt_nominal: Microvolts,
        available: bool,
    ) -> Result<(), PmError> {
        let at = self.partition(domain, freq);
        if self
            .entries
            .get(at)
            .is_some_and(|e| e.domain == domain && e.freq == freq)
        {
            return Err(PmError::DuplicateName);
        }
        self.entries
            .push(OppEntry {
                domain,
                freq,
                volt_nominal,
                volt_calibrated: Microvolts(0),
                available,
            })
            .map_err(|_| PmError::TableFull)?;
        self.entries[at..].rotate_right(1);
        Ok(())
    }

    /// Lowest available frequency >= `min` in `domain`.
    pub fn find_ceil(
        &self,
        domain: &str,
        min: Hertz,
    ) -> Option<&OppEntry> {
        let at = self.partition(domain, min);
        self.entries[at..]
            .iter()
            .take_while(|e| e.domain == domain)
            .find(|e| e.available)
    }

    /// Highest available frequency <= `max` in `domain`.
    pub fn find_floor(
        &self,
        domain: &str,
        max: Hertz,
    ) -> Option<&OppEntry> {
        let end = self.partition_above(domain, max);
        self.entries[..end]
            .iter()
            .rev()
            .take_while(|e| e.domain == domain)
            .find(|e| e.available)
    }

    /// Exact-frequency lookup, available or not.
    pub fn find_exact(&self, domain: &str, freq: Hertz) -> Option<&OppEntry> {
        let at = self.partition(domain, freq);
        self.entries
            .get(at)
            .filter(|e| e.domain == domain && e.freq == freq)
    }

    /// Speed-binning hook: marks one exact operating point (un)usable for
    /// this chip.
    pub fn set_available(
        &mut self,
        domain: &str,
        freq: Hertz,
        available: bool,
    ) -> Result<(), PmError> {
        self.find_exact_mut(domain, freq)?.available = available;
        Ok(())
    }

    /// Calibration write-back. Callers other than the calibration engine
    /// have no business here.
    pub fn set_calibrated_voltage(
        &mut self,
        domain: &str,
        freq: Hertz,
        volt: Microvolts,
    ) -> Result<(), PmError> {
        self.find_exact_mut(domain, freq)?.volt_calibrated = volt;
        Ok(())
    }

    /// Drops any calibrated voltage for `domain`, forcing transitions back
    /// to nominal until recalibration runs.
    pub fn invalidate_calibration(&mut self, domain: &str) {
        for e in self.entries.iter_mut().filter(|e| e.domain == domain) {
            e.volt_calibrated = Microvolts(0);
        }
    }

    /// `domain`'s entries, frequency ascending.
    pub fn entries(
        &self,
        domain: &'static str,
    ) -> impl Iterator<Item = &OppEntry> + '_ {
        let at = self.partition(domain, Hertz(0));
        self.entries[at..]
            .iter()
            .take_while(move |e| e.domain == domain)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    fn find_exact_mut(
        &mut self,
        domain: &str,
        freq: Hertz,
    ) -> Result<&mut OppEntry, PmError> {
        let at = self.partition(domain, freq);
        self.entries
            .get_mut(at)
            .filter(|e| e.domain == domain && e.freq == freq)
            .ok_or(PmError::NotFound)
    }

    /// First index whose entry is >= `(domain, freq)`.
    fn partition(&self, domain: &str, freq: Hertz) -> usize {
        self.entries
            .partition_point(|e| (e.domain, e.freq) < (domain, freq))
    }

    /// First index whose entry is > `(domain, freq)`.
    fn partition_above(&self, domain: &str, freq: Hertz) -> usize {
        self.entries
            .partition_point(|e| (e.domain, e.freq) <= (domain, freq))
    }
}
