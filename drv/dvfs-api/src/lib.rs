// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Shared API surface for the DVFS subsystem: units, error codes, and the
//! traits that platform code implements to put real hardware behind the
//! clock tree, the voltage scaling engine, and the AVS calibration loop.
//!
//! Nothing in this crate touches hardware itself; the engine crates are
//! generic over these traits, and tests substitute recording fakes.

#![cfg_attr(not(test), no_std)]

use num_derive::FromPrimitive;

/// Clock rate in Hertz.
#[derive(Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Debug, Default)]
pub struct Hertz(pub u64);

/// Rail voltage in microvolts.
///
/// The zero value doubles as "not set" in calibration bookkeeping, matching
/// the convention for uncalibrated operating points.
#[derive(Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Debug, Default)]
pub struct Microvolts(pub u32);

/// Error codes for the power-management subsystem.
///
/// These are deliberately a single flat namespace: every engine returns the
/// same code type, and callers at the policy layer typically log the code
/// and keep running at the last-known-good operating point.
#[derive(Copy, Clone, Debug, FromPrimitive, PartialEq, Eq)]
#[repr(u32)]
pub enum PmError {
    /// A clock, domain, or table entry with this name already exists
    DuplicateName = 1,

    /// Lookup missed: no such clock, operating point, or binding
    NotFound = 2,

    /// A fixed-capacity table is full
    TableFull = 3,

    /// Operation requires usecount == 0 (reparent of a live clock)
    Busy = 4,

    /// Malformed argument (zero divisor, parentless derived clock, ...)
    BadArg = 5,

    /// Reparent target would create a cycle or is otherwise unusable
    InvalidParent = 6,

    /// A bounded hardware poll (PLL lock, transition-done) expired
    HardwareTimeout = 7,

    /// The underlying layer rejected a rate or voltage commit
    ScaleFailed = 8,

    /// No dependency breakpoint covers the requested voltage
    NoDependencyMatch = 9,

    /// AVS comparator register access failed
    SamplerFault = 10,
}

impl From<PmError> for u32 {
    fn from(rc: PmError) -> Self {
        rc as u32
    }
}

/// Hardware behind a clock tree.
///
/// Implementations own the actual divider/PLL programming. Any polling for
/// hardware completion (a PLL lock bit, a relock-done flag) must be bounded
/// and report [`PmError::HardwareTimeout`] instead of spinning forever.
pub trait ClockBackend {
    /// Rounds a requested rate to what the hardware can actually produce.
    /// This never fails; the worst case is returning the current rate.
    fn round_rate(&mut self, clock: &'static str, requested: Hertz) -> Hertz;

    /// Programs `clock` to `rate`, which has already been through
    /// [`ClockBackend::round_rate`].
    fn commit_rate(
        &mut self,
        clock: &'static str,
        rate: Hertz,
    ) -> Result<(), PmError>;

    /// Ungates `clock`. Called only on the 0 -> 1 usecount edge.
    fn enable(&mut self, clock: &'static str) -> Result<(), PmError>;

    /// Gates `clock`. Called only on the 1 -> 0 usecount edge.
    fn disable(&mut self, clock: &'static str) -> Result<(), PmError>;

    /// Switches `clock` onto a different input. The tree has already
    /// validated the topology; this is the mux write itself.
    fn set_parent(
        &mut self,
        clock: &'static str,
        parent: &'static str,
    ) -> Result<(), PmError>;
}

/// Hardware behind a set of regulated supply rails, one per voltage domain.
///
/// The same bounded-poll rule applies: waiting on a transition-done flag
/// must time out with [`PmError::HardwareTimeout`].
pub trait VoltageRail {
    /// Moves `domain`'s rail to `volt` and waits (bounded) for the
    /// transition to complete.
    fn set_voltage(
        &mut self,
        domain: &'static str,
        volt: Microvolts,
    ) -> Result<(), PmError>;
}

/// The AVS comparator loop for one or more voltage domains.
///
/// The sampler watches a domain at its current voltage and counts
/// oscillation events; zero events over a sampling window means the domain
/// is stable there. The calibration engine drives this interface and treats
/// every error as a degraded round, never as a fatal condition.
pub trait AvsSampler {
    /// Turns the comparator loop on for `domain`, seeded at the operating
    /// point's nominal voltage.
    fn enable(
        &mut self,
        domain: &'static str,
        nominal: Microvolts,
    ) -> Result<(), PmError>;

    /// Clears the event counters and opens a fresh sampling window.
    fn rearm(&mut self, domain: &'static str) -> Result<(), PmError>;

    /// Momentarily stops sampling so the counters can be read coherently.
    fn pause(&mut self, domain: &'static str) -> Result<(), PmError>;

    /// Number of oscillation events observed in the window ended by the
    /// last [`AvsSampler::pause`].
    fn oscillation_events(
        &mut self,
        domain: &'static str,
    ) -> Result<u32, PmError>;

    /// The voltage the hardware loop has settled the domain at.
    fn sampled_voltage(
        &mut self,
        domain: &'static str,
    ) -> Result<Microvolts, PmError>;

    /// Turns the comparator loop off for `domain`.
    fn disable(&mut self, domain: &'static str) -> Result<(), PmError>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use num_traits::FromPrimitive;

    #[test]
    fn error_codes_round_trip() {
        for code in 1..=10u32 {
            let err = PmError::from_u32(code).unwrap();
            assert_eq!(u32::from(err), code);
        }
        assert_eq!(PmError::from_u32(0), None);
        assert_eq!(PmError::from_u32(11), None);
    }

    #[test]
    fn unit_ordering() {
        assert!(Hertz(1_008_000_000) > Hertz(800_000_000));
        assert!(Microvolts(1_375_000) > Microvolts(1_200_000));
        assert_eq!(Microvolts::default(), Microvolts(0));
    }
}
