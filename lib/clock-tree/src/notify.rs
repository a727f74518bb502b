// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Rate-change notification plumbing.
//!
//! Subscribers register an opaque `u32` token against a clock; when a rate
//! change traverses the subtree, every subscription on a visited clock is
//! delivered to the caller-supplied [`RateObserver`] along with that clock's
//! own old and new rate. Dispatch happens while the tree is exclusively
//! borrowed, so an observer cannot re-enter the clock framework; the borrow
//! checker enforces it rather than a comment asking nicely.

use drv_dvfs_api::{Hertz, PmError};
use heapless::Vec;

use crate::ClockId;

/// Total subscriptions across the whole tree.
pub const MAX_SUBSCRIPTIONS: usize = 16;

/// Where in a rate change the notification is being delivered.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum RatePhase {
    /// The new rates have been computed but nothing is committed yet.
    Pre,
    /// The change is committed and the cached rates are updated.
    Post,
    /// The hardware commit failed; cached rates are unchanged.
    Abort,
}

/// One notification, scoped to a single clock in the affected subtree.
///
/// `new_rate` is the visited clock's own prospective rate, recomputed
/// through its rule chain from the clock that actually changed, not the
/// changed ancestor's rate.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct RateEvent {
    pub clock: ClockId,
    pub phase: RatePhase,
    pub old_rate: Hertz,
    pub new_rate: Hertz,
}

/// Receiver for rate-change notifications.
///
/// Observers get the token they subscribed with, so one observer can fan
/// out to multiple interested parties.
pub trait RateObserver {
    fn rate_event(&mut self, token: u32, event: &RateEvent);
}

/// Observer for callers that don't care about notifications.
impl RateObserver for () {
    fn rate_event(&mut self, _token: u32, _event: &RateEvent) {}
}

#[derive(Debug, Default)]
pub(crate) struct SubscriberTable {
    subs: Vec<(ClockId, u32), MAX_SUBSCRIPTIONS>,
}

impl SubscriberTable {
    pub(crate) const fn new() -> Self {
        Self { subs: Vec::new() }
    }

    pub(crate) fn subscribe(
        &mut self,
        clock: ClockId,
        token: u32,
    ) -> Result<(), PmError> {
        self.subs
            .push((clock, token))
            .map_err(|_| PmError::TableFull)
    }

    pub(crate) fn unsubscribe(
        &mut self,
        clock: ClockId,
        token: u32,
    ) -> Result<(), PmError> {
        let pos = self
            .subs
            .iter()
            .position(|&s| s == (clock, token))
            .ok_or(PmError::NotFound)?;
        self.subs[pos..].rotate_left(1);
        self.subs.pop();
        Ok(())
    }

    /// Whether the clock has any subscription at all. Dispatch skips clocks
    /// that don't; their rates still recompute.
    pub(crate) fn any_for(&self, clock: ClockId) -> bool {
        self.subs.iter().any(|&(c, _)| c == clock)
    }

    pub(crate) fn tokens_for(
        &self,
        clock: ClockId,
    ) -> impl Iterator<Item = u32> + '_ {
        self.subs
            .iter()
            .filter(move |&&(c, _)| c == clock)
            .map(|&(_, t)| t)
    }
}
