// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Hardware clock tree with rate propagation.
//!
//! Every clock is a node in an arena-backed tree: a parent id, a list of
//! child ids, a cached rate, a usecount, and a recompute rule describing how
//! its rate derives from its parent. Topology is append-only after
//! registration except for explicit reparenting of idle muxes.
//!
//! The interesting operation is [`ClockTree::set_rate`]: the affected
//! subtree is walked in pre-order (parent strictly before child, so no node
//! is ever recomputed from a stale parent rate), prospective rates are
//! planned up front, subscribers see `Pre` notifications, the hardware
//! commit happens, and only then are the cached rates stored and `Post`
//! delivered. If the hardware rejects the commit the cache is untouched and
//! the same subtree sees `Abort` instead; the cached tree always reflects
//! what the hardware actually runs at.
//!
//! The tree is a plain owned value; all mutation goes through `&mut self`,
//! which is what serializes rate changes against each other and keeps
//! observer callbacks from re-entering the framework.

#![cfg_attr(not(test), no_std)]

mod notify;

pub use notify::{RateEvent, RateObserver, RatePhase, MAX_SUBSCRIPTIONS};

use drv_dvfs_api::{ClockBackend, Hertz, PmError};
use heapless::Vec;
use tracebuf::TraceBuf;

/// Children per clock.
pub const MAX_FANOUT: usize = 8;

const TRACE_DEPTH: usize = 32;

/// Handle to a registered clock. Only meaningful for the tree that issued
/// it.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct ClockId(u16);

impl ClockId {
    fn index(self) -> usize {
        usize::from(self.0)
    }
}

/// How a clock's rate derives from its parent.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Recompute {
    /// Rate is independent of the parent. The only rule valid for root
    /// clocks, and the only rule [`ClockTree::set_rate`] accepts.
    Fixed(Hertz),
    /// Rate tracks the parent exactly.
    FollowParent,
    /// Rate is the parent rate over a hardware divisor.
    FixedDivisor(u32),
    /// Rate is an arbitrary pure function of the parent rate.
    Custom(fn(Hertz) -> Hertz),
}

fn recompute_one(rule: Recompute, parent_rate: Hertz) -> Hertz {
    match rule {
        Recompute::Fixed(rate) => rate,
        Recompute::FollowParent => parent_rate,
        Recompute::FixedDivisor(div) => Hertz(parent_rate.0 / u64::from(div)),
        Recompute::Custom(f) => f(parent_rate),
    }
}

#[derive(Debug)]
struct Node {
    name: &'static str,
    parent: Option<ClockId>,
    children: Vec<ClockId, MAX_FANOUT>,
    rate: Hertz,
    usecount: u32,
    rule: Recompute,
}

/// One planned rate update: a node, its current rate, and the rate it will
/// have once the change commits.
#[derive(Copy, Clone, Debug)]
struct Change {
    clock: ClockId,
    old: Hertz,
    new: Hertz,
}

#[derive(Copy, Clone, Debug, PartialEq)]
enum Trace {
    Registered(ClockId),
    RateSet(ClockId, Hertz),
    CommitFailed(ClockId),
    Reparented(ClockId),
    Enabled(ClockId),
    Disabled(ClockId),
    DisableUnderflow(ClockId),
    GateFault(ClockId),
}

/// The clock tree: up to `N` clocks over backend `B`.
pub struct ClockTree<B, const N: usize> {
    backend: B,
    nodes: Vec<Node, N>,
    subs: notify::SubscriberTable,
    trace: TraceBuf<Trace, TRACE_DEPTH>,
}

impl<B: ClockBackend, const N: usize> ClockTree<B, N> {
    pub fn new(backend: B) -> Self {
        Self {
            backend,
            nodes: Vec::new(),
            subs: notify::SubscriberTable::new(),
            trace: TraceBuf::new(),
        }
    }

    /// Registers a clock.
    ///
    /// Root clocks (no parent) must use [`Recompute::Fixed`]; derived rules
    /// have nothing to recompute from otherwise. A derived clock's rate is
    /// computed from its parent immediately.
    pub fn register(
        &mut self,
        name: &'static str,
        parent: Option<ClockId>,
        rule: Recompute,
    ) -> Result<ClockId, PmError> {
        if self.lookup(name).is_some() {
            return Err(PmError::DuplicateName);
        }
        if matches!(rule, Recompute::FixedDivisor(0)) {
            return Err(PmError::BadArg);
        }

        let rate = match parent {
            None => match rule {
                Recompute::Fixed(rate) => rate,
                _ => return Err(PmError::BadArg),
            },
            Some(p) => {
                let parent_rate = self
                    .nodes
                    .get(p.index())
                    .ok_or(PmError::NotFound)?
                    .rate;
                recompute_one(rule, parent_rate)
            }
        };

        if self.nodes.is_full() {
            return Err(PmError::TableFull);
        }
        if let Some(p) = parent {
            if self.nodes[p.index()].children.is_full() {
                return Err(PmError::TableFull);
            }
        }

        let id = ClockId(self.nodes.len() as u16);
        // Cannot fail: fullness checked above.
        let _ = self.nodes.push(Node {
            name,
            parent,
            children: Vec::new(),
            rate,
            usecount: 0,
            rule,
        });
        if let Some(p) = parent {
            let _ = self.nodes[p.index()].children.push(id);
        }
        self.trace.record(Trace::Registered(id));
        Ok(id)
    }

    /// Finds a clock by name.
    pub fn lookup(&self, name: &str) -> Option<ClockId> {
        self.nodes
            .iter()
            .position(|n| n.name == name)
            .map(|i| ClockId(i as u16))
    }

    /// Cached rate, O(1).
    pub fn rate(&self, id: ClockId) -> Hertz {
        self.nodes[id.index()].rate
    }

    pub fn name(&self, id: ClockId) -> &'static str {
        self.nodes[id.index()].name
    }

    pub fn parent(&self, id: ClockId) -> Option<ClockId> {
        self.nodes[id.index()].parent
    }

    pub fn usecount(&self, id: ClockId) -> u32 {
        self.nodes[id.index()].usecount
    }

    /// Diagnostic snapshot of every clock, registration order.
    pub fn summary(
        &self,
    ) -> impl Iterator<Item = (ClockId, &'static str, Hertz, u32)> + '_ {
        self.nodes.iter().enumerate().map(|(i, n)| {
            (ClockId(i as u16), n.name, n.rate, n.usecount)
        })
    }

    /// Registers interest in rate changes of `clock`. The token comes back
    /// verbatim in every delivery.
    pub fn subscribe(
        &mut self,
        clock: ClockId,
        token: u32,
    ) -> Result<(), PmError> {
        if clock.index() >= self.nodes.len() {
            return Err(PmError::NotFound);
        }
        self.subs.subscribe(clock, token)
    }

    pub fn unsubscribe(
        &mut self,
        clock: ClockId,
        token: u32,
    ) -> Result<(), PmError> {
        self.subs.unsubscribe(clock, token)
    }

    /// Changes the rate of a `Fixed`-rule clock and propagates the result
    /// through its descendants.
    ///
    /// Returns the rate the hardware actually settled on, which may differ
    /// from `requested` by divisor rounding. Derived clocks are pure
    /// functions of their parent and refuse direct rate requests.
    pub fn set_rate(
        &mut self,
        id: ClockId,
        requested: Hertz,
        observer: &mut dyn RateObserver,
    ) -> Result<Hertz, PmError> {
        let node = self.nodes.get(id.index()).ok_or(PmError::NotFound)?;
        if !matches!(node.rule, Recompute::Fixed(_)) {
            return Err(PmError::BadArg);
        }
        let name = node.name;

        let actual = self.backend.round_rate(name, requested);

        let mut plan: Vec<Change, N> = Vec::new();
        self.plan_subtree(id, actual, &mut plan);

        self.dispatch(RatePhase::Pre, &plan, observer);

        if let Err(e) = self.backend.commit_rate(name, actual) {
            self.trace.record(Trace::CommitFailed(id));
            self.dispatch(RatePhase::Abort, &plan, observer);
            return Err(e);
        }

        self.apply(&plan);
        self.nodes[id.index()].rule = Recompute::Fixed(actual);
        self.trace.record(Trace::RateSet(id, actual));
        self.dispatch(RatePhase::Post, &plan, observer);
        Ok(actual)
    }

    /// Moves a mux clock onto a different input.
    ///
    /// Requires `usecount == 0` (`Busy` otherwise). Only clocks registered
    /// with a parent can reparent, and the new parent must not be in the
    /// clock's own subtree. The subtree re-derives its rates from the new
    /// parent with the same pre/post/abort notification protocol as
    /// [`ClockTree::set_rate`].
    pub fn set_parent(
        &mut self,
        id: ClockId,
        new_parent: ClockId,
        observer: &mut dyn RateObserver,
    ) -> Result<(), PmError> {
        let node = self.nodes.get(id.index()).ok_or(PmError::NotFound)?;
        let Some(old_parent) = node.parent else {
            return Err(PmError::InvalidParent);
        };
        if node.usecount != 0 {
            return Err(PmError::Busy);
        }
        let parent_node = self
            .nodes
            .get(new_parent.index())
            .ok_or(PmError::NotFound)?;
        if id == new_parent || self.in_subtree(id, new_parent) {
            return Err(PmError::InvalidParent);
        }
        if new_parent != old_parent && parent_node.children.is_full() {
            return Err(PmError::TableFull);
        }

        let name = self.nodes[id.index()].name;
        let parent_name = self.nodes[new_parent.index()].name;
        let root_new = recompute_one(
            self.nodes[id.index()].rule,
            self.nodes[new_parent.index()].rate,
        );

        let mut plan: Vec<Change, N> = Vec::new();
        self.plan_subtree(id, root_new, &mut plan);

        self.dispatch(RatePhase::Pre, &plan, observer);

        if let Err(e) = self.backend.set_parent(name, parent_name) {
            self.trace.record(Trace::CommitFailed(id));
            self.dispatch(RatePhase::Abort, &plan, observer);
            return Err(e);
        }

        detach_child(&mut self.nodes[old_parent.index()].children, id);
        // Cannot fail: fullness checked above.
        let _ = self.nodes[new_parent.index()].children.push(id);
        self.nodes[id.index()].parent = Some(new_parent);

        self.apply(&plan);
        self.trace.record(Trace::Reparented(id));
        self.dispatch(RatePhase::Post, &plan, observer);
        Ok(())
    }

    /// Bumps the usecount, ungating the clock (and its ancestor chain,
    /// root first) on the 0 -> 1 edge.
    pub fn enable(&mut self, id: ClockId) -> Result<(), PmError> {
        if id.index() >= self.nodes.len() {
            return Err(PmError::NotFound);
        }
        self.enable_inner(id)
    }

    fn enable_inner(&mut self, id: ClockId) -> Result<(), PmError> {
        if self.nodes[id.index()].usecount == 0 {
            if let Some(p) = self.nodes[id.index()].parent {
                self.enable_inner(p)?;
            }
            let name = self.nodes[id.index()].name;
            if let Err(e) = self.backend.enable(name) {
                self.trace.record(Trace::GateFault(id));
                // Undo the ancestor enable so usecounts stay balanced.
                if let Some(p) = self.nodes[id.index()].parent {
                    self.disable_inner(p);
                }
                return Err(e);
            }
            self.trace.record(Trace::Enabled(id));
        }
        self.nodes[id.index()].usecount += 1;
        Ok(())
    }

    /// Drops the usecount, gating the clock (and relaxing its ancestors)
    /// on the 1 -> 0 edge. Gate faults on the way down are traced, not
    /// surfaced; there is nothing useful a caller can do with them.
    pub fn disable(&mut self, id: ClockId) -> Result<(), PmError> {
        if id.index() >= self.nodes.len() {
            return Err(PmError::NotFound);
        }
        self.disable_inner(id);
        Ok(())
    }

    fn disable_inner(&mut self, id: ClockId) {
        if self.nodes[id.index()].usecount == 0 {
            self.trace.record(Trace::DisableUnderflow(id));
            return;
        }
        self.nodes[id.index()].usecount -= 1;
        if self.nodes[id.index()].usecount == 0 {
            let name = self.nodes[id.index()].name;
            if self.backend.disable(name).is_err() {
                self.trace.record(Trace::GateFault(id));
            } else {
                self.trace.record(Trace::Disabled(id));
            }
            if let Some(p) = self.nodes[id.index()].parent {
                self.disable_inner(p);
            }
        }
    }

    /// Recomputes every cached rate from the roots down. Used once after
    /// board init has registered everything; fires no notifications.
    pub fn recalculate(&mut self) {
        for i in 0..self.nodes.len() {
            if self.nodes[i].parent.is_none() {
                let root = ClockId(i as u16);
                let rate = self.nodes[i].rate;
                let mut plan: Vec<Change, N> = Vec::new();
                self.plan_subtree(root, rate, &mut plan);
                self.apply(&plan);
            }
        }
    }

    /// Plans the subtree rooted at `root` in pre-order, assigning `root`
    /// the rate `root_new` and each descendant the rate derived from its
    /// (planned) parent. Parent entries always precede their children.
    fn plan_subtree(
        &self,
        root: ClockId,
        root_new: Hertz,
        plan: &mut Vec<Change, N>,
    ) {
        let mut stack: Vec<(ClockId, Hertz), N> = Vec::new();
        // Pushes below cannot fail: a tree of at most N nodes is visited
        // once each.
        let _ = stack.push((root, root_new));
        while let Some((id, new)) = stack.pop() {
            let node = &self.nodes[id.index()];
            let _ = plan.push(Change {
                clock: id,
                old: node.rate,
                new,
            });
            for &child in node.children.iter().rev() {
                let rule = self.nodes[child.index()].rule;
                let _ = stack.push((child, recompute_one(rule, new)));
            }
        }
    }

    fn apply(&mut self, plan: &[Change]) {
        for change in plan {
            self.nodes[change.clock.index()].rate = change.new;
        }
    }

    fn dispatch(
        &self,
        phase: RatePhase,
        plan: &[Change],
        observer: &mut dyn RateObserver,
    ) {
        for change in plan {
            if !self.subs.any_for(change.clock) {
                continue;
            }
            let event = RateEvent {
                clock: change.clock,
                phase,
                old_rate: change.old,
                new_rate: change.new,
            };
            for token in self.subs.tokens_for(change.clock) {
                observer.rate_event(token, &event);
            }
        }
    }

    /// Whether `descendant` is `root` or sits anywhere in its subtree.
    fn in_subtree(&self, root: ClockId, descendant: ClockId) -> bool {
        let mut cursor = Some(descendant);
        while let Some(id) = cursor {
            if id == root {
                return true;
            }
            cursor = self.nodes[id.index()].parent;
        }
        false
    }
}

fn detach_child(children: &mut Vec<ClockId, MAX_FANOUT>, id: ClockId) {
    if let Some(pos) = children.iter().position(|&c| c == id) {
        children[pos..].rotate_left(1);
        children.pop();
    }
}
