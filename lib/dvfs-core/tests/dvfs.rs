// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! End-to-end coordinator scenarios, driven through fake hardware that
//! records every rail and rate commit into one shared log so cross-engine
//! ordering can be asserted.

use std::cell::RefCell;
use std::collections::{HashMap, VecDeque};
use std::rc::Rc;

use drv_dvfs_api::{
    AvsSampler, ClockBackend, Hertz, Microvolts, PmError, VoltageRail,
};
use dvfs_core::{CalState, Dvfs, RateEvent, RateObserver, Recompute};
use proptest::prelude::*;

#[derive(Debug, Clone, Copy, PartialEq)]
enum Event {
    Volt(&'static str, u32),
    Rate(&'static str, u64),
}

type Log = Rc<RefCell<Vec<Event>>>;

struct FakeClock {
    log: Log,
}

impl ClockBackend for FakeClock {
    fn round_rate(&mut self, _: &'static str, r: Hertz) -> Hertz {
        r
    }
    fn commit_rate(
        &mut self,
        clock: &'static str,
        rate: Hertz,
    ) -> Result<(), PmError> {
        self.log.borrow_mut().push(Event::Rate(clock, rate.0));
        Ok(())
    }
    fn enable(&mut self, _: &'static str) -> Result<(), PmError> {
        Ok(())
    }
    fn disable(&mut self, _: &'static str) -> Result<(), PmError> {
        Ok(())
    }
    fn set_parent(
        &mut self,
        _: &'static str,
        _: &'static str,
    ) -> Result<(), PmError> {
        Ok(())
    }
}

struct FakeRail {
    log: Log,
}

impl VoltageRail for FakeRail {
    fn set_voltage(
        &mut self,
        domain: &'static str,
        volt: Microvolts,
    ) -> Result<(), PmError> {
        self.log.borrow_mut().push(Event::Volt(domain, volt.0));
        Ok(())
    }
}

#[derive(Default)]
struct FakeSampler {
    /// Scripted oscillation-event reads per domain; empty means clean.
    osc: HashMap<&'static str, VecDeque<u32>>,
    /// Voltage the AVS loop "settled" each domain at.
    voltage: HashMap<&'static str, u32>,
}

impl AvsSampler for FakeSampler {
    fn enable(
        &mut self,
        _: &'static str,
        _: Microvolts,
    ) -> Result<(), PmError> {
        Ok(())
    }
    fn rearm(&mut self, _: &'static str) -> Result<(), PmError> {
        Ok(())
    }
    fn pause(&mut self, _: &'static str) -> Result<(), PmError> {
        Ok(())
    }
    fn oscillation_events(
        &mut self,
        domain: &'static str,
    ) -> Result<u32, PmError> {
        Ok(self
            .osc
            .get_mut(domain)
            .and_then(|q| q.pop_front())
            .unwrap_or(0))
    }
    fn sampled_voltage(
        &mut self,
        domain: &'static str,
    ) -> Result<Microvolts, PmError> {
        Ok(Microvolts(*self.voltage.get(domain).unwrap_or(&1_000_000)))
    }
    fn disable(&mut self, _: &'static str) -> Result<(), PmError> {
        Ok(())
    }
}

/// OMAP4460-style MPU -> CORE dependency: the 1375000 uV MPU point needs
/// CORE at 1200000 uV.
static MPU_CORE: &[(Microvolts, Microvolts)] = &[
    (Microvolts(1_025_000), Microvolts(962_000)),
    (Microvolts(1_200_000), Microvolts(1_025_000)),
    (Microvolts(1_375_000), Microvolts(1_200_000)),
];

struct Rig {
    dvfs: Dvfs<FakeClock, FakeRail, FakeSampler>,
    log: Log,
}

/// MPU domain with the 4460 operating points and the CORE dependency,
/// CORE domain with its own two points.
fn rig(sampler: FakeSampler) -> Rig {
    let log: Log = Rc::new(RefCell::new(Vec::new()));
    let mut dvfs = Dvfs::new(
        FakeClock {
            log: Rc::clone(&log),
        },
        FakeRail {
            log: Rc::clone(&log),
        },
        sampler,
    );

    let dpll_mpu = dvfs
        .register_clock("dpll_mpu", None, Recompute::Fixed(Hertz(350_000_000)))
        .unwrap();
    let l3_div = dvfs
        .register_clock("l3_div", None, Recompute::Fixed(Hertz(200_000_000)))
        .unwrap();

    for (freq, volt) in [
        (350_000_000, 1_025_000),
        (700_000_000, 1_200_000),
        (920_000_000, 1_313_000),
        (1_008_000_000, 1_375_000),
    ] {
        dvfs.add_opp("mpu", Hertz(freq), Microvolts(volt), true)
            .unwrap();
    }
    for (freq, volt) in [(200_000_000, 962_000), (400_000_000, 1_025_000)] {
        dvfs.add_opp("core", Hertz(freq), Microvolts(volt), true)
            .unwrap();
    }

    dvfs.add_dependency("mpu", "core", MPU_CORE).unwrap();
    dvfs.bind_domain("mpu", dpll_mpu).unwrap();
    dvfs.bind_domain("core", l3_div).unwrap();

    Rig { dvfs, log }
}

fn events(log: &Log) -> Vec<Event> {
    log.borrow().clone()
}

#[test]
fn raise_commits_dependent_voltage_main_voltage_then_rate() {
    let mut r = rig(FakeSampler::default());
    let freq = r
        .dvfs
        .request("mpu", Hertz(1_008_000_000), 0, &mut ())
        .unwrap();
    assert_eq!(freq, Hertz(1_008_000_000));
    assert_eq!(
        events(&r.log),
        [
            Event::Volt("core", 1_200_000),
            Event::Volt("mpu", 1_375_000),
            Event::Rate("dpll_mpu", 1_008_000_000),
        ]
    );
    assert_eq!(r.dvfs.active_opp("mpu"), Some(Hertz(1_008_000_000)));
    assert_eq!(r.dvfs.rail_voltage("mpu"), Some(Microvolts(1_375_000)));
}

#[test]
fn lowering_commits_rate_then_voltages() {
    let mut r = rig(FakeSampler::default());
    r.dvfs
        .request("mpu", Hertz(1_008_000_000), 0, &mut ())
        .unwrap();
    r.log.borrow_mut().clear();

    r.dvfs.request("mpu", Hertz(350_000_000), 1, &mut ()).unwrap();
    assert_eq!(
        events(&r.log),
        [
            Event::Rate("dpll_mpu", 350_000_000),
            Event::Volt("mpu", 1_025_000),
            Event::Volt("core", 962_000),
        ]
    );
}

#[test]
fn request_rounds_up_to_the_next_available_point() {
    let mut r = rig(FakeSampler::default());
    let freq = r
        .dvfs
        .request("mpu", Hertz(500_000_000), 0, &mut ())
        .unwrap();
    assert_eq!(freq, Hertz(700_000_000));
    assert_eq!(r.dvfs.rail_voltage("mpu"), Some(Microvolts(1_200_000)));
}

#[test]
fn speed_binning_hides_the_top_point() {
    let mut r = rig(FakeSampler::default());
    r.dvfs
        .set_opp_available("mpu", Hertz(1_008_000_000), false)
        .unwrap();
    assert_eq!(
        r.dvfs.request("mpu", Hertz(1_000_000_000), 0, &mut ()),
        Err(PmError::NotFound)
    );
    // Rebinned (say, a faster sibling revision): the point comes back.
    r.dvfs
        .set_opp_available("mpu", Hertz(1_008_000_000), true)
        .unwrap();
    assert_eq!(
        r.dvfs.request("mpu", Hertz(1_000_000_000), 1, &mut ()),
        Ok(Hertz(1_008_000_000))
    );
}

#[test]
fn clean_calibration_round_writes_back_nominal() {
    let mut sampler = FakeSampler::default();
    sampler.voltage.insert("core", 1_025_000);
    let mut r = rig(sampler);

    r.dvfs.request("core", Hertz(400_000_000), 0, &mut ()).unwrap();
    assert_eq!(r.dvfs.cal_state("core"), CalState::Sampling);
    r.log.borrow_mut().clear();

    // One window to arm, one clean window to converge.
    assert!(r.dvfs.poll(5).is_empty());
    let out = r.dvfs.poll(10);
    assert_eq!(out.len(), 1);
    assert_eq!(out[0].state, CalState::Converged);
    assert_eq!(out[0].volt, Microvolts(1_025_000));

    let e = r
        .dvfs
        .opp_table()
        .find_exact("core", Hertz(400_000_000))
        .unwrap();
    assert_eq!(e.volt_calibrated, Microvolts(1_025_000));
    // Settled where the rail already was: no extra transition.
    assert!(events(&r.log).is_empty());
}

#[test]
fn calibration_below_nominal_moves_the_rail_once() {
    let mut sampler = FakeSampler::default();
    sampler.voltage.insert("core", 1_010_000);
    let mut r = rig(sampler);

    r.dvfs.request("core", Hertz(400_000_000), 0, &mut ()).unwrap();
    r.log.borrow_mut().clear();

    r.dvfs.poll(5);
    let out = r.dvfs.poll(10);
    assert_eq!(out[0].volt, Microvolts(1_010_000));
    assert_eq!(events(&r.log), [Event::Volt("core", 1_010_000)]);
    assert_eq!(r.dvfs.rail_voltage("core"), Some(Microvolts(1_010_000)));
}

#[test]
fn oscillating_domain_falls_back_to_nominal() {
    let mut sampler = FakeSampler::default();
    sampler
        .osc
        .insert("core", VecDeque::from([4, 2, 9, 1]));
    let mut r = rig(sampler);

    r.dvfs.request("core", Hertz(400_000_000), 0, &mut ()).unwrap();

    let mut outcomes = Vec::new();
    let mut now = 0;
    for _ in 0..5 {
        now += 5;
        outcomes.extend(r.dvfs.poll(now).iter().copied());
    }
    assert_eq!(outcomes.len(), 1);
    assert_eq!(outcomes[0].state, CalState::Oscillating);
    assert_eq!(outcomes[0].volt, Microvolts(1_025_000));
    let e = r
        .dvfs
        .opp_table()
        .find_exact("core", Hertz(400_000_000))
        .unwrap();
    assert_eq!(e.volt_calibrated, Microvolts(1_025_000));
}

#[test]
fn later_transitions_use_the_calibrated_voltage() {
    let mut sampler = FakeSampler::default();
    sampler.voltage.insert("core", 1_010_000);
    let mut r = rig(sampler);

    r.dvfs.request("core", Hertz(400_000_000), 0, &mut ()).unwrap();
    r.dvfs.poll(5);
    r.dvfs.poll(10);

    // Drop to the low point, then come back up.
    r.dvfs.request("core", Hertz(200_000_000), 11, &mut ()).unwrap();
    r.log.borrow_mut().clear();
    r.dvfs.request("core", Hertz(400_000_000), 12, &mut ()).unwrap();

    // Raise uses the calibrated 1010000, not nominal 1025000, and the
    // already-calibrated point does not start another AVS round.
    assert_eq!(
        events(&r.log),
        [
            Event::Volt("core", 1_010_000),
            Event::Rate("l3_div", 400_000_000),
        ]
    );
    assert_eq!(r.dvfs.cal_state("core"), CalState::Disabled);
    assert_eq!(r.dvfs.next_cal_deadline(), None);
}

#[test]
fn opp_change_restarts_calibration_for_the_new_point() {
    let mut r = rig(FakeSampler::default());
    r.dvfs.request("core", Hertz(200_000_000), 0, &mut ()).unwrap();
    assert_eq!(r.dvfs.next_cal_deadline(), Some(5));

    // Move before the first window closes: the old round dies with the
    // old point and the new one starts its own window.
    r.dvfs.request("core", Hertz(400_000_000), 2, &mut ()).unwrap();
    assert_eq!(r.dvfs.next_cal_deadline(), Some(7));

    r.dvfs.poll(7);
    let out = r.dvfs.poll(12);
    assert_eq!(out.len(), 1);
    assert_eq!(out[0].freq, Hertz(400_000_000));
}

#[test]
fn recalibrate_discards_and_reruns() {
    let mut sampler = FakeSampler::default();
    sampler.voltage.insert("core", 1_010_000);
    let mut r = rig(sampler);

    r.dvfs.request("core", Hertz(400_000_000), 0, &mut ()).unwrap();
    r.dvfs.poll(5);
    r.dvfs.poll(10);
    assert_eq!(
        r.dvfs
            .opp_table()
            .find_exact("core", Hertz(400_000_000))
            .unwrap()
            .volt_calibrated,
        Microvolts(1_010_000)
    );

    r.dvfs.recalibrate("core", 20).unwrap();
    assert_eq!(
        r.dvfs
            .opp_table()
            .find_exact("core", Hertz(400_000_000))
            .unwrap()
            .volt_calibrated,
        Microvolts(0)
    );
    assert_eq!(r.dvfs.cal_state("core"), CalState::Sampling);
    r.dvfs.poll(25);
    let out = r.dvfs.poll(30);
    assert_eq!(out.len(), 1);
    assert_eq!(out[0].state, CalState::Converged);
}

#[test]
fn rate_notifications_reach_subscribed_dependents() {
    #[derive(Default)]
    struct Recorder {
        events: Vec<(u32, dvfs_core::RatePhase, u64)>,
    }
    impl RateObserver for Recorder {
        fn rate_event(&mut self, token: u32, event: &RateEvent) {
            self.events.push((token, event.phase, event.new_rate.0));
        }
    }

    let mut r = rig(FakeSampler::default());
    let dpll = r.dvfs.register_clock(
        "dpll_iva",
        None,
        Recompute::Fixed(Hertz(932_000_000)),
    );
    let dpll = dpll.unwrap();
    let div = r
        .dvfs
        .register_clock("iva_div2", Some(dpll), Recompute::FixedDivisor(2))
        .unwrap();
    r.dvfs
        .add_opp("iva", Hertz(233_000_000), Microvolts(962_000), true)
        .unwrap();
    r.dvfs.bind_domain("iva", dpll).unwrap();
    r.dvfs.subscribe(div, 7).unwrap();

    let mut rec = Recorder::default();
    r.dvfs.request("iva", Hertz(100_000_000), 0, &mut rec).unwrap();

    assert_eq!(
        rec.events,
        [
            (7, dvfs_core::RatePhase::Pre, 116_500_000),
            (7, dvfs_core::RatePhase::Post, 116_500_000),
        ]
    );
    assert_eq!(r.dvfs.clock_rate(div), Hertz(116_500_000));
}

/// The MPU voltage floor required of CORE at a given MPU voltage, straight
/// off the dependency table.
fn core_floor(mpu_volt: u32) -> u32 {
    MPU_CORE
        .iter()
        .find(|&&(main, _)| main.0 >= mpu_volt)
        .map(|&(_, dep)| dep.0)
        .unwrap_or(1_200_000)
}

proptest! {
    /// Any sequence of successful MPU requests leaves the MPU rail at the
    /// active point's operating voltage, the clock at the active point's
    /// frequency, and CORE at or above its dependency floor.
    #[test]
    fn requests_preserve_voltage_invariants(
        reqs in proptest::collection::vec(0u64..=1_008_000_000, 1..12),
    ) {
        let mut r = rig(FakeSampler::default());
        let mut now = 0;
        for min in reqs {
            now += 1;
            let freq = r.dvfs.request("mpu", Hertz(min), now, &mut ()).unwrap();

            let entry = r
                .dvfs
                .opp_table()
                .find_exact("mpu", freq)
                .unwrap();
            let volt = entry.operating_voltage();
            prop_assert_eq!(r.dvfs.rail_voltage("mpu"), Some(volt));

            let core = r.dvfs.rail_voltage("core").map_or(0, |v| v.0);
            prop_assert!(
                core >= core_floor(volt.0),
                "core at {core} below floor for mpu {}",
                volt.0
            );
        }
    }
}
