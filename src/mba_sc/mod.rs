//! MBA software controller (spec §4.5): a closed-loop regulator that
//! tightens or loosens a cluster's MBA throttle based on a hidden
//! monitoring group's observed bandwidth, run on its own thread per
//! cluster. Constants mirror the reference `mba_sc` sampling loop: a
//! 100ms tick and a 100% initial rate.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{mpsc, Arc};
use std::thread::JoinHandle;
use std::time::Duration;

use crate::alloc::{AllocEngine, MbaValue};
use crate::cap::event::MonEvent;
use crate::error::Result;
use crate::mon::MonEngine;
use crate::sysconfig;

pub const MBA_SC_SAMPLING_INTERVAL: Duration = Duration::from_millis(100);
pub const MBA_SC_DEF_INIT_MBA: u32 = 100;

/// Pure decision step, kept free of I/O so it can be unit tested without a
/// live backend (spec §4.5 steps 3-4). `cur_bw`/`max_bw` are in bytes/sec,
/// `prev_rate` and the return value are MBA throttle percentages. `delta_bw`
/// is the bandwidth swing the previous tick's hardware change is estimated
/// to have caused, added back in before judging whether there's headroom
/// to raise the rate again — this is what keeps the loop from oscillating
/// around the budget.
pub fn decide_next_rate(
    cur_bw: f64,
    max_bw: f64,
    prev_rate: u32,
    delta_bw: f64,
    throttle_step: u32,
    min_rate: u32,
) -> u32 {
    if max_bw <= 0.0 {
        return prev_rate;
    }
    if prev_rate > min_rate && cur_bw > max_bw {
        prev_rate.saturating_sub(throttle_step).max(min_rate)
    } else if prev_rate < 100 && cur_bw + delta_bw < max_bw {
        (prev_rate + throttle_step).min(100)
    } else {
        prev_rate
    }
}

struct ClusterHandle {
    stop: mpsc::Sender<()>,
    join: JoinHandle<()>,
}

/// Owns every running per-cluster regulator thread; `mba_sc_exit` or
/// `alloc_reset_config` tears them all down and restores the pre-control
/// throttle value.
pub struct MbaScManager {
    clusters: Vec<(u32, ClusterHandle)>,
}

impl Default for MbaScManager {
    fn default() -> Self {
        Self::new()
    }
}

impl MbaScManager {
    pub fn new() -> Self {
        MbaScManager { clusters: Vec::new() }
    }

    /// Starts regulating `cluster` toward `max_bw_bps`, applied to `class_id`
    /// over `cores`. Only one regulator per cluster may run at a time.
    pub fn start(&mut self, cluster: u32, cores: Vec<u32>, class_id: u32, max_bw_bps: f64) -> Result<()> {
        if self.clusters.iter().any(|(c, _)| *c == cluster) {
            return Err(crate::error::RdtError::resource(format!(
                "MBA software controller already running for cluster {cluster}"
            )));
        }

        let (throttle_step, min_rate) = sysconfig::with_snapshot(|s| {
            s.cap
                .mba
                .as_ref()
                .map(|m| (m.throttle_step, 100 - m.throttle_max))
                .unwrap_or((1, 0))
        })?;

        let mon = sysconfig::mon_engine()?;
        let mut group = mon.start_cores(cores.clone(), MonEvent::TOTAL_MBW)?;
        let alloc = sysconfig::alloc_engine()?;
        alloc.mba_set(cores[0], class_id, MbaValue::Percent(MBA_SC_DEF_INIT_MBA))?;

        let (tx, rx) = mpsc::channel();
        let running = Arc::new(AtomicBool::new(true));
        let running_thread = Arc::clone(&running);

        let join = std::thread::spawn(move || {
            let mon = MonEngine::new();
            let alloc = AllocEngine;
            let mut rate = MBA_SC_DEF_INIT_MBA;
            let mut prev_bw = 0.0;
            let mut delta_comp = false;
            while running_thread.load(Ordering::Relaxed) {
                if rx.recv_timeout(MBA_SC_SAMPLING_INTERVAL).is_ok() {
                    break;
                }
                let Ok(values) = mon.poll(&mut group) else { continue };
                let Some(cur_bw) = values.total_mbw_bps else { continue };

                let delta_bw = if delta_comp { (cur_bw - prev_bw).abs() } else { 0.0 };
                delta_comp = false;

                let next = decide_next_rate(cur_bw, max_bw_bps, rate, delta_bw, throttle_step, min_rate);
                if next != rate && alloc.mba_set(cores[0], class_id, MbaValue::Percent(next)).is_ok() {
                    rate = next;
                    delta_comp = true;
                }
                prev_bw = cur_bw;
            }
            let _ = alloc.mba_set(cores[0], class_id, MbaValue::Percent(MBA_SC_DEF_INIT_MBA));
            let _ = mon.stop(group);
        });

        self.clusters.push((cluster, ClusterHandle { stop: tx, join }));
        Ok(())
    }

    pub fn stop(&mut self, cluster: u32) -> Result<()> {
        if let Some(idx) = self.clusters.iter().position(|(c, _)| *c == cluster) {
            let (_, handle) = self.clusters.remove(idx);
            let _ = handle.stop.send(());
            let _ = handle.join.join();
        }
        Ok(())
    }

    /// Stops every regulator (spec §4.5 `mba_sc_exit`), used by `fini` and
    /// by `alloc_reset_config` before a CDP/MBA-CTRL/IO-RDT state flip.
    pub fn exit_all(&mut self) -> Result<()> {
        let clusters: Vec<u32> = self.clusters.iter().map(|(c, _)| *c).collect();
        for cluster in clusters {
            self.stop(cluster)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decreases_rate_when_over_budget() {
        let next = decide_next_rate(120.0, 100.0, 50, 0.0, 10, 0);
        assert_eq!(next, 40);
    }

    #[test]
    fn increases_rate_when_well_under_budget() {
        let next = decide_next_rate(50.0, 100.0, 50, 0.0, 10, 0);
        assert_eq!(next, 60);
    }

    #[test]
    fn holds_steady_at_budget() {
        // Neither over budget (so no decrease) nor under it (so no headroom
        // to increase) — the only value where both conditions are false.
        let next = decide_next_rate(100.0, 100.0, 50, 0.0, 10, 0);
        assert_eq!(next, 50);
    }

    #[test]
    fn never_drops_below_min_rate() {
        let next = decide_next_rate(1000.0, 100.0, 5, 0.0, 10, 0);
        assert_eq!(next, 0);
    }

    #[test]
    fn delta_bw_hysteresis_prevents_immediate_re_raise() {
        // The previous tick's throttle cut is estimated to have swung
        // bandwidth by 10 bytes/sec; added back in, 92 + 10 = 102 is over
        // budget, so the controller holds instead of raising again.
        let next = decide_next_rate(92.0, 100.0, 50, 10.0, 10, 0);
        assert_eq!(next, 50);
    }
}
