//! Monitoring engine (spec §4.4): groups over cores/tasks/channels, counter
//! source fusion (hardware MBM/CMT via the active backend, `perf_event_open`
//! for LLC-miss/reference/IPC), delta/overflow arithmetic, and derived
//! remote-MBW.

use std::collections::HashMap;
use std::fs::File;
use std::os::fd::AsRawFd;
use std::time::Instant;

use crate::cap::event::{MonCapabilityItem, MonEvent};
use crate::error::{RdtError, Result};
use crate::ffi::bindings::{
    PerfEventAttr, ATTR_FLAG_DISABLED, ATTR_FLAG_EXCLUDE_HV, ATTR_FLAG_EXCLUDE_KERNEL,
    PERF_COUNT_HW_CACHE_MISSES, PERF_COUNT_HW_CACHE_REFERENCES, PERF_COUNT_HW_CPU_CYCLES,
    PERF_COUNT_HW_INSTRUCTIONS, PERF_TYPE_HARDWARE,
};
use crate::ffi::syscall::{ioctl_arg, perf_event_open, read as fd_read};
use crate::sysconfig;

/// What a group counts against (spec §3 `MonTarget`); channel/uncore
/// targets reuse the same RMID path as cores once associated.
#[derive(Clone, Debug)]
pub enum MonTarget {
    Cores(Vec<u32>),
    Pids(Vec<u32>),
    Channels(Vec<u64>),
    /// Device/uncore monitoring, grouped by socket (spec.md §6).
    Uncore(Vec<u32>),
}

/// Platform-maximum bandwidth a single MBM counter delta can plausibly
/// represent; a larger implied rate means the counter wrapped in a way
/// `counter_modulus` couldn't account for (spec §4.4 "Delta and overflow").
const MAX_PHYSICAL_BANDWIDTH_BPS: f64 = 200.0 * 1024.0 * 1024.0 * 1024.0;

fn overflow_tripped(values: &MonValues) -> bool {
    [values.local_mbw_bps, values.total_mbw_bps]
        .into_iter()
        .flatten()
        .any(|bps| bps > MAX_PHYSICAL_BANDWIDTH_BPS)
}

struct PerfCounter {
    file: File,
    prev_raw: u64,
}

impl PerfCounter {
    fn open(event: MonEvent, target: &MonTarget) -> Result<Self> {
        let config = match event {
            MonEvent::LLC_MISS => PERF_COUNT_HW_CACHE_MISSES,
            MonEvent::LLC_REFERENCE => PERF_COUNT_HW_CACHE_REFERENCES,
            MonEvent::IPC => PERF_COUNT_HW_INSTRUCTIONS,
            _ => return Err(RdtError::param("event has no perf counterpart")),
        };
        let attr = PerfEventAttr {
            type_: PERF_TYPE_HARDWARE,
            size: std::mem::size_of::<PerfEventAttr>() as u32,
            config,
            flags: ATTR_FLAG_DISABLED | ATTR_FLAG_EXCLUDE_KERNEL | ATTR_FLAG_EXCLUDE_HV,
            ..Default::default()
        };
        let (pid, cpu) = match target {
            MonTarget::Cores(cores) => {
                (-1, *cores.first().ok_or_else(|| RdtError::param("empty core list"))? as i32)
            }
            MonTarget::Pids(pids) => {
                (*pids.first().ok_or_else(|| RdtError::param("empty pid list"))? as i32, -1)
            }
            MonTarget::Channels(_) => {
                return Err(RdtError::resource("perf events are not available for channel targets"))
            }
            MonTarget::Uncore(_) => {
                return Err(RdtError::resource("perf events are not available for uncore targets"))
            }
        };
        let file = perf_event_open(&attr, pid, cpu, -1, 0).map_err(RdtError::Internal)?;
        Ok(PerfCounter { file, prev_raw: 0 })
    }

    fn enable(&self) -> Result<()> {
        ioctl_arg(&self.file, crate::ffi::bindings::PERF_EVENT_IOC_ENABLE, 0)
            .map(|_| ())
            .map_err(RdtError::Internal)
    }

    /// Reads the cumulative count and returns the delta since the previous
    /// read (perf counters are 64-bit monotonic while enabled).
    fn delta(&mut self) -> Result<u64> {
        let mut buf = [0u8; 8];
        fd_read(&self.file, &mut buf).map_err(RdtError::Internal)?;
        let raw = u64::from_le_bytes(buf);
        let delta = raw.wrapping_sub(self.prev_raw);
        self.prev_raw = raw;
        Ok(delta)
    }
}

/// Ties instructions and cycles counters together to derive IPC.
struct IpcCounter {
    instructions: PerfCounter,
    cycles: File,
    prev_cycles: u64,
}

impl IpcCounter {
    fn open(target: &MonTarget) -> Result<Self> {
        let instructions = PerfCounter::open(MonEvent::IPC, target)?;
        let cycles_attr = PerfEventAttr {
            type_: PERF_TYPE_HARDWARE,
            size: std::mem::size_of::<PerfEventAttr>() as u32,
            config: PERF_COUNT_HW_CPU_CYCLES,
            flags: ATTR_FLAG_DISABLED | ATTR_FLAG_EXCLUDE_KERNEL | ATTR_FLAG_EXCLUDE_HV,
            ..Default::default()
        };
        let (pid, cpu) = match target {
            MonTarget::Cores(cores) => (-1, cores[0] as i32),
            MonTarget::Pids(pids) => (pids[0] as i32, -1),
            MonTarget::Channels(_) => {
                return Err(RdtError::resource("perf events are not available for channel targets"))
            }
            MonTarget::Uncore(_) => {
                return Err(RdtError::resource("perf events are not available for uncore targets"))
            }
        };
        let cycles = perf_event_open(&cycles_attr, pid, cpu, -1, 0).map_err(RdtError::Internal)?;
        ioctl_arg(&cycles, crate::ffi::bindings::PERF_EVENT_IOC_ENABLE, 0).map_err(RdtError::Internal)?;
        instructions.enable()?;
        Ok(IpcCounter { instructions, cycles, prev_cycles: 0 })
    }

    fn sample(&mut self) -> Result<f64> {
        let insn_delta = self.instructions.delta()?;
        let mut buf = [0u8; 8];
        fd_read(&self.cycles, &mut buf).map_err(RdtError::Internal)?;
        let raw_cycles = u64::from_le_bytes(buf);
        let cycle_delta = raw_cycles.wrapping_sub(self.prev_cycles);
        self.prev_cycles = raw_cycles;
        if cycle_delta == 0 {
            Ok(0.0)
        } else {
            Ok(insn_delta as f64 / cycle_delta as f64)
        }
    }
}

/// One live monitoring group (spec §3 `MonGroup`). Holds the hardware RMID
/// plus any `perf` file descriptors opened for software-backed events.
pub struct MonGroup {
    rmid: u32,
    target: MonTarget,
    events: MonEvent,
    perf_misses: Option<PerfCounter>,
    perf_refs: Option<PerfCounter>,
    ipc: Option<IpcCounter>,
    prev_hw: HashMap<MonEvent, u128>,
    prev_instant: Option<Instant>,
    /// Representative core the group's RMID is read back on (MSR backend
    /// `IA32_QM_EVTSEL`/`IA32_QM_CTR` are logical-processor scoped).
    repr_core: u32,
}

/// Values produced by one `poll` (spec §3 `MonValues`); fields the group
/// wasn't started with stay `None`.
#[derive(Clone, Copy, Debug, Default)]
pub struct MonValues {
    pub llc_occupancy_bytes: Option<u64>,
    pub local_mbw_bps: Option<f64>,
    pub remote_mbw_bps: Option<f64>,
    pub total_mbw_bps: Option<f64>,
    pub llc_misses: Option<u64>,
    pub llc_references: Option<u64>,
    pub ipc: Option<f64>,
}

pub struct MonEngine {
    _private: (),
}

impl MonEngine {
    pub(crate) fn new() -> Self {
        MonEngine { _private: () }
    }

    fn mon_item(&self, event: MonEvent) -> Result<MonCapabilityItem> {
        sysconfig::with_snapshot(|s| {
            s.cap
                .mon
                .as_ref()
                .and_then(|m| m.item(event).copied())
                .ok_or_else(|| RdtError::resource("event not supported on this platform"))
        })?
    }

    fn start(&self, target: MonTarget, events: MonEvent) -> Result<MonGroup> {
        if events.is_empty() {
            return Err(RdtError::param("at least one event must be requested"));
        }
        for event in flag_iter(events) {
            self.mon_item(event)?;
        }

        let rmid = sysconfig::with_backend(|b| b.mon_alloc_rmid())?;

        let assoc_cores: Vec<u32> = match &target {
            MonTarget::Cores(cores) => cores.clone(),
            MonTarget::Uncore(sockets) => {
                let cpu = sysconfig::with_snapshot(|s| s.cpu.clone())?;
                sockets.iter().flat_map(|&socket| cpu.cores_on_socket(socket)).collect()
            }
            MonTarget::Pids(_) | MonTarget::Channels(_) => Vec::new(),
        };
        for &core in &assoc_cores {
            if let Err(e) = sysconfig::with_backend(|b| b.mon_assoc_set(core, rmid)) {
                let _ = sysconfig::with_backend(|b| b.mon_free_rmid(rmid));
                return Err(e);
            }
        }
        let repr_core = assoc_cores.first().copied().unwrap_or(0);

        let perf_misses = if events.contains(MonEvent::LLC_MISS) {
            let c = PerfCounter::open(MonEvent::LLC_MISS, &target)?;
            c.enable()?;
            Some(c)
        } else {
            None
        };
        let perf_refs = if events.contains(MonEvent::LLC_REFERENCE) {
            let c = PerfCounter::open(MonEvent::LLC_REFERENCE, &target)?;
            c.enable()?;
            Some(c)
        } else {
            None
        };
        let ipc = if events.contains(MonEvent::IPC) {
            Some(IpcCounter::open(&target)?)
        } else {
            None
        };

        sysconfig::register_rmid(rmid)?;

        Ok(MonGroup {
            rmid,
            target,
            events,
            perf_misses,
            perf_refs,
            ipc,
            prev_hw: HashMap::new(),
            prev_instant: None,
            repr_core,
        })
    }

    pub fn start_cores(&self, cores: Vec<u32>, events: MonEvent) -> Result<MonGroup> {
        self.start(MonTarget::Cores(cores), events)
    }

    pub fn start_pids(&self, pids: Vec<u32>, events: MonEvent) -> Result<MonGroup> {
        let group = self.start(MonTarget::Pids(pids.clone()), events)?;
        for pid in &pids {
            sysconfig::with_backend(|b| b.mon_assoc_set_pid(*pid, group.rmid))?;
        }
        Ok(group)
    }

    pub fn start_channels(&self, channels: Vec<u64>, events: MonEvent) -> Result<MonGroup> {
        self.start(MonTarget::Channels(channels), events)
    }

    /// Starts a device/uncore monitoring group over every core on the
    /// given sockets (spec.md §6 `start_uncore`).
    pub fn start_uncore(&self, sockets: Vec<u32>, events: MonEvent) -> Result<MonGroup> {
        self.start(MonTarget::Uncore(sockets), events)
    }

    pub fn add_pids(&self, group: &MonGroup, pids: &[u32]) -> Result<()> {
        for pid in pids {
            sysconfig::with_backend(|b| b.mon_assoc_set_pid(*pid, group.rmid))?;
        }
        Ok(())
    }

    pub fn remove_pids(&self, pids: &[u32]) -> Result<()> {
        for pid in pids {
            sysconfig::with_backend(|b| b.mon_assoc_set_pid(*pid, 0))?;
        }
        Ok(())
    }

    pub fn stop(&self, mut group: MonGroup) -> Result<()> {
        if matches!(group.target, MonTarget::Cores(_) | MonTarget::Uncore(_)) {
            let cores: Vec<u32> = match &group.target {
                MonTarget::Cores(cores) => cores.clone(),
                MonTarget::Uncore(sockets) => sysconfig::with_snapshot(|s| {
                    sockets.iter().flat_map(|&socket| s.cpu.cores_on_socket(socket)).collect()
                })
                .unwrap_or_default(),
                _ => Vec::new(),
            };
            for core in cores {
                let _ = sysconfig::with_backend(|b| b.mon_assoc_set(core, 0));
            }
        }
        group.perf_misses = None;
        group.perf_refs = None;
        group.ipc = None;
        // Already absent from the registry (and possibly already freed at
        // the backend) if a CDP/MBA-CTRL/IO-RDT flip invalidated it first;
        // that isn't an error for the caller calling `stop` afterwards.
        let _ = sysconfig::unregister_rmid(group.rmid);
        let _ = sysconfig::with_backend(|b| b.mon_free_rmid(group.rmid));
        Ok(())
    }

    /// Reads every event the group was started with, applying delta and
    /// overflow arithmetic against the platform-reported counter width
    /// (spec §4.4 "Delta and overflow"). Per-group reads are ordered
    /// counter-first then timestamp, so a slow read between the hardware
    /// sample and the clock read never inflates the derived bandwidth.
    pub fn poll(&self, group: &mut MonGroup) -> Result<MonValues> {
        let mut values = MonValues::default();
        let mut elapsed = None;
        let mut first_read = true;

        for event in [MonEvent::LLC_OCCUPANCY, MonEvent::LOCAL_MBW, MonEvent::TOTAL_MBW] {
            if !group.events.contains(event) {
                continue;
            }
            let item = self.mon_item(event)?;
            let raw =
                sysconfig::with_backend(|b| b.mon_read_counter(group.repr_core, group.rmid, event))?
                    as u128;
            if first_read {
                let now = Instant::now();
                elapsed = group
                    .prev_instant
                    .map(|prev| now.duration_since(prev).as_secs_f64())
                    .filter(|s| *s > 0.0);
                group.prev_instant = Some(now);
                first_read = false;
            }
            let prev = group.prev_hw.insert(event, raw);
            let delta = match prev {
                Some(p) if raw >= p => raw - p,
                Some(p) => (raw + item.counter_modulus()) - p,
                None => 0,
            };
            let scaled_bytes = delta * item.scale_factor as u128;

            match event {
                MonEvent::LLC_OCCUPANCY => values.llc_occupancy_bytes = Some(raw as u64 * item.scale_factor),
                MonEvent::LOCAL_MBW => {
                    values.local_mbw_bps = elapsed.map(|s| scaled_bytes as f64 / s);
                }
                MonEvent::TOTAL_MBW => {
                    values.total_mbw_bps = elapsed.map(|s| scaled_bytes as f64 / s);
                }
                _ => unreachable!(),
            }
        }

        if let (Some(total), Some(local)) = (values.total_mbw_bps, values.local_mbw_bps) {
            values.remote_mbw_bps = Some((total - local).max(0.0));
        }

        if overflow_tripped(&values) {
            return Err(RdtError::Overflow);
        }

        if let Some(counter) = group.perf_misses.as_mut() {
            values.llc_misses = Some(counter.delta()?);
        }
        if let Some(counter) = group.perf_refs.as_mut() {
            values.llc_references = Some(counter.delta()?);
        }
        if let Some(ipc) = group.ipc.as_mut() {
            values.ipc = Some(ipc.sample()?);
        }

        Ok(values)
    }

    /// Frees every outstanding monitoring resource the backend holds
    /// (spec §4.4 `mon_reset_config`), used by `fini` and by explicit
    /// caller-initiated resets.
    pub fn mon_reset_config(&self) -> Result<()> {
        sysconfig::with_backend(|b| b.mon_reset())
    }
}

/// Individual flags set in `events`, collected into a fixed-capacity
/// buffer since `MonEvent` never grows past its current bit width.
fn flag_iter(events: MonEvent) -> arrayvec::ArrayVec<MonEvent, 14> {
    MonEvent::all().iter().filter(|&e| events.contains(e)).collect()
}

impl AsRawFd for PerfCounter {
    fn as_raw_fd(&self) -> std::os::fd::RawFd {
        self.file.as_raw_fd()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn overflow_wraps_using_counter_modulus() {
        let item = MonCapabilityItem {
            event: MonEvent::LLC_OCCUPANCY,
            max_rmid: 8,
            counter_width_bits: 8,
            scale_factor: 1,
            io_rdt_capable: false,
        };
        let prev: u128 = 250;
        let raw: u128 = 10; // wrapped past 2^8
        let delta = (raw + item.counter_modulus()) - prev;
        assert_eq!(delta, 16);
    }

    #[test]
    fn overflow_trips_above_physical_max_bandwidth() {
        let values = MonValues {
            total_mbw_bps: Some(MAX_PHYSICAL_BANDWIDTH_BPS * 2.0),
            ..Default::default()
        };
        assert!(overflow_tripped(&values));
    }

    #[test]
    fn overflow_does_not_trip_under_physical_max_bandwidth() {
        let values = MonValues { total_mbw_bps: Some(1024.0), ..Default::default() };
        assert!(!overflow_tripped(&values));
    }

    #[test]
    fn derived_remote_is_total_minus_local() {
        let mut values = MonValues {
            total_mbw_bps: Some(100.0),
            local_mbw_bps: Some(40.0),
            ..Default::default()
        };
        values.remote_mbw_bps = Some((values.total_mbw_bps.unwrap() - values.local_mbw_bps.unwrap()).max(0.0));
        assert_eq!(values.remote_mbw_bps, Some(60.0));
    }
}
