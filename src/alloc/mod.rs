//! Allocation engine (spec §4.3): class-mask validation, MBA throttle
//! percentages, and the four association kinds (core/task/channel),
//! dispatched through the process-wide backend chosen at `init`.

use crate::backend::{CacheTech, MbaTech};
use crate::cap::{CaCapability, Capability, Interface, MbaCapability};
use crate::error::{RdtError, Result};
use crate::sysconfig;

/// A validated cache-capacity bitmask (spec §3 `ClassMask`).
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ClassMask(pub u64);

impl ClassMask {
    /// Checks non-zero, width-within-`num_ways`, and (unless the platform
    /// allows it) a single contiguous run of set bits.
    pub fn validate(mask: u64, cap: &CaCapability) -> Result<()> {
        if mask == 0 {
            return Err(RdtError::param("class mask must not be zero"));
        }
        if mask & !cap.full_mask() != 0 {
            return Err(RdtError::param(format!(
                "class mask {mask:#x} exceeds the {}-way range",
                cap.num_ways
            )));
        }
        if !cap.non_contiguous_cbm && !is_contiguous(mask) {
            return Err(RdtError::param(format!(
                "class mask {mask:#x} is not a contiguous bit run on a platform \
                 that requires one"
            )));
        }
        Ok(())
    }
}

fn is_contiguous(mask: u64) -> bool {
    let lowest = mask & mask.wrapping_neg();
    let run = mask.wrapping_add(lowest);
    run & mask == 0
}

/// Rounds `percent` down to a multiple of `throttle_step`, the only values
/// a back-end accepts (spec §4.3 "MBA granularity").
fn snap_mba_percent(percent: u32, cap: &MbaCapability) -> Result<u32> {
    if percent > cap.throttle_max {
        return Err(RdtError::param(format!(
            "MBA percent {percent} exceeds throttle_max {}",
            cap.throttle_max
        )));
    }
    if cap.is_linear {
        Ok((percent / cap.throttle_step) * cap.throttle_step)
    } else {
        Ok(percent)
    }
}

/// Applies `write` for `new_value` across every core in `cores`, rolling
/// writes already applied back to their prior value (read via `read`) if a
/// later core in the fan-out fails (spec §4.3 "Applies the mask to the
/// hardware class register for every core belonging to `cluster_id`...
/// partial failure after the first write rolls back via best-effort
/// restoration of prior masks").
fn fan_out_with_rollback<T: Copy>(
    cores: &[u32],
    new_value: T,
    write: impl Fn(u32, T) -> Result<()>,
    read: impl Fn(u32) -> Result<T>,
) -> Result<()> {
    let mut applied = Vec::new();
    for &core in cores {
        let prev = read(core)?;
        if let Err(e) = write(core, new_value) {
            for (c, p) in applied.into_iter().rev() {
                let _ = write(c, p);
            }
            return Err(e);
        }
        applied.push((core, prev));
    }
    Ok(())
}

/// Which technologies an `alloc_assign` call spans (spec §4.3
/// `alloc_assign`): at least one must be set.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct AllocTech {
    pub l3: bool,
    pub l2: bool,
    pub mba: bool,
}

/// An MBA/SMBA class setpoint: a raw throttle percentage (`ctrl=0`) or a
/// bytes/second target handed to MBA-CTRL or the software controller
/// (`ctrl=1`, spec §4.3 "For `ctrl=1`...").
#[derive(Clone, Copy, Debug, PartialEq)]
pub enum MbaValue {
    Percent(u32),
    BytesPerSec(f64),
}

/// Thin handle returned by `sysconfig::alloc_engine`; carries no state of
/// its own, every call reads the live snapshot and dispatches to the
/// active backend.
pub struct AllocEngine;

impl AllocEngine {
    fn cap(&self) -> Result<Capability> {
        sysconfig::with_snapshot(|s| s.cap.clone())
    }

    fn l3_cap(&self) -> Result<CaCapability> {
        self.cap()?.l3ca.ok_or_else(|| RdtError::resource("L3 CAT not available"))
    }

    fn l2_cap(&self) -> Result<CaCapability> {
        self.cap()?.l2ca.ok_or_else(|| RdtError::resource("L2 CAT not available"))
    }

    fn mba_cap(&self, tech: MbaTech) -> Result<MbaCapability> {
        let cap = self.cap()?;
        match tech {
            MbaTech::Mba => cap.mba.ok_or_else(|| RdtError::resource("MBA not available")),
            MbaTech::Smba => cap.smba.ok_or_else(|| RdtError::resource("SMBA not available")),
        }
    }

    fn l3_cluster_of(&self, core: u32) -> Result<u32> {
        sysconfig::with_snapshot(|s| s.cpu.core(core).map(|c| c.l3_cluster))?
            .ok_or_else(|| RdtError::param(format!("unknown core {core}")))
    }

    fn l2_cluster_of(&self, core: u32) -> Result<u32> {
        sysconfig::with_snapshot(|s| s.cpu.core(core).map(|c| c.l2_cluster))?
            .ok_or_else(|| RdtError::param(format!("unknown core {core}")))
    }

    fn mba_cluster_of(&self, core: u32) -> Result<u32> {
        sysconfig::with_snapshot(|s| s.cpu.core(core).map(|c| c.mba_cluster))?
            .ok_or_else(|| RdtError::param(format!("unknown core {core}")))
    }

    pub fn l3ca_set(&self, core: u32, class_id: u32, mask: u64) -> Result<()> {
        let cap = self.l3_cap()?;
        if cap.cdp_on {
            return Err(RdtError::param("L3 CDP is enabled; use l3ca_set_cdp instead"));
        }
        ClassMask::validate(mask, &cap)?;
        sysconfig::logger()?.verbose(format!("l3ca_set core={core} class={class_id} mask={mask:#x}"));
        let cluster = self.l3_cluster_of(core)?;
        let cores = sysconfig::with_snapshot(|s| s.cpu.cores_in_l3_cluster(cluster))?;
        fan_out_with_rollback(
            &cores,
            mask,
            |c, m| sysconfig::with_backend(|b| b.write_ca_mask(CacheTech::L3, c, class_id, m)),
            |c| sysconfig::with_backend(|b| b.read_ca_mask(CacheTech::L3, c, class_id)),
        )
    }

    pub fn l3ca_get(&self, core: u32, class_id: u32) -> Result<u64> {
        sysconfig::with_backend(|b| b.read_ca_mask(CacheTech::L3, core, class_id))
    }

    pub fn l3ca_set_cdp(&self, core: u32, class_id: u32, code_mask: u64, data_mask: u64) -> Result<()> {
        let cap = self.l3_cap()?;
        if !cap.cdp_on {
            return Err(RdtError::param("CDP is not enabled for L3 CAT"));
        }
        ClassMask::validate(code_mask, &cap)?;
        ClassMask::validate(data_mask, &cap)?;
        sysconfig::with_backend(|b| b.write_ca_mask_cdp(CacheTech::L3, core, class_id, code_mask, data_mask))
    }

    pub fn l3ca_get_cdp(&self, core: u32, class_id: u32) -> Result<(u64, u64)> {
        sysconfig::with_backend(|b| b.read_ca_mask_cdp(CacheTech::L3, core, class_id))
    }

    pub fn l2ca_set(&self, core: u32, class_id: u32, mask: u64) -> Result<()> {
        let cap = self.l2_cap()?;
        if cap.cdp_on {
            return Err(RdtError::param("L2 CDP is enabled; use a CDP-aware setter instead"));
        }
        ClassMask::validate(mask, &cap)?;
        let cluster = self.l2_cluster_of(core)?;
        let cores = sysconfig::with_snapshot(|s| s.cpu.cores_in_l2_cluster(cluster))?;
        fan_out_with_rollback(
            &cores,
            mask,
            |c, m| sysconfig::with_backend(|b| b.write_ca_mask(CacheTech::L2, c, class_id, m)),
            |c| sysconfig::with_backend(|b| b.read_ca_mask(CacheTech::L2, c, class_id)),
        )
    }

    pub fn l2ca_get(&self, core: u32, class_id: u32) -> Result<u64> {
        sysconfig::with_backend(|b| b.read_ca_mask(CacheTech::L2, core, class_id))
    }

    /// Sets `class_id`'s MBA throttle across every core in `core`'s MBA
    /// cluster (spec §4.3 "MBA granularity" / "State flips"). `ctrl=1`
    /// (`MbaValue::BytesPerSec`) is accepted only when MBA-CTRL is already
    /// enabled on the platform, or handed off to the MSR software
    /// controller (spec §4.5) when the back-end is linear MSR MBA.
    pub fn mba_set(&self, core: u32, class_id: u32, value: MbaValue) -> Result<()> {
        let cap = self.mba_cap(MbaTech::Mba)?;
        match value {
            MbaValue::Percent(percent) => {
                let snapped = snap_mba_percent(percent, &cap)?;
                let cluster = self.mba_cluster_of(core)?;
                // A direct rate write overrides whatever the software
                // controller thinks the rate should be; stop it first so it
                // doesn't immediately clobber this write on its next tick.
                sysconfig::mba_sc_stop(cluster)?;
                let cores = sysconfig::with_snapshot(|s| s.cpu.cores_in_mba_cluster(cluster))?;
                fan_out_with_rollback(
                    &cores,
                    snapped,
                    |c, v| sysconfig::with_backend(|b| b.write_mba(MbaTech::Mba, c, class_id, v)),
                    |c| sysconfig::with_backend(|b| b.read_mba(MbaTech::Mba, c, class_id)),
                )
            }
            MbaValue::BytesPerSec(bps) => {
                if cap.ctrl_on {
                    return sysconfig::with_backend(|b| {
                        b.write_mba(MbaTech::Mba, core, class_id, bps as u32)
                    });
                }
                let interface = sysconfig::inter_get()?;
                if interface != Interface::Msr || !cap.is_linear {
                    return Err(RdtError::resource(
                        "ctrl=1 MBA requires MBA-CTRL or the MSR software controller (is_linear)",
                    ));
                }
                let cluster = self.mba_cluster_of(core)?;
                let cores = sysconfig::with_snapshot(|s| s.cpu.cores_in_mba_cluster(cluster))?;
                self.mba_set(core, class_id, MbaValue::Percent(crate::mba_sc::MBA_SC_DEF_INIT_MBA))?;
                sysconfig::mba_sc_start(cluster, cores, class_id, bps)
            }
        }
    }

    pub fn mba_get(&self, core: u32, class_id: u32) -> Result<u32> {
        sysconfig::with_backend(|b| b.read_mba(MbaTech::Mba, core, class_id))
    }

    /// SMBA counterpart of [`Self::mba_set`]; there is no software
    /// controller for SMBA (spec §4.5 is MBA-only), so `ctrl=1` is only
    /// accepted when MBA-CTRL already reports SMBA as enabled.
    pub fn smba_set(&self, core: u32, class_id: u32, value: MbaValue) -> Result<()> {
        let cap = self.mba_cap(MbaTech::Smba)?;
        match value {
            MbaValue::Percent(percent) => {
                let snapped = snap_mba_percent(percent, &cap)?;
                let cluster = self.mba_cluster_of(core)?;
                let cores = sysconfig::with_snapshot(|s| s.cpu.cores_in_mba_cluster(cluster))?;
                fan_out_with_rollback(
                    &cores,
                    snapped,
                    |c, v| sysconfig::with_backend(|b| b.write_mba(MbaTech::Smba, c, class_id, v)),
                    |c| sysconfig::with_backend(|b| b.read_mba(MbaTech::Smba, c, class_id)),
                )
            }
            MbaValue::BytesPerSec(bps) => {
                if !cap.ctrl_on {
                    return Err(RdtError::resource("ctrl=1 SMBA requires MBA-CTRL"));
                }
                sysconfig::with_backend(|b| b.write_mba(MbaTech::Smba, core, class_id, bps as u32))
            }
        }
    }

    pub fn smba_get(&self, core: u32, class_id: u32) -> Result<u32> {
        sysconfig::with_backend(|b| b.read_mba(MbaTech::Smba, core, class_id))
    }

    /// Binds `core` directly to the given L3/MBA classes; either class may
    /// be left unchanged by passing `None`. Distinct from [`Self::alloc_assign`],
    /// which picks the class for the caller instead of taking one explicitly.
    pub fn assoc_set(&self, core: u32, l3_class: Option<u32>, mba_class: Option<u32>) -> Result<()> {
        sysconfig::with_backend(|b| b.set_assoc(core, l3_class, mba_class))
    }

    /// Restores `core` to COS0, the platform default association.
    pub fn assoc_release(&self, core: u32) -> Result<()> {
        sysconfig::with_backend(|b| b.set_assoc(core, Some(0), Some(0)))
    }

    /// Finds the lowest-indexed class of service unused across every core
    /// sharing a cluster with any of `cores` (for the requested
    /// technologies), binds all of `cores` to it, and returns it (spec
    /// §4.3 `alloc_assign`: "find the lowest-indexed unused class across
    /// the requested technologies on the cores' clusters and bind all
    /// given cores to it. Returns `RESOURCE` when none free.").
    pub fn alloc_assign(&self, tech: AllocTech, cores: &[u32]) -> Result<u32> {
        if cores.is_empty() {
            return Err(RdtError::param("alloc_assign requires at least one core"));
        }

        let mut num_classes = u32::MAX;
        if tech.l3 {
            num_classes = num_classes.min(self.l3_cap()?.num_classes);
        }
        if tech.l2 {
            num_classes = num_classes.min(self.l2_cap()?.num_classes);
        }
        if tech.mba {
            num_classes = num_classes.min(self.mba_cap(MbaTech::Mba)?.num_classes);
        }
        if num_classes == u32::MAX {
            return Err(RdtError::param("alloc_assign requires at least one technology"));
        }

        let mut scope_cores = std::collections::BTreeSet::new();
        for &core in cores {
            if tech.l3 {
                let cluster = self.l3_cluster_of(core)?;
                scope_cores.extend(sysconfig::with_snapshot(|s| s.cpu.cores_in_l3_cluster(cluster))?);
            }
            if tech.l2 {
                let cluster = self.l2_cluster_of(core)?;
                scope_cores.extend(sysconfig::with_snapshot(|s| s.cpu.cores_in_l2_cluster(cluster))?);
            }
            if tech.mba {
                let cluster = self.mba_cluster_of(core)?;
                scope_cores.extend(sysconfig::with_snapshot(|s| s.cpu.cores_in_mba_cluster(cluster))?);
            }
        }

        let mut used = std::collections::HashSet::new();
        for &core in &scope_cores {
            let (l3_class, mba_class) = sysconfig::with_backend(|b| b.get_assoc(core))?;
            if tech.l3 || tech.l2 {
                used.insert(l3_class);
            }
            if tech.mba {
                used.insert(mba_class);
            }
        }

        let class_id = (0..num_classes)
            .find(|c| !used.contains(c))
            .ok_or_else(|| RdtError::resource("no free class of service"))?;

        for &core in cores {
            sysconfig::with_backend(|b| {
                b.set_assoc(
                    core,
                    (tech.l3 || tech.l2).then_some(class_id),
                    tech.mba.then_some(class_id),
                )
            })?;
        }
        Ok(class_id)
    }

    pub fn assoc_get(&self, core: u32) -> Result<(u32, u32)> {
        sysconfig::with_backend(|b| b.get_assoc(core))
    }

    pub fn assoc_set_pid(&self, pid: u32, l3_class: u32) -> Result<()> {
        sysconfig::with_backend(|b| b.set_assoc_pid(pid, l3_class))
    }

    pub fn assoc_get_pid(&self, pid: u32) -> Result<u32> {
        sysconfig::with_backend(|b| b.get_assoc_pid(pid))
    }

    pub fn assoc_set_channel(&self, channel: u64, l3_class: u32) -> Result<()> {
        sysconfig::with_backend(|b| b.set_assoc_channel(channel, l3_class))
    }

    pub fn assoc_get_channel(&self, channel: u64) -> Result<u32> {
        sysconfig::with_backend(|b| b.get_assoc_channel(channel))
    }

    /// Flips CDP/MBA-CTRL/IO-RDT and resets every class mask back to the
    /// platform default (spec §4.3 "State flips"). `None` leaves a mode
    /// untouched.
    pub fn alloc_reset_config(
        &self,
        cdp_l3: Option<bool>,
        cdp_l2: Option<bool>,
        mba_ctrl: Option<bool>,
        iordt: Option<bool>,
    ) -> Result<()> {
        // Live monitoring groups and software-controlled MBA clusters are
        // invalidated before the flip, not left in an unenforced undefined
        // state (Open Question decision).
        sysconfig::invalidate_live_groups()?;
        sysconfig::mba_sc_exit_all()?;

        sysconfig::with_backend(|b| {
            if let Some(on) = cdp_l3 {
                b.flip_cdp(CacheTech::L3, on)?;
            }
            if let Some(on) = cdp_l2 {
                b.flip_cdp(CacheTech::L2, on)?;
            }
            if let Some(on) = mba_ctrl {
                b.flip_mba_ctrl(on)?;
            }
            if let Some(on) = iordt {
                b.flip_iordt(on)?;
            }
            Ok(())
        })?;

        let cpu = sysconfig::with_snapshot(|s| s.cpu.clone())?;
        let new_cap = sysconfig::with_backend(|b| crate::cap::discover_capabilities(b, &cpu))?;
        sysconfig::replace_capability(new_cap)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cap(num_ways: u32, non_contiguous: bool) -> CaCapability {
        CaCapability {
            num_classes: 4,
            num_ways,
            way_size: 1 << 20,
            way_contention_mask: 0,
            cdp_supported: true,
            cdp_on: false,
            non_contiguous_cbm: non_contiguous,
            io_rdt_supported: false,
            io_rdt_on: false,
        }
    }

    #[test]
    fn rejects_zero_mask() {
        assert!(ClassMask::validate(0, &cap(8, false)).is_err());
    }

    #[test]
    fn rejects_mask_wider_than_ways() {
        assert!(ClassMask::validate(0xFF00, &cap(8, false)).is_err());
    }

    #[test]
    fn rejects_non_contiguous_when_unsupported() {
        assert!(ClassMask::validate(0b1011, &cap(8, false)).is_err());
        assert!(ClassMask::validate(0b0111, &cap(8, false)).is_ok());
    }

    #[test]
    fn allows_non_contiguous_when_platform_supports_it() {
        assert!(ClassMask::validate(0b1011, &cap(8, true)).is_ok());
    }

    #[test]
    fn mba_percent_snaps_down_to_step() {
        let c = MbaCapability {
            kind: crate::cap::MbaKind::Mba,
            num_classes: 8,
            is_linear: true,
            throttle_step: 10,
            throttle_max: 100,
            ctrl_supported: false,
            ctrl_on: false,
            mba40_supported: false,
            mba40_on: false,
        };
        assert_eq!(snap_mba_percent(47, &c).unwrap(), 40);
        assert!(snap_mba_percent(150, &c).is_err());
    }
}
