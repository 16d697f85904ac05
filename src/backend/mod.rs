//! Back-end dispatch (spec §4.6): one `Backend` implementation is chosen
//! at `init` time and never changes for the life of the process — the
//! rest of the crate talks to `dyn Backend` and never branches on the
//! concrete back-end itself.

pub mod msr;
pub mod os;

use crate::cap::event::MonEvent;
use crate::cap::CapProbe;
use crate::error::Result;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CacheTech {
    L2,
    L3,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum MbaTech {
    Mba,
    Smba,
}

/// Operations every back-end must provide, grouped by the subsystem that
/// calls them (capability probing lives on `CapProbe`, implemented
/// separately by each back-end).
pub trait Backend: CapProbe {
    // --- allocation: cache masks -------------------------------------
    fn write_ca_mask(&self, tech: CacheTech, core: u32, class_id: u32, mask: u64) -> Result<()>;
    fn read_ca_mask(&self, tech: CacheTech, core: u32, class_id: u32) -> Result<u64>;
    fn write_ca_mask_cdp(
        &self,
        tech: CacheTech,
        core: u32,
        class_id: u32,
        code_mask: u64,
        data_mask: u64,
    ) -> Result<()>;
    fn read_ca_mask_cdp(&self, tech: CacheTech, core: u32, class_id: u32) -> Result<(u64, u64)>;

    // --- allocation: MBA/SMBA throttle --------------------------------
    fn write_mba(&self, tech: MbaTech, core: u32, class_id: u32, percent: u32) -> Result<()>;
    fn read_mba(&self, tech: MbaTech, core: u32, class_id: u32) -> Result<u32>;

    // --- associations ---------------------------------------------------
    fn set_assoc(&self, core: u32, l3_class: Option<u32>, mba_class: Option<u32>) -> Result<()>;
    fn get_assoc(&self, core: u32) -> Result<(u32, u32)>;
    fn set_assoc_pid(&self, pid: u32, l3_class: u32) -> Result<()>;
    fn get_assoc_pid(&self, pid: u32) -> Result<u32>;
    fn set_assoc_channel(&self, channel: u64, l3_class: u32) -> Result<()>;
    fn get_assoc_channel(&self, channel: u64) -> Result<u32>;

    /// Binds `pid` to a monitoring RMID. Distinct from `set_assoc_pid`,
    /// which binds a COS: RMID and COS are separate id spaces, so a
    /// monitored PID must never be routed through the COS path.
    fn mon_assoc_set_pid(&self, pid: u32, rmid: u32) -> Result<()>;

    // --- state flips (CDP / MBA-CTRL / IO-RDT) -------------------------
    fn flip_cdp(&self, tech: CacheTech, on: bool) -> Result<()>;
    fn flip_mba_ctrl(&self, on: bool) -> Result<()>;
    fn flip_iordt(&self, on: bool) -> Result<()>;

    // --- monitoring -----------------------------------------------------
    fn mon_alloc_rmid(&self) -> Result<u32>;
    fn mon_free_rmid(&self, rmid: u32) -> Result<()>;
    fn mon_assoc_set(&self, core: u32, rmid: u32) -> Result<()>;
    fn mon_assoc_get(&self, core: u32) -> Result<u32>;
    /// Raw (unscaled) counter reading for `event` on `rmid`, scoped to
    /// `core` (the MSR path is logical-processor-scoped: `IA32_QM_EVTSEL`/
    /// `IA32_QM_CTR` must be read on the same core the RMID's group is
    /// bound to, not an arbitrary one).
    fn mon_read_counter(&self, core: u32, rmid: u32, event: MonEvent) -> Result<u64>;
    fn mon_reset(&self) -> Result<()>;
}
