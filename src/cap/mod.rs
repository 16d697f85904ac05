//! Capability probe (spec §4.1): resolves the effective back-end interface
//! and produces the immutable `Capability` record that every other
//! subsystem validates requests against.

pub mod event;

use std::env;

use crate::error::{RdtError, Result};
use crate::topology::CpuInfo;

pub use event::{MonCapability, MonCapabilityItem, MonEvent};

#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Interface {
    Auto,
    Msr,
    Os,
    OsResctrlMon,
}

/// Cache-allocation capability, shared shape for L2 and L3 (spec §3
/// `CaCapability`).
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[derive(Clone, Debug)]
pub struct CaCapability {
    pub num_classes: u32,
    pub num_ways: u32,
    pub way_size: u64,
    pub way_contention_mask: u64,
    pub cdp_supported: bool,
    pub cdp_on: bool,
    pub non_contiguous_cbm: bool,
    /// L3 only; always `false` for L2.
    pub io_rdt_supported: bool,
    pub io_rdt_on: bool,
}

impl CaCapability {
    /// All-ways bitmask, the platform default every class resets to.
    pub fn full_mask(&self) -> u64 {
        if self.num_ways >= 64 {
            u64::MAX
        } else {
            (1u64 << self.num_ways) - 1
        }
    }
}

#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum MbaKind {
    Mba,
    Smba,
}

/// MBA/SMBA capability (spec §3 `MbaCapability`); SMBA is modeled as an
/// independent instance of the same shape (Open Question E.3).
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[derive(Clone, Debug)]
pub struct MbaCapability {
    pub kind: MbaKind,
    pub num_classes: u32,
    pub is_linear: bool,
    pub throttle_step: u32,
    pub throttle_max: u32,
    pub ctrl_supported: bool,
    pub ctrl_on: bool,
    pub mba40_supported: bool,
    pub mba40_on: bool,
}

#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[derive(Clone, Debug, Default)]
pub struct Capability {
    pub mon: Option<MonCapability>,
    pub l2ca: Option<CaCapability>,
    pub l3ca: Option<CaCapability>,
    pub mba: Option<MbaCapability>,
    pub smba: Option<MbaCapability>,
}

impl Capability {
    pub fn is_empty(&self) -> bool {
        self.mon.is_none()
            && self.l2ca.is_none()
            && self.l3ca.is_none()
            && self.mba.is_none()
            && self.smba.is_none()
    }
}

/// Back-end-independent probe results used to assemble `Capability`; the
/// `msr`/`os` back-ends each implement this (spec §4.6 dispatch).
pub trait CapProbe {
    fn probe_mon(&self, cpu: &CpuInfo) -> Result<Option<MonCapability>>;
    fn probe_l2ca(&self) -> Result<Option<CaCapability>>;
    fn probe_l3ca(&self) -> Result<Option<CaCapability>>;
    fn probe_mba(&self) -> Result<Option<MbaCapability>>;
    fn probe_smba(&self) -> Result<Option<MbaCapability>>;
}

/// Resolves `requested` against `RDT_IFACE` and host support (spec §4.1).
pub fn discover_interface(requested: Interface, resctrl_present: bool) -> Result<Interface> {
    let env_override = match env::var("RDT_IFACE").ok().as_deref() {
        Some("MSR") => Some(Interface::Msr),
        Some("OS") => Some(Interface::Os),
        Some("OS_RESCTRL_MON") => Some(Interface::OsResctrlMon),
        Some(other) => {
            return Err(RdtError::param(format!("unrecognised RDT_IFACE: {other}")));
        }
        None => None,
    };

    let resolved = match (env_override, requested) {
        (Some(env_iface), Interface::Auto) => env_iface,
        (Some(env_iface), requested) if env_iface == requested => env_iface,
        (Some(_), _) => {
            return Err(RdtError::param(
                "RDT_IFACE conflicts with the interface requested by the caller",
            ));
        }
        (None, Interface::Auto) => {
            if resctrl_present {
                Interface::Os
            } else {
                Interface::Msr
            }
        }
        (None, explicit) => explicit,
    };

    if !cfg!(target_os = "linux")
        && matches!(resolved, Interface::Os | Interface::OsResctrlMon)
    {
        return Err(RdtError::param("OS interface requires Linux"));
    }
    if matches!(resolved, Interface::Os | Interface::OsResctrlMon) && !resctrl_present {
        return Err(RdtError::Internal(std::io::Error::new(
            std::io::ErrorKind::NotFound,
            "resctrl filesystem not mounted",
        )));
    }

    Ok(resolved)
}

/// Probes every feature independently; a feature legitimately absent is
/// not fatal, but the resulting record must expose at least one feature.
pub fn discover_capabilities(probe: &dyn CapProbe, cpu: &CpuInfo) -> Result<Capability> {
    let cap = Capability {
        mon: probe.probe_mon(cpu)?,
        l2ca: probe.probe_l2ca()?,
        l3ca: probe.probe_l3ca()?,
        mba: probe.probe_mba()?,
        smba: probe.probe_smba()?,
    };

    if cap.is_empty() {
        return Err(RdtError::resource("no RDT features detected on this platform"));
    }

    Ok(cap)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn explicit_msr_without_override_is_respected() {
        let iface = discover_interface(Interface::Msr, false).unwrap();
        assert_eq!(iface, Interface::Msr);
    }

    // `RDT_IFACE` is process-global state, so both cases live in one test
    // to avoid racing with other tests that touch the same variable.
    #[test]
    fn env_override_behaviour() {
        std::env::set_var("RDT_IFACE", "MSR");
        assert_eq!(discover_interface(Interface::Auto, false).unwrap(), Interface::Msr);
        assert!(discover_interface(Interface::Os, true).is_err());
        std::env::remove_var("RDT_IFACE");
    }

    #[test]
    fn auto_prefers_os_when_resctrl_present() {
        let iface = discover_interface(Interface::Auto, true).unwrap();
        assert_eq!(iface, Interface::Os);
    }

    #[test]
    fn empty_capability_set_fails() {
        struct Empty;
        impl CapProbe for Empty {
            fn probe_mon(&self, _cpu: &CpuInfo) -> Result<Option<MonCapability>> {
                Ok(None)
            }
            fn probe_l2ca(&self) -> Result<Option<CaCapability>> {
                Ok(None)
            }
            fn probe_l3ca(&self) -> Result<Option<CaCapability>> {
                Ok(None)
            }
            fn probe_mba(&self) -> Result<Option<MbaCapability>> {
                Ok(None)
            }
            fn probe_smba(&self) -> Result<Option<MbaCapability>> {
                Ok(None)
            }
        }
        let cpu = CpuInfo::new(vec![], None, None);
        assert!(discover_capabilities(&Empty, &cpu).is_err());
    }
}
