//! Control plane for Intel Resource Director Technology: cache/memory-
//! bandwidth monitoring (CMT/MBM) and allocation (CAT/CDP/MBA), dispatched
//! through either direct MSR access or the Linux `resctrl` pseudo-filesystem
//! behind one interface chosen at `init` time.
//!
//! ## Example
//!
//! ```no_run
//! use rdtctl::sysconfig::{self, InitConfig};
//! use rdtctl::cap::Interface;
//! use rdtctl::cap::event::MonEvent;
//!
//! let mut config = InitConfig::default();
//! config.interface = Interface::Auto;
//! sysconfig::init(config).unwrap();
//!
//! let mon = sysconfig::mon_engine().unwrap();
//! let mut group = mon.start_cores(vec![0], MonEvent::LLC_OCCUPANCY).unwrap();
//! let values = mon.poll(&mut group).unwrap();
//! println!("{:?}", values.llc_occupancy_bytes);
//! mon.stop(group).unwrap();
//!
//! sysconfig::fini().unwrap();
//! ```
//!
//! ## Interfaces
//!
//! `RDT_IFACE` selects the back-end ahead of `init`: `MSR` for direct
//! register access, `OS` for `resctrl`, `OS_RESCTRL_MON` to additionally
//! prefer resctrl's own monitoring files over hardware MBM/CMT registers.
//! Leaving it unset lets `init` pick `OS` when `resctrl` is mounted and
//! `MSR` otherwise.

pub mod alloc;
pub mod backend;
pub mod cap;
pub mod error;
pub(crate) mod ffi;
pub mod mba_sc;
pub mod mon;
pub mod profiles;
pub mod sysconfig;
pub mod topology;
pub mod utils;

pub use error::{RdtError, Result};
