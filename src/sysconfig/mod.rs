//! Process-wide state (spec §4.2): a single initialised snapshot behind a
//! file lock and an in-process latch. The teacher's module-level statics
//! (`Thaumy-perf-event-open` has none of its own, being stateless per
//! `Counter`) become one heap-owned snapshot behind accessors here,
//! replacing any implicit init-order assumption with an explicit latch.

use std::path::PathBuf;
use std::sync::{Arc, Mutex, OnceLock, RwLock};
use std::time::Duration;

use crate::alloc::AllocEngine;
use crate::backend::msr::MsrBackend;
use crate::backend::os::OsBackend;
use crate::backend::Backend;
use crate::cap::{self, Capability, Interface};
use crate::error::{RdtError, Result};
use crate::mba_sc::MbaScManager;
use crate::mon::MonEngine;
use crate::topology::CpuInfo;
use crate::utils::lock::{self, RdtLock};
use crate::utils::log::{LogCallback, Logger, Verbosity};

/// A PCIe device addressable by I/O RDT (spec §3 `Device`).
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Device {
    pub segment: u16,
    pub bus: u8,
    pub device: u8,
    pub function: u8,
    pub virtual_channel: u8,
}

impl Device {
    /// Sentinel meaning "all virtual channels" (spec §3 `DEV_ALL_VCS`).
    pub const DEV_ALL_VCS: u8 = 0xFF;
}

/// Opaque I/O-RDT channel identifier (spec §3 `Channel`).
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct Channel(pub u64);

pub enum LogSink {
    None,
    Fd(std::fs::File),
    Callback(LogCallback),
}

pub struct InitConfig {
    pub verbose: Verbosity,
    pub interface: Interface,
    pub log_sink: LogSink,
    pub lock_path: Option<PathBuf>,
    pub lock_retries: u32,
    pub lock_retry_interval: Duration,
    pub resctrl_root: Option<PathBuf>,
}

impl Default for InitConfig {
    fn default() -> Self {
        InitConfig {
            verbose: Verbosity::Silent,
            interface: Interface::Auto,
            log_sink: LogSink::None,
            lock_path: None,
            lock_retries: 3,
            lock_retry_interval: Duration::from_millis(50),
            resctrl_root: None,
        }
    }
}

/// Immutable-once-built snapshot shared by every public accessor.
pub struct Snapshot {
    pub interface: Interface,
    pub cap: Capability,
    pub cpu: CpuInfo,
    pub devinfo: Vec<Device>,
}

struct LibState {
    snapshot: Arc<Snapshot>,
    backend: Arc<dyn Backend + Send + Sync>,
    logger: Arc<Logger>,
    _lock: RdtLock,
    /// RMIDs of every monitoring group currently live, so a CDP/MBA-CTRL/
    /// IO-RDT state flip can invalidate them (spec §4.3 Open Question:
    /// live groups are stopped rather than left in an unenforced
    /// undefined state).
    live_rmids: std::sync::Mutex<std::collections::HashSet<u32>>,
    /// Running MBA software-controller threads (spec §4.5), reachable so
    /// `alloc_reset_config`/`fini` can tear them down before a state flip.
    mba_sc: Arc<Mutex<MbaScManager>>,
}

static STATE: OnceLock<RwLock<Option<LibState>>> = OnceLock::new();

fn state_lock() -> &'static RwLock<Option<LibState>> {
    STATE.get_or_init(|| RwLock::new(None))
}

/// Discovers a bare-bones topology by reading `/sys/devices/system/cpu`
/// when available, falling back to a single-core record so the library
/// still initialises on hosts/sandboxes without that sysfs tree.
fn discover_topology() -> CpuInfo {
    let online = std::fs::read_to_string("/sys/devices/system/cpu/online")
        .ok()
        .and_then(|s| crate::utils::parse::parse_id_list(s.trim()).ok())
        .filter(|v| !v.is_empty())
        .unwrap_or_else(|| vec![0]);

    let cores = online
        .into_iter()
        .map(|lcore| {
            let socket = sysfs_u32(&format!(
                "/sys/devices/system/cpu/cpu{lcore}/topology/physical_package_id"
            ))
            .unwrap_or(0);
            crate::topology::Core {
                lcore,
                socket,
                l2_cluster: socket,
                l3_cluster: socket,
                mba_cluster: socket,
            }
        })
        .collect();

    CpuInfo::new(cores, None, None)
}

fn sysfs_u32(path: &str) -> Option<u32> {
    std::fs::read_to_string(path).ok()?.trim().parse().ok()
}

/// Acquires the process lock, probes capabilities, and flips the
/// initialised latch. On any failure every earlier step is unwound.
pub fn init(config: InitConfig) -> Result<()> {
    init_inner(config, None)
}

/// Bypasses hardware probing with a canned backend/capability pair, so the
/// init/fini lifecycle itself can be exercised on hosts without real RDT
/// silicon (every CI sandbox this crate has run in so far).
#[cfg(test)]
pub(crate) fn init_for_test(
    config: InitConfig,
    backend: Arc<dyn Backend + Send + Sync>,
    capability: Capability,
) -> Result<()> {
    init_inner(config, Some((backend, capability)))
}

fn init_inner(
    config: InitConfig,
    test_override: Option<(Arc<dyn Backend + Send + Sync>, Capability)>,
) -> Result<()> {
    let mut guard = state_lock().write().expect("state lock poisoned");
    if guard.is_some() {
        return Err(RdtError::AlreadyInitialized);
    }

    let logger = Arc::new(match config.log_sink {
        LogSink::None => Logger::silent(),
        LogSink::Fd(file) => Logger::with_fd(config.verbose, file),
        LogSink::Callback(cb) => Logger::with_callback(config.verbose, cb),
    });
    logger.verbose("acquiring configuration lock");

    let lock_path = config.lock_path.unwrap_or_else(lock::default_lock_path);
    let file_lock = RdtLock::acquire(&lock_path, config.lock_retries, config.lock_retry_interval)?;

    let resctrl_root = config.resctrl_root.unwrap_or_else(OsBackend::default_root);
    let resctrl_present = OsBackend::is_present(&resctrl_root);

    let interface = match cap::discover_interface(config.interface, resctrl_present) {
        Ok(iface) => iface,
        Err(e) => {
            logger.error(format!("interface discovery failed: {e}"));
            return Err(e);
        }
    };
    logger.verbose(format!("effective interface: {interface:?}"));

    let cpu = discover_topology();

    let (backend, capability) = match test_override {
        Some((backend, capability)) => (backend, capability),
        None => {
            let backend: Arc<dyn Backend + Send + Sync> = match interface {
                Interface::Msr => Arc::new(MsrBackend::new()),
                Interface::Os | Interface::OsResctrlMon => Arc::new(OsBackend::new(resctrl_root)),
                Interface::Auto => unreachable!("discover_interface always resolves Auto"),
            };
            let capability = match cap::discover_capabilities(backend.as_ref(), &cpu) {
                Ok(c) => c,
                Err(e) => {
                    logger.error(format!("capability discovery failed: {e}"));
                    return Err(e);
                }
            };
            (backend, capability)
        }
    };

    let snapshot = Arc::new(Snapshot {
        interface,
        cap: capability,
        cpu,
        devinfo: Vec::new(),
    });

    *guard = Some(LibState {
        snapshot,
        backend,
        logger,
        _lock: file_lock,
        live_rmids: std::sync::Mutex::new(std::collections::HashSet::new()),
        mba_sc: Arc::new(Mutex::new(MbaScManager::new())),
    });

    Ok(())
}

/// Tears down monitoring/allocation state, releases the lock, and flips
/// the latch back off. Intermediate failures are aggregated, not dropped.
pub fn fini() -> Result<()> {
    mba_sc_exit_all()?;
    invalidate_live_groups()?;

    let mut guard = state_lock().write().expect("state lock poisoned");
    let state = guard.take().ok_or(RdtError::NotInitialized)?;
    state.logger.verbose("tearing down");
    // Monitoring/allocation reset is best-effort during teardown: a
    // failure here must not leave the lock held or the latch stuck on.
    let mon_reset = state.backend.mon_reset();
    if let Err(e) = &mon_reset {
        state.logger.error(format!("mon reset during fini failed: {e}"));
    }
    mon_reset
}

pub fn check_init(expect: bool) -> Result<()> {
    let guard = state_lock().read().expect("state lock poisoned");
    match (guard.is_some(), expect) {
        (true, true) | (false, false) => Ok(()),
        (false, true) => Err(RdtError::NotInitialized),
        (true, false) => Err(RdtError::AlreadyInitialized),
    }
}

pub fn inter_get() -> Result<Interface> {
    with_snapshot(|s| s.interface)
}

pub fn sysconfig_get() -> Result<Arc<Snapshot>> {
    let guard = state_lock().read().expect("state lock poisoned");
    guard
        .as_ref()
        .map(|s| Arc::clone(&s.snapshot))
        .ok_or(RdtError::NotInitialized)
}

pub(crate) fn with_snapshot<T>(f: impl FnOnce(&Snapshot) -> T) -> Result<T> {
    let guard = state_lock().read().expect("state lock poisoned");
    guard
        .as_ref()
        .map(|s| f(&s.snapshot))
        .ok_or(RdtError::NotInitialized)
}

pub(crate) fn with_backend<T>(f: impl FnOnce(&(dyn Backend + Send + Sync)) -> Result<T>) -> Result<T> {
    let guard = state_lock().read().expect("state lock poisoned");
    match guard.as_ref() {
        Some(s) => f(s.backend.as_ref()),
        None => Err(RdtError::NotInitialized),
    }
}

pub(crate) fn logger() -> Result<Arc<Logger>> {
    let guard = state_lock().read().expect("state lock poisoned");
    guard.as_ref().map(|s| Arc::clone(&s.logger)).ok_or(RdtError::NotInitialized)
}

pub(crate) fn register_rmid(rmid: u32) -> Result<()> {
    let guard = state_lock().read().expect("state lock poisoned");
    let state = guard.as_ref().ok_or(RdtError::NotInitialized)?;
    state.live_rmids.lock().expect("live_rmids lock poisoned").insert(rmid);
    Ok(())
}

pub(crate) fn unregister_rmid(rmid: u32) -> Result<()> {
    let guard = state_lock().read().expect("state lock poisoned");
    let state = guard.as_ref().ok_or(RdtError::NotInitialized)?;
    state.live_rmids.lock().expect("live_rmids lock poisoned").remove(&rmid);
    Ok(())
}

/// Frees every live monitoring group's RMID and clears the registry: a
/// CDP/MBA-CTRL/IO-RDT state flip invalidates live groups rather than
/// leaving them in an unenforced state (spec §4.3 Open Question).
pub(crate) fn invalidate_live_groups() -> Result<()> {
    let guard = state_lock().read().expect("state lock poisoned");
    let state = guard.as_ref().ok_or(RdtError::NotInitialized)?;
    let rmids: Vec<u32> = state
        .live_rmids
        .lock()
        .expect("live_rmids lock poisoned")
        .drain()
        .collect();
    for rmid in rmids {
        let _ = state.backend.mon_free_rmid(rmid);
    }
    Ok(())
}

/// Starts an MBA software-controller regulator for `cluster` (spec §4.5).
/// The outer state guard is dropped before calling into `MbaScManager`,
/// since `start` itself calls back into `mon_engine`/`alloc_engine`, which
/// would otherwise try to re-acquire this same `RwLock`.
pub(crate) fn mba_sc_start(cluster: u32, cores: Vec<u32>, class_id: u32, max_bw_bps: f64) -> Result<()> {
    let guard = state_lock().read().expect("state lock poisoned");
    let state = guard.as_ref().ok_or(RdtError::NotInitialized)?;
    let mba_sc = Arc::clone(&state.mba_sc);
    drop(guard);
    let mut mba_sc = mba_sc.lock().expect("mba_sc lock poisoned");
    mba_sc.start(cluster, cores, class_id, max_bw_bps)
}

pub(crate) fn mba_sc_stop(cluster: u32) -> Result<()> {
    let guard = state_lock().read().expect("state lock poisoned");
    let state = guard.as_ref().ok_or(RdtError::NotInitialized)?;
    let mba_sc = Arc::clone(&state.mba_sc);
    drop(guard);
    let mut mba_sc = mba_sc.lock().expect("mba_sc lock poisoned");
    mba_sc.stop(cluster)
}

/// Stops every running MBA software-controller regulator, used by `fini`
/// and by `alloc_reset_config` before a CDP/MBA-CTRL/IO-RDT state flip.
pub(crate) fn mba_sc_exit_all() -> Result<()> {
    let guard = state_lock().read().expect("state lock poisoned");
    let state = match guard.as_ref() {
        Some(s) => s,
        None => return Ok(()),
    };
    let mba_sc = Arc::clone(&state.mba_sc);
    drop(guard);
    let mut mba_sc = mba_sc.lock().expect("mba_sc lock poisoned");
    mba_sc.exit_all()
}

/// Replaces the capability record in place after a successful state flip
/// (CDP/MBA-CTRL/IO-RDT), so later validation observes the new mode
/// (spec §4.3 "State flips").
pub(crate) fn replace_capability(cap: Capability) -> Result<()> {
    let mut guard = state_lock().write().expect("state lock poisoned");
    let state = guard.as_mut().ok_or(RdtError::NotInitialized)?;
    state.snapshot = Arc::new(Snapshot {
        interface: state.snapshot.interface,
        cap,
        cpu: state.snapshot.cpu.clone(),
        devinfo: state.snapshot.devinfo.clone(),
    });
    Ok(())
}

/// Convenience used by `alloc`/`mon` engines that need both engines alive
/// across the library's lifetime; constructed once per `init`.
pub fn alloc_engine() -> Result<AllocEngine> {
    check_init(true)?;
    Ok(AllocEngine)
}

pub fn mon_engine() -> Result<MonEngine> {
    check_init(true)?;
    Ok(MonEngine::new())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cap::event::MonCapability;
    use serial_test::serial;

    fn base_config(lock_path: PathBuf) -> InitConfig {
        InitConfig {
            interface: Interface::Msr,
            lock_path: Some(lock_path),
            ..Default::default()
        }
    }

    fn fake_capability() -> Capability {
        Capability {
            mon: Some(MonCapability::default()),
            ..Default::default()
        }
    }

    fn init_fake(lock_path: PathBuf) -> Result<()> {
        init_for_test(base_config(lock_path), Arc::new(MsrBackend::new()), fake_capability())
    }

    #[test]
    #[serial(sysconfig)]
    fn double_init_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let _ = fini();
        let first = init_fake(dir.path().join("lock"));
        assert!(first.is_ok());
        let second = init_fake(dir.path().join("lock"));
        assert!(matches!(second, Err(RdtError::AlreadyInitialized)));
        fini().unwrap();
    }

    #[test]
    #[serial(sysconfig)]
    fn fini_without_init_errors() {
        let _ = fini();
        assert!(matches!(fini(), Err(RdtError::NotInitialized)));
    }

    #[test]
    #[serial(sysconfig)]
    fn accessors_fail_before_init() {
        let _ = fini();
        assert!(matches!(sysconfig_get(), Err(RdtError::NotInitialized)));
    }
}
