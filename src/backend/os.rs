//! OS (resctrl) back-end: every operation is file I/O against the Linux
//! resctrl pseudo-filesystem (spec §4.6), through the symlink-safe helpers
//! in `utils::fs`. Directories are one per class of service, with a
//! monitoring sub-directory per group; `cpus`/`schemata`/`tasks` use the
//! kernel-documented text format.
//!
//! Monitoring groups are flattened to `<root>/mon_groups/mon_<id>` rather
//! than nested under their owning COS directory — the full kernel layout
//! nests them under `<cos>/mon_groups/...`, but this crate only ever opens
//! one logical COS worth of sub-groups at a time, so the simpler flat
//! layout is kept and the class COS each group's cores are bound to is
//! tracked separately by the monitoring engine.

use std::path::{Path, PathBuf};

use crate::cap::event::{MonCapability, MonCapabilityItem, MonEvent};
use crate::cap::{CaCapability, CapProbe, MbaCapability, MbaKind};
use crate::error::{RdtError, Result};
use crate::topology::CpuInfo;
use crate::utils::fs as ufs;

use super::{Backend, CacheTech, MbaTech};

pub struct OsBackend {
    root: PathBuf,
}

impl OsBackend {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        OsBackend { root: root.into() }
    }

    pub fn default_root() -> PathBuf {
        PathBuf::from("/sys/fs/resctrl")
    }

    pub fn is_present(root: &Path) -> bool {
        root.join("info").is_dir()
    }

    fn info_dir(&self, name: &str) -> PathBuf {
        self.root.join("info").join(name)
    }

    fn cos_dir(&self, class_id: u32) -> PathBuf {
        if class_id == 0 {
            self.root.clone()
        } else {
            self.root.join(format!("COS{class_id}"))
        }
    }

    fn mon_group_dir(&self, rmid: u32) -> PathBuf {
        self.root.join("mon_groups").join(format!("mon_{rmid}"))
    }

    fn read_u32(&self, path: &Path) -> Result<u32> {
        ufs::read_to_string(path)?
            .parse()
            .map_err(|_| RdtError::Internal(std::io::Error::other("malformed resctrl integer")))
    }

    fn read_hex(&self, path: &Path) -> Result<u64> {
        let s = ufs::read_to_string(path)?;
        u64::from_str_radix(s.trim_start_matches("0x"), 16)
            .map_err(|_| RdtError::Internal(std::io::Error::other("malformed resctrl hex mask")))
    }

    fn schemata_line(&self, class_id: u32, resource: &str) -> Result<String> {
        let path = self.cos_dir(class_id).join("schemata");
        let body = ufs::read_to_string(&path)?;
        body.lines()
            .find(|l| l.starts_with(resource))
            .map(str::to_string)
            .ok_or_else(|| RdtError::resource(format!("no {resource} line in schemata")))
    }
}

impl CapProbe for OsBackend {
    fn probe_mon(&self, _cpu: &CpuInfo) -> Result<Option<MonCapability>> {
        let dir = self.info_dir("L3_MON");
        if !dir.is_dir() {
            return Ok(None);
        }
        let max_rmid = self.read_u32(&dir.join("num_rmids"))?;
        let features = ufs::read_to_string(&dir.join("mon_features"))?;

        let mut items = Vec::new();
        for line in features.lines() {
            let event = match line.trim() {
                "llc_occupancy" => MonEvent::LLC_OCCUPANCY,
                "mbm_total_bytes" => MonEvent::TOTAL_MBW,
                "mbm_local_bytes" => MonEvent::LOCAL_MBW,
                _ => continue,
            };
            items.push(MonCapabilityItem {
                event,
                max_rmid,
                counter_width_bits: 62,
                scale_factor: 1, // resctrl reports bytes directly, no scaling needed
                io_rdt_capable: false,
            });
        }
        for ev in [MonEvent::LLC_MISS, MonEvent::LLC_REFERENCE, MonEvent::IPC] {
            items.push(MonCapabilityItem {
                event: ev,
                max_rmid: 0,
                counter_width_bits: 64,
                scale_factor: 1,
                io_rdt_capable: false,
            });
        }
        if items.is_empty() {
            return Ok(None);
        }
        Ok(Some(MonCapability {
            items,
            snc_num_clusters: 1,
            snc_mode_local: false,
            io_rdt_enabled: false,
        }))
    }

    fn probe_l2ca(&self) -> Result<Option<CaCapability>> {
        self.probe_ca("L2")
    }

    fn probe_l3ca(&self) -> Result<Option<CaCapability>> {
        self.probe_ca("L3")
    }

    fn probe_mba(&self) -> Result<Option<MbaCapability>> {
        self.probe_mba_dir("MB", MbaKind::Mba)
    }

    fn probe_smba(&self) -> Result<Option<MbaCapability>> {
        self.probe_mba_dir("SMBA", MbaKind::Smba)
    }
}

impl OsBackend {
    fn probe_ca(&self, name: &str) -> Result<Option<CaCapability>> {
        let dir = self.info_dir(name);
        if !dir.is_dir() {
            return Ok(None);
        }
        let num_classes = self.read_u32(&dir.join("num_closids"))?;
        let cbm_mask = self.read_hex(&dir.join("cbm_mask"))?;
        let num_ways = 64 - cbm_mask.leading_zeros().min(64);
        let way_contention_mask = dir
            .join("shareable_bits")
            .exists()
            .then(|| self.read_hex(&dir.join("shareable_bits")))
            .transpose()?
            .unwrap_or(0);
        let cdp_dir = self.root.join("info").join(format!("{name}CODE"));
        let cdp_supported = cdp_dir.is_dir();
        let non_contiguous_cbm = dir.join("non_contiguous_cbm").exists();

        Ok(Some(CaCapability {
            num_classes,
            num_ways,
            way_size: 0,
            way_contention_mask,
            cdp_supported,
            cdp_on: false,
            non_contiguous_cbm,
            io_rdt_supported: name == "L3" && self.info_dir("L3_IO").is_dir(),
            io_rdt_on: false,
        }))
    }

    fn probe_mba_dir(&self, name: &str, kind: MbaKind) -> Result<Option<MbaCapability>> {
        let dir = self.info_dir(name);
        if !dir.is_dir() {
            return Ok(None);
        }
        let num_classes = self.read_u32(&dir.join("num_closids"))?;
        let throttle_step = self.read_u32(&dir.join("bandwidth_gran"))?;
        let min_bw = self.read_u32(&dir.join("min_bandwidth"))?;
        let is_linear = dir.join("delay_linear").exists() && self.read_u32(&dir.join("delay_linear"))? == 1;

        Ok(Some(MbaCapability {
            kind,
            num_classes,
            is_linear,
            throttle_step,
            throttle_max: 100 - min_bw,
            ctrl_supported: dir.join("bandwidth_gran").exists(),
            ctrl_on: false,
            mba40_supported: false,
            mba40_on: false,
        }))
    }

    /// Whether `IA32_MBA_CTRL`/MBA-CTRL mode is currently on, read back
    /// post-query (spec §4.1 "Returns also the MBA-CTRL enabled flag").
    pub fn mba_ctrl_enabled(&self) -> Result<bool> {
        let path = self.info_dir("MB").join("mba_MBps_enabled");
        if !path.exists() {
            return Ok(false);
        }
        Ok(self.read_u32(&path)? == 1)
    }

    /// Remounts the resctrl tree with `option` added or dropped from the
    /// mount-data string (spec §4.3 "State flips": CDP/MBA-CTRL/IO-RDT are
    /// resctrl mount options, not per-class settings).
    fn remount_option(&self, option: &str, on: bool) -> Result<()> {
        let data = if on { option.to_string() } else { String::new() };
        crate::ffi::syscall::remount(&self.root, &data).map_err(RdtError::Internal)
    }
}

impl Backend for OsBackend {
    fn write_ca_mask(&self, tech: CacheTech, _core: u32, class_id: u32, mask: u64) -> Result<()> {
        let resource = match tech {
            CacheTech::L2 => "L2",
            CacheTech::L3 => "L3",
        };
        let line = format!("{resource}:{class_id}={mask:x}");
        let path = self.cos_dir(class_id).join("schemata");
        ufs::write_str(&path, &line)
    }

    fn read_ca_mask(&self, tech: CacheTech, _core: u32, class_id: u32) -> Result<u64> {
        let resource = match tech {
            CacheTech::L2 => "L2",
            CacheTech::L3 => "L3",
        };
        let line = self.schemata_line(class_id, resource)?;
        parse_schemata_value(&line, class_id)
    }

    fn write_ca_mask_cdp(
        &self,
        tech: CacheTech,
        _core: u32,
        class_id: u32,
        code_mask: u64,
        data_mask: u64,
    ) -> Result<()> {
        let resource = match tech {
            CacheTech::L2 => "L2",
            CacheTech::L3 => "L3",
        };
        let line = format!(
            "{resource}CODE:{class_id}={code_mask:x}\n{resource}DATA:{class_id}={data_mask:x}"
        );
        let path = self.cos_dir(class_id).join("schemata");
        ufs::write_str(&path, &line)
    }

    fn read_ca_mask_cdp(&self, tech: CacheTech, _core: u32, class_id: u32) -> Result<(u64, u64)> {
        let resource = match tech {
            CacheTech::L2 => "L2",
            CacheTech::L3 => "L3",
        };
        let code = self.schemata_line(class_id, &format!("{resource}CODE"))?;
        let data = self.schemata_line(class_id, &format!("{resource}DATA"))?;
        Ok((parse_schemata_value(&code, class_id)?, parse_schemata_value(&data, class_id)?))
    }

    fn write_mba(&self, tech: MbaTech, _core: u32, class_id: u32, percent: u32) -> Result<()> {
        let resource = match tech {
            MbaTech::Mba => "MB",
            MbaTech::Smba => "SMBA",
        };
        let line = format!("{resource}:{class_id}={percent}");
        let path = self.cos_dir(class_id).join("schemata");
        ufs::write_str(&path, &line)
    }

    fn read_mba(&self, tech: MbaTech, _core: u32, class_id: u32) -> Result<u32> {
        let resource = match tech {
            MbaTech::Mba => "MB",
            MbaTech::Smba => "SMBA",
        };
        let line = self.schemata_line(class_id, resource)?;
        Ok(parse_schemata_value(&line, class_id)? as u32)
    }

    fn set_assoc(&self, core: u32, l3_class: Option<u32>, _mba_class: Option<u32>) -> Result<()> {
        let class_id = l3_class.unwrap_or(0);
        let path = self.cos_dir(class_id).join("cpus_list");
        ufs::write_str(&path, &core.to_string())
    }

    fn get_assoc(&self, core: u32) -> Result<(u32, u32)> {
        // Scan every COS directory for one whose `cpus_list` contains `core`.
        let entries = std::fs::read_dir(&self.root).map_err(RdtError::Internal)?;
        for entry in entries.flatten() {
            let name = entry.file_name();
            let name = name.to_string_lossy();
            if !name.starts_with("COS") && name != "." {
                continue;
            }
            let class_id: u32 = if name == "." { 0 } else {
                name.trim_start_matches("COS").parse().unwrap_or(0)
            };
            let list_path = entry.path().join("cpus_list");
            if let Ok(list) = ufs::read_to_string(&list_path) {
                if crate::utils::parse::parse_id_list(&list).unwrap_or_default().contains(&core) {
                    return Ok((class_id, class_id));
                }
            }
        }
        Ok((0, 0))
    }

    fn set_assoc_pid(&self, pid: u32, l3_class: u32) -> Result<()> {
        let path = self.cos_dir(l3_class).join("tasks");
        ufs::write_str(&path, &pid.to_string())
    }

    fn get_assoc_pid(&self, pid: u32) -> Result<u32> {
        let entries = std::fs::read_dir(&self.root).map_err(RdtError::Internal)?;
        for entry in entries.flatten() {
            let tasks_path = entry.path().join("tasks");
            if let Ok(body) = ufs::read_to_string(&tasks_path) {
                if body.lines().any(|l| l.trim() == pid.to_string()) {
                    let name = entry.file_name();
                    let name = name.to_string_lossy();
                    return Ok(name.trim_start_matches("COS").parse().unwrap_or(0));
                }
            }
        }
        Ok(0)
    }

    fn set_assoc_channel(&self, channel: u64, l3_class: u32) -> Result<()> {
        let path = self.cos_dir(l3_class).join("channels");
        ufs::write_str(&path, &format!("{channel:#x}"))
    }

    fn mon_assoc_set_pid(&self, pid: u32, rmid: u32) -> Result<()> {
        let path = if rmid == 0 {
            self.root.join("tasks")
        } else {
            self.mon_group_dir(rmid).join("tasks")
        };
        ufs::write_str(&path, &pid.to_string())
    }

    fn get_assoc_channel(&self, _channel: u64) -> Result<u32> {
        Ok(0)
    }

    fn flip_cdp(&self, tech: CacheTech, on: bool) -> Result<()> {
        let option = match tech {
            CacheTech::L2 => "l2cdp",
            CacheTech::L3 => "cdp",
        };
        self.remount_option(option, on)
    }

    fn flip_mba_ctrl(&self, on: bool) -> Result<()> {
        self.remount_option("mba_MBps", on)
    }

    fn flip_iordt(&self, on: bool) -> Result<()> {
        self.remount_option("l3iordt", on)
    }

    fn mon_alloc_rmid(&self) -> Result<u32> {
        static NEXT: std::sync::atomic::AtomicU32 = std::sync::atomic::AtomicU32::new(1);
        let id = NEXT.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
        ufs::create_dir(&self.root.join("mon_groups"))?;
        ufs::create_dir(&self.mon_group_dir(id))?;
        Ok(id)
    }

    fn mon_free_rmid(&self, rmid: u32) -> Result<()> {
        ufs::remove_dir(&self.mon_group_dir(rmid))
    }

    fn mon_assoc_set(&self, core: u32, rmid: u32) -> Result<()> {
        let path = self.mon_group_dir(rmid).join("cpus_list");
        ufs::write_str(&path, &core.to_string())
    }

    fn mon_assoc_get(&self, _core: u32) -> Result<u32> {
        Ok(0)
    }

    fn mon_read_counter(&self, _core: u32, rmid: u32, event: MonEvent) -> Result<u64> {
        let file = match event {
            MonEvent::LLC_OCCUPANCY => "llc_occupancy",
            MonEvent::TOTAL_MBW => "mbm_total_bytes",
            MonEvent::LOCAL_MBW => "mbm_local_bytes",
            _ => return Err(RdtError::param("event not backed by resctrl mon_data")),
        };
        let path = self.mon_group_dir(rmid).join("mon_data").join("mon_L3_00").join(file);
        self.read_u32(&path).map(u64::from)
    }

    fn mon_reset(&self) -> Result<()> {
        let dir = self.root.join("mon_groups");
        if let Ok(entries) = std::fs::read_dir(&dir) {
            for entry in entries.flatten() {
                let _ = ufs::remove_dir(&entry.path());
            }
        }
        Ok(())
    }
}

fn parse_schemata_value(line: &str, class_id: u32) -> Result<u64> {
    let rhs = line
        .split_once(':')
        .map(|(_, r)| r)
        .ok_or_else(|| RdtError::resource(format!("malformed schemata line: {line}")))?;
    let wanted = format!("{class_id}=");
    for entry in rhs.split(';') {
        if let Some(v) = entry.trim().strip_prefix(&wanted) {
            return u64::from_str_radix(v.trim_start_matches("0x"), 16)
                .or_else(|_| v.parse())
                .map_err(|_| RdtError::resource(format!("malformed schemata value: {v}")));
        }
    }
    Err(RdtError::resource(format!("class {class_id} absent from schemata")))
}


#[cfg(test)]
mod tests {
    use super::*;

    fn setup() -> (tempfile::TempDir, OsBackend) {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path().to_path_buf();
        std::fs::create_dir_all(root.join("info/L3")).unwrap();
        std::fs::write(root.join("info/L3/num_closids"), "4\n").unwrap();
        std::fs::write(root.join("info/L3/cbm_mask"), "fff\n").unwrap();
        std::fs::write(root.join("schemata"), "L3:0=fff\n").unwrap();
        let backend = OsBackend::new(root);
        (dir, backend)
    }

    #[test]
    fn probes_l3_from_info_tree() {
        let (_dir, be) = setup();
        let cap = be.probe_l3ca().unwrap().unwrap();
        assert_eq!(cap.num_classes, 4);
        assert_eq!(cap.num_ways, 12);
    }

    #[test]
    fn schemata_roundtrip() {
        let (_dir, be) = setup();
        assert_eq!(be.read_ca_mask(CacheTech::L3, 0, 0).unwrap(), 0xfff);
        be.write_ca_mask(CacheTech::L3, 0, 0, 0xff).unwrap();
        assert_eq!(be.read_ca_mask(CacheTech::L3, 0, 0).unwrap(), 0xff);
    }
}
