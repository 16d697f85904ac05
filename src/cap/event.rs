use bitflags::bitflags;

bitflags! {
    /// Monitoring event bitset (spec §3 `MonEvent`). Using `bitflags`
    /// keeps subscription/derivation arithmetic (union, difference, the
    /// derived-remote-MBW check) as plain bit ops instead of a `match`.
    #[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
    #[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Default)]
    pub struct MonEvent: u32 {
        const LLC_OCCUPANCY   = 1 << 0;
        const LOCAL_MBW       = 1 << 1;
        const REMOTE_MBW      = 1 << 2;
        const TOTAL_MBW       = 1 << 3;
        const LLC_MISS        = 1 << 4;
        const LLC_REFERENCE   = 1 << 5;
        const IPC             = 1 << 6;
        const IO_OCCUPANCY    = 1 << 7;
        const IO_TOTAL_MBW    = 1 << 8;
        const IO_MISS_MBW     = 1 << 9;
        const PCIE_WRITE_MISS = 1 << 10;
        const PCIE_WRITE_REF  = 1 << 11;
        const PCIE_READ_MISS  = 1 << 12;
        const PCIE_READ_REF   = 1 << 13;
    }
}

impl MonEvent {
    /// Events backed by hardware MBM/CMT registers (MSR) or the resctrl
    /// monitoring pseudo-file (OS), as opposed to the `perf` subsystem.
    pub fn is_hw_mon(self) -> bool {
        self.intersects(
            MonEvent::LLC_OCCUPANCY | MonEvent::LOCAL_MBW | MonEvent::REMOTE_MBW | MonEvent::TOTAL_MBW,
        )
    }

    /// Events read through `perf_event_open` rather than RDT registers.
    pub fn is_perf(self) -> bool {
        self.intersects(MonEvent::LLC_MISS | MonEvent::LLC_REFERENCE | MonEvent::IPC)
    }

    pub fn is_io(self) -> bool {
        self.intersects(
            MonEvent::IO_OCCUPANCY
                | MonEvent::IO_TOTAL_MBW
                | MonEvent::IO_MISS_MBW
                | MonEvent::PCIE_WRITE_MISS
                | MonEvent::PCIE_WRITE_REF
                | MonEvent::PCIE_READ_MISS
                | MonEvent::PCIE_READ_REF
        )
    }
}

/// Per-event capability descriptor (spec §3 `MonCapabilityItem`).
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[derive(Clone, Copy, Debug)]
pub struct MonCapabilityItem {
    pub event: MonEvent,
    pub max_rmid: u32,
    pub counter_width_bits: u32,
    /// Bytes represented by one counter tick, mandatory for any event the
    /// capability record exposes (spec §4.1 "Key decisions").
    pub scale_factor: u64,
    pub io_rdt_capable: bool,
}

impl MonCapabilityItem {
    /// `2^width`, the modulus overflow/delta arithmetic wraps against.
    pub fn counter_modulus(&self) -> u128 {
        1u128 << self.counter_width_bits
    }
}

#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[derive(Clone, Debug, Default)]
pub struct MonCapability {
    pub items: Vec<MonCapabilityItem>,
    pub snc_num_clusters: u32,
    pub snc_mode_local: bool,
    pub io_rdt_enabled: bool,
}

impl MonCapability {
    pub fn supports(&self, event: MonEvent) -> bool {
        self.items.iter().any(|i| i.event == event)
    }

    pub fn item(&self, event: MonEvent) -> Option<&MonCapabilityItem> {
        self.items.iter().find(|i| i.event == event)
    }

    /// Remote-MBW is derived when hardware exposes only local+total (or
    /// only local+remote), per spec §4.4 "Source selection".
    pub fn remote_mbw_is_derived(&self) -> bool {
        !self.supports(MonEvent::REMOTE_MBW)
            && self.supports(MonEvent::LOCAL_MBW)
            && self.supports(MonEvent::TOTAL_MBW)
    }
}
