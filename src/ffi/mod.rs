//! Thin FFI boundary: raw `perf_event_open`/MSR/file-lock syscalls wrapped
//! as `std::io::Result`-returning functions, the same shape the rest of the
//! crate builds on (see `syscall`).

pub mod syscall;

pub(crate) mod bindings {
    pub const PERF_TYPE_HARDWARE: u32 = 0;

    pub const PERF_COUNT_HW_CPU_CYCLES: u64 = 0;
    pub const PERF_COUNT_HW_INSTRUCTIONS: u64 = 1;
    pub const PERF_COUNT_HW_CACHE_REFERENCES: u64 = 2;
    pub const PERF_COUNT_HW_CACHE_MISSES: u64 = 3;

    pub const PERF_EVENT_IOC_ENABLE: u64 = 0x2400;

    // https://github.com/torvalds/linux/blob/v6.13/include/uapi/linux/perf_event.h#L411
    // Trimmed to the fields this crate actually sets; unused tail fields
    // (branch sampling, regs, clockid, aux watermark) are zeroed and never
    // read back, so a stripped layout is safe as long as `size` matches.
    #[repr(C)]
    #[derive(Clone, Copy, Default)]
    pub struct PerfEventAttr {
        pub type_: u32,
        pub size: u32,
        pub config: u64,
        pub sample_period_or_freq: u64,
        pub sample_type: u64,
        pub read_format: u64,
        pub flags: u64,
        pub wakeup_events_or_watermark: u32,
        pub bp_type: u32,
        pub config1: u64,
        pub config2: u64,
    }

    pub const ATTR_FLAG_DISABLED: u64 = 1 << 0;
    pub const ATTR_FLAG_EXCLUDE_KERNEL: u64 = 1 << 5;
    pub const ATTR_FLAG_EXCLUDE_HV: u64 = 1 << 6;
}

pub use bindings::PerfEventAttr;
