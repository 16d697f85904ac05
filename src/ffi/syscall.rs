use std::ffi::CString;
use std::fs::File;
use std::io::{Error, Result};
use std::os::fd::{AsRawFd, FromRawFd};
use std::os::unix::ffi::OsStrExt;
use std::path::Path;

use super::PerfEventAttr;

/// Opens a `perf_event_open` counter for `(attr, pid, cpu, group_fd)`.
///
/// Used by the monitoring engine's `perf` source for events the hardware
/// doesn't expose through MBM/CMT registers (LLC misses/references, IPC,
/// PCIe counters).
pub fn perf_event_open(
    attr: &PerfEventAttr,
    pid: i32,
    cpu: i32,
    group_fd: i32,
    flags: u64,
) -> Result<File> {
    let num = libc::SYS_perf_event_open;
    let fd = unsafe { libc::syscall(num, attr as *const PerfEventAttr, pid, cpu, group_fd, flags) };
    if fd != -1 {
        Ok(unsafe { File::from_raw_fd(fd as _) })
    } else {
        Err(Error::last_os_error())
    }
}

pub fn ioctl_arg(file: &File, op: u64, arg: u64) -> Result<i32> {
    let fd = file.as_raw_fd();
    let result = unsafe { libc::ioctl(fd, op as _, arg) };
    if result != -1 {
        Ok(result)
    } else {
        Err(Error::last_os_error())
    }
}

pub fn read(file: &File, buf: &mut [u8]) -> Result<usize> {
    let fd = file.as_raw_fd();
    let count = buf.len();
    let ptr = buf.as_mut_ptr() as _;
    let bytes = unsafe { libc::read(fd, ptr, count) };
    if bytes != -1 {
        Ok(bytes as _)
    } else {
        Err(Error::last_os_error())
    }
}

/// `pread(2)` at a fixed offset, used to read a per-CPU MSR device node
/// (`/dev/cpu/N/msr`) without disturbing the file's own cursor.
pub fn pread(file: &File, buf: &mut [u8], offset: i64) -> Result<usize> {
    let fd = file.as_raw_fd();
    let ptr = buf.as_mut_ptr() as _;
    let bytes = unsafe { libc::pread(fd, ptr, buf.len(), offset) };
    if bytes != -1 {
        Ok(bytes as _)
    } else {
        Err(Error::last_os_error())
    }
}

/// `pwrite(2)` counterpart of [`pread`], used to write an MSR value.
pub fn pwrite(file: &File, buf: &[u8], offset: i64) -> Result<usize> {
    let fd = file.as_raw_fd();
    let ptr = buf.as_ptr() as _;
    let bytes = unsafe { libc::pwrite(fd, ptr, buf.len(), offset) };
    if bytes != -1 {
        Ok(bytes as _)
    } else {
        Err(Error::last_os_error())
    }
}

/// Non-blocking advisory lock, used to serialise `init`/`fini` across
/// processes on the same host (§4.2: "a process-exclusive advisory lock").
pub fn flock_try_exclusive(file: &File) -> Result<()> {
    let fd = file.as_raw_fd();
    let result = unsafe { libc::flock(fd, libc::LOCK_EX | libc::LOCK_NB) };
    if result != -1 {
        Ok(())
    } else {
        Err(Error::last_os_error())
    }
}

pub fn flock_unlock(file: &File) -> Result<()> {
    let fd = file.as_raw_fd();
    let result = unsafe { libc::flock(fd, libc::LOCK_UN) };
    if result != -1 {
        Ok(())
    } else {
        Err(Error::last_os_error())
    }
}

/// `mount(2)` with `MS_REMOUNT`, used to flip resctrl mount options
/// (`cdp`/`cdpl2`/`mba_MBps`/`l3iordt`) in place (spec §4.3 "State flips").
/// Requires `CAP_SYS_ADMIN`.
pub fn remount(target: &Path, options: &str) -> Result<()> {
    let target_c = CString::new(target.as_os_str().as_bytes())
        .map_err(|e| Error::new(std::io::ErrorKind::InvalidInput, e))?;
    let data_c =
        CString::new(options).map_err(|e| Error::new(std::io::ErrorKind::InvalidInput, e))?;
    let result = unsafe {
        libc::mount(
            std::ptr::null(),
            target_c.as_ptr(),
            std::ptr::null(),
            libc::MS_REMOUNT,
            data_c.as_ptr() as *const libc::c_void,
        )
    };
    if result == 0 {
        Ok(())
    } else {
        Err(Error::last_os_error())
    }
}
