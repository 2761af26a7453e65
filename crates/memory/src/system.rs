//! Process and system memory probes.

/// Physical RAM installed in the machine.
#[cfg(target_os = "macos")]
pub fn physical_ram_bytes() -> Option<u64> {
    use std::ffi::CString;
    use std::mem::size_of;
    use std::ptr;

    let key = CString::new("hw.memsize").ok()?;
    let mut value: u64 = 0;
    let mut len = size_of::<u64>();
    let rc = unsafe {
        libc::sysctlbyname(
            key.as_ptr(),
            &mut value as *mut u64 as *mut libc::c_void,
            &mut len,
            ptr::null_mut(),
            0,
        )
    };
    if rc == 0 && len == size_of::<u64>() {
        Some(value)
    } else {
        None
    }
}

/// Physical RAM installed in the machine.
#[cfg(target_os = "linux")]
pub fn physical_ram_bytes() -> Option<u64> {
    let mut info = std::mem::MaybeUninit::<libc::sysinfo>::uninit();
    let rc = unsafe { libc::sysinfo(info.as_mut_ptr()) };
    if rc != 0 {
        return None;
    }
    let info = unsafe { info.assume_init() };
    Some((info.totalram as u64).saturating_mul(info.mem_unit as u64))
}

#[cfg(not(any(target_os = "macos", target_os = "linux")))]
pub fn physical_ram_bytes() -> Option<u64> {
    None
}

/// Memory the system can hand out without swapping.
#[cfg(target_os = "linux")]
pub fn available_ram_bytes() -> Option<u64> {
    let meminfo = std::fs::read_to_string("/proc/meminfo").ok()?;
    meminfo_available_kib(&meminfo).map(|kib| kib.saturating_mul(1024))
}

#[cfg(target_os = "macos")]
pub fn available_ram_bytes() -> Option<u64> {
    let mut stats = std::mem::MaybeUninit::<libc::vm_statistics64>::uninit();
    let mut count = libc::HOST_VM_INFO64_COUNT;
    #[allow(deprecated)]
    let kr = unsafe {
        libc::host_statistics64(
            libc::mach_host_self(),
            libc::HOST_VM_INFO64,
            stats.as_mut_ptr().cast(),
            &mut count,
        )
    };
    if kr != libc::KERN_SUCCESS {
        return None;
    }
    let stats = unsafe { stats.assume_init() };
    let page_size = unsafe { libc::sysconf(libc::_SC_PAGESIZE) };
    if page_size <= 0 {
        return None;
    }
    let pages = stats.free_count as u64 + stats.inactive_count as u64;
    Some(pages.saturating_mul(page_size as u64))
}

#[cfg(not(any(target_os = "macos", target_os = "linux")))]
pub fn available_ram_bytes() -> Option<u64> {
    None
}

/// Resident set size of this process.
#[cfg(target_os = "macos")]
pub fn current_rss_bytes() -> Option<u64> {
    task_basic_info().map(|info| info.resident_size as u64)
}

/// Virtual memory size of this process.
#[cfg(target_os = "macos")]
pub fn current_vms_bytes() -> Option<u64> {
    task_basic_info().map(|info| info.virtual_size as u64)
}

#[cfg(target_os = "macos")]
fn task_basic_info() -> Option<libc::mach_task_basic_info> {
    let mut info = libc::mach_task_basic_info {
        virtual_size: 0,
        resident_size: 0,
        resident_size_max: 0,
        user_time: libc::time_value_t { seconds: 0, microseconds: 0 },
        system_time: libc::time_value_t { seconds: 0, microseconds: 0 },
        policy: 0,
        suspend_count: 0,
    };

    let mut count = libc::MACH_TASK_BASIC_INFO_COUNT;
    #[allow(deprecated)]
    let kr = unsafe {
        libc::task_info(
            libc::mach_task_self(),
            libc::MACH_TASK_BASIC_INFO,
            (&mut info as *mut libc::mach_task_basic_info).cast(),
            &mut count,
        )
    };
    if kr == libc::KERN_SUCCESS {
        Some(info)
    } else {
        None
    }
}

/// Resident set size of this process.
#[cfg(target_os = "linux")]
pub fn current_rss_bytes() -> Option<u64> {
    statm_pages().map(|(_, rss)| rss)
}

/// Virtual memory size of this process.
#[cfg(target_os = "linux")]
pub fn current_vms_bytes() -> Option<u64> {
    statm_pages().map(|(size, _)| size)
}

/// (total program size, resident size) in bytes from `/proc/self/statm`.
#[cfg(target_os = "linux")]
fn statm_pages() -> Option<(u64, u64)> {
    let statm = std::fs::read_to_string("/proc/self/statm").ok()?;
    let mut fields = statm.split_whitespace();
    let size_pages = fields.next()?.parse::<u64>().ok()?;
    let rss_pages = fields.next()?.parse::<u64>().ok()?;
    let page_size = unsafe { libc::sysconf(libc::_SC_PAGESIZE) };
    if page_size <= 0 {
        return None;
    }
    let page_size = page_size as u64;
    Some((size_pages.saturating_mul(page_size), rss_pages.saturating_mul(page_size)))
}

#[cfg(not(any(target_os = "macos", target_os = "linux")))]
pub fn current_rss_bytes() -> Option<u64> {
    None
}

#[cfg(not(any(target_os = "macos", target_os = "linux")))]
pub fn current_vms_bytes() -> Option<u64> {
    None
}

#[cfg_attr(not(target_os = "linux"), allow(dead_code))]
fn meminfo_field_kib(meminfo: &str, field: &str) -> Option<u64> {
    meminfo.lines().find_map(|line| {
        let rest = line.strip_prefix(field)?.strip_prefix(':')?;
        rest.split_whitespace().next()?.parse().ok()
    })
}

/// `MemAvailable`, or on kernels older than 3.14 an estimate from
/// `MemFree`, `Buffers` and `Cached`.
#[cfg_attr(not(target_os = "linux"), allow(dead_code))]
fn meminfo_available_kib(meminfo: &str) -> Option<u64> {
    if let Some(available) = meminfo_field_kib(meminfo, "MemAvailable") {
        return Some(available);
    }
    let free = meminfo_field_kib(meminfo, "MemFree")?;
    let reclaimable = ["Buffers", "Cached"]
        .iter()
        .filter_map(|field| meminfo_field_kib(meminfo, field))
        .sum::<u64>();
    Some(free.saturating_add(reclaimable))
}

/// One reading of process and system memory. Unknown values are zero.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct MemorySample {
    pub rss_bytes: u64,
    pub vms_bytes: u64,
    pub system_total_bytes: u64,
    pub system_available_bytes: u64,
}

impl MemorySample {
    /// Builds a sample from raw readings.
    ///
    /// The system figures are kept only when both are known, so a missing
    /// available-memory reading shows as unknown usage rather than as 100%.
    pub fn from_readings(rss: Option<u64>, vms: Option<u64>, total: Option<u64>, available: Option<u64>) -> Self {
        let (system_total_bytes, system_available_bytes) = match (total, available) {
            (Some(total), Some(available)) => (total, available),
            _ => (0, 0),
        };
        Self {
            rss_bytes: rss.unwrap_or(0),
            vms_bytes: vms.unwrap_or(0),
            system_total_bytes,
            system_available_bytes,
        }
    }

    /// System-wide memory in use, as a percentage (0.0 to 100.0).
    pub fn percent_used(&self) -> f64 {
        if self.system_total_bytes == 0 {
            return 0.0;
        }
        let used = self.system_total_bytes.saturating_sub(self.system_available_bytes);
        used as f64 / self.system_total_bytes as f64 * 100.0
    }
}

/// Source of memory readings for the resource monitor.
pub trait MemoryProbe: Send + Sync {
    fn sample(&self) -> MemorySample;
}

/// Reads the live process and system counters.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemProbe;

impl MemoryProbe for SystemProbe {
    fn sample(&self) -> MemorySample {
        MemorySample::from_readings(
            current_rss_bytes(),
            current_vms_bytes(),
            physical_ram_bytes(),
            available_ram_bytes(),
        )
    }
}
