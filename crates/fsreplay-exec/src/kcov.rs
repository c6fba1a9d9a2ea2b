use std::ffi::CString;
use std::fs::File;
use std::io::{self, BufWriter, Write as _};
use std::os::unix::io::RawFd;
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};

use anyhow::{Context, Result};

pub const KCOV_DEVICE: &str = "/sys/kernel/debug/kcov";
pub const KCOV_FILENAME: &str = "kcov.dat";

/// Shared-region capacity in 8-byte words; word 0 holds the count, words
/// 1..=count hold visited program counters.
const COVER_SIZE: usize = 64 << 10;

// Request codes from include/uapi/linux/kcov.h.
const KCOV_INIT_TRACE: libc::c_ulong = 0x8008_6301; // _IOR('c', 1, unsigned long)
const KCOV_ENABLE: libc::c_ulong = 0x6364; // _IO('c', 100)
const KCOV_DISABLE: libc::c_ulong = 0x6365; // _IO('c', 101)
const KCOV_TRACE_PC: libc::c_ulong = 0;

struct Session {
    fd: RawFd,
    cover: *mut u64,
    collected: usize,
}

impl Session {
    fn word(&self, i: usize) -> &AtomicU64 {
        // The region is shared with the kernel; go through atomics the way
        // the kcov documentation prescribes.
        unsafe { &*self.cover.add(i).cast::<AtomicU64>() }
    }
}

/// Kernel coverage session bracketing the workload: acquired before it,
/// drained strictly after it, so visited addresses are attributed to the
/// workload interval alone.
///
/// When the kcov device cannot be opened the session degrades to a no-op and
/// the run proceeds without a coverage dump.
pub struct Coverage {
    session: Option<Session>,
}

impl Coverage {
    /// Opens the kcov device and maps the shared region. An unopenable
    /// device downgrades to the no-op session with a warning; every later
    /// protocol failure is a setup error.
    pub fn init() -> Result<Coverage> {
        let device = CString::new(KCOV_DEVICE).context("kcov device path")?;
        let fd = unsafe { libc::open(device.as_ptr(), libc::O_RDWR) };
        if fd == -1 {
            eprintln!("[WARNING] failed to open {KCOV_DEVICE}, coverage disabled");
            return Ok(Coverage { session: None });
        }
        if unsafe { libc::ioctl(fd, KCOV_INIT_TRACE, COVER_SIZE as libc::c_ulong) } != 0 {
            return Err(io::Error::last_os_error()).context("set up kcov trace mode");
        }
        let cover = unsafe {
            libc::mmap(
                std::ptr::null_mut(),
                COVER_SIZE * std::mem::size_of::<u64>(),
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_SHARED,
                fd,
                0,
            )
        };
        if cover == libc::MAP_FAILED {
            return Err(io::Error::last_os_error()).context("mmap kcov coverage region");
        }
        Ok(Coverage {
            session: Some(Session {
                fd,
                cover: cover.cast(),
                collected: 0,
            }),
        })
    }

    pub fn is_enabled(&self) -> bool {
        self.session.is_some()
    }

    /// Starts collection on the current thread; must run strictly before the
    /// workload.
    pub fn enable(&mut self) -> Result<()> {
        let Some(session) = &self.session else {
            return Ok(());
        };
        if unsafe { libc::ioctl(session.fd, KCOV_ENABLE, KCOV_TRACE_PC) } != 0 {
            return Err(io::Error::last_os_error()).context("enable kcov collection");
        }
        // Drop counts accumulated by the tail of the ioctl itself.
        session.word(0).store(0, Ordering::Relaxed);
        Ok(())
    }

    /// Stops collection and latches the visited-address count; must run
    /// strictly after the workload.
    pub fn disable(&mut self) -> Result<()> {
        let Some(session) = &mut self.session else {
            return Ok(());
        };
        if unsafe { libc::ioctl(session.fd, KCOV_DISABLE, 0) } != 0 {
            return Err(io::Error::last_os_error()).context("disable kcov collection");
        }
        let count = session.word(0).load(Ordering::Relaxed) as usize;
        session.collected = count.min(COVER_SIZE - 1);
        Ok(())
    }

    pub fn collected(&self) -> usize {
        self.session.as_ref().map_or(0, |s| s.collected)
    }

    /// Writes one hexadecimal program counter per line. Returns whether a
    /// dump was written (false for the degraded session).
    pub fn dump(&self, path: &Path) -> Result<bool> {
        let Some(session) = &self.session else {
            return Ok(false);
        };
        let file = File::create(path)
            .with_context(|| format!("open kcov dump file '{}'", path.display()))?;
        let mut out = BufWriter::new(file);
        for i in 0..session.collected {
            writeln!(out, "{:#x}", session.word(i + 1).load(Ordering::Relaxed))
                .context("write kcov dump")?;
        }
        out.flush().context("flush kcov dump")?;
        Ok(true)
    }

    /// Unmaps the shared region and closes the device.
    pub fn release(mut self) -> Result<()> {
        let Some(session) = self.session.take() else {
            return Ok(());
        };
        let len = COVER_SIZE * std::mem::size_of::<u64>();
        if unsafe { libc::munmap(session.cover.cast(), len) } != 0 {
            return Err(io::Error::last_os_error()).context("unmap kcov coverage region");
        }
        if unsafe { libc::close(session.fd) } != 0 {
            return Err(io::Error::last_os_error()).context("close kcov device");
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn request_codes_match_uapi_encoding() {
        // _IOC(dir, 'c', nr, size): dir<<30 | size<<16 | type<<8 | nr.
        let ior = (2u64 << 30) | (8 << 16) | (0x63 << 8) | 1;
        assert_eq!(ior, u64::from(KCOV_INIT_TRACE));
        assert_eq!((0x63 << 8) | 100, KCOV_ENABLE);
        assert_eq!((0x63 << 8) | 101, KCOV_DISABLE);
    }

    #[test]
    fn degraded_session_is_a_no_op() {
        let mut coverage = Coverage { session: None };
        assert!(!coverage.is_enabled());
        coverage.enable().unwrap();
        coverage.disable().unwrap();
        assert_eq!(0, coverage.collected());
        let path = std::env::temp_dir().join("fsreplay-kcov-noop.dat");
        assert!(!coverage.dump(&path).unwrap());
        assert!(!path.exists());
        coverage.release().unwrap();
    }
}
