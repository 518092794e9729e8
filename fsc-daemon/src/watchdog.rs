//! Hardware watchdog
//!
//! The device is opened once at startup. Every tick writes a keep-alive byte;
//! a clean SIGQUIT shutdown writes the magic close byte so the timer stops
//! instead of resetting the BMC.

use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::Path;
use tracing::{debug, info, warn};

use fsc_core::constants::watchdog::{DISARM, KEEPALIVE};
use fsc_error::{FscError, Result};

/// `_IOWR('W', 6, int)`
#[cfg(target_os = "linux")]
const WDIOC_SETTIMEOUT: u64 = 0xC004_5706;

pub struct Watchdog {
    device: Box<dyn Write + Send>,
}

impl Watchdog {
    /// Open the device and program its timeout
    pub fn open(path: &Path, timeout_s: u64) -> Result<Self> {
        let file = OpenOptions::new()
            .write(true)
            .open(path)
            .map_err(|e| FscError::Watchdog(format!("cannot open {:?}: {}", path, e)))?;
        set_timeout(&file, timeout_s);
        info!("Watchdog {:?} armed ({}s)", path, timeout_s);
        Ok(Self::new(Box::new(file)))
    }

    pub fn new(device: Box<dyn Write + Send>) -> Self {
        Self { device }
    }

    pub fn kick(&mut self) -> Result<()> {
        self.device
            .write_all(KEEPALIVE)
            .and_then(|_| self.device.flush())
            .map_err(|e| FscError::Watchdog(format!("keep-alive failed: {}", e)))
    }

    /// Close the device; with `disarm` the timer is stopped first
    pub fn release(mut self, disarm: bool) {
        if disarm {
            match self.device.write_all(DISARM).and_then(|_| self.device.flush()) {
                Ok(()) => info!("Watchdog disarmed"),
                Err(e) => warn!("Failed to disarm watchdog: {}", e),
            }
        } else {
            debug!("Watchdog released without disarming");
        }
    }
}

#[cfg(target_os = "linux")]
fn set_timeout(file: &File, timeout_s: u64) {
    use std::os::unix::io::AsRawFd;

    let mut timeout = timeout_s.min(i32::MAX as u64) as libc::c_int;
    // SAFETY: the fd is open for the duration of the call and `timeout` is a
    // valid int the driver reads and writes back.
    let rc = unsafe { libc::ioctl(file.as_raw_fd(), WDIOC_SETTIMEOUT as _, &mut timeout) };
    if rc != 0 {
        warn!("Watchdog timeout could not be set, keeping the driver default");
    } else {
        debug!("Watchdog timeout is {}s", timeout);
    }
}

#[cfg(not(target_os = "linux"))]
fn set_timeout(_file: &File, _timeout_s: u64) {}
