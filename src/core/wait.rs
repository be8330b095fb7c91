use std::sync::atomic::{AtomicU32, Ordering};
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};

use crate::core::Result;

pub const DEFAULT_SPIN_US: u32 = 10;

/// How a blocked producer or consumer waits for the ring to move.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WaitStrategy {
    /// True busy-spinning. Burns 100% CPU on a single core for maximum responsiveness.
    BusySpin,
    /// High-performance hybrid: spins for a period, then parks (sleeps) in the kernel.
    SpinThenPark { spin_us: u32 },
    /// Low-priority periodic polling: yields to the OS for a fixed duration.
    Sleep(Duration),
}

impl Default for WaitStrategy {
    fn default() -> Self {
        WaitStrategy::SpinThenPark {
            spin_us: DEFAULT_SPIN_US,
        }
    }
}

/// Wake word shared by everything blocked on one ring buffer.
///
/// Writers bump `notify_seq` after every cursor move; the futex wake is only
/// issued when somebody registered in `waiters_pending`.
#[repr(C, align(128))]
#[derive(Debug, Default)]
pub struct Notifier {
    notify_seq: AtomicU32,
    waiters_pending: AtomicU32,
}

impl Notifier {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn notify(&self) {
        self.notify_seq.fetch_add(1, Ordering::SeqCst);
        if self.waiters_pending.load(Ordering::SeqCst) > 0 {
            if let Err(err) = futex_wake(&self.notify_seq) {
                log::warn!("futex wake failed: {err}");
            }
        }
    }

    /// Blocks until `ready` reports true or a notification arrives.
    ///
    /// May return spuriously; callers re-check their condition in a loop.
    pub fn wait(&self, strategy: WaitStrategy, ready: impl Fn() -> bool) -> Result<()> {
        match strategy {
            WaitStrategy::BusySpin => {
                std::hint::spin_loop();
                return Ok(());
            }
            WaitStrategy::Sleep(duration) => {
                std::thread::sleep(duration);
                return Ok(());
            }
            WaitStrategy::SpinThenPark { spin_us } => {
                let spin_deadline = Instant::now() + Duration::from_micros(spin_us as u64);
                let mut i = 0u32;
                loop {
                    if ready() {
                        return Ok(());
                    }
                    i = i.wrapping_add(1);
                    if i % 128 == 0 && Instant::now() >= spin_deadline {
                        break;
                    }
                    std::hint::spin_loop();
                }
            }
        }

        // Register before loading the wake word so a concurrent notify either
        // sees us pending or bumps the word we are about to sleep on.
        self.waiters_pending.fetch_add(1, Ordering::SeqCst);
        let seq = self.notify_seq.load(Ordering::SeqCst);

        if ready() {
            self.waiters_pending.fetch_sub(1, Ordering::SeqCst);
            return Ok(());
        }

        let res = futex_wait(&self.notify_seq, seq, None);
        self.waiters_pending.fetch_sub(1, Ordering::SeqCst);
        res
    }
}

#[cfg(target_os = "linux")]
pub fn futex_wait(addr: &AtomicU32, expected: u32, timeout: Option<Duration>) -> Result<()> {
    use libc::{syscall, timespec, EAGAIN, EINTR, ETIMEDOUT, FUTEX_WAIT, SYS_futex};

    let mut ts = timespec { tv_sec: 0, tv_nsec: 0 };
    let ts_ptr = if let Some(timeout) = timeout {
        ts.tv_sec = timeout.as_secs() as libc::time_t;
        ts.tv_nsec = timeout.subsec_nanos() as libc::c_long;
        &ts as *const timespec
    } else {
        std::ptr::null()
    };

    let res = unsafe {
        syscall(
            SYS_futex,
            addr as *const AtomicU32 as *const u32,
            FUTEX_WAIT,
            expected,
            ts_ptr,
            std::ptr::null::<u32>(),
            0,
        )
    };
    if res == 0 {
        return Ok(());
    }
    let err = std::io::Error::last_os_error();
    match err.raw_os_error() {
        Some(code) if code == EAGAIN || code == EINTR || code == ETIMEDOUT => Ok(()),
        _ => Err(crate::core::Error::Io(err)),
    }
}

#[cfg(target_os = "linux")]
pub fn futex_wake(addr: &AtomicU32) -> Result<()> {
    use libc::{syscall, FUTEX_WAKE, SYS_futex};
    let res = unsafe {
        syscall(
            SYS_futex,
            addr as *const AtomicU32 as *const u32,
            FUTEX_WAKE,
            i32::MAX,
            std::ptr::null::<u32>(),
            std::ptr::null::<u32>(),
            0,
        )
    };
    if res < 0 {
        return Err(crate::core::Error::Io(std::io::Error::last_os_error()));
    }
    Ok(())
}

#[cfg(not(target_os = "linux"))]
pub fn futex_wait(_addr: &AtomicU32, _expected: u32, timeout: Option<Duration>) -> Result<()> {
    if let Some(timeout) = timeout {
        std::thread::sleep(timeout);
    } else {
        std::thread::sleep(Duration::from_millis(1));
    }
    Ok(())
}

#[cfg(not(target_os = "linux"))]
pub fn futex_wake(_addr: &AtomicU32) -> Result<()> {
    Ok(())
}
