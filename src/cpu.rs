//! Process CPU accounting through `getrusage(2)`.

use std::io;
use std::mem::MaybeUninit;
use std::time::Duration;
use tracing::debug;

/// User and system CPU time consumed by the process.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CpuTimes {
    pub user: Duration,
    pub system: Duration,
}

impl CpuTimes {
    /// Totals for the whole process so far.
    pub fn now() -> io::Result<Self> {
        let mut usage = MaybeUninit::<libc::rusage>::zeroed();
        // Safety: `usage` is a valid, writable rusage for the kernel to fill.
        let ret = unsafe { libc::getrusage(libc::RUSAGE_SELF, usage.as_mut_ptr()) };
        if ret != 0 {
            return Err(io::Error::last_os_error());
        }
        // Safety: getrusage succeeded, so every field has been written.
        let usage = unsafe { usage.assume_init() };

        Ok(Self {
            user: to_duration(usage.ru_utime),
            system: to_duration(usage.ru_stime),
        })
    }

    /// Time consumed between `earlier` and `self`.
    pub fn since(&self, earlier: &CpuTimes) -> CpuTimes {
        CpuTimes {
            user: self.user.saturating_sub(earlier.user),
            system: self.system.saturating_sub(earlier.system),
        }
    }
}

/// Measures CPU time over one session.
///
/// Accounting is best effort: if `getrusage` fails the session still runs
/// and reports zero.
pub struct CpuClock {
    start: Option<CpuTimes>,
}

impl CpuClock {
    pub fn start() -> Self {
        let start = CpuTimes::now()
            .inspect_err(|e| debug!(error = %e, "CPU accounting unavailable"))
            .ok();
        Self { start }
    }

    pub fn elapsed(&self) -> CpuTimes {
        match (self.start, CpuTimes::now()) {
            (Some(start), Ok(end)) => end.since(&start),
            _ => CpuTimes::default(),
        }
    }
}

fn to_duration(tv: libc::timeval) -> Duration {
    let micros = u64::try_from(tv.tv_usec).unwrap_or(0);
    Duration::from_secs(u64::try_from(tv.tv_sec).unwrap_or(0)) + Duration::from_micros(micros)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Instant;

    #[test]
    fn test_busy_loop_is_counted() {
        let clock = CpuClock::start();

        let started = Instant::now();
        let mut acc = 0u64;
        while started.elapsed() < Duration::from_millis(100) {
            acc = acc.wrapping_mul(31).wrapping_add(7);
            std::hint::black_box(acc);
        }

        let used = clock.elapsed();
        assert!(used.user + used.system > Duration::ZERO);
    }

    #[test]
    fn test_since_saturates() {
        let later = CpuTimes {
            user: Duration::from_millis(5),
            system: Duration::from_millis(1),
        };
        let earlier = CpuTimes {
            user: Duration::from_millis(2),
            system: Duration::from_millis(3),
        };

        assert_eq!(
            later.since(&earlier),
            CpuTimes {
                user: Duration::from_millis(3),
                system: Duration::ZERO,
            }
        );
    }
}
