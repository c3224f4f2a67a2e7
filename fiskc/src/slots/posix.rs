//! POSIX named semaphores shared by every fisk client on the host.

#![allow(unsafe_code)]

use super::{Permit, SlotBackend, SlotCapacities, SlotError, SlotReport};
use fisk_common::SlotKind;
use std::ffi::CString;
use std::io;
use tracing::{debug, warn};

/// Owned handle to an open `sem_t`.
pub struct NamedSemaphore {
    name: String,
    sem: *mut libc::sem_t,
}

// sem_t operations are thread-safe; the handle is only closed on drop.
unsafe impl Send for NamedSemaphore {}
unsafe impl Sync for NamedSemaphore {}

fn c_name(name: &str) -> io::Result<CString> {
    CString::new(name).map_err(|e| io::Error::new(io::ErrorKind::InvalidInput, e))
}

impl NamedSemaphore {
    /// Open `name`, creating it with `initial` units if it does not exist.
    /// An existing semaphore keeps its current count.
    pub fn open(name: &str, initial: usize) -> Result<Self, SlotError> {
        let open_error = |source| SlotError::Open {
            name: name.to_string(),
            source,
        };
        let c_name = c_name(name).map_err(open_error)?;
        let initial = libc::c_uint::try_from(initial).unwrap_or(libc::c_uint::MAX);
        let sem = unsafe {
            libc::sem_open(
                c_name.as_ptr(),
                libc::O_CREAT,
                0o666 as libc::c_uint,
                initial,
            )
        };
        if sem == libc::SEM_FAILED {
            return Err(open_error(io::Error::last_os_error()));
        }
        Ok(Self {
            name: name.to_string(),
            sem,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Take a unit if one is free. `Ok(false)` means none was.
    pub fn try_wait(&self) -> io::Result<bool> {
        loop {
            if unsafe { libc::sem_trywait(self.sem) } == 0 {
                return Ok(true);
            }
            let err = io::Error::last_os_error();
            match err.raw_os_error() {
                Some(libc::EAGAIN) => return Ok(false),
                Some(libc::EINTR) => continue,
                _ => return Err(err),
            }
        }
    }

    /// Block until a unit is free.
    pub fn wait(&self) -> io::Result<()> {
        loop {
            if unsafe { libc::sem_wait(self.sem) } == 0 {
                return Ok(());
            }
            let err = io::Error::last_os_error();
            if err.raw_os_error() != Some(libc::EINTR) {
                return Err(err);
            }
        }
    }

    pub fn post(&self) -> io::Result<()> {
        if unsafe { libc::sem_post(self.sem) } == 0 {
            Ok(())
        } else {
            Err(io::Error::last_os_error())
        }
    }

    /// Current count; `None` where the OS does not report it.
    #[cfg(any(target_os = "linux", target_os = "android"))]
    pub fn value(&self) -> Option<i64> {
        let mut value: libc::c_int = 0;
        if unsafe { libc::sem_getvalue(self.sem, &mut value) } == 0 {
            Some(i64::from(value))
        } else {
            None
        }
    }

    #[cfg(not(any(target_os = "linux", target_os = "android")))]
    pub fn value(&self) -> Option<i64> {
        None
    }

    /// Remove `name` from the system. Returns false if it did not exist.
    pub fn unlink(name: &str) -> Result<bool, SlotError> {
        let unlink_error = |source| SlotError::Unlink {
            name: name.to_string(),
            source,
        };
        let c_name = c_name(name).map_err(unlink_error)?;
        if unsafe { libc::sem_unlink(c_name.as_ptr()) } == 0 {
            return Ok(true);
        }
        let err = io::Error::last_os_error();
        if err.raw_os_error() == Some(libc::ENOENT) {
            Ok(false)
        } else {
            Err(unlink_error(err))
        }
    }
}

impl Drop for NamedSemaphore {
    fn drop(&mut self) {
        unsafe {
            libc::sem_close(self.sem);
        }
    }
}

/// Slot backend over `/fisk.compile` and `/fisk.cpp`.
pub struct PosixSlots {
    capacities: SlotCapacities,
    semaphores: [Option<NamedSemaphore>; 2],
}

impl PosixSlots {
    /// Open both semaphores. A kind whose semaphore cannot be opened runs
    /// unlimited.
    pub fn open(capacities: SlotCapacities) -> Self {
        let open = |kind: SlotKind| match NamedSemaphore::open(
            kind.semaphore_name(),
            capacities.get(kind),
        ) {
            Ok(sem) => Some(sem),
            Err(e) => {
                warn!("Failed to open {} slots: {}, running without a limit", kind, e);
                None
            }
        };
        Self {
            capacities,
            semaphores: [open(SlotKind::Compile), open(SlotKind::Preprocess)],
        }
    }

    fn semaphore(&self, kind: SlotKind) -> Option<&NamedSemaphore> {
        self.semaphores[kind.index()].as_ref()
    }
}

impl SlotBackend for PosixSlots {
    fn try_acquire(&self, kind: SlotKind) -> Option<Permit> {
        let Some(sem) = self.semaphore(kind) else {
            return Some(Permit::Uncounted);
        };
        match sem.try_wait() {
            Ok(true) => Some(Permit::Counted),
            Ok(false) => None,
            Err(e) => {
                warn!("Failed to take {} slot: {}, proceeding uncounted", kind, e);
                Some(Permit::Uncounted)
            }
        }
    }

    fn acquire(&self, kind: SlotKind) -> Permit {
        let Some(sem) = self.semaphore(kind) else {
            return Permit::Uncounted;
        };
        match sem.wait() {
            Ok(()) => Permit::Counted,
            Err(e) => {
                warn!("Failed to wait for {} slot: {}, proceeding uncounted", kind, e);
                Permit::Uncounted
            }
        }
    }

    fn release(&self, kind: SlotKind) {
        if let Some(sem) = self.semaphore(kind)
            && let Err(e) = sem.post()
        {
            warn!("Failed to release {} slot: {}", kind, e);
        }
    }

    fn report(&self, kind: SlotKind) -> SlotReport {
        let sem = self.semaphore(kind);
        SlotReport {
            kind,
            name: kind.semaphore_name().to_string(),
            capacity: self.capacities.get(kind),
            available: sem.and_then(NamedSemaphore::value),
            counted: sem.is_some(),
        }
    }
}

/// Unlink both host-wide semaphores. The next client recreates them with its
/// configured capacities.
pub fn clean() -> Result<usize, SlotError> {
    let mut removed = 0;
    for kind in SlotKind::ALL {
        if NamedSemaphore::unlink(kind.semaphore_name())? {
            debug!("Unlinked {}", kind.semaphore_name());
            removed += 1;
        }
    }
    Ok(removed)
}
