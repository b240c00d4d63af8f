//! SIGSEGV / SIGBUS handling for lazily mapped segments.
//!
//! A process touching a segment it has not mapped yet hits the no-access
//! placeholder (SIGSEGV); a process touching a segment whose backing
//! object was destroyed hits a truncated object (SIGBUS). Both land in
//! [`handle_fault`], which asks the [`FaultResolver`] owning the faulting
//! address to map the current generation and then returns, so the access
//! is retried and succeeds.
//!
//! # Handler discipline
//!
//! The handler runs between arbitrary instructions of the interrupted
//! thread, possibly while that thread holds the directory lock. It must
//! not allocate, must not take the directory lock, and must not log
//! through `tracing`. It reads a revision atomically, takes one Local
//! Mapping Table entry lock, and issues `shm_open` / `mmap` / `close`.
//! Fatal outcomes are written to stderr from a stack buffer.
//!
//! # Chaining
//!
//! Faults outside every registered range, and fatal outcomes inside one,
//! go to whatever handler was installed before:
//!
//! | previous disposition | action |
//! |---|---|
//! | `SA_SIGINFO` handler | called with the original arguments |
//! | plain handler | called with the signal number |
//! | `SIG_DFL` | restored, then the access is retried and the default action applies |
//! | `SIG_IGN` | process aborts |
//!
//! After calling a previous handler we return only if it changed the
//! disposition (the standard library does this to report stack
//! overflows); otherwise the process aborts.
//!
//! # Backends
//!
//! Everything allocator-specific sits behind [`FaultResolver`]. Another
//! delivery mechanism (for example a userfaultfd reader thread) only needs
//! to call [`FaultResolver::resolve`] with the faulting address.

use crate::error::{Error, Result};
use rustix::fd::BorrowedFd;
use rustix::io::Errno;
use std::ffi::c_void;
use std::fmt::{self, Write};
use std::ptr;
use std::sync::atomic::{AtomicPtr, AtomicUsize, Ordering};
use std::sync::{Mutex, OnceLock};

/// Shared buffer contexts that can be registered at the same time in one
/// process.
pub const MAX_REGISTRATIONS: usize = 64;

/// Why a fault could not be resolved. Carries no heap data so it can be
/// built and printed inside the signal handler.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FaultError {
    /// The address is outside the resolver's reserved range.
    OutOfRange {
        /// Faulting address.
        addr: usize,
    },
    /// The segment has no backing object (even revision): the access went
    /// through a dangling reference.
    SegmentMissing {
        /// Segment slot.
        segment_id: u32,
        /// Current (even) revision.
        revision: u32,
    },
    /// The current generation is already mapped here, so this is a real
    /// invalid access and not a staleness fault.
    AlreadyMapped {
        /// Segment slot.
        segment_id: u32,
        /// Current revision.
        revision: u32,
    },
    /// The faulting thread already holds the entry lock of this segment.
    Reentrant {
        /// Segment slot.
        segment_id: u32,
    },
    /// `shm_open` of the current generation failed.
    Open {
        /// Segment slot.
        segment_id: u32,
        /// Revision whose object was opened.
        revision: u32,
        /// Error from the kernel.
        errno: Errno,
    },
    /// `mmap` of the current generation failed.
    Map {
        /// Segment slot.
        segment_id: u32,
        /// Revision whose object was mapped.
        revision: u32,
        /// Error from the kernel.
        errno: Errno,
    },
}

impl fmt::Display for FaultError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        // Errno's Display may allocate, print the raw number instead.
        match *self {
            FaultError::OutOfRange { addr } => {
                write!(f, "address {addr:#x} is outside the shared buffer range")
            }
            FaultError::SegmentMissing {
                segment_id,
                revision,
            } => write!(
                f,
                "segment {segment_id} does not exist (revision {revision}), dangling reference"
            ),
            FaultError::AlreadyMapped {
                segment_id,
                revision,
            } => write!(
                f,
                "segment {segment_id} is already mapped at current revision {revision}"
            ),
            FaultError::Reentrant { segment_id } => write!(
                f,
                "nested fault while resolving segment {segment_id} on the same thread"
            ),
            FaultError::Open {
                segment_id,
                revision,
                errno,
            } => write!(
                f,
                "shm_open failed for segment {segment_id} revision {revision} (errno {})",
                errno.raw_os_error()
            ),
            FaultError::Map {
                segment_id,
                revision,
                errno,
            } => write!(
                f,
                "mmap failed for segment {segment_id} revision {revision} (errno {})",
                errno.raw_os_error()
            ),
        }
    }
}

/// Turns a faulting address into an accessible one.
pub trait FaultResolver: Send + Sync {
    /// Map whatever should live at `addr`.
    ///
    /// `Ok(())` means the faulting access can be retried. Implementations
    /// are called from a signal handler and must be async-signal-safe.
    fn resolve(&self, addr: usize) -> std::result::Result<(), FaultError>;
}

struct Registration {
    start: usize,
    end: usize,
    resolver: *const dyn FaultResolver,
}

static REGISTRY: [AtomicPtr<Registration>; MAX_REGISTRATIONS] =
    [const { AtomicPtr::new(ptr::null_mut()) }; MAX_REGISTRATIONS];

/// Handlers currently reading the registry.
static IN_FLIGHT: AtomicUsize = AtomicUsize::new(0);

#[derive(Clone, Copy)]
struct PreviousHandlers {
    segv: libc::sigaction,
    bus: libc::sigaction,
}

// SAFETY: plain data copied out of the kernel.
unsafe impl Send for PreviousHandlers {}
unsafe impl Sync for PreviousHandlers {}

static PREVIOUS: OnceLock<PreviousHandlers> = OnceLock::new();
static INSTALL_LOCK: Mutex<()> = Mutex::new(());

/// Install the fault handler for SIGSEGV and SIGBUS, once per process.
///
/// The handlers found at installation time are kept for chaining. Later
/// calls are no-ops.
pub fn install() -> Result<()> {
    let _guard = INSTALL_LOCK.lock().unwrap_or_else(|e| e.into_inner());
    if PREVIOUS.get().is_some() {
        return Ok(());
    }

    // SAFETY: sigaction is a plain C struct; zero is a valid bit pattern.
    let mut action: libc::sigaction = unsafe { std::mem::zeroed() };
    action.sa_sigaction = handle_fault as usize;
    action.sa_flags = libc::SA_SIGINFO | libc::SA_ONSTACK | libc::SA_NODEFER;

    let mut segv: libc::sigaction = unsafe { std::mem::zeroed() };
    let mut bus: libc::sigaction = unsafe { std::mem::zeroed() };
    // SAFETY: all pointers refer to live locals.
    unsafe {
        libc::sigemptyset(&mut action.sa_mask);
        if libc::sigaction(libc::SIGSEGV, &action, &mut segv) != 0 {
            return Err(std::io::Error::last_os_error().into());
        }
        if libc::sigaction(libc::SIGBUS, &action, &mut bus) != 0 {
            let err = std::io::Error::last_os_error();
            libc::sigaction(libc::SIGSEGV, &segv, ptr::null_mut());
            return Err(err.into());
        }
    }

    let _ = PREVIOUS.set(PreviousHandlers { segv, bus });
    tracing::debug!("installed SIGSEGV/SIGBUS handler");
    Ok(())
}

/// Keeps a resolver registered for `[start, end)` until dropped.
pub struct FaultRegistration {
    index: usize,
}

impl FaultRegistration {
    /// Register `resolver` for faults in `[start, end)`.
    ///
    /// # Safety
    ///
    /// `resolver` must stay valid until the returned registration is
    /// dropped.
    pub unsafe fn new(
        start: usize,
        end: usize,
        resolver: *const dyn FaultResolver,
    ) -> Result<Self> {
        let registration = Box::into_raw(Box::new(Registration {
            start,
            end,
            resolver,
        }));
        for (index, slot) in REGISTRY.iter().enumerate() {
            if slot
                .compare_exchange(
                    ptr::null_mut(),
                    registration,
                    Ordering::AcqRel,
                    Ordering::Relaxed,
                )
                .is_ok()
            {
                return Ok(Self { index });
            }
        }
        // SAFETY: never published.
        drop(unsafe { Box::from_raw(registration) });
        Err(Error::InvalidConfig(format!(
            "at most {MAX_REGISTRATIONS} shared buffers can exist in one process"
        )))
    }
}

impl Drop for FaultRegistration {
    fn drop(&mut self) {
        let registration = REGISTRY[self.index].swap(ptr::null_mut(), Ordering::SeqCst);
        // a handler may still be reading the entry
        while IN_FLIGHT.load(Ordering::SeqCst) != 0 {
            std::thread::yield_now();
        }
        if !registration.is_null() {
            // SAFETY: created by Box::into_raw in new and now unreachable.
            drop(unsafe { Box::from_raw(registration) });
        }
    }
}

/// Find the resolver owning `addr` and run it.
fn dispatch(addr: usize) -> Option<std::result::Result<(), FaultError>> {
    for slot in &REGISTRY {
        let registration = slot.load(Ordering::SeqCst);
        if registration.is_null() {
            continue;
        }
        // SAFETY: registrations are freed only after IN_FLIGHT drops to zero.
        let registration = unsafe { &*registration };
        if (registration.start..registration.end).contains(&addr) {
            // SAFETY: the registering context outlives its registration.
            let resolver = unsafe { &*registration.resolver };
            return Some(resolver.resolve(addr));
        }
    }
    None
}

extern "C" fn handle_fault(signum: libc::c_int, info: *mut libc::siginfo_t, context: *mut c_void) {
    // SAFETY: __errno_location returns the calling thread's errno slot.
    let errno = unsafe { libc::__errno_location() };
    let saved_errno = unsafe { *errno };

    // SAFETY: the kernel passes a valid siginfo for SA_SIGINFO handlers.
    let addr = unsafe { (*info).si_addr() } as usize;

    IN_FLIGHT.fetch_add(1, Ordering::SeqCst);
    let outcome = dispatch(addr);
    IN_FLIGHT.fetch_sub(1, Ordering::SeqCst);

    match outcome {
        Some(Ok(())) => {}
        Some(Err(error)) => {
            report(signum, addr, &error);
            chain(signum, info, context);
        }
        None => chain(signum, info, context),
    }
    // SAFETY: same thread-local slot as above.
    unsafe { *errno = saved_errno };
}

/// Fixed-capacity text buffer; output beyond capacity is dropped.
struct StackBuf {
    buf: [u8; 256],
    len: usize,
}

impl Write for StackBuf {
    fn write_str(&mut self, s: &str) -> fmt::Result {
        let n = s.len().min(self.buf.len() - self.len);
        self.buf[self.len..self.len + n].copy_from_slice(&s.as_bytes()[..n]);
        self.len += n;
        Ok(())
    }
}

fn signal_name(signum: libc::c_int) -> &'static str {
    match signum {
        libc::SIGSEGV => "SIGSEGV",
        libc::SIGBUS => "SIGBUS",
        _ => "signal",
    }
}

fn report(signum: libc::c_int, addr: usize, error: &FaultError) {
    let mut out = StackBuf {
        buf: [0; 256],
        len: 0,
    };
    let _ = writeln!(
        out,
        "shmbuf: unresolved {} at {addr:#x}: {error}",
        signal_name(signum)
    );
    // SAFETY: fd 2 stays open for the life of the process.
    let stderr = unsafe { BorrowedFd::borrow_raw(2) };
    let _ = rustix::io::write(stderr, &out.buf[..out.len]);
}

fn current_disposition(signum: libc::c_int) -> Option<libc::sighandler_t> {
    // SAFETY: querying with a null new action only writes `current`.
    unsafe {
        let mut current: libc::sigaction = std::mem::zeroed();
        (libc::sigaction(signum, ptr::null(), &mut current) == 0).then_some(current.sa_sigaction)
    }
}

fn chain(signum: libc::c_int, info: *mut libc::siginfo_t, context: *mut c_void) {
    let Some(previous) = PREVIOUS.get() else {
        unsafe { libc::abort() };
    };
    let previous = if signum == libc::SIGBUS {
        previous.bus
    } else {
        previous.segv
    };

    match previous.sa_sigaction {
        libc::SIG_DFL => {
            // SAFETY: restoring the default disposition; the retried access
            // then terminates the process with the original signal.
            unsafe {
                let mut default: libc::sigaction = std::mem::zeroed();
                default.sa_sigaction = libc::SIG_DFL;
                libc::sigemptyset(&mut default.sa_mask);
                libc::sigaction(signum, &default, ptr::null_mut());
            }
        }
        libc::SIG_IGN => unsafe { libc::abort() },
        handler => {
            // SAFETY: the kernel stored this value as a handler of the
            // matching kind when it was installed.
            unsafe {
                if previous.sa_flags & libc::SA_SIGINFO != 0 {
                    let handler: extern "C" fn(libc::c_int, *mut libc::siginfo_t, *mut c_void) =
                        std::mem::transmute(handler);
                    handler(signum, info, context);
                } else {
                    let handler: extern "C" fn(libc::c_int) = std::mem::transmute(handler);
                    handler(signum);
                }
            }
            if current_disposition(signum) == Some(handle_fault as usize) {
                unsafe { libc::abort() };
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicU32;

    struct Counting {
        calls: AtomicU32,
    }

    impl FaultResolver for Counting {
        fn resolve(&self, addr: usize) -> std::result::Result<(), FaultError> {
            self.calls.fetch_add(1, Ordering::Relaxed);
            Err(FaultError::OutOfRange { addr })
        }
    }

    #[test]
    fn test_dispatch_by_range() {
        let resolver = Counting {
            calls: AtomicU32::new(0),
        };
        let start = 0x7000_dead_0000;
        let dyn_resolver: &(dyn FaultResolver + 'static) = &resolver;
        let registration =
            unsafe { FaultRegistration::new(start, start + 4096, dyn_resolver) }.unwrap();

        assert_eq!(dispatch(start - 1), None);
        assert_eq!(
            dispatch(start + 8),
            Some(Err(FaultError::OutOfRange { addr: start + 8 }))
        );
        assert_eq!(resolver.calls.load(Ordering::Relaxed), 1);

        drop(registration);
        assert_eq!(dispatch(start + 8), None);
    }

    #[test]
    fn test_install_is_idempotent() {
        install().unwrap();
        install().unwrap();
        assert_eq!(
            current_disposition(libc::SIGSEGV),
            Some(handle_fault as usize)
        );
        assert_eq!(current_disposition(libc::SIGBUS), Some(handle_fault as usize));
    }

    #[test]
    fn test_report_fits_stack_buffer() {
        let mut out = StackBuf {
            buf: [0; 256],
            len: 0,
        };
        let error = FaultError::Open {
            segment_id: u32::MAX,
            revision: u32::MAX,
            errno: Errno::NOENT,
        };
        write!(out, "shmbuf: unresolved SIGBUS at {:#x}: {error}", usize::MAX).unwrap();
        let text = std::str::from_utf8(&out.buf[..out.len]).unwrap();
        assert!(text.ends_with(&format!("(errno {})", Errno::NOENT.raw_os_error())));
    }

    #[test]
    fn test_fault_error_messages() {
        let msg = FaultError::SegmentMissing {
            segment_id: 3,
            revision: 4,
        }
        .to_string();
        assert!(msg.contains("dangling reference"));
        let msg = FaultError::Reentrant { segment_id: 1 }.to_string();
        assert!(msg.contains("nested fault"));
    }
}
