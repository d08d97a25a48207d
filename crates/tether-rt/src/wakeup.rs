//! Wakeup channel: a self-signalling pipe.
//!
//! Worker threads cannot call into the host loop, but the host loop can watch
//! a descriptor for readability. Completing a request writes one byte to the
//! pipe; the host's watcher fires and the drain routine empties both the pipe
//! and the completion queue.
//!
//! Signals coalesce: after the first `signal()` the channel is "armed" and
//! further signals are no-ops until the host drains. The consumer always
//! empties the whole completion queue on a wakeup, so one byte per burst is
//! enough.

use std::io;
use std::os::fd::{AsFd, AsRawFd, BorrowedFd, FromRawFd, OwnedFd, RawFd};

use crate::sync::{AtomicBool, Ordering};

pub struct WakeupChannel {
    reader: OwnedFd,
    writer: OwnedFd,
    armed: AtomicBool,
}

impl WakeupChannel {
    /// Create a non-blocking, close-on-exec pipe pair.
    pub fn new() -> io::Result<Self> {
        let (reader, writer) = sys_pipe()?;
        Ok(Self {
            reader,
            writer,
            armed: AtomicBool::new(false),
        })
    }

    /// Make the channel readable. Callable from any thread; never blocks.
    pub fn signal(&self) {
        if self.armed.swap(true, Ordering::SeqCst) {
            return;
        }

        let byte = [1u8];
        loop {
            let ret = unsafe { libc::write(self.writer.as_raw_fd(), byte.as_ptr().cast(), 1) };
            if ret >= 0 {
                return;
            }
            let err = io::Error::last_os_error();
            match err.kind() {
                io::ErrorKind::Interrupted => continue,
                // Pipe buffer full: the read end is readable already.
                io::ErrorKind::WouldBlock => return,
                _ => {
                    log::warn!("wakeup signal failed: {err}");
                    // Let the next signal try again.
                    self.armed.store(false, Ordering::SeqCst);
                    return;
                }
            }
        }
    }

    /// Consume every pending signal byte. Host thread only; never blocks.
    ///
    /// Returns the number of bytes read, which is 0 on a spurious wakeup.
    pub fn drain(&self) -> usize {
        // Disarm before reading so a completion racing with this drain
        // writes a fresh byte instead of being swallowed.
        self.armed.store(false, Ordering::SeqCst);

        let mut buf = [0u8; 64];
        let mut total = 0;
        loop {
            let ret = unsafe {
                libc::read(self.reader.as_raw_fd(), buf.as_mut_ptr().cast(), buf.len())
            };
            if ret > 0 {
                total += ret as usize;
                continue;
            }
            if ret == 0 {
                break;
            }
            let err = io::Error::last_os_error();
            match err.kind() {
                io::ErrorKind::Interrupted => continue,
                io::ErrorKind::WouldBlock => break,
                _ => {
                    log::warn!("wakeup drain failed: {err}");
                    break;
                }
            }
        }
        total
    }
}

impl AsFd for WakeupChannel {
    fn as_fd(&self) -> BorrowedFd<'_> {
        self.reader.as_fd()
    }
}

impl AsRawFd for WakeupChannel {
    fn as_raw_fd(&self) -> RawFd {
        self.reader.as_raw_fd()
    }
}

impl std::fmt::Debug for WakeupChannel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WakeupChannel")
            .field("fd", &self.reader.as_raw_fd())
            .field("armed", &self.armed.load(Ordering::Relaxed))
            .finish()
    }
}

// =============================================================================
// Pipe creation
// =============================================================================

#[cfg(any(
    target_os = "linux",
    target_os = "android",
    target_os = "solaris",
    target_os = "illumos",
    target_os = "freebsd",
))]
fn sys_pipe() -> io::Result<(OwnedFd, OwnedFd)> {
    let mut fds = [0 as RawFd; 2];
    let ret = unsafe { libc::pipe2(fds.as_mut_ptr(), libc::O_CLOEXEC | libc::O_NONBLOCK) };
    if ret == -1 {
        return Err(io::Error::last_os_error());
    }
    Ok(unsafe { (OwnedFd::from_raw_fd(fds[0]), OwnedFd::from_raw_fd(fds[1])) })
}

#[cfg(not(any(
    target_os = "linux",
    target_os = "android",
    target_os = "solaris",
    target_os = "illumos",
    target_os = "freebsd",
)))]
fn sys_pipe() -> io::Result<(OwnedFd, OwnedFd)> {
    let mut fds = [0 as RawFd; 2];
    let ret = unsafe { libc::pipe(fds.as_mut_ptr()) };
    if ret == -1 {
        return Err(io::Error::last_os_error());
    }
    // Owned first so both ends close if fcntl fails.
    let pair = unsafe { (OwnedFd::from_raw_fd(fds[0]), OwnedFd::from_raw_fd(fds[1])) };
    for fd in [pair.0.as_raw_fd(), pair.1.as_raw_fd()] {
        set_cloexec(fd)?;
        set_nonblocking(fd)?;
    }
    Ok(pair)
}

#[cfg(not(any(
    target_os = "linux",
    target_os = "android",
    target_os = "solaris",
    target_os = "illumos",
    target_os = "freebsd",
)))]
fn set_cloexec(fd: RawFd) -> io::Result<()> {
    let flags = unsafe { libc::fcntl(fd, libc::F_GETFD) };
    if flags == -1 {
        return Err(io::Error::last_os_error());
    }
    if unsafe { libc::fcntl(fd, libc::F_SETFD, flags | libc::FD_CLOEXEC) } == -1 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}

#[cfg(not(any(
    target_os = "linux",
    target_os = "android",
    target_os = "solaris",
    target_os = "illumos",
    target_os = "freebsd",
)))]
fn set_nonblocking(fd: RawFd) -> io::Result<()> {
    let flags = unsafe { libc::fcntl(fd, libc::F_GETFL) };
    if flags == -1 {
        return Err(io::Error::last_os_error());
    }
    if unsafe { libc::fcntl(fd, libc::F_SETFL, flags | libc::O_NONBLOCK) } == -1 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}

#[cfg(all(test, not(loom)))]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    fn readable(channel: &WakeupChannel) -> bool {
        let mut pfd = libc::pollfd {
            fd: channel.as_raw_fd(),
            events: libc::POLLIN,
            revents: 0,
        };
        let ret = unsafe { libc::poll(&mut pfd, 1, 0) };
        assert!(ret >= 0, "poll failed: {}", io::Error::last_os_error());
        ret == 1 && (pfd.revents & libc::POLLIN) != 0
    }

    #[test]
    fn fresh_channel_is_not_readable() {
        let channel = WakeupChannel::new().unwrap();
        assert!(!readable(&channel));
        assert_eq!(channel.drain(), 0, "drain on an idle channel must not block");
    }

    #[test]
    fn signal_makes_readable_and_drain_clears() {
        let channel = WakeupChannel::new().unwrap();
        channel.signal();
        assert!(readable(&channel));
        assert_eq!(channel.drain(), 1);
        assert!(!readable(&channel));
    }

    #[test]
    fn repeated_signals_coalesce() {
        let channel = WakeupChannel::new().unwrap();
        for _ in 0..1000 {
            channel.signal();
        }
        assert_eq!(channel.drain(), 1);
        assert!(!readable(&channel));
    }

    #[test]
    fn signal_after_drain_rearms() {
        let channel = WakeupChannel::new().unwrap();
        channel.signal();
        channel.drain();
        channel.signal();
        assert!(readable(&channel));
    }

    #[test]
    fn concurrent_signals_from_workers() {
        let channel = Arc::new(WakeupChannel::new().unwrap());
        let workers: Vec<_> = (0..8)
            .map(|_| {
                let channel = Arc::clone(&channel);
                thread::spawn(move || {
                    for _ in 0..100 {
                        channel.signal();
                    }
                })
            })
            .collect();
        for w in workers {
            w.join().unwrap();
        }
        assert!(readable(&channel));
        assert_eq!(channel.drain(), 1);
        assert!(!readable(&channel));
    }

    #[test]
    fn descriptor_is_close_on_exec() {
        let channel = WakeupChannel::new().unwrap();
        let flags = unsafe { libc::fcntl(channel.as_raw_fd(), libc::F_GETFD) };
        assert!(flags & libc::FD_CLOEXEC != 0);
    }
}
