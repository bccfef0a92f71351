//! The self-pipe used to interrupt a blocked wait.

use std::io;
use std::sync::atomic::{AtomicBool, Ordering};

use rustix::fd::{AsRawFd, BorrowedFd, OwnedFd, RawFd};
use rustix::fs::{fcntl_getfl, fcntl_setfl, OFlags};
use rustix::io::{fcntl_getfd, fcntl_setfd, read, write, Errno, FdFlags};
use rustix::net::{socketpair, AddressFamily, SocketFlags, SocketType};

use crate::{Error, Result};

/// A byte written to the wake channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Signal {
    /// Something changed; re-evaluate and keep waiting.
    Poke,
    /// Stop waiting for good.
    Kill,
}

impl Signal {
    fn byte(self) -> u8 {
        match self {
            Signal::Poke => b'p',
            Signal::Kill => b'k',
        }
    }
}

/// A connected pair of local sockets plus the flags that give its bytes meaning.
///
/// The bytes only wake the waiting thread. What they mean is carried by `notified` and
/// `killed`, which are set before the byte is written, so a byte consumed by another party
/// never loses a user wake-up or a kill.
#[derive(Debug)]
pub(crate) struct WakeChannel {
    /// Registered with the backend for readability.
    read: OwnedFd,
    /// Written to by `poke`, `spak` and `kill`.
    write: OwnedFd,
    /// Set by `spak`, cleared by the wait that reports it.
    notified: AtomicBool,
    /// Set by `kill`, never cleared.
    killed: AtomicBool,
}

impl WakeChannel {
    pub(crate) fn new() -> Result<WakeChannel> {
        let (read, write) = socketpair(
            AddressFamily::UNIX,
            SocketType::STREAM,
            SocketFlags::empty(),
            None,
        )
        .map_err(|e| Error::from_create(e.into(), "wake channel"))?;

        for fd in [&read, &write] {
            fcntl_setfd(fd, fcntl_getfd(fd)? | FdFlags::CLOEXEC)?;
            fcntl_setfl(fd, fcntl_getfl(fd)? | OFlags::NONBLOCK)?;
        }

        tracing::trace!(?read, ?write, "wake channel");

        Ok(WakeChannel {
            read,
            write,
            notified: AtomicBool::new(false),
            killed: AtomicBool::new(false),
        })
    }

    /// The end the backend watches.
    pub(crate) fn read_fd(&self) -> RawFd {
        self.read.as_raw_fd()
    }

    /// Borrow of the read end that is valid for as long as the channel lives.
    ///
    /// # Safety
    ///
    /// The caller must not let the returned value outlive `self`.
    #[cfg(not(sockpoll_epoll))]
    pub(crate) unsafe fn read_borrowed(&self) -> BorrowedFd<'static> {
        BorrowedFd::borrow_raw(self.read.as_raw_fd())
    }

    #[cfg(sockpoll_epoll)]
    pub(crate) fn as_fd(&self) -> BorrowedFd<'_> {
        rustix::fd::AsFd::as_fd(&self.read)
    }

    /// Whether `fd` is one of the channel's own sockets.
    pub(crate) fn owns(&self, fd: RawFd) -> bool {
        fd == self.read.as_raw_fd() || fd == self.write.as_raw_fd()
    }

    /// Sends a POKE on behalf of an internal mutation.
    ///
    /// Returns whether a byte actually went out.
    pub(crate) fn poke(&self) -> io::Result<bool> {
        self.send(Signal::Poke)
    }

    /// Sends a POKE the next wait must report to its caller.
    ///
    /// Pokes sent while one is already pending coalesce. Returns whether a byte went out.
    pub(crate) fn spak(&self) -> io::Result<bool> {
        if self.notified.swap(true, Ordering::SeqCst) {
            return Ok(false);
        }
        self.send(Signal::Poke)
    }

    /// Sends a KILL. Returns whether a byte went out.
    pub(crate) fn kill(&self) -> io::Result<bool> {
        self.killed.store(true, Ordering::SeqCst);
        self.send(Signal::Kill)
    }

    pub(crate) fn is_killed(&self) -> bool {
        self.killed.load(Ordering::SeqCst)
    }

    /// Clears and returns the pending user wake-up.
    pub(crate) fn take_notified(&self) -> bool {
        self.notified.swap(false, Ordering::SeqCst)
    }

    /// Consumes every pending byte. Returns whether a KILL was among them.
    pub(crate) fn drain(&self) -> io::Result<bool> {
        let mut buf = [0; 64];
        let mut killed = false;
        let mut total = 0;

        loop {
            match read(&self.read, &mut buf) {
                Ok(0) => break,
                Ok(n) => {
                    total += n;
                    killed |= buf[..n].contains(&Signal::Kill.byte());
                }
                Err(err) if err == Errno::INTR => continue,
                Err(err) if err == Errno::WOULDBLOCK => break,
                Err(err) => return Err(err.into()),
            }
        }

        tracing::trace!(bytes = total, killed, "drained wake channel");
        Ok(killed)
    }

    /// Removes a single byte written by `poke` or `spak` that nobody consumed.
    pub(crate) fn pop(&self) {
        let _ = read(&self.read, &mut [0; 1]);
    }

    fn send(&self, signal: Signal) -> io::Result<bool> {
        loop {
            match write(&self.write, &[signal.byte()]) {
                Ok(n) => return Ok(n == 1),
                Err(err) if err == Errno::INTR => continue,
                // The buffer is full of unread wake-ups already.
                Err(err) if err == Errno::WOULDBLOCK => return Ok(false),
                Err(err) => return Err(err.into()),
            }
        }
    }
}
