//! Level-triggered socket readiness poller with a cross-thread wake channel.
//!
//! Supported platforms:
//! - [epoll](https://en.wikipedia.org/wiki/Epoll): Linux, Android
//! - [poll](https://en.wikipedia.org/wiki/Poll_(Unix)): every other Unix
//!
//! A [`Poller`] watches a set of sockets for readability and writability. Every registered socket
//! may carry a piece of caller data that is handed back to the callback of [`Poller::wait`] when
//! the socket becomes ready.
//!
//! While one thread is blocked in [`Poller::wait`], other threads may keep calling
//! [`Poller::insert`], [`Poller::modify`] and [`Poller::remove`]; the waiting thread picks the
//! change up on its next evaluation. [`Poller::spak`] makes the wait return early and
//! [`Poller::kill`] shuts the poller down for good.
//!
//! # Examples
//!
//! ```no_run
//! use sockpoll::{Interest, Poller, WaitStatus};
//! use std::net::TcpListener;
//!
//! // Create a TCP listener.
//! let socket = TcpListener::bind("127.0.0.1:8000")?;
//! socket.set_nonblocking(true)?;
//!
//! // Create a poller and register interest in readability on the socket.
//! let poller = Poller::new()?;
//! unsafe {
//!     poller.insert(&socket, Interest::READABLE, Some("listener"))?;
//! }
//!
//! // The event loop.
//! loop {
//!     let status = poller.wait(None, |fd, events, name| {
//!         println!("{:?} on {} ({:?})", events, fd, name);
//!     })?;
//!
//!     if status == WaitStatus::Killed {
//!         break;
//!     }
//!
//!     // Accept whatever is pending; the socket stays registered.
//!     while socket.accept().is_ok() {}
//! }
//! # std::io::Result::Ok(())
//! ```

#![warn(missing_docs, missing_debug_implementations, rust_2018_idioms)]

use std::fmt;
use std::time::{Duration, Instant};

use rustix::fd::{AsFd, AsRawFd, RawFd};

cfg_if::cfg_if! {
    if #[cfg(sockpoll_epoll)] {
        mod epoll;
        use epoll as sys;
    } else if #[cfg(unix)] {
        mod poll;
        use poll as sys;
    } else {
        compile_error!("sockpoll does not support this target OS");
    }
}

mod error;
mod private;
mod table;
mod wake;

pub use error::{Error, Result};

/// Capacity hint used by [`Poller::new`].
const DEFAULT_CAPACITY: usize = 64;

bitflags::bitflags! {
    /// Readiness a caller can ask for, and readiness a wait reports.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct Interest: u8 {
        /// Reading will not block.
        const READABLE = 0b01;
        /// Writing will not block.
        const WRITABLE = 0b10;
    }
}

impl Interest {
    /// Interest in nothing.
    ///
    /// The socket stays registered and still reports hang-ups and errors.
    pub const NONE: Interest = Interest::empty();
}

/// How a call to [`Poller::wait`] ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum WaitStatus {
    /// The callback ran this many times.
    ///
    /// Zero means the wait was interrupted by [`Poller::spak`] before any socket was ready.
    Ready(usize),
    /// The timeout elapsed with no socket ready.
    TimedOut,
    /// [`Poller::kill`] was called. The poller must not be waited on again; further waits
    /// return `Killed` immediately.
    Killed,
}

impl WaitStatus {
    /// Number of callbacks invoked.
    pub fn events(self) -> usize {
        match self {
            WaitStatus::Ready(n) => n,
            WaitStatus::TimedOut | WaitStatus::Killed => 0,
        }
    }

    /// Whether the poller has been killed.
    pub fn is_killed(self) -> bool {
        self == WaitStatus::Killed
    }

    /// Whether the timeout elapsed.
    pub fn is_timed_out(self) -> bool {
        self == WaitStatus::TimedOut
    }
}

/// A resource with a raw file descriptor.
pub trait AsRawSource {
    /// Returns the raw file descriptor.
    fn raw(&self) -> RawFd;
}

impl AsRawSource for RawFd {
    fn raw(&self) -> RawFd {
        *self
    }
}

impl<T: AsFd> AsRawSource for &T {
    fn raw(&self) -> RawFd {
        self.as_fd().as_raw_fd()
    }
}

/// A ready socket collected by a backend, dispatched once its locks are released.
pub(crate) struct Ready<T> {
    pub(crate) fd: RawFd,
    pub(crate) readiness: Interest,
    pub(crate) data: Option<T>,
}

/// Waits for readiness events on a set of sockets.
///
/// `T` is the caller data attached to sockets. It is cloned out of the poller for every
/// dispatched event, so use an integer key or an `Arc` for anything large.
pub struct Poller<T> {
    poller: sys::Poller<T>,
}

impl<T> Poller<T> {
    /// Creates a new poller.
    ///
    /// # Examples
    ///
    /// ```
    /// use sockpoll::Poller;
    ///
    /// let poller = Poller::<()>::new()?;
    /// # std::io::Result::Ok(())
    /// ```
    pub fn new() -> Result<Poller<T>> {
        Poller::with_capacity(DEFAULT_CAPACITY)
    }

    /// Creates a new poller sized for about `capacity` sockets.
    ///
    /// The table grows past `capacity` as needed. A zero hint is rejected.
    pub fn with_capacity(capacity: usize) -> Result<Poller<T>> {
        if capacity == 0 {
            return Err(Error::InvalidUse("capacity hint must be non-zero"));
        }

        Ok(Poller {
            poller: sys::Poller::new(capacity)?,
        })
    }

    /// Whether every flag in `interest` is understood by this poller.
    ///
    /// # Examples
    ///
    /// ```
    /// use sockpoll::{Interest, Poller};
    ///
    /// let poller = Poller::<()>::new()?;
    /// assert!(poller.supports(Interest::READABLE | Interest::WRITABLE));
    /// assert!(!poller.supports(Interest::from_bits_retain(0x80)));
    /// # std::io::Result::Ok(())
    /// ```
    pub fn supports(&self, interest: Interest) -> bool {
        Interest::all().contains(interest)
    }

    /// Whether this poller reports readiness for as long as it lasts.
    pub fn supports_level(&self) -> bool {
        self.poller.supports_level()
    }

    /// Whether this poller can report readiness only on transitions.
    pub fn supports_edge(&self) -> bool {
        self.poller.supports_edge()
    }

    /// Adds a socket to the watch set.
    ///
    /// `data` is handed to the wait callback whenever the socket is ready. A socket can be
    /// registered once; inserting it again before [`remove`][Poller::remove] fails.
    ///
    /// # Safety
    ///
    /// The socket must stay open until it is removed from the poller or the poller is dropped.
    ///
    /// # Examples
    ///
    /// ```
    /// use sockpoll::{Interest, Poller};
    /// use std::net::TcpListener;
    ///
    /// let poller = Poller::new()?;
    /// let socket = TcpListener::bind("127.0.0.1:0")?;
    ///
    /// unsafe {
    ///     poller.insert(&socket, Interest::READABLE, Some(7u32))?;
    /// }
    /// assert_eq!(poller.data(&socket), Some(7));
    ///
    /// poller.remove(&socket);
    /// # std::io::Result::Ok(())
    /// ```
    pub unsafe fn insert(
        &self,
        source: impl AsRawSource,
        interest: Interest,
        data: Option<T>,
    ) -> Result<()> {
        let fd = source.raw();
        if fd < 0 {
            return Err(Error::InvalidUse("negative descriptor"));
        }
        if !self.supports(interest) {
            return Err(Error::InvalidUse("unsupported interest"));
        }

        self.poller.insert(fd, interest, data)
    }

    /// Changes the interest of a registered socket.
    ///
    /// `Some(data)` replaces the attached data, `None` leaves it as it is. Unknown sockets are
    /// ignored.
    pub fn modify(&self, source: impl AsFd, interest: Interest, data: Option<T>) -> Result<()> {
        if !self.supports(interest) {
            return Err(Error::InvalidUse("unsupported interest"));
        }

        self.poller.modify(source.as_fd().as_raw_fd(), interest, data)
    }

    /// Removes a socket and its data from the watch set.
    ///
    /// Unknown sockets are ignored.
    pub fn remove(&self, source: impl AsFd) {
        self.poller.remove(source.as_fd().as_raw_fd());
    }

    /// Removes every socket from the watch set.
    ///
    /// Must not race with a [`wait`][Poller::wait] on another thread.
    pub fn clear(&self) {
        self.poller.clear();
    }

    /// The data attached to a registered socket.
    pub fn data(&self, source: impl AsFd) -> Option<T>
    where
        T: Clone,
    {
        self.poller.with_data(source.as_fd().as_raw_fd(), |data| data.cloned())
    }

    /// Detaches and returns the data of a socket, leaving it registered.
    pub fn take_data(&self, source: impl AsFd) -> Option<T> {
        self.poller.take_data(source.as_fd().as_raw_fd())
    }

    /// The interest a socket is registered with, or `None` if it is not registered.
    pub fn interest(&self, source: impl AsFd) -> Option<Interest> {
        self.poller.interest(source.as_fd().as_raw_fd())
    }

    /// Number of registered sockets.
    pub fn len(&self) -> usize {
        self.poller.len()
    }

    /// Whether no socket is registered.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Waits for at least one socket to become ready.
    ///
    /// `callback` runs once per ready socket, in the order the OS reports them, with the socket,
    /// its readiness and its data. A hang-up or error that carries no readable or writable
    /// readiness is reported as both, so a closed peer is never missed. The callback runs
    /// without any internal lock held and may change the watch set.
    ///
    /// A `None` timeout waits forever; `Some(Duration::ZERO)` checks once and returns. The
    /// timeout covers the whole call, including re-evaluations after the watch set changed.
    ///
    /// # Examples
    ///
    /// ```
    /// use sockpoll::{Poller, WaitStatus};
    /// use std::time::Duration;
    ///
    /// let poller = Poller::<()>::new()?;
    /// let status = poller.wait(Some(Duration::ZERO), |_, _, _| {})?;
    /// assert_eq!(status, WaitStatus::TimedOut);
    /// # std::io::Result::Ok(())
    /// ```
    pub fn wait<F>(&self, timeout: Option<Duration>, mut callback: F) -> Result<WaitStatus>
    where
        T: Clone,
        F: FnMut(RawFd, Interest, Option<&T>),
    {
        let mut ready = Vec::new();
        let status = self.poller.wait(&mut ready, timeout)?;

        if let WaitStatus::Ready(_) = status {
            for event in &ready {
                callback(event.fd, event.readiness, event.data.as_ref());
            }
        }

        Ok(status)
    }

    /// Interrupts the current or next call to [`wait`][Poller::wait].
    ///
    /// The interrupted wait returns [`WaitStatus::Ready`], with zero events if no socket was
    /// ready. Several calls before the wait notices them count as one.
    ///
    /// # Examples
    ///
    /// ```
    /// use sockpoll::{Poller, WaitStatus};
    ///
    /// let poller = Poller::<()>::new()?;
    /// poller.spak()?;
    /// assert_eq!(poller.wait(None, |_, _, _| {})?, WaitStatus::Ready(0));
    /// # std::io::Result::Ok(())
    /// ```
    pub fn spak(&self) -> Result<()> {
        self.poller.spak()
    }

    /// Stops the current or next call to [`wait`][Poller::wait] for good.
    ///
    /// Every wait from then on returns [`WaitStatus::Killed`] without blocking.
    pub fn kill(&self) -> Result<()> {
        self.poller.kill()
    }

    /// Whether [`kill`][Poller::kill] has been called.
    pub fn is_killed(&self) -> bool {
        self.poller.is_killed()
    }
}

impl<T> fmt::Debug for Poller<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Poller")
            .field("backend", &sys::NAME)
            .field("len", &self.len())
            .field("killed", &self.is_killed())
            .finish()
    }
}

/// Converts a deadline into a `poll`-style millisecond timeout, `-1` meaning forever.
pub(crate) fn timeout_ms(deadline: Option<Instant>) -> i32 {
    deadline
        .map(|deadline| round_up_ms(deadline.saturating_duration_since(Instant::now())))
        .unwrap_or(-1)
}

/// Rounds up to a whole millisecond so a wait never ends before its deadline.
fn round_up_ms(timeout: Duration) -> i32 {
    let mut ms = u64::try_from(timeout.as_millis()).unwrap_or(u64::MAX);
    if Duration::from_millis(ms) < timeout {
        ms = ms.saturating_add(1);
    }
    i32::try_from(ms).unwrap_or(i32::MAX)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn timeout_rounds_up() {
        assert_eq!(round_up_ms(Duration::ZERO), 0);
        assert_eq!(round_up_ms(Duration::from_micros(100)), 1);
        assert_eq!(round_up_ms(Duration::from_micros(3_100)), 4);
        assert_eq!(round_up_ms(Duration::from_millis(250)), 250);
    }

    #[test]
    fn timeout_saturates() {
        assert_eq!(round_up_ms(Duration::from_secs(60 * 60 * 24 * 365)), i32::MAX);
        assert_eq!(timeout_ms(None), -1);
        assert_eq!(timeout_ms(Some(Instant::now())), 0);
    }

    #[test]
    fn status_helpers() {
        assert_eq!(WaitStatus::Ready(3).events(), 3);
        assert_eq!(WaitStatus::Killed.events(), 0);
        assert!(WaitStatus::Killed.is_killed());
        assert!(WaitStatus::TimedOut.is_timed_out());
        assert!(!WaitStatus::Ready(0).is_timed_out());
    }

    #[test]
    fn poller_is_send_and_sync() {
        fn assert_send_sync<P: Send + Sync>() {}
        assert_send_sync::<Poller<usize>>();
        assert_send_sync::<Poller<std::sync::Arc<String>>>();
    }
}
