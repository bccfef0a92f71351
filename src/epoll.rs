//! Bindings to epoll (Linux, Android).

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use rustix::event::epoll::{self, CreateFlags, EventData, EventFlags, EventVec};
use rustix::fd::{AsRawFd, BorrowedFd, OwnedFd, RawFd};
use rustix::io::Errno;

use crate::private::PrivateIndex;
use crate::table::{DescriptorTable, Entry};
use crate::wake::WakeChannel;
use crate::{timeout_ms, Error, Interest, Ready, Result, WaitStatus};

pub(crate) const NAME: &str = "epoll";

/// Key associated with the wake channel.
const WAKE_KEY: u64 = u64::MAX;

/// Upper bound on events collected by a single `epoll_wait`.
const MAX_EVENTS: usize = 1024;

/// Interface to epoll.
pub struct Poller<T> {
    /// File descriptor for the epoll instance.
    epoll_fd: OwnedFd,

    /// The registered descriptors and the data attached to them.
    ///
    /// The kernel keeps its own copy of the interest set, so `wait` only takes this lock to
    /// resolve events, never while blocked.
    state: Mutex<State<T>>,

    /// Wakes up `wait`. Registered under `WAKE_KEY`, never stored in `state`.
    wake: WakeChannel,

    /// Size of the event buffer handed to `epoll_wait`.
    batch: usize,

    /// Set once `epoll_wait` itself failed; the poller is unusable afterwards.
    failed: AtomicBool,
}

struct State<T> {
    table: DescriptorTable<Watch>,
    data: PrivateIndex<T>,
}

/// A registered descriptor.
#[derive(Debug, Clone, Copy)]
struct Watch {
    fd: RawFd,
    interest: Interest,
}

impl Entry for Watch {
    fn fd(&self) -> RawFd {
        self.fd
    }
}

impl<T> Poller<T> {
    /// Creates a new poller.
    pub fn new(capacity: usize) -> Result<Poller<T>> {
        let table = DescriptorTable::with_capacity(capacity)?;

        // Create an epoll instance.
        let epoll_fd = epoll::create(CreateFlags::CLOEXEC)
            .map_err(|e| Error::from_create(e.into(), "epoll instance"))?;

        // Register the wake channel.
        let wake = WakeChannel::new()?;
        epoll::add(
            &epoll_fd,
            wake.as_fd(),
            EventData::new_u64(WAKE_KEY),
            EventFlags::IN,
        )?;

        tracing::trace!(
            epoll_fd = ?epoll_fd.as_raw_fd(),
            wake = ?wake.read_fd(),
            capacity,
            "new",
        );

        Ok(Poller {
            epoll_fd,
            state: Mutex::new(State {
                table,
                data: PrivateIndex::new(),
            }),
            wake,
            batch: capacity.clamp(1, MAX_EVENTS),
            failed: AtomicBool::new(false),
        })
    }

    /// Whether this poller supports level-triggered events.
    pub fn supports_level(&self) -> bool {
        true
    }

    /// Whether this poller supports edge-triggered events.
    ///
    /// epoll could, but the watch set is level-triggered by contract.
    pub fn supports_edge(&self) -> bool {
        false
    }

    /// Adds a new file descriptor.
    pub fn insert(&self, fd: RawFd, interest: Interest, data: Option<T>) -> Result<()> {
        if self.wake.owns(fd) {
            return Err(Error::InvalidUse("descriptor belongs to the wake channel"));
        }

        let span = tracing::trace_span!(
            "insert",
            epoll_fd = ?self.epoll_fd.as_raw_fd(),
            ?fd,
            ?interest,
        );
        let _enter = span.enter();

        {
            let mut state = self.lock_state();
            if state.table.contains(fd) {
                return Err(Error::InvalidUse("descriptor is already registered"));
            }

            // SAFETY: the caller of `insert` keeps `fd` open until it is removed.
            let source = unsafe { BorrowedFd::borrow_raw(fd) };
            epoll::add(&self.epoll_fd, source, key(fd), epoll_flags(interest))?;

            let res = state
                .table
                .insert(Watch { fd, interest })
                .and_then(|()| state.data.set(fd, data));
            if let Err(err) = res {
                state.table.remove(fd);
                let _ = epoll::delete(&self.epoll_fd, source);
                return Err(err);
            }
        }

        if !interest.is_empty() {
            let _ = self.wake.poke();
        }
        Ok(())
    }

    /// Modifies an existing file descriptor.
    pub fn modify(&self, fd: RawFd, interest: Interest, data: Option<T>) -> Result<()> {
        if self.wake.owns(fd) {
            return Ok(());
        }

        let span = tracing::trace_span!(
            "modify",
            epoll_fd = ?self.epoll_fd.as_raw_fd(),
            ?fd,
            ?interest,
        );
        let _enter = span.enter();

        {
            let mut state = self.lock_state();
            let watch = match state.table.find_mut(fd) {
                Some(watch) => watch,
                None => return Ok(()),
            };

            // SAFETY: `fd` is registered, so the caller of `insert` keeps it open.
            let source = unsafe { BorrowedFd::borrow_raw(fd) };
            epoll::modify(&self.epoll_fd, source, key(fd), epoll_flags(interest))?;
            watch.interest = interest;

            if let Some(data) = data {
                state.data.set(fd, Some(data))?;
            }
        }

        if !interest.is_empty() {
            let _ = self.wake.poke();
        }
        Ok(())
    }

    /// Deletes a file descriptor.
    pub fn remove(&self, fd: RawFd) {
        if self.wake.owns(fd) {
            return;
        }

        let span = tracing::trace_span!(
            "remove",
            epoll_fd = ?self.epoll_fd.as_raw_fd(),
            ?fd,
        );
        let _enter = span.enter();

        {
            let mut state = self.lock_state();
            if state.table.remove(fd).is_none() {
                return;
            }
            state.data.clear(fd);

            // The descriptor may already be closed, in which case the kernel forgot it anyway.
            // SAFETY: only used for the duration of the call.
            let source = unsafe { BorrowedFd::borrow_raw(fd) };
            if let Err(err) = epoll::delete(&self.epoll_fd, source) {
                tracing::trace!(?fd, ?err, "epoll_ctl(DEL) failed");
            }
        }

        let _ = self.wake.poke();
    }

    /// Deletes every file descriptor but the wake channel.
    pub fn clear(&self) {
        let span = tracing::trace_span!("clear", epoll_fd = ?self.epoll_fd.as_raw_fd());
        let _enter = span.enter();

        {
            let mut state = self.lock_state();
            let State { table, data } = &mut *state;
            for watch in table.truncate(0) {
                data.clear(watch.fd);

                // SAFETY: only used for the duration of the call.
                let source = unsafe { BorrowedFd::borrow_raw(watch.fd) };
                let _ = epoll::delete(&self.epoll_fd, source);
            }
        }

        let _ = self.wake.poke();
    }

    pub fn with_data<R>(&self, fd: RawFd, f: impl FnOnce(Option<&T>) -> R) -> R {
        f(self.lock_state().data.get(fd))
    }

    pub fn take_data(&self, fd: RawFd) -> Option<T> {
        self.lock_state().data.take(fd)
    }

    pub fn interest(&self, fd: RawFd) -> Option<Interest> {
        self.lock_state().table.find(fd).map(|watch| watch.interest)
    }

    pub fn len(&self) -> usize {
        self.lock_state().table.len()
    }

    /// Waits for I/O events with an optional timeout.
    pub fn wait(&self, ready: &mut Vec<Ready<T>>, timeout: Option<Duration>) -> Result<WaitStatus>
    where
        T: Clone,
    {
        let span = tracing::trace_span!(
            "wait",
            epoll_fd = ?self.epoll_fd.as_raw_fd(),
            ?timeout,
        );
        let _enter = span.enter();

        if self.wake.is_killed() {
            return Ok(WaitStatus::Killed);
        }
        if self.failed.load(Ordering::SeqCst) {
            return Err(Error::InvalidUse("poller failed and cannot be waited on"));
        }

        let deadline = timeout.and_then(|t| Instant::now().checked_add(t));
        let mut events = EventVec::with_capacity(self.batch);

        loop {
            if self.wake.is_killed() {
                return Ok(WaitStatus::Killed);
            } else if self.wake.take_notified() {
                // `spak` will have sent a byte in case we were waiting. We weren't, so remove it.
                self.wake.pop();
                return Ok(WaitStatus::Ready(0));
            }

            // Wait for I/O events.
            match epoll::wait(&self.epoll_fd, &mut events, timeout_ms(deadline)) {
                Ok(()) => {}
                Err(err) if err == Errno::INTR => continue,
                Err(err) => {
                    self.failed.store(true, Ordering::SeqCst);
                    tracing::error!(?err, "epoll_wait failed");
                    return Err(Error::Backend(err.into()));
                }
            }

            if events.is_empty() {
                return Ok(WaitStatus::TimedOut);
            }

            let mut woken = false;
            {
                let state = self.lock_state();
                for event in events.iter() {
                    let key = event.data.u64();
                    if key == WAKE_KEY {
                        woken = true;
                        continue;
                    }

                    // Matched by descriptor number only. A descriptor closed and registered
                    // again since `epoll_wait` returned may receive the old readiness once;
                    // with level-triggered reporting that is a spurious wake-up, not a loss.
                    let fd = key as RawFd;
                    if !state.table.contains(fd) {
                        // Removed by another thread after `epoll_wait` returned.
                        tracing::trace!(?fd, "dropping stale event");
                        continue;
                    }

                    ready.push(Ready {
                        fd,
                        readiness: readiness(event.flags),
                        data: state.data.get(fd).cloned(),
                    });
                }
            }
            tracing::trace!(
                num_events = events.len(),
                ?woken,
                num_fd_events = ready.len(),
                "new events"
            );

            // Read all wake-ups.
            if woken {
                let killed = self.wake.drain().map_err(|err| {
                    self.failed.store(true, Ordering::SeqCst);
                    Error::Backend(err)
                })?;
                if killed {
                    ready.clear();
                    return Ok(WaitStatus::Killed);
                }
            }
            if self.wake.is_killed() {
                ready.clear();
                return Ok(WaitStatus::Killed);
            }

            let notified = self.wake.take_notified();
            if !ready.is_empty() || notified {
                return Ok(WaitStatus::Ready(ready.len()));
            }

            // Only woken because the watch set changed; keep waiting on what is left of the
            // timeout.
            if let Some(deadline) = deadline {
                if Instant::now() >= deadline {
                    return Ok(WaitStatus::TimedOut);
                }
            }
        }
    }

    /// Sends a notification to wake up the current or next `wait()` call.
    pub fn spak(&self) -> Result<()> {
        let span = tracing::trace_span!("spak", epoll_fd = ?self.epoll_fd.as_raw_fd());
        let _enter = span.enter();

        self.wake.spak()?;
        Ok(())
    }

    /// Makes the current and every later `wait()` call return `Killed`.
    pub fn kill(&self) -> Result<()> {
        let span = tracing::trace_span!("kill", epoll_fd = ?self.epoll_fd.as_raw_fd());
        let _enter = span.enter();

        self.wake.kill()?;
        Ok(())
    }

    pub fn is_killed(&self) -> bool {
        self.wake.is_killed()
    }

    fn lock_state(&self) -> MutexGuard<'_, State<T>> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl<T> fmt::Debug for Poller<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Poller")
            .field("epoll_fd", &self.epoll_fd)
            .field("wake", &self.wake)
            .finish()
    }
}

fn key(fd: RawFd) -> EventData {
    EventData::new_u64(fd as u64)
}

/// Epoll flags for the given interest. Hang-ups and errors are always reported.
fn epoll_flags(interest: Interest) -> EventFlags {
    let mut flags = EventFlags::empty();
    if interest.contains(Interest::READABLE) {
        flags |= read_flags();
    }
    if interest.contains(Interest::WRITABLE) {
        flags |= write_flags();
    }
    flags
}

/// Epoll flags for all possible readability events.
fn read_flags() -> EventFlags {
    EventFlags::IN | EventFlags::PRI | EventFlags::RDHUP
}

/// Epoll flags for all possible writability events.
fn write_flags() -> EventFlags {
    EventFlags::OUT
}

/// Translate returned epoll flags.
///
/// A hang-up or error without readable or writable readiness counts as both.
fn readiness(flags: EventFlags) -> Interest {
    let mut readiness = Interest::NONE;
    if flags.intersects(read_flags()) {
        readiness |= Interest::READABLE;
    }
    if flags.intersects(write_flags()) {
        readiness |= Interest::WRITABLE;
    }
    if readiness.is_empty() && flags.intersects(EventFlags::HUP | EventFlags::ERR) {
        readiness = Interest::all();
    }
    readiness
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use std::os::unix::net::UnixStream;

    #[test]
    fn failed_poller_refuses_to_wait() {
        let poller = Poller::new(4).unwrap();
        let (read, mut write) = UnixStream::pair().unwrap();
        poller
            .insert(read.as_raw_fd(), Interest::READABLE, Some(1u8))
            .unwrap();
        write.write_all(&[1]).unwrap();

        poller.failed.store(true, Ordering::SeqCst);

        let mut ready = Vec::new();
        for _ in 0..2 {
            assert!(matches!(
                poller.wait(&mut ready, Some(Duration::ZERO)),
                Err(Error::InvalidUse(_))
            ));
            assert!(ready.is_empty());
        }

        // Killing still wins.
        poller.kill().unwrap();
        assert_eq!(poller.wait(&mut ready, None).unwrap(), WaitStatus::Killed);

        poller.remove(read.as_raw_fd());
    }

    #[test]
    fn hangup_without_readiness_is_both() {
        assert_eq!(readiness(EventFlags::HUP), Interest::all());
        assert_eq!(readiness(EventFlags::ERR), Interest::all());
        assert_eq!(readiness(EventFlags::RDHUP), Interest::READABLE);
        assert_eq!(readiness(EventFlags::OUT | EventFlags::HUP), Interest::WRITABLE);
    }

    #[test]
    fn interest_maps_to_flags() {
        assert!(epoll_flags(Interest::NONE).is_empty());
        assert!(epoll_flags(Interest::READABLE).contains(EventFlags::IN));
        assert!(epoll_flags(Interest::WRITABLE).contains(EventFlags::OUT));
        assert!(!epoll_flags(Interest::WRITABLE).contains(EventFlags::IN));
    }
}
