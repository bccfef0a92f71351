//! Bindings to poll (every Unix without a better backend).

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Condvar, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use rustix::event::{poll, PollFd, PollFlags};
use rustix::fd::{AsFd, AsRawFd, BorrowedFd, RawFd};
use rustix::io::Errno;

use crate::private::PrivateIndex;
use crate::table::{DescriptorTable, Entry};
use crate::wake::WakeChannel;
use crate::{timeout_ms, Error, Interest, Ready, Result, WaitStatus};

pub(crate) const NAME: &str = "poll";

/// Interface to poll.
#[derive(Debug)]
pub struct Poller<T> {
    /// The watch set and the data attached to it.
    state: Mutex<State<T>>,

    /// The wake channel. Its read end is also the first entry of `state.table`.
    ///
    /// Declared after `state` so the borrowed entry is dropped before the socket closes.
    wake: WakeChannel,

    /// The number of operations (`insert`, `modify`, `remove`, ...) that are currently waiting
    /// on the mutex to become free. When this is nonzero, `wait` must be suspended until it
    /// reaches zero again.
    waiting_operations: AtomicUsize,

    /// Set once `poll` itself failed; the poller is unusable afterwards.
    failed: AtomicBool,

    /// The condition variable that gets notified when `waiting_operations` reaches zero or the
    /// wake channel was signalled.
    ///
    /// This is used with the `state` mutex.
    operations_complete: Condvar,
}

/// The descriptors to poll in a `Poller`.
#[derive(Debug)]
struct State<T> {
    /// The list of `pollfd`s handed to poll.
    ///
    /// The first entry is always present and watches the wake channel.
    table: DescriptorTable<PollFd<'static>>,

    /// Registered interest, indexed by descriptor. `pollfd` does not expose it back.
    interests: PrivateIndex<Interest>,

    /// Caller data, indexed by descriptor. Never holds data for the wake channel.
    data: PrivateIndex<T>,
}

impl Entry for PollFd<'static> {
    fn fd(&self) -> RawFd {
        self.as_fd().as_raw_fd()
    }
}

impl<T> Poller<T> {
    /// Creates a new poller.
    pub fn new(capacity: usize) -> Result<Poller<T>> {
        let wake = WakeChannel::new()?;

        let mut table = DescriptorTable::with_capacity(capacity.saturating_add(1))?;
        table.insert(PollFd::from_borrowed_fd(
            // SAFETY: the wake channel outlives the table, see the field order of `Poller`.
            unsafe { wake.read_borrowed() },
            PollFlags::IN,
        ))?;

        tracing::trace!(wake = ?wake.read_fd(), capacity, "new");

        Ok(Poller {
            state: Mutex::new(State {
                table,
                interests: PrivateIndex::new(),
                data: PrivateIndex::new(),
            }),
            wake,
            waiting_operations: AtomicUsize::new(0),
            failed: AtomicBool::new(false),
            operations_complete: Condvar::new(),
        })
    }

    /// Whether this poller supports level-triggered events.
    pub fn supports_level(&self) -> bool {
        true
    }

    /// Whether the poller supports edge-triggered events.
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
            wake = ?self.wake.read_fd(),
            ?fd,
            ?interest,
        );
        let _enter = span.enter();

        self.with_state(|state| {
            if state.table.contains(fd) {
                return Err(Error::InvalidUse("descriptor is already registered"));
            }

            state.table.insert(PollFd::from_borrowed_fd(
                // SAFETY: the caller of `insert` keeps `fd` open until it is removed.
                unsafe { BorrowedFd::borrow_raw(fd) },
                poll_events(interest),
            ))?;

            let res = state
                .interests
                .set(fd, Some(interest))
                .and_then(|()| state.data.set(fd, data));
            if res.is_err() {
                state.table.remove(fd);
                state.interests.clear(fd);
            }
            res
        })
    }

    /// Modifies an existing file descriptor.
    pub fn modify(&self, fd: RawFd, interest: Interest, data: Option<T>) -> Result<()> {
        if self.wake.owns(fd) {
            return Ok(());
        }

        let span = tracing::trace_span!(
            "modify",
            wake = ?self.wake.read_fd(),
            ?fd,
            ?interest,
        );
        let _enter = span.enter();

        self.with_state(|state| {
            let entry = match state.table.find_mut(fd) {
                Some(entry) => entry,
                None => return Ok(()),
            };

            // SAFETY: `fd` is registered, so the caller of `insert` keeps it open.
            *entry = PollFd::from_borrowed_fd(
                unsafe { BorrowedFd::borrow_raw(fd) },
                poll_events(interest),
            );
            state.interests.set(fd, Some(interest))?;

            match data {
                Some(data) => state.data.set(fd, Some(data)),
                None => Ok(()),
            }
        })
    }

    /// Deletes a file descriptor.
    pub fn remove(&self, fd: RawFd) {
        if self.wake.owns(fd) {
            return;
        }

        let span = tracing::trace_span!(
            "remove",
            wake = ?self.wake.read_fd(),
            ?fd,
        );
        let _enter = span.enter();

        self.with_state(|state| {
            if state.table.remove(fd).is_some() {
                state.interests.clear(fd);
                state.data.clear(fd);
            }
        });
    }

    /// Deletes every file descriptor but the wake channel.
    pub fn clear(&self) {
        let span = tracing::trace_span!("clear", wake = ?self.wake.read_fd());
        let _enter = span.enter();

        self.with_state(|state| {
            let State {
                table,
                interests,
                data,
            } = state;
            for entry in table.truncate(1) {
                interests.clear(entry.fd());
                data.clear(entry.fd());
            }
        });
    }

    pub fn with_data<R>(&self, fd: RawFd, f: impl FnOnce(Option<&T>) -> R) -> R {
        self.with_state(|state| f(state.data.get(fd)))
    }

    pub fn take_data(&self, fd: RawFd) -> Option<T> {
        self.with_state(|state| state.data.take(fd))
    }

    pub fn interest(&self, fd: RawFd) -> Option<Interest> {
        self.with_state(|state| state.interests.get(fd).copied())
    }

    pub fn len(&self) -> usize {
        self.with_state(|state| state.table.len() - 1)
    }

    /// Waits for I/O events with an optional timeout.
    pub fn wait(&self, ready: &mut Vec<Ready<T>>, timeout: Option<Duration>) -> Result<WaitStatus>
    where
        T: Clone,
    {
        let span = tracing::trace_span!(
            "wait",
            wake = ?self.wake.read_fd(),
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

        let mut state = self.lock_state();

        loop {
            // Complete all current operations.
            loop {
                if self.wake.is_killed() {
                    return Ok(WaitStatus::Killed);
                } else if self.wake.take_notified() {
                    // `spak` will have sent a byte in case we were polling. We weren't, so
                    // remove it.
                    self.wake.pop();
                    return Ok(WaitStatus::Ready(0));
                } else if self.waiting_operations.load(Ordering::SeqCst) == 0 {
                    break;
                }

                state = self
                    .operations_complete
                    .wait(state)
                    .unwrap_or_else(PoisonError::into_inner);
            }

            // Perform the poll.
            let num_events = match poll(state.table.as_mut_slice(), timeout_ms(deadline)) {
                Ok(num_events) => num_events,
                Err(err) if err == Errno::INTR => continue,
                Err(err) => {
                    self.failed.store(true, Ordering::SeqCst);
                    tracing::error!(?err, "poll failed");
                    return Err(Error::Backend(err.into()));
                }
            };

            if num_events == 0 {
                return Ok(WaitStatus::TimedOut);
            }

            let woken = !state.table[0].revents().is_empty();
            let num_fd_events = if woken { num_events - 1 } else { num_events };
            tracing::trace!(?num_events, ?woken, ?num_fd_events, "new events");

            // Read all wake-ups.
            if woken {
                let killed = self.wake.drain().map_err(|err| {
                    self.failed.store(true, Ordering::SeqCst);
                    Error::Backend(err)
                })?;
                if killed {
                    return Ok(WaitStatus::Killed);
                }
            }
            if self.wake.is_killed() {
                return Ok(WaitStatus::Killed);
            }
            let notified = self.wake.take_notified();

            // Store the events if there were any.
            if num_fd_events > 0 {
                let state = &*state;

                ready.reserve(num_fd_events);
                for entry in state.table.iter().skip(1) {
                    let revents = entry.revents();
                    if revents.is_empty() {
                        continue;
                    }

                    let fd = entry.fd();
                    ready.push(Ready {
                        fd,
                        readiness: readiness(revents),
                        data: state.data.get(fd).cloned(),
                    });

                    if ready.len() == num_fd_events {
                        break;
                    }
                }

                return Ok(WaitStatus::Ready(ready.len()));
            }

            if notified {
                return Ok(WaitStatus::Ready(0));
            }

            // Only woken so another thread could touch the table; keep waiting on what is left
            // of the timeout.
            if let Some(deadline) = deadline {
                if Instant::now() >= deadline {
                    return Ok(WaitStatus::TimedOut);
                }
            }
        }
    }

    /// Sends a notification to wake up the current or next `wait()` call.
    pub fn spak(&self) -> Result<()> {
        let span = tracing::trace_span!("spak", wake = ?self.wake.read_fd());
        let _enter = span.enter();

        self.wake.spak()?;
        self.operations_complete.notify_one();
        Ok(())
    }

    /// Makes the current and every later `wait()` call return `Killed`.
    pub fn kill(&self) -> Result<()> {
        let span = tracing::trace_span!("kill", wake = ?self.wake.read_fd());
        let _enter = span.enter();

        self.wake.kill()?;
        self.operations_complete.notify_one();
        Ok(())
    }

    pub fn is_killed(&self) -> bool {
        self.wake.is_killed()
    }

    /// Perform an operation on `state`, interrupting the current caller of `wait` if it's
    /// running.
    fn with_state<R>(&self, f: impl FnOnce(&mut State<T>) -> R) -> R {
        self.waiting_operations.fetch_add(1, Ordering::SeqCst);

        // Wake up the current caller of `wait` if there is one.
        let sent_notification = matches!(self.wake.poke(), Ok(true));

        let mut state = self.lock_state();

        // If there was no caller of `wait` our notification was not removed from the channel.
        if sent_notification {
            self.wake.pop();
        }

        let res = f(&mut state);

        if self.waiting_operations.fetch_sub(1, Ordering::SeqCst) == 1 {
            self.operations_complete.notify_one();
        }

        res
    }

    fn lock_state(&self) -> MutexGuard<'_, State<T>> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Get the input poll events for the given interest.
fn poll_events(interest: Interest) -> PollFlags {
    let mut flags = PollFlags::empty();
    if interest.contains(Interest::READABLE) {
        flags |= PollFlags::IN | PollFlags::PRI;
    }
    if interest.contains(Interest::WRITABLE) {
        flags |= PollFlags::OUT | PollFlags::WRBAND;
    }
    flags
}

/// The interest expressed by a set of poll events.
fn interest(events: PollFlags) -> Interest {
    let mut interest = Interest::NONE;
    if events.intersects(PollFlags::IN | PollFlags::PRI) {
        interest |= Interest::READABLE;
    }
    if events.intersects(PollFlags::OUT | PollFlags::WRBAND) {
        interest |= Interest::WRITABLE;
    }
    interest
}

/// Translate returned poll events.
///
/// A hang-up or error without readable or writable readiness counts as both.
fn readiness(revents: PollFlags) -> Interest {
    let readiness = interest(revents);
    if readiness.is_empty() && revents.intersects(PollFlags::HUP | PollFlags::ERR | PollFlags::NVAL)
    {
        Interest::all()
    } else {
        readiness
    }
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
    fn interest_round_trips_through_poll_events() {
        for bits in 0..=3 {
            let want = Interest::from_bits_truncate(bits);
            assert_eq!(interest(poll_events(want)), want);
        }
    }

    #[test]
    fn hangup_without_readiness_is_both() {
        assert_eq!(readiness(PollFlags::HUP), Interest::all());
        assert_eq!(readiness(PollFlags::ERR), Interest::all());
        assert_eq!(readiness(PollFlags::HUP | PollFlags::IN), Interest::READABLE);
        assert_eq!(readiness(PollFlags::OUT), Interest::WRITABLE);
        assert_eq!(readiness(PollFlags::empty()), Interest::NONE);
    }
}
