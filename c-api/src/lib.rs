//! Implementation of the C API for the `sockpoll` crate.

#![allow(clippy::missing_safety_doc, non_camel_case_types)]

use libc::{c_int, c_uint, c_void, size_t};
use sockpoll::{Error, Interest, Poller, WaitStatus};
use std::os::unix::io::RawFd;
use std::time::Duration;

type sockpoll_t = c_void;

/// Private data is stored by address so the poller stays `Send + Sync`.
type CPoller = Poller<usize>;

/// Called once per ready socket with the caller's `user` pointer.
pub type sockpoll_callback_t =
    Option<unsafe extern "C" fn(user: *mut c_void, fd: c_int, events: c_uint, data: *mut c_void)>;

pub const SOCKPOLL_EVENT_RECV: c_uint = 0x1;
pub const SOCKPOLL_EVENT_SEND: c_uint = 0x2;

type sockpoll_status_t = c_int;
pub const SOCKPOLL_STATUS_OK: c_int = 0;
pub const SOCKPOLL_STATUS_INVALID: c_int = 1;
pub const SOCKPOLL_STATUS_UNSUPPORTED: c_int = 2;
pub const SOCKPOLL_STATUS_IO: c_int = 3;
pub const SOCKPOLL_STATUS_OUT_OF_MEMORY: c_int = 4;

type sockpoll_wait_t = c_int;
pub const SOCKPOLL_WAIT_READY: c_int = 0;
pub const SOCKPOLL_WAIT_TIMEOUT: c_int = 1;
pub const SOCKPOLL_WAIT_KILLED: c_int = 2;

/* sockpoll_t API */

#[no_mangle]
pub unsafe extern "C" fn sockpoll_new(
    capacity: size_t,
    out: *mut *mut sockpoll_t,
) -> sockpoll_status_t {
    abort_on_panic(|| {
        if out.is_null() {
            return SOCKPOLL_STATUS_INVALID;
        }

        let poller = match CPoller::with_capacity(capacity) {
            Ok(poller) => poller,
            Err(e) => return convert_error(e),
        };

        let poller = Box::new(poller);
        *out = Box::into_raw(poller) as *mut sockpoll_t;
        SOCKPOLL_STATUS_OK
    })
}

#[no_mangle]
pub unsafe extern "C" fn sockpoll_free(poller: *mut sockpoll_t) {
    abort_on_panic(|| {
        if poller.is_null() {
            return;
        }

        let poller = Box::from_raw(poller as *mut CPoller);
        drop(poller);
    })
}

#[no_mangle]
pub unsafe extern "C" fn sockpoll_supports(poller: *const sockpoll_t, events: c_uint) -> c_int {
    abort_on_panic(|| {
        let poller = match (poller as *const CPoller).as_ref() {
            Some(poller) => poller,
            None => return 0,
        };
        match convert_events(events) {
            Some(interest) => poller.supports(interest) as c_int,
            None => 0,
        }
    })
}

#[no_mangle]
pub unsafe extern "C" fn sockpoll_insert(
    poller: *const sockpoll_t,
    fd: RawFd,
    events: c_uint,
    data: *mut c_void,
) -> sockpoll_status_t {
    abort_on_panic(|| {
        let poller = match (poller as *const CPoller).as_ref() {
            Some(poller) => poller,
            None => return SOCKPOLL_STATUS_INVALID,
        };

        // Convert the events.
        let interest = match convert_events(events) {
            Some(interest) => interest,
            None => return SOCKPOLL_STATUS_UNSUPPORTED,
        };

        match poller.insert(fd, interest, convert_data(data)) {
            Ok(()) => SOCKPOLL_STATUS_OK,
            Err(e) => convert_error(e),
        }
    })
}

#[no_mangle]
pub unsafe extern "C" fn sockpoll_modify(
    poller: *const sockpoll_t,
    fd: RawFd,
    events: c_uint,
    data: *mut c_void,
) -> sockpoll_status_t {
    abort_on_panic(|| {
        let poller = match (poller as *const CPoller).as_ref() {
            Some(poller) => poller,
            None => return SOCKPOLL_STATUS_INVALID,
        };

        // Convert the events.
        let interest = match convert_events(events) {
            Some(interest) => interest,
            None => return SOCKPOLL_STATUS_UNSUPPORTED,
        };
        if fd < 0 {
            return SOCKPOLL_STATUS_INVALID;
        }

        // SAFETY: the descriptor is only used for the duration of the call.
        let source = std::os::unix::io::BorrowedFd::borrow_raw(fd);
        match poller.modify(source, interest, convert_data(data)) {
            Ok(()) => SOCKPOLL_STATUS_OK,
            Err(e) => convert_error(e),
        }
    })
}

#[no_mangle]
pub unsafe extern "C" fn sockpoll_remove(poller: *const sockpoll_t, fd: RawFd) {
    abort_on_panic(|| {
        let poller = match (poller as *const CPoller).as_ref() {
            Some(poller) => poller,
            None => return,
        };
        if fd < 0 {
            return;
        }

        // SAFETY: the descriptor is only used for the duration of the call.
        poller.remove(std::os::unix::io::BorrowedFd::borrow_raw(fd));
    })
}

#[no_mangle]
pub unsafe extern "C" fn sockpoll_clear(poller: *const sockpoll_t) {
    abort_on_panic(|| {
        let poller = match (poller as *const CPoller).as_ref() {
            Some(poller) => poller,
            None => return,
        };
        poller.clear();
    })
}

#[no_mangle]
pub unsafe extern "C" fn sockpoll_wait(
    poller: *const sockpoll_t,
    func: sockpoll_callback_t,
    user: *mut c_void,
    timeout_ms: c_int,
    out_result: *mut sockpoll_wait_t,
    out_count: *mut size_t,
) -> sockpoll_status_t {
    abort_on_panic(|| {
        let poller = match (poller as *const CPoller).as_ref() {
            Some(poller) => poller,
            None => return SOCKPOLL_STATUS_INVALID,
        };
        let func = match func {
            Some(func) => func,
            None => return SOCKPOLL_STATUS_INVALID,
        };

        // Convert the timeout.
        let timeout = u64::try_from(timeout_ms).ok().map(Duration::from_millis);

        // Wait for events.
        let status = poller.wait(timeout, |fd, readiness, data| {
            let data = data.copied().unwrap_or(0) as *mut c_void;
            func(user, fd, readiness.bits().into(), data);
        });

        let (result, count) = match status {
            Ok(WaitStatus::Ready(count)) => (SOCKPOLL_WAIT_READY, count),
            Ok(WaitStatus::TimedOut) => (SOCKPOLL_WAIT_TIMEOUT, 0),
            Ok(WaitStatus::Killed) => (SOCKPOLL_WAIT_KILLED, 0),
            Err(e) => return convert_error(e),
        };

        if !out_result.is_null() {
            *out_result = result;
        }
        if !out_count.is_null() {
            *out_count = count;
        }
        SOCKPOLL_STATUS_OK
    })
}

#[no_mangle]
pub unsafe extern "C" fn sockpoll_spak(poller: *const sockpoll_t) -> sockpoll_status_t {
    abort_on_panic(|| {
        let poller = match (poller as *const CPoller).as_ref() {
            Some(poller) => poller,
            None => return SOCKPOLL_STATUS_INVALID,
        };

        match poller.spak() {
            Ok(()) => SOCKPOLL_STATUS_OK,
            Err(e) => convert_error(e),
        }
    })
}

#[no_mangle]
pub unsafe extern "C" fn sockpoll_kill(poller: *const sockpoll_t) -> sockpoll_status_t {
    abort_on_panic(|| {
        let poller = match (poller as *const CPoller).as_ref() {
            Some(poller) => poller,
            None => return SOCKPOLL_STATUS_INVALID,
        };

        match poller.kill() {
            Ok(()) => SOCKPOLL_STATUS_OK,
            Err(e) => convert_error(e),
        }
    })
}

/* Helpers */

fn abort_on_panic<R>(f: impl FnOnce() -> R) -> R {
    struct Bomb;

    impl Drop for Bomb {
        fn drop(&mut self) {
            std::process::abort();
        }
    }

    let bomb = Bomb;
    let result = f();
    std::mem::forget(bomb);
    result
}

/// Event bits outside of `RECV | SEND` are not understood.
fn convert_events(events: c_uint) -> Option<Interest> {
    u8::try_from(events).ok().and_then(Interest::from_bits)
}

fn convert_data(data: *mut c_void) -> Option<usize> {
    if data.is_null() {
        None
    } else {
        Some(data as usize)
    }
}

fn convert_error(e: Error) -> sockpoll_status_t {
    match e {
        Error::InvalidUse(_) => SOCKPOLL_STATUS_INVALID,
        Error::ResourceExhausted(_) => SOCKPOLL_STATUS_OUT_OF_MEMORY,
        Error::Backend(_) | Error::Io(_) => SOCKPOLL_STATUS_IO,
    }
}
