//! Three-list readiness wait over `poll(2)`.
//!
//! Descriptor sets are merged into one `pollfd` array, so there is no
//! `FD_SETSIZE` ceiling. The wait is level-triggered and stateless.

#![allow(unsafe_code)]

use super::Ready;
use std::collections::BTreeMap;
use std::io;
use std::os::fd::RawFd;
use std::time::{Duration, Instant};

const WANT_READ: u8 = 1;
const WANT_WRITE: u8 = 2;
const WANT_EXCEPT: u8 = 4;

/// Converts an optional timeout to `poll(2)` milliseconds, rounding up so
/// short waits do not become busy loops.
fn timeout_ms(timeout: Option<Duration>) -> libc::c_int {
    match timeout {
        None => -1,
        Some(d) => {
            let mut ms = d.as_millis();
            if Duration::from_millis(ms as u64) < d {
                ms += 1;
            }
            ms.min(libc::c_int::MAX as u128) as libc::c_int
        }
    }
}

/// Waits until any descriptor in the three lists is ready.
///
/// With all three lists empty this sleeps for `timeout` (if any) and returns
/// nothing; no OS readiness call is made. `EINTR` restarts the wait with
/// whatever remains of the deadline.
pub fn select(
    read: &[RawFd],
    write: &[RawFd],
    except: &[RawFd],
    timeout: Option<Duration>,
) -> io::Result<Ready> {
    if read.is_empty() && write.is_empty() && except.is_empty() {
        if let Some(timeout) = timeout {
            std::thread::sleep(timeout);
        }
        return Ok(Ready::default());
    }

    let mut wanted: BTreeMap<RawFd, u8> = BTreeMap::new();
    for &fd in read {
        *wanted.entry(fd).or_default() |= WANT_READ;
    }
    for &fd in write {
        *wanted.entry(fd).or_default() |= WANT_WRITE;
    }
    for &fd in except {
        *wanted.entry(fd).or_default() |= WANT_EXCEPT;
    }

    let mut fds: Vec<libc::pollfd> = wanted
        .iter()
        .map(|(&fd, &want)| {
            let mut events = 0;
            if want & WANT_READ != 0 {
                events |= libc::POLLIN;
            }
            if want & WANT_WRITE != 0 {
                events |= libc::POLLOUT;
            }
            if want & WANT_EXCEPT != 0 {
                events |= libc::POLLPRI;
            }
            libc::pollfd {
                fd,
                events,
                revents: 0,
            }
        })
        .collect();

    let deadline = timeout.map(|t| Instant::now() + t);
    loop {
        let remaining = deadline.map(|d| d.saturating_duration_since(Instant::now()));
        // SAFETY: `fds` is a valid, exclusively borrowed array of `pollfd`
        // whose length is passed alongside the pointer.
        let ret = unsafe {
            libc::poll(
                fds.as_mut_ptr(),
                fds.len() as libc::nfds_t,
                timeout_ms(remaining),
            )
        };
        if ret >= 0 {
            break;
        }
        let err = io::Error::last_os_error();
        if err.kind() != io::ErrorKind::Interrupted {
            return Err(err);
        }
        if deadline.is_some_and(|d| Instant::now() >= d) {
            return Ok(Ready::default());
        }
    }

    let mut ready = Ready::default();
    for pfd in &fds {
        if pfd.revents == 0 {
            continue;
        }
        let want = wanted.get(&pfd.fd).copied().unwrap_or_default();
        let rev = pfd.revents;
        let invalid = rev & libc::POLLNVAL != 0;
        if want & WANT_READ != 0
            && (invalid || rev & (libc::POLLIN | libc::POLLHUP | libc::POLLERR) != 0)
        {
            ready.readable.push(pfd.fd);
        }
        if want & WANT_WRITE != 0
            && (invalid || rev & (libc::POLLOUT | libc::POLLHUP | libc::POLLERR) != 0)
        {
            ready.writable.push(pfd.fd);
        }
        if want & WANT_EXCEPT != 0 && rev & libc::POLLPRI != 0 {
            ready.exceptional.push(pfd.fd);
        }
    }
    Ok(ready)
}
