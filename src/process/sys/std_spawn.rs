#![allow(unsafe_code)]
//! `std::process::Command` backend.
//!
//! std performs its own exec-error reporting through a private CLOEXEC
//! pipe, so `close_fds` here marks inherited descriptors close-on-exec
//! instead of closing them.

use super::{SpawnRequest, Spawner, max_fd, set_cloexec};
use crate::process::error::ProcessError;
use std::ffi::OsStr;
use std::io;
use std::os::fd::{BorrowedFd, RawFd};
use std::os::unix::ffi::OsStrExt;
use std::os::unix::process::CommandExt;
use std::path::PathBuf;
use std::process as std_process;
use tracing::debug;

/// Spawns through the standard library.
#[derive(Debug, Clone, Copy, Default)]
pub(crate) struct StdSpawn;

impl Spawner for StdSpawn {
    fn spawn(&self, request: &SpawnRequest) -> Result<i32, ProcessError> {
        let program = request
            .candidates
            .iter()
            .map(|c| PathBuf::from(OsStr::from_bytes(c.as_bytes())))
            .find(|path| path.is_file())
            .unwrap_or_else(|| request.executable.clone());

        let mut cmd = std_process::Command::new(&program);
        if let Some((argv0, rest)) = request.argv.split_first() {
            cmd.arg0(OsStr::from_bytes(argv0.as_bytes()));
            cmd.args(rest.iter().map(|a| OsStr::from_bytes(a.as_bytes())));
        }

        if let Some(envp) = &request.envp {
            cmd.env_clear();
            for entry in envp {
                let bytes = entry.as_bytes();
                if let Some(eq) = bytes.iter().position(|&b| b == b'=') {
                    cmd.env(
                        OsStr::from_bytes(&bytes[..eq]),
                        OsStr::from_bytes(&bytes[eq + 1..]),
                    );
                }
            }
        }

        if let Some(dir) = &request.cwd_path {
            cmd.current_dir(dir);
        }

        cmd.stdin(stdio_for(request.targets[0])?);
        cmd.stdout(stdio_for(request.targets[1])?);
        cmd.stderr(stdio_for(request.targets[2])?);

        let close_fds = request.close_fds;
        let restore_signals = request.restore_signals;
        let start_new_session = request.start_new_session;
        let pass_fds = request.pass_fds.clone();
        let fd_limit = max_fd();

        // SAFETY: the hook only makes async-signal-safe libc calls.
        unsafe {
            cmd.pre_exec(move || {
                if restore_signals {
                    libc::signal(libc::SIGPIPE, libc::SIG_DFL);
                    libc::signal(libc::SIGXFSZ, libc::SIG_DFL);
                }
                if start_new_session && libc::setsid() < 0 {
                    return Err(io::Error::last_os_error());
                }
                if close_fds {
                    mark_cloexec_from(3, fd_limit, &pass_fds);
                }
                for &fd in &pass_fds {
                    set_cloexec(fd, false)?;
                }
                Ok(())
            });
        }

        let child = cmd.spawn().map_err(|err| {
            let errno = err.raw_os_error().unwrap_or(0);
            let cwd_missing = request.cwd_path.as_ref().is_some_and(|dir| !dir.is_dir());
            ProcessError::from_exec_failure(
                errno,
                !cwd_missing,
                request.executable.clone(),
                request.cwd_path.clone(),
            )
        })?;

        let pid = child.id() as i32;
        debug!(pid, program = %program.display(), "child spawned via std");
        // Dropping the std handle neither kills nor reaps; the caller owns
        // the pid from here.
        drop(child);
        Ok(pid)
    }
}

fn stdio_for(target: Option<RawFd>) -> io::Result<std_process::Stdio> {
    match target {
        None => Ok(std_process::Stdio::inherit()),
        Some(fd) => {
            // SAFETY: `fd` is held open by the caller's plumbing for the
            // duration of the spawn.
            let borrowed = unsafe { BorrowedFd::borrow_raw(fd) };
            Ok(std_process::Stdio::from(borrowed.try_clone_to_owned()?))
        }
    }
}

/// Sets close-on-exec on every descriptor from `low` up, except `keep`.
fn mark_cloexec_from(low: RawFd, fd_limit: RawFd, keep: &[RawFd]) {
    #[cfg(target_os = "linux")]
    {
        const CLOSE_RANGE_CLOEXEC: libc::c_uint = 1 << 2;
        let mut start = low;
        let mut ok = true;
        for &fd in keep.iter().filter(|&&fd| fd >= low) {
            if fd > start {
                ok &= range_cloexec(start, fd - 1, CLOSE_RANGE_CLOEXEC);
            }
            start = fd + 1;
        }
        ok &= range_cloexec(start, libc::c_int::MAX, CLOSE_RANGE_CLOEXEC);
        if ok {
            return;
        }
    }
    for fd in low..fd_limit {
        if keep.binary_search(&fd).is_err() {
            let _ = set_cloexec(fd, true);
        }
    }
}

#[cfg(target_os = "linux")]
fn range_cloexec(low: RawFd, high: RawFd, flags: libc::c_uint) -> bool {
    // SAFETY: close_range with CLOSE_RANGE_CLOEXEC only changes flags.
    let ret = unsafe {
        libc::syscall(
            libc::SYS_close_range,
            low as libc::c_uint,
            high as libc::c_uint,
            flags,
        )
    };
    ret == 0
}
