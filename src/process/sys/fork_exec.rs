#![allow(unsafe_code)]
//! `fork` + `exec` backend.
//!
//! The child reports a failed setup step or exec through a close-on-exec
//! pipe: a successful exec closes the pipe with nothing written, so the
//! parent's read returns EOF immediately. A failure writes a six byte
//! record (`b'E'`, stage, native-endian errno) and exits with 255.
//!
//! Everything between `fork` and `exec` must be async-signal-safe: the
//! parent may be multi-threaded, and another thread could hold the
//! allocator lock at the moment of the fork. All strings and pointer
//! arrays are therefore built before forking.

use super::{SpawnRequest, Spawner, cloexec_pipe, max_fd, raise_above_stdio, waitpid};
use crate::process::error::ProcessError;
use std::ffi::{CString, c_char};
use std::fs::File;
use std::io::{self, Read};
use std::os::fd::{AsRawFd, OwnedFd, RawFd};
use std::ptr;
use tracing::debug;

/// The child failed before reaching exec (dup2, chdir, setsid, ...).
const STAGE_SETUP: u8 = 0;
/// Every exec candidate failed.
const STAGE_EXEC: u8 = 1;

const REPORT_LEN: usize = 6;

/// Forks and execs directly.
#[derive(Debug, Clone, Copy, Default)]
pub(crate) struct ForkExec;

impl Spawner for ForkExec {
    fn spawn(&self, request: &SpawnRequest) -> Result<i32, ProcessError> {
        let argv = pointer_array(&request.argv);
        let envp = request.envp.as_deref().map(pointer_array);

        let (err_read, err_write) = cloexec_pipe()?;
        let err_write = raise_above_stdio(err_write)?;

        let mut keep = request.pass_fds.clone();
        keep.push(err_write.as_raw_fd());
        keep.sort_unstable();
        keep.dedup();
        let fd_limit = max_fd();

        // SAFETY: the child branch only runs `exec_child`, which restricts
        // itself to async-signal-safe calls on data prepared above.
        let pid = unsafe { libc::fork() };
        if pid < 0 {
            let err = io::Error::last_os_error();
            return Err(spawn_error(&err));
        }
        if pid == 0 {
            let child = ChildSetup {
                request,
                argv: &argv,
                envp: envp.as_deref(),
                errpipe: err_write.as_raw_fd(),
                keep: &keep,
                fd_limit,
            };
            // SAFETY: we are the freshly forked child.
            unsafe { child.exec() }
        }

        drop(err_write);
        let report = match read_report(err_read, request.errpipe_limit) {
            Ok(report) => report,
            Err(err) => {
                let _ = waitpid(pid, false);
                return Err(err.into());
            }
        };
        if report.is_empty() {
            debug!(pid, executable = %request.executable.display(), "child exec'd");
            return Ok(pid);
        }

        // The child exits right after writing the report.
        if let Err(err) = waitpid(pid, false) {
            debug!(pid, error = %err, "reaping failed child");
        }

        let (reached_exec, errno) = decode_report(&report).ok_or_else(|| {
            ProcessError::Internal(format!("malformed exec failure report: {report:?}"))
        })?;
        debug!(pid, errno, reached_exec, "child failed before running");
        Err(ProcessError::from_exec_failure(
            errno,
            reached_exec,
            request.executable.clone(),
            request.cwd_path.clone(),
        ))
    }
}

fn spawn_error(err: &io::Error) -> ProcessError {
    let errno = err.raw_os_error().unwrap_or(0);
    ProcessError::Spawn {
        errno,
        message: crate::error::strerror(errno).to_string(),
        path: None,
    }
}

/// NULL-terminated array of pointers into `strings`.
fn pointer_array(strings: &[CString]) -> Vec<*const c_char> {
    strings
        .iter()
        .map(|s| s.as_ptr())
        .chain(std::iter::once(ptr::null()))
        .collect()
}

fn read_report(pipe: OwnedFd, limit: usize) -> io::Result<Vec<u8>> {
    let mut data = Vec::new();
    File::from(pipe)
        .take(limit as u64)
        .read_to_end(&mut data)?;
    Ok(data)
}

fn decode_report(data: &[u8]) -> Option<(bool, i32)> {
    if data.len() < REPORT_LEN || data[0] != b'E' {
        return None;
    }
    let errno = i32::from_ne_bytes(data[2..REPORT_LEN].try_into().ok()?);
    Some((data[1] == STAGE_EXEC, errno))
}

/// Borrowed view of what the child needs after the fork.
struct ChildSetup<'a> {
    request: &'a SpawnRequest,
    argv: &'a [*const c_char],
    envp: Option<&'a [*const c_char]>,
    errpipe: RawFd,
    /// Sorted; includes `errpipe`.
    keep: &'a [RawFd],
    fd_limit: libc::c_int,
}

impl ChildSetup<'_> {
    /// Runs in the forked child. Never returns.
    unsafe fn exec(&self) -> ! {
        let req = self.request;

        for (slot, target) in req.targets.iter().enumerate() {
            if let Some(fd) = *target {
                // SAFETY: dup2 is async-signal-safe.
                if unsafe { libc::dup2(fd, slot as libc::c_int) } < 0 {
                    unsafe { self.fail(STAGE_SETUP, last_errno()) }
                }
            }
        }
        for (slot, target) in req.targets.iter().enumerate() {
            let Some(fd) = *target else { continue };
            let seen = req.targets[..slot].contains(&Some(fd));
            if fd > 2 && !seen && self.keep.binary_search(&fd).is_err() {
                // SAFETY: the descriptor was just duplicated onto a stdio slot.
                unsafe { libc::close(fd) };
            }
        }

        if let Some(cwd) = &req.cwd {
            // SAFETY: `cwd` is a valid C string.
            if unsafe { libc::chdir(cwd.as_ptr()) } < 0 {
                unsafe { self.fail(STAGE_SETUP, last_errno()) }
            }
        }

        if req.restore_signals {
            // SAFETY: resetting dispositions is async-signal-safe.
            unsafe {
                libc::signal(libc::SIGPIPE, libc::SIG_DFL);
                libc::signal(libc::SIGXFSZ, libc::SIG_DFL);
            }
        }

        // SAFETY: setsid is async-signal-safe.
        if req.start_new_session && unsafe { libc::setsid() } < 0 {
            unsafe { self.fail(STAGE_SETUP, last_errno()) }
        }

        if req.close_fds {
            unsafe { self.close_unkept() };
        }

        for &fd in &req.pass_fds {
            // SAFETY: fcntl on descriptor flags only.
            let flags = unsafe { libc::fcntl(fd, libc::F_GETFD) };
            if flags < 0
                || unsafe { libc::fcntl(fd, libc::F_SETFD, flags & !libc::FD_CLOEXEC) } < 0
            {
                unsafe { self.fail(STAGE_SETUP, last_errno()) }
            }
        }

        let mut saved = 0;
        let mut last = libc::ENOENT;
        for path in &req.candidates {
            // SAFETY: all pointer arrays are NULL-terminated and point into
            // CStrings owned by the request, which outlives this call.
            unsafe {
                match self.envp {
                    Some(envp) => libc::execve(path.as_ptr(), self.argv.as_ptr(), envp.as_ptr()),
                    None => libc::execv(path.as_ptr(), self.argv.as_ptr()),
                };
            }
            last = last_errno();
            if last != libc::ENOENT && last != libc::ENOTDIR && saved == 0 {
                saved = last;
            }
        }
        let errno = if saved != 0 { saved } else { last };
        unsafe { self.fail(STAGE_EXEC, errno) }
    }

    /// Closes every descriptor from 3 up that is not in `keep`.
    unsafe fn close_unkept(&self) {
        let mut low: libc::c_int = 3;
        for &fd in self.keep {
            if fd < low {
                continue;
            }
            if fd > low {
                unsafe { close_range(low, fd - 1, self.fd_limit) };
            }
            low = fd + 1;
        }
        unsafe { close_range(low, libc::c_int::MAX, self.fd_limit) };
    }

    unsafe fn fail(&self, stage: u8, errno: i32) -> ! {
        let mut record = [0u8; REPORT_LEN];
        record[0] = b'E';
        record[1] = stage;
        record[2..].copy_from_slice(&errno.to_ne_bytes());

        let mut written = 0;
        while written < REPORT_LEN {
            // SAFETY: the slice is valid for the remaining length.
            let n = unsafe {
                libc::write(
                    self.errpipe,
                    record[written..].as_ptr().cast(),
                    REPORT_LEN - written,
                )
            };
            if n < 0 && last_errno() == libc::EINTR {
                continue;
            }
            if n <= 0 {
                break;
            }
            written += n as usize;
        }
        // SAFETY: _exit skips atexit handlers and stdio flushing.
        unsafe { libc::_exit(255) }
    }
}

fn last_errno() -> i32 {
    io::Error::last_os_error().raw_os_error().unwrap_or(0)
}

/// Closes `low..=high`, using `close_range(2)` where the kernel has it.
unsafe fn close_range(low: libc::c_int, high: libc::c_int, fd_limit: libc::c_int) {
    if low > high {
        return;
    }
    #[cfg(target_os = "linux")]
    {
        // SAFETY: close_range only closes descriptors.
        let ret = unsafe {
            libc::syscall(
                libc::SYS_close_range,
                low as libc::c_uint,
                high as libc::c_uint,
                0 as libc::c_uint,
            )
        };
        if ret == 0 {
            return;
        }
    }
    for fd in low..=high.min(fd_limit) {
        // SAFETY: closing an unopened descriptor just returns EBADF.
        unsafe { libc::close(fd) };
    }
}
