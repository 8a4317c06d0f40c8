#![allow(unsafe_code)]
//! OS layer of the process controller: descriptor helpers, wait-status
//! decoding, and the spawn backends.
//!
//! Two backends implement [`Spawner`]:
//!
//! - [`ForkExec`]: `fork` + `execve` with a CLOEXEC error pipe, doing only
//!   async-signal-safe work in the child.
//! - [`StdSpawn`]: `std::process::Command` with a `pre_exec` hook.
//!
//! Both receive the same [`SpawnRequest`] and produce the same observable
//! child: stdio redirected, environment replaced or inherited, `close_fds`
//! honored, return code decoded by [`decode_wait_status`].

mod fork_exec;
mod std_spawn;

pub(crate) use fork_exec::ForkExec;
pub(crate) use std_spawn::StdSpawn;

use super::error::ProcessError;
use crate::config::SpawnBackend;
use std::ffi::{CString, OsStr, OsString};
use std::io;
use nix::fcntl::{FcntlArg, FdFlag, OFlag, fcntl};
use nix::unistd::{SysconfVar, sysconf};
use std::os::fd::{AsFd, AsRawFd, BorrowedFd, FromRawFd, OwnedFd, RawFd};
use std::os::unix::ffi::OsStrExt;
use std::path::{Path, PathBuf};

/// Search path used when the child environment has no `PATH`.
const DEFAULT_PATH: &str = "/bin:/usr/bin";

/// Everything a backend needs to start a child, prepared in the parent so
/// the child side never allocates.
#[derive(Debug)]
pub(crate) struct SpawnRequest {
    /// Argument vector; `argv[0]` is what the child sees as its name.
    pub argv: Vec<CString>,
    /// Paths to try with exec, in order.
    pub candidates: Vec<CString>,
    /// Executable as given, for error messages.
    pub executable: PathBuf,
    /// Replacement environment; `None` inherits the parent's.
    pub envp: Option<Vec<CString>>,
    pub cwd: Option<CString>,
    pub cwd_path: Option<PathBuf>,
    /// Descriptors to install as 0, 1, 2; `None` leaves the slot inherited.
    pub targets: [Option<RawFd>; 3],
    pub close_fds: bool,
    /// Sorted, deduplicated.
    pub pass_fds: Vec<RawFd>,
    pub restore_signals: bool,
    pub start_new_session: bool,
    pub errpipe_limit: usize,
}

impl SpawnRequest {
    /// Converts OS strings into the C forms exec needs.
    ///
    /// Interior NUL bytes are usage errors. Stdio `targets` start out
    /// inherited and are filled in once the plumbing exists.
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn new(
        argv: &[OsString],
        executable: &Path,
        env: Option<&[(OsString, OsString)]>,
        cwd: Option<&Path>,
        close_fds: bool,
        pass_fds: &[RawFd],
        restore_signals: bool,
        start_new_session: bool,
        errpipe_limit: usize,
    ) -> Result<Self, ProcessError> {
        let argv = argv
            .iter()
            .map(|arg| c_string(arg, "argument"))
            .collect::<Result<Vec<_>, _>>()?;

        let envp = match env {
            Some(vars) => Some(
                vars.iter()
                    .map(|(key, val)| {
                        let mut entry = key.clone();
                        entry.push("=");
                        entry.push(val);
                        c_string(&entry, "environment variable")
                    })
                    .collect::<Result<Vec<_>, _>>()?,
            ),
            None => None,
        };

        let search_path = env
            .and_then(|vars| {
                vars.iter()
                    .find(|(key, _)| key.as_os_str() == "PATH")
                    .map(|(_, val)| val.clone())
            })
            .or_else(|| std::env::var_os("PATH"))
            .unwrap_or_else(|| OsString::from(DEFAULT_PATH));

        let candidates = exec_candidates(executable, &search_path)
            .iter()
            .map(|path| c_string(path.as_os_str(), "executable"))
            .collect::<Result<Vec<_>, _>>()?;

        let cwd_c = cwd
            .map(|dir| c_string(dir.as_os_str(), "working directory"))
            .transpose()?;

        let mut pass_fds = pass_fds.to_vec();
        pass_fds.sort_unstable();
        pass_fds.dedup();

        Ok(Self {
            argv,
            candidates,
            executable: executable.to_path_buf(),
            envp,
            cwd: cwd_c,
            cwd_path: cwd.map(Path::to_path_buf),
            targets: [None; 3],
            close_fds,
            pass_fds,
            restore_signals,
            start_new_session,
            errpipe_limit,
        })
    }
}

fn c_string(value: &OsStr, what: &str) -> Result<CString, ProcessError> {
    CString::new(value.as_bytes())
        .map_err(|_| ProcessError::Usage(format!("{what} contains a NUL byte")))
}

/// Paths exec should try for `executable`.
///
/// A name with a directory component is used as is; a bare name is joined
/// with every entry of `search_path` (an empty entry means the current
/// directory).
pub(crate) fn exec_candidates(executable: &Path, search_path: &OsStr) -> Vec<PathBuf> {
    if executable.as_os_str().as_bytes().contains(&b'/') {
        return vec![executable.to_path_buf()];
    }
    std::env::split_paths(search_path)
        .map(|dir| {
            if dir.as_os_str().is_empty() {
                PathBuf::from(".").join(executable)
            } else {
                dir.join(executable)
            }
        })
        .collect()
}

/// A way of turning a [`SpawnRequest`] into a running child.
pub(crate) trait Spawner {
    /// Starts the child and returns its pid.
    ///
    /// On error no child is left behind: a child that failed before exec
    /// has already been reaped.
    fn spawn(&self, request: &SpawnRequest) -> Result<i32, ProcessError>;
}

/// Returns the backend for `backend`.
pub(crate) fn spawner(backend: SpawnBackend) -> &'static dyn Spawner {
    match backend {
        SpawnBackend::ForkExec => &ForkExec,
        SpawnBackend::Std => &StdSpawn,
    }
}

/// Decodes a raw `waitpid` status into a return code.
///
/// Signaled → `-signal`, exited → exit status, stopped → `-stopsig`.
/// Anything else is an internal error.
pub(crate) fn decode_wait_status(status: libc::c_int) -> Result<i32, ProcessError> {
    if libc::WIFSIGNALED(status) {
        Ok(-libc::WTERMSIG(status))
    } else if libc::WIFEXITED(status) {
        Ok(libc::WEXITSTATUS(status))
    } else if libc::WIFSTOPPED(status) {
        Ok(-libc::WSTOPSIG(status))
    } else {
        Err(ProcessError::Internal(format!(
            "unknown child exit status {status:#x}"
        )))
    }
}

/// One `waitpid` call, retried on `EINTR`.
///
/// Returns `Ok(None)` when `nohang` is set and the child is still running.
/// The raw status is kept: `nix::sys::wait::waitpid` reaps the child and
/// then fails on signals its `Signal` enum lacks (realtime signals), which
/// would lose the return code.
pub(crate) fn waitpid(pid: i32, nohang: bool) -> io::Result<Option<libc::c_int>> {
    let flags = if nohang { libc::WNOHANG } else { 0 };
    loop {
        let mut status: libc::c_int = 0;
        // SAFETY: `status` is a valid out-pointer for the duration of the call.
        let ret = unsafe { libc::waitpid(pid, &mut status, flags) };
        if ret == pid {
            return Ok(Some(status));
        }
        if ret == 0 {
            return Ok(None);
        }
        let err = io::Error::last_os_error();
        if err.raw_os_error() == Some(libc::EINTR) {
            continue;
        }
        return Err(err);
    }
}

/// Creates a pipe whose ends are both close-on-exec: `(read, write)`.
#[cfg(any(
    target_os = "linux",
    target_os = "android",
    target_os = "freebsd",
    target_os = "netbsd",
    target_os = "openbsd",
    target_os = "dragonfly"
))]
pub(crate) fn cloexec_pipe() -> io::Result<(OwnedFd, OwnedFd)> {
    Ok(nix::unistd::pipe2(OFlag::O_CLOEXEC)?)
}

/// Creates a pipe whose ends are both close-on-exec: `(read, write)`.
#[cfg(not(any(
    target_os = "linux",
    target_os = "android",
    target_os = "freebsd",
    target_os = "netbsd",
    target_os = "openbsd",
    target_os = "dragonfly"
)))]
pub(crate) fn cloexec_pipe() -> io::Result<(OwnedFd, OwnedFd)> {
    let (read, write) = nix::unistd::pipe()?;
    set_cloexec(read.as_raw_fd(), true)?;
    set_cloexec(write.as_raw_fd(), true)?;
    Ok((read, write))
}

/// Sets or clears `FD_CLOEXEC` on `fd`.
pub(crate) fn set_cloexec(fd: RawFd, cloexec: bool) -> io::Result<()> {
    let flags = FdFlag::from_bits_retain(fcntl(fd, FcntlArg::F_GETFD)?);
    let wanted = if cloexec {
        flags | FdFlag::FD_CLOEXEC
    } else {
        flags.difference(FdFlag::FD_CLOEXEC)
    };
    if wanted != flags {
        fcntl(fd, FcntlArg::F_SETFD(wanted))?;
    }
    Ok(())
}

/// Duplicates `fd` to a close-on-exec descriptor numbered 3 or higher.
///
/// Child setup dup2s onto 0, 1 and 2; sources in that range could be
/// clobbered before they are used.
pub(crate) fn dup_above_stdio(fd: BorrowedFd<'_>) -> io::Result<OwnedFd> {
    let dup = fcntl(fd.as_raw_fd(), FcntlArg::F_DUPFD_CLOEXEC(3))?;
    // SAFETY: `dup` was just returned by fcntl and nothing else owns it.
    Ok(unsafe { OwnedFd::from_raw_fd(dup) })
}

/// Moves an owned descriptor above the stdio range if it landed in it.
pub(crate) fn raise_above_stdio(fd: OwnedFd) -> io::Result<OwnedFd> {
    if fd.as_raw_fd() > 2 {
        return Ok(fd);
    }
    dup_above_stdio(fd.as_fd())
}

/// Opens the null device read-write and close-on-exec.
pub(crate) fn open_devnull() -> io::Result<OwnedFd> {
    let file = std::fs::OpenOptions::new()
        .read(true)
        .write(true)
        .open("/dev/null")?;
    raise_above_stdio(OwnedFd::from(file))
}

/// Highest descriptor number the child might have open.
fn max_fd() -> libc::c_int {
    match sysconf(SysconfVar::OPEN_MAX) {
        Ok(Some(limit)) if limit > 0 => libc::c_int::try_from(limit).unwrap_or(libc::c_int::MAX),
        _ => 256,
    }
}
