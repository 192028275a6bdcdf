#![allow(unsafe_code)]
//! Thin libc shims.
//!
//! The only module in the crate allowed to use `unsafe`. Every wrapper
//! converts a failing return code into `io::Error::last_os_error()` and
//! exposes a safe signature to the rest of the crate. The child-side
//! post-fork path lives here too, because between `fork` and `exec` only
//! async-signal-safe calls are permitted and nothing may allocate.

use std::ffi::CString;
use std::io;
use std::os::unix::io::RawFd;

/// Sentinel for a descriptor slot that holds no open descriptor.
pub(crate) const INVALID_FD: RawFd = -1;

/// Creates an OS pipe, returning `(read_end, write_end)`.
pub(crate) fn pipe() -> io::Result<(RawFd, RawFd)> {
    let mut fds = [0 as libc::c_int; 2];
    let rc = unsafe { libc::pipe(fds.as_mut_ptr()) };
    if rc < 0 {
        return Err(io::Error::last_os_error());
    }
    Ok((fds[0], fds[1]))
}

/// Puts a descriptor into non-blocking mode via fcntl.
pub(crate) fn set_nonblocking(fd: RawFd) -> io::Result<()> {
    let flags = unsafe { libc::fcntl(fd, libc::F_GETFL) };
    if flags < 0 {
        return Err(io::Error::last_os_error());
    }
    let rc = unsafe { libc::fcntl(fd, libc::F_SETFL, flags | libc::O_NONBLOCK) };
    if rc < 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}

/// Marks a descriptor close-on-exec so later exec'd children do not inherit
/// the parent-kept pipe ends.
pub(crate) fn set_cloexec(fd: RawFd) -> io::Result<()> {
    let flags = unsafe { libc::fcntl(fd, libc::F_GETFD) };
    if flags < 0 {
        return Err(io::Error::last_os_error());
    }
    let rc = unsafe { libc::fcntl(fd, libc::F_SETFD, flags | libc::FD_CLOEXEC) };
    if rc < 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}

/// Closes the descriptor in `slot` and resets the slot to [`INVALID_FD`].
///
/// A slot already holding the sentinel is left alone, so calling this twice
/// never closes a reused descriptor.
pub(crate) fn close_fd(slot: &mut RawFd) {
    if *slot >= 0 {
        unsafe {
            libc::close(*slot);
        }
        *slot = INVALID_FD;
    }
}

/// Returns whether `fd` currently names an open descriptor.
#[cfg(test)]
pub(crate) fn fd_is_open(fd: RawFd) -> bool {
    unsafe { libc::fcntl(fd, libc::F_GETFD) >= 0 }
}

/// Forks the process. Returns 0 in the child, the child's pid in the parent.
pub(crate) fn fork() -> io::Result<libc::pid_t> {
    let pid = unsafe { libc::fork() };
    if pid < 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(pid)
}

/// Sends `signal` to `target` (a pid, or a negated pgid for a whole group).
pub(crate) fn send_signal(target: libc::pid_t, signal: i32) -> io::Result<()> {
    let rc = unsafe { libc::kill(target, signal) };
    if rc < 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}

/// Non-blocking reap of `target` (a pid, or a negated pgid).
///
/// Returns `Ok(Some((pid, status)))` when a child was reaped, `Ok(None)`
/// when nothing is waiting. `ECHILD` (no such children at all) is reported
/// as `Ok(None)` because the caller treats both the same way.
pub(crate) fn try_reap(target: libc::pid_t) -> io::Result<Option<(libc::pid_t, i32)>> {
    let mut status: libc::c_int = 0;
    let rc = unsafe { libc::waitpid(target, &mut status, libc::WNOHANG) };
    match rc {
        0 => Ok(None),
        n if n > 0 => Ok(Some((n, status))),
        _ => {
            let err = io::Error::last_os_error();
            if err.raw_os_error() == Some(libc::ECHILD) {
                Ok(None)
            } else {
                Err(err)
            }
        }
    }
}

/// Reads from a raw descriptor into `buf`.
pub(crate) fn read_fd(fd: RawFd, buf: &mut [u8]) -> io::Result<usize> {
    let n = unsafe { libc::read(fd, buf.as_mut_ptr().cast::<libc::c_void>(), buf.len()) };
    if n < 0 {
        return Err(io::Error::last_os_error());
    }
    #[allow(clippy::cast_sign_loss)]
    Ok(n as usize)
}

/// Writes `buf` to a raw descriptor.
pub(crate) fn write_fd(fd: RawFd, buf: &[u8]) -> io::Result<usize> {
    let n = unsafe { libc::write(fd, buf.as_ptr().cast::<libc::c_void>(), buf.len()) };
    if n < 0 {
        return Err(io::Error::last_os_error());
    }
    #[allow(clippy::cast_sign_loss)]
    Ok(n as usize)
}

/// NUL-terminated string vectors in the layout execvpe expects.
///
/// Built entirely before forking; the child only reads the raw pointers, so
/// no allocation happens on the child side of the fork.
#[derive(Debug)]
pub(crate) struct ExecVectors {
    // `ptrs` borrows from `strings`; both live until exec or drop.
    _strings: Vec<CString>,
    ptrs: Vec<*const libc::c_char>,
}

impl ExecVectors {
    /// Converts a slice of strings into C vectors. Fails on interior NUL.
    pub(crate) fn new(items: &[String]) -> io::Result<Self> {
        let mut strings = Vec::with_capacity(items.len());
        for item in items {
            let cstr = CString::new(item.as_str()).map_err(|_| {
                io::Error::new(
                    io::ErrorKind::InvalidInput,
                    format!("interior NUL byte in {item:?}"),
                )
            })?;
            strings.push(cstr);
        }
        let mut ptrs: Vec<*const libc::c_char> =
            strings.iter().map(|s| s.as_ptr()).collect();
        ptrs.push(std::ptr::null());
        Ok(Self {
            _strings: strings,
            ptrs,
        })
    }

    fn as_ptr(&self) -> *const *const libc::c_char {
        self.ptrs.as_ptr()
    }
}

// The raw pointers only ever target `_strings`, which moves with the struct
// contents boxed inside the Vec allocations.
unsafe impl Send for ExecVectors {}

/// The child side of the fork. Wires the pipe ends onto fds 0/1/2 and execs
/// the target. Never returns; any failure exits with status 1.
pub(crate) fn child_after_fork(
    pipes: &[[RawFd; 2]; 3],
    argv: &ExecVectors,
    envp: Option<&ExecVectors>,
    workdir: Option<&CString>,
    group_leader: bool,
) -> ! {
    // Ask for SIGTERM if the parent dies first, best effort.
    #[cfg(target_os = "linux")]
    unsafe {
        libc::prctl(libc::PR_SET_PDEATHSIG, libc::SIGTERM);
    }
    if group_leader {
        unsafe {
            libc::setpgid(0, 0);
        }
    }
    if let Some(dir) = workdir {
        // Failure tolerated: the target may not care about its cwd.
        unsafe {
            libc::chdir(dir.as_ptr());
        }
    }
    for (n, pair) in pipes.iter().enumerate() {
        let child_end = pair[usize::from(n != 0)];
        #[allow(clippy::cast_possible_truncation, clippy::cast_possible_wrap)]
        let std_fd = n as libc::c_int;
        if unsafe { libc::dup2(child_end, std_fd) } < 0 {
            unsafe { libc::_exit(1) }
        }
        unsafe {
            libc::close(pair[0]);
            libc::close(pair[1]);
        }
    }
    unsafe {
        match envp {
            #[cfg(target_os = "linux")]
            Some(envp) => {
                libc::execvpe(argv.ptrs[0], argv.as_ptr(), envp.as_ptr());
            }
            #[cfg(not(target_os = "linux"))]
            Some(envp) => {
                // No execvpe outside glibc; putenv keeps the caller's
                // pointers, so this path allocates nothing either.
                for ptr in &envp.ptrs {
                    if ptr.is_null() {
                        break;
                    }
                    libc::putenv((*ptr).cast_mut());
                }
                libc::execvp(argv.ptrs[0], argv.as_ptr());
            }
            None => {
                libc::execvp(argv.ptrs[0], argv.as_ptr());
            }
        }
        // Only reached when exec itself failed.
        libc::_exit(1)
    }
}
