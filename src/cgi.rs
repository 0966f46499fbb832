use std::ffi::{CStr, CString};
use std::os::unix::io::RawFd;
use std::time::{Duration, Instant};

use nix::fcntl::{fcntl, FcntlArg, OFlag};
use nix::sys::signal::{kill, Signal};
use nix::sys::wait::{waitpid, WaitPidFlag, WaitStatus};
use nix::unistd::{close, dup2, execve, fork, ForkResult, Pid};

/// A CGI script producing more than this is killed and answered with a 500.
pub const CGI_MAX_OUTPUT_BYTES: usize = 2 * 1024 * 1024;

/// Bookkeeping for one spawned CGI child, keyed by the pipe read end.
#[derive(Debug)]
pub struct CgiState {
    pub pid: Pid,
    pub pipe_fd: RawFd,
    pub client_fd: RawFd,
    pub output: Vec<u8>,
    pub started: Instant,
}

impl CgiState {
    pub fn new(pid: Pid, pipe_fd: RawFd, client_fd: RawFd) -> Self {
        Self {
            pid,
            pipe_fd,
            client_fd,
            output: Vec::new(),
            started: Instant::now(),
        }
    }

    pub fn timed_out(&self, timeout: Duration) -> bool {
        self.started.elapsed() > timeout
    }
}

/// Fork and exec a CGI executable with its stdout wired to an anonymous
/// pipe. Returns the child pid and the non-blocking read end.
///
/// On any failure no fd survives: both pipe ends are closed, and a child
/// that was already forked is killed and reaped.
pub fn spawn(script_path: &str) -> nix::Result<(Pid, RawFd)> {
    let (read_fd, write_fd) = nix::unistd::pipe()?;
    match unsafe { fork() } {
        Err(e) => {
            close(read_fd).ok();
            close(write_fd).ok();
            Err(e)
        }
        Ok(ForkResult::Child) => {
            // Only async-signal-safe calls between fork and exec.
            close(read_fd).ok();
            if dup2(write_fd, libc::STDOUT_FILENO).is_ok() {
                close(write_fd).ok();
                if let Ok(path) = CString::new(script_path) {
                    let argv = [path.as_c_str()];
                    let env: [&CStr; 0] = [];
                    execve(&path, &argv, &env).ok();
                }
            }
            unsafe { libc::_exit(1) }
        }
        Ok(ForkResult::Parent { child }) => {
            close(write_fd).ok();
            if let Err(e) = fcntl(read_fd, FcntlArg::F_SETFL(OFlag::O_NONBLOCK)) {
                kill_and_reap(child);
                close(read_fd).ok();
                return Err(e);
            }
            Ok((child, read_fd))
        }
    }
}

/// SIGKILL the child and wait for it so it cannot linger as a zombie.
pub fn kill_and_reap(pid: Pid) {
    kill(pid, Signal::SIGKILL).ok();
    waitpid(pid, None).ok();
}

/// Reap a child believed to have exited already (its stdout hit EOF). A child
/// that closed stdout but kept running is killed instead.
pub fn reap(pid: Pid) {
    if let Ok(WaitStatus::StillAlive) = waitpid(pid, Some(WaitPidFlag::WNOHANG)) {
        kill_and_reap(pid);
    }
}
