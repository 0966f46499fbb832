use std::collections::HashMap;
use std::os::unix::io::RawFd;

use anyhow::{Context, Result};
use nix::errno::Errno;
use nix::sys::epoll::{
    epoll_create1, epoll_ctl, epoll_wait, EpollCreateFlags, EpollEvent, EpollFlags, EpollOp,
};

pub const MAX_EVENTS: usize = 64;

/// Direction of readiness interest for a registered handle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Read,
    Write,
}

impl Direction {
    fn flags(self) -> EpollFlags {
        match self {
            // RDHUP so a peer half-close surfaces as end-of-stream instead of
            // a zero-byte read loop.
            Direction::Read => EpollFlags::EPOLLIN | EpollFlags::EPOLLRDHUP,
            Direction::Write => EpollFlags::EPOLLOUT,
        }
    }
}

/// One readiness notification from the kernel.
#[derive(Debug, Clone, Copy)]
pub struct Event {
    pub fd: RawFd,
    pub readable: bool,
    pub writable: bool,
    pub end_of_stream: bool,
}

/// Thin epoll wrapper tracking the interest set per fd so registration is
/// idempotent and partial deregistration works.
///
/// The reactor owns no payload state and never closes a registered fd;
/// callers must unregister before closing.
#[derive(Debug)]
pub struct Reactor {
    epoll_fd: RawFd,
    interests: HashMap<RawFd, EpollFlags>,
}

impl Reactor {
    /// Failure here is fatal; there is no readiness mechanism to fall back to.
    pub fn new() -> Result<Self> {
        let epoll_fd = epoll_create1(EpollCreateFlags::EPOLL_CLOEXEC)
            .context("failed to create epoll instance")?;
        Ok(Self {
            epoll_fd,
            interests: HashMap::new(),
        })
    }

    /// Register interest in one direction. Already-registered pairs are a
    /// no-op.
    pub fn register(&mut self, fd: RawFd, direction: Direction) -> nix::Result<()> {
        let current = self.interests.get(&fd).copied().unwrap_or(EpollFlags::empty());
        let wanted = current | direction.flags();
        if wanted == current {
            return Ok(());
        }
        let op = if current.is_empty() {
            EpollOp::EpollCtlAdd
        } else {
            EpollOp::EpollCtlMod
        };
        let mut event = EpollEvent::new(wanted, fd as u64);
        epoll_ctl(self.epoll_fd, op, fd, &mut event)?;
        self.interests.insert(fd, wanted);
        Ok(())
    }

    /// Remove interest in one direction. Safe to call for pairs that were
    /// never registered.
    pub fn unregister(&mut self, fd: RawFd, direction: Direction) {
        let current = match self.interests.get(&fd).copied() {
            Some(current) => current,
            None => return,
        };
        let wanted = current & !direction.flags();
        if wanted == current {
            return;
        }
        let result = if wanted.is_empty() {
            self.interests.remove(&fd);
            epoll_ctl(self.epoll_fd, EpollOp::EpollCtlDel, fd, None)
        } else {
            self.interests.insert(fd, wanted);
            let mut event = EpollEvent::new(wanted, fd as u64);
            epoll_ctl(self.epoll_fd, EpollOp::EpollCtlMod, fd, &mut event)
        };
        // The fd may already be gone from the kernel's perspective.
        result.ok();
    }

    /// Wait for readiness. Returns an empty batch on timeout or signal
    /// interruption; callers must tolerate that.
    pub fn wait(&mut self, timeout_ms: isize) -> nix::Result<Vec<Event>> {
        let mut events = [EpollEvent::empty(); MAX_EVENTS];
        let count = match epoll_wait(self.epoll_fd, &mut events, timeout_ms) {
            Ok(count) => count,
            Err(Errno::EINTR) => 0,
            Err(e) => return Err(e),
        };
        Ok(events[..count]
            .iter()
            .map(|event| {
                let flags = event.events();
                Event {
                    fd: event.data() as RawFd,
                    readable: flags.intersects(EpollFlags::EPOLLIN),
                    writable: flags.intersects(EpollFlags::EPOLLOUT),
                    end_of_stream: flags.intersects(
                        EpollFlags::EPOLLRDHUP | EpollFlags::EPOLLHUP | EpollFlags::EPOLLERR,
                    ),
                }
            })
            .collect())
    }
}

impl Drop for Reactor {
    fn drop(&mut self) {
        nix::unistd::close(self.epoll_fd).ok();
    }
}
