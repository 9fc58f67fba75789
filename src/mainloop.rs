//! Readiness multiplexing for the single-threaded main loop.
//!
//! Components add the fds they care about to a [`MainloopContext`] and
//! tighten its deadline. The [`Mainloop`] waits on them and hands back a
//! [`Readiness`] that the components consume in their `process` calls.

use std::collections::HashSet;
use std::io;
use std::os::unix::io::RawFd;
use std::time::{Duration, Instant};

use mio::unix::SourceFd;
use mio::{Events, Interest, Poll, Token};

/// What the next wait should watch, and for how long at most.
#[derive(Debug, Clone)]
pub struct MainloopContext {
    read_fds: Vec<RawFd>,
    write_fds: Vec<RawFd>,
    deadline: Instant,
}

impl MainloopContext {
    /// Context that waits until `deadline` unless something tightens it.
    pub fn new(deadline: Instant) -> Self {
        MainloopContext {
            read_fds: Vec::new(),
            write_fds: Vec::new(),
            deadline,
        }
    }

    pub fn add_read_fd(&mut self, fd: RawFd) {
        if !self.read_fds.contains(&fd) {
            self.read_fds.push(fd);
        }
    }

    pub fn add_write_fd(&mut self, fd: RawFd) {
        if !self.write_fds.contains(&fd) {
            self.write_fds.push(fd);
        }
    }

    /// Move the deadline to `at` if that is earlier. Never later.
    pub fn tighten_deadline(&mut self, at: Instant) {
        if at < self.deadline {
            self.deadline = at;
        }
    }

    pub fn deadline(&self) -> Instant {
        self.deadline
    }

    pub fn read_fds(&self) -> &[RawFd] {
        &self.read_fds
    }

    pub fn write_fds(&self) -> &[RawFd] {
        &self.write_fds
    }
}

/// Fds that became ready during a wait.
#[derive(Debug, Default, Clone)]
pub struct Readiness {
    readable: HashSet<RawFd>,
    writable: HashSet<RawFd>,
}

impl Readiness {
    /// Readiness with nothing ready, e.g. after a pure timeout.
    pub fn none() -> Self {
        Readiness::default()
    }

    /// Readiness claiming every fd in `fds` is readable. Processing a
    /// non-blocking socket that has nothing queued is harmless.
    pub fn all_readable(fds: &[RawFd]) -> Self {
        Readiness {
            readable: fds.iter().copied().collect(),
            writable: HashSet::new(),
        }
    }

    pub fn mark_readable(&mut self, fd: RawFd) {
        self.readable.insert(fd);
    }

    pub fn is_readable(&self, fd: RawFd) -> bool {
        self.readable.contains(&fd)
    }

    pub fn is_writable(&self, fd: RawFd) -> bool {
        self.writable.contains(&fd)
    }

    pub fn is_empty(&self) -> bool {
        self.readable.is_empty() && self.writable.is_empty()
    }
}

/// Waits for readiness on the fds of a [`MainloopContext`].
pub struct Mainloop {
    poll: Poll,
    events: Events,
}

impl Mainloop {
    pub fn new() -> io::Result<Self> {
        Ok(Mainloop {
            poll: Poll::new()?,
            events: Events::with_capacity(64),
        })
    }

    /// Block until an fd is ready or the deadline passes.
    ///
    /// The fds are registered for the duration of this call only, so
    /// sockets may come and go between waits.
    pub fn wait(&mut self, ctx: &MainloopContext) -> io::Result<Readiness> {
        let mut interests: Vec<(RawFd, Interest)> = Vec::new();
        for fd in &ctx.read_fds {
            interests.push((*fd, Interest::READABLE));
        }
        for fd in &ctx.write_fds {
            match interests.iter_mut().find(|(f, _)| f == fd) {
                Some((_, interest)) => *interest = interest.add(Interest::WRITABLE),
                None => interests.push((*fd, Interest::WRITABLE)),
            }
        }

        let mut registered = 0;
        let mut result = Ok(());
        for (fd, interest) in &interests {
            result =
                self.poll
                    .registry()
                    .register(&mut SourceFd(fd), Token(*fd as usize), *interest);
            if result.is_err() {
                break;
            }
            registered += 1;
        }

        if result.is_ok() {
            let timeout = ctx
                .deadline
                .checked_duration_since(Instant::now())
                .unwrap_or(Duration::ZERO);
            result = self.poll.poll(&mut self.events, Some(timeout));
        }

        let mut readiness = Readiness::none();
        if result.is_ok() {
            for event in self.events.iter() {
                let fd = event.token().0 as RawFd;
                if event.is_readable() || event.is_read_closed() || event.is_error() {
                    readiness.readable.insert(fd);
                }
                if event.is_writable() {
                    readiness.writable.insert(fd);
                }
            }
        }

        for (fd, _) in &interests[..registered] {
            if let Err(e) = self.poll.registry().deregister(&mut SourceFd(fd)) {
                trace!("Deregister fd={} failed: {}", fd, e);
            }
        }

        match result {
            Ok(()) => Ok(readiness),
            Err(e) if e.kind() == io::ErrorKind::Interrupted => Ok(Readiness::none()),
            Err(e) => Err(e),
        }
    }
}

impl std::fmt::Debug for Mainloop {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Mainloop").finish()
    }
}
