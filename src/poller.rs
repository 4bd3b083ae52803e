//! Readiness-based reactor
//!
//! An [`Action`] ties a file descriptor, a direction, a callback, and an
//! activation predicate together. Each [`Poller::poll`] iteration evaluates
//! every predicate, waits for readiness on the enabled descriptors, and
//! dispatches the callbacks of whichever actions fired.
//!
//! Callbacks receive the caller's context plus a [`Registrar`] through which
//! they may install further actions (an accept callback registers the new
//! connection's actions this way); additions take effect on the next
//! iteration. Returning [`ActionResult::CancelAll`] tears down every action
//! bound to the same descriptor at the end of the dispatch pass.

use std::collections::{HashMap, HashSet};
use std::io;
use std::os::fd::RawFd;
use std::time::Duration;

use mio::unix::SourceFd;
use mio::{Events, Interest, Poll, Token};

/// Readiness direction
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    /// Readable
    In,
    /// Writable
    Out,
}

/// What a callback asks the poller to do next
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ActionResult {
    /// Keep the action installed
    Continue,
    /// Remove every action bound to this descriptor
    CancelAll,
    /// Stop the loop with this exit status
    Exit(i32),
}

/// Outcome of one poll iteration
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PollResult {
    /// At least one callback was dispatched
    Success,
    /// The wait timed out with nothing ready
    Timeout,
    /// A callback requested loop exit with this status
    Exit(i32),
}

type Callback<Ctx> = Box<dyn FnMut(&mut Ctx, &mut Registrar<Ctx>) -> ActionResult>;
type InterestFn<Ctx> = Box<dyn Fn(&Ctx) -> bool>;

/// A poller registration: descriptor, direction, callback, predicate.
pub struct Action<Ctx> {
    fd: RawFd,
    direction: Direction,
    callback: Callback<Ctx>,
    interest: InterestFn<Ctx>,
}

impl<Ctx> Action<Ctx> {
    /// Create a new action.
    ///
    /// `interest` is re-evaluated before every wait; the descriptor only
    /// participates in the wait (and the callback only fires) while it
    /// returns true.
    pub fn new(
        fd: RawFd,
        direction: Direction,
        callback: impl FnMut(&mut Ctx, &mut Registrar<Ctx>) -> ActionResult + 'static,
        interest: impl Fn(&Ctx) -> bool + 'static,
    ) -> Self {
        Self {
            fd,
            direction,
            callback: Box::new(callback),
            interest: Box::new(interest),
        }
    }
}

/// Collects actions added from inside a dispatch pass.
pub struct Registrar<Ctx> {
    pending: Vec<Action<Ctx>>,
}

impl<Ctx> Registrar<Ctx> {
    /// Install an action; it becomes active on the next iteration.
    pub fn add_action(&mut self, action: Action<Ctx>) {
        self.pending.push(action);
    }
}

/// Single-threaded readiness poller over a caller-supplied context.
pub struct Poller<Ctx> {
    poll: Poll,
    events: Events,
    actions: Vec<Action<Ctx>>,
    registered: HashMap<RawFd, Interest>,
}

impl<Ctx> Poller<Ctx> {
    /// Create a new poller.
    pub fn new() -> io::Result<Self> {
        Ok(Self {
            poll: Poll::new()?,
            events: Events::with_capacity(256),
            actions: Vec::new(),
            registered: HashMap::new(),
        })
    }

    /// Install an action.
    pub fn add_action(&mut self, action: Action<Ctx>) {
        self.actions.push(action);
    }

    /// Number of installed actions.
    pub fn action_count(&self) -> usize {
        self.actions.len()
    }

    /// Run one iteration: reconcile interests, wait, dispatch.
    ///
    /// `timeout` of `None` waits indefinitely for readiness.
    pub fn poll(&mut self, ctx: &mut Ctx, timeout: Option<Duration>) -> io::Result<PollResult> {
        self.reconcile(ctx)?;

        loop {
            match self.poll.poll(&mut self.events, timeout) {
                Ok(()) => {
                    if self.events.is_empty() {
                        if timeout.is_some() {
                            return Ok(PollResult::Timeout);
                        }
                        continue; // spurious wakeup
                    }
                    break;
                }
                Err(e) if e.kind() == io::ErrorKind::Interrupted => {
                    if timeout.is_some() {
                        return Ok(PollResult::Timeout);
                    }
                    continue;
                }
                Err(e) => return Err(e),
            }
        }

        let ready: Vec<(RawFd, bool, bool)> = self
            .events
            .iter()
            .map(|event| {
                (
                    event.token().0 as RawFd,
                    event.is_readable(),
                    event.is_writable(),
                )
            })
            .collect();

        let mut registrar = Registrar {
            pending: Vec::new(),
        };
        let mut canceled: HashSet<RawFd> = HashSet::new();
        let mut exit_status = None;

        'dispatch: for (fd, readable, writable) in ready {
            for i in 0..self.actions.len() {
                if canceled.contains(&fd) {
                    break;
                }

                let action = &self.actions[i];
                let fired = action.fd == fd
                    && match action.direction {
                        Direction::In => readable,
                        Direction::Out => writable,
                    };
                if !fired || !(action.interest)(ctx) {
                    continue;
                }

                match (self.actions[i].callback)(ctx, &mut registrar) {
                    ActionResult::Continue => {}
                    ActionResult::CancelAll => {
                        canceled.insert(fd);
                    }
                    ActionResult::Exit(status) => {
                        exit_status = Some(status);
                        break 'dispatch;
                    }
                }
            }
        }

        if !canceled.is_empty() {
            self.actions.retain(|action| !canceled.contains(&action.fd));
            for fd in canceled {
                if self.registered.remove(&fd).is_some() {
                    // the descriptor may already be closed; the kernel drops
                    // closed descriptors from the interest set on its own
                    let _ = self.poll.registry().deregister(&mut SourceFd(&fd));
                }
            }
        }

        self.actions.extend(registrar.pending);

        match exit_status {
            Some(status) => Ok(PollResult::Exit(status)),
            None => Ok(PollResult::Success),
        }
    }

    /// Bring kernel registrations in line with the activation predicates.
    fn reconcile(&mut self, ctx: &Ctx) -> io::Result<()> {
        let mut desired: HashMap<RawFd, (bool, bool)> = HashMap::new();
        for action in &self.actions {
            let entry = desired.entry(action.fd).or_insert((false, false));
            if (action.interest)(ctx) {
                match action.direction {
                    Direction::In => entry.0 = true,
                    Direction::Out => entry.1 = true,
                }
            }
        }

        // registrations for descriptors that lost all their actions
        let stale: Vec<RawFd> = self
            .registered
            .keys()
            .filter(|fd| !desired.contains_key(fd))
            .copied()
            .collect();
        for fd in stale {
            self.registered.remove(&fd);
            let _ = self.poll.registry().deregister(&mut SourceFd(&fd));
        }

        for (&fd, &(readable, writable)) in &desired {
            let wanted = match (readable, writable) {
                (true, true) => Some(Interest::READABLE | Interest::WRITABLE),
                (true, false) => Some(Interest::READABLE),
                (false, true) => Some(Interest::WRITABLE),
                (false, false) => None,
            };

            match (self.registered.get(&fd).copied(), wanted) {
                (None, Some(interest)) => {
                    self.poll
                        .registry()
                        .register(&mut SourceFd(&fd), Token(fd as usize), interest)?;
                    self.registered.insert(fd, interest);
                }
                (Some(current), Some(interest)) if current != interest => {
                    self.poll.registry().reregister(
                        &mut SourceFd(&fd),
                        Token(fd as usize),
                        interest,
                    )?;
                    self.registered.insert(fd, interest);
                }
                (Some(_), None) => {
                    self.registered.remove(&fd);
                    let _ = self.poll.registry().deregister(&mut SourceFd(&fd));
                }
                _ => {}
            }
        }

        Ok(())
    }
}
