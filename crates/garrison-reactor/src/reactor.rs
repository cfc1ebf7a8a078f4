//! The poll stack: a registry of socket handlers on top of `mio::Poll`.

use std::io;
use std::time::{Duration, Instant};

use mio::event::Source;
use mio::{Events, Interest, Poll, Registry, Token};
use tracing::{trace, warn};

use crate::error::{ReactorError, ReactorResult};

/// Default number of events collected per wait.
pub const DEFAULT_EVENT_CAPACITY: usize = 1024;

/// What a registered socket belongs to.
///
/// The reactor only stores the binding; the owner of the socket keeps the
/// state and resolves the slot index on dispatch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Binding {
    /// The shared listening socket.
    Listener,
    /// The self-pipe that wakes the loop on signal delivery.
    Signals,
    /// An HTTP connection in the server's connection table.
    Http(usize),
    /// A PostgreSQL connection in the pool.
    Pg(usize),
}

impl std::fmt::Display for Binding {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Listener => write!(f, "listener"),
            Self::Signals => write!(f, "signals"),
            Self::Http(slot) => write!(f, "http#{slot}"),
            Self::Pg(slot) => write!(f, "pg#{slot}"),
        }
    }
}

/// One registered socket.
#[derive(Debug, Clone, Copy)]
pub struct Handler {
    pub binding: Binding,
    pub interest: Interest,
    /// When set, the handler receives `on_timeout` once this instant passes.
    pub deadline: Option<Instant>,
}

/// Callbacks invoked by [`Reactor::run_once`].
///
/// Every callback receives the reactor so that it can register, re-arm, or
/// deregister sockets while the dispatch is in progress.
pub trait EventSink {
    /// The listener is readable.
    fn on_accept(&mut self, reactor: &mut Reactor, token: Token);

    /// The socket is readable (or reported an error or hang-up).
    fn on_read(&mut self, reactor: &mut Reactor, token: Token, binding: Binding);

    /// The socket is writable (or reported an error or hang-up).
    fn on_write(&mut self, reactor: &mut Reactor, token: Token, binding: Binding);

    /// The handler's deadline has passed.
    fn on_timeout(&mut self, reactor: &mut Reactor, token: Token, binding: Binding);
}

#[derive(Debug, Clone, Copy)]
struct Ready {
    token: Token,
    readable: bool,
    writable: bool,
}

/// Single-threaded readiness reactor.
pub struct Reactor {
    poll: Poll,
    events: Events,
    handlers: Vec<Option<Handler>>,
    free: Vec<usize>,
    /// Slots released during the current dispatch. They become reusable only
    /// after the batch, so stale events never reach a new owner.
    released: Vec<usize>,
    ready: Vec<Ready>,
    dispatching: bool,
}

impl Reactor {
    pub fn new(event_capacity: usize) -> ReactorResult<Self> {
        Ok(Self {
            poll: Poll::new().map_err(ReactorError::Poll)?,
            events: Events::with_capacity(event_capacity.max(1)),
            handlers: Vec::new(),
            free: Vec::new(),
            released: Vec::new(),
            ready: Vec::new(),
            dispatching: false,
        })
    }

    pub fn registry(&self) -> &Registry {
        self.poll.registry()
    }

    /// Registers `source` and returns its token.
    pub fn register<S: Source + ?Sized>(
        &mut self,
        source: &mut S,
        interest: Interest,
        binding: Binding,
    ) -> ReactorResult<Token> {
        let slot = self.free.pop().unwrap_or_else(|| {
            self.handlers.push(None);
            self.handlers.len() - 1
        });
        let token = Token(slot);

        if let Err(source_err) = self.poll.registry().register(source, token, interest) {
            self.free.push(slot);
            return Err(ReactorError::Register {
                binding: binding.to_string(),
                source: source_err,
            });
        }

        self.handlers[slot] = Some(Handler {
            binding,
            interest,
            deadline: None,
        });
        trace!(token = slot, %binding, "registered");
        Ok(token)
    }

    /// Changes the interest set of an existing registration.
    pub fn reregister<S: Source + ?Sized>(
        &mut self,
        source: &mut S,
        token: Token,
        interest: Interest,
    ) -> ReactorResult<()> {
        if self.handler_mut(token)?.interest == interest {
            return Ok(());
        }
        self.poll
            .registry()
            .reregister(source, token, interest)
            .map_err(|source| ReactorError::Reregister { token, source })?;
        self.handler_mut(token)?.interest = interest;
        Ok(())
    }

    /// Removes a registration. Pending events for the token in the current
    /// batch are dropped.
    pub fn deregister<S: Source + ?Sized>(
        &mut self,
        source: &mut S,
        token: Token,
    ) -> ReactorResult<()> {
        let handler = self
            .handlers
            .get_mut(token.0)
            .and_then(Option::take)
            .ok_or(ReactorError::UnknownToken(token))?;

        if self.dispatching {
            self.released.push(token.0);
        } else {
            self.free.push(token.0);
        }
        trace!(token = token.0, binding = %handler.binding, "deregistered");

        self.poll
            .registry()
            .deregister(source)
            .map_err(|source| ReactorError::Deregister { token, source })
    }

    /// Sets or clears the handler's deadline.
    pub fn set_deadline(&mut self, token: Token, deadline: Option<Instant>) -> ReactorResult<()> {
        self.handler_mut(token)?.deadline = deadline;
        Ok(())
    }

    /// Sets the deadline to `timeout` from now. A zero timeout clears it.
    pub fn set_timeout(&mut self, token: Token, timeout: Duration) -> ReactorResult<()> {
        let deadline = (!timeout.is_zero()).then(|| Instant::now() + timeout);
        self.set_deadline(token, deadline)
    }

    pub fn handler(&self, token: Token) -> Option<&Handler> {
        self.handlers.get(token.0).and_then(Option::as_ref)
    }

    pub fn is_registered(&self, token: Token) -> bool {
        self.handler(token).is_some()
    }

    /// Number of live registrations.
    pub fn len(&self) -> usize {
        self.handlers.iter().filter(|h| h.is_some()).count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Waits for readiness, dispatches the ready events in the order the OS
    /// reported them, then fires timeouts for handlers past their deadline.
    ///
    /// `timeout` bounds the wait; it is further shortened so that the nearest
    /// deadline is honoured. Returns the number of callbacks invoked.
    pub fn run_once<S: EventSink>(
        &mut self,
        timeout: Option<Duration>,
        sink: &mut S,
    ) -> ReactorResult<usize> {
        let wait = self.effective_timeout(timeout, Instant::now());

        if let Err(e) = self.poll.poll(&mut self.events, wait) {
            if e.kind() == io::ErrorKind::Interrupted {
                return Ok(0);
            }
            return Err(ReactorError::Poll(e));
        }

        let mut ready = std::mem::take(&mut self.ready);
        ready.clear();
        for event in &self.events {
            // Errors and hang-ups are surfaced as both read and write so the
            // owner observes the failure on its next I/O call.
            let broken = event.is_error() || event.is_read_closed() || event.is_write_closed();
            ready.push(Ready {
                token: event.token(),
                readable: event.is_readable() || broken,
                writable: event.is_writable() || broken,
            });
        }

        self.dispatching = true;
        let mut dispatched = 0;

        for ev in &ready {
            let Some(handler) = self.handler(ev.token).copied() else {
                continue;
            };

            if ev.readable {
                match handler.binding {
                    Binding::Listener => sink.on_accept(self, ev.token),
                    binding => sink.on_read(self, ev.token, binding),
                }
                dispatched += 1;
            }

            if ev.writable && handler.binding != Binding::Listener {
                // The read callback may have closed the socket.
                if let Some(current) = self.handler(ev.token).copied() {
                    sink.on_write(self, ev.token, current.binding);
                    dispatched += 1;
                }
            }
        }

        dispatched += self.fire_timeouts(Instant::now(), sink);

        self.dispatching = false;
        self.free.append(&mut self.released);
        self.ready = ready;
        Ok(dispatched)
    }

    fn fire_timeouts<S: EventSink>(&mut self, now: Instant, sink: &mut S) -> usize {
        let expired: Vec<(Token, Binding)> = self
            .handlers
            .iter_mut()
            .enumerate()
            .filter_map(|(slot, h)| {
                let h = h.as_mut()?;
                match h.deadline {
                    Some(deadline) if deadline <= now => {
                        h.deadline = None;
                        Some((Token(slot), h.binding))
                    }
                    _ => None,
                }
            })
            .collect();

        for &(token, binding) in &expired {
            if self.is_registered(token) {
                sink.on_timeout(self, token, binding);
            } else {
                warn!(token = token.0, %binding, "timeout for released handler skipped");
            }
        }
        expired.len()
    }

    fn effective_timeout(&self, requested: Option<Duration>, now: Instant) -> Option<Duration> {
        let nearest = self
            .handlers
            .iter()
            .flatten()
            .filter_map(|h| h.deadline)
            .min()
            .map(|deadline| deadline.saturating_duration_since(now));

        match (requested, nearest) {
            (Some(a), Some(b)) => Some(a.min(b)),
            (a, b) => a.or(b),
        }
    }

    fn handler_mut(&mut self, token: Token) -> ReactorResult<&mut Handler> {
        self.handlers
            .get_mut(token.0)
            .and_then(Option::as_mut)
            .ok_or(ReactorError::UnknownToken(token))
    }
}
