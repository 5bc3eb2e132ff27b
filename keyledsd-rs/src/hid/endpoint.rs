/* HID endpoint: serialises request/reply exchanges over one file descriptor.
 *
 * At most one command is in flight at a time; further posts queue up to a
 * small bound. Registered frame filters see every inbound report before the
 * pending command does and consume asynchronous device notifications. Reads
 * always use a buffer sized for the device's largest report plus the leading
 * report-id byte; payloads are never interpreted here. */

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use nix::errno::Errno;
use thiserror::Error;
use tracing::trace;

/* Four pending commands: enough for a render tick's worth of traffic. */
pub const QUEUE_SIZE: usize = 4;
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(1);

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("transport timed out")]
    Timeout,
    #[error("transport I/O error: {0}")]
    Io(Errno),
}

#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum CommandError {
    #[error("command timed out")]
    Timeout,
    #[error("command cancelled")]
    Cancelled,
    #[error("command queue is full")]
    QueueFull,
    #[error("send failed: {0}")]
    Send(Errno),
    #[error("receive failed: {0}")]
    Receive(Errno),
}

/* Raw report transport. Real devices use `HidrawTransport`; tests script one. */
pub trait Transport: Send {
    fn write_report(&mut self, frame: &[u8]) -> Result<(), TransportError>;
    /* Read one report; must return `Timeout` once `deadline` has passed. */
    fn read_report(&mut self, buf: &mut [u8], deadline: Instant) -> Result<usize, TransportError>;
    /* Discard buffered inbound reports without blocking. */
    fn drain(&mut self) -> Result<usize, TransportError>;
}

/* An outbound report plus the continuations resolving it. `accept` decides
 * which inbound report answers the command; everything it rejects is
 * discarded (unless a frame filter consumed it first). */
pub struct Command {
    pub frame: Vec<u8>,
    pub accept: Box<dyn FnMut(&[u8]) -> bool + Send>,
    pub on_reply: Box<dyn FnOnce(&[u8]) + Send>,
    pub on_error: Box<dyn FnOnce(CommandError) + Send>,
}

pub type FilterToken = u64;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    Inactive,
    Sending,
    AwaitingReply,
}

pub struct Endpoint<T: Transport> {
    transport: T,
    read_size: usize,
    timeout: Duration,
    state: State,
    queue: VecDeque<Command>,
    filters: Vec<(FilterToken, Box<dyn FnMut(&[u8]) -> bool + Send>)>,
    next_filter: FilterToken,
}

impl<T: Transport> Endpoint<T> {
    pub fn new(transport: T, max_report_size: usize) -> Self {
        Self {
            transport,
            read_size: max_report_size + 1,
            timeout: DEFAULT_TIMEOUT,
            state: State::Inactive,
            queue: VecDeque::new(),
            filters: Vec::new(),
            next_filter: 1,
        }
    }

    /* Per-command deadline for the reply. */
    pub fn set_timeout(&mut self, timeout: Duration) {
        self.timeout = timeout;
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /* Enqueue a command. Returns false when the queue is full. */
    pub fn post(&mut self, command: Command) -> bool {
        if self.queue.len() >= QUEUE_SIZE {
            return false;
        }
        self.queue.push_back(command);
        true
    }

    /* Register a demultiplexer for asynchronous notifications. A filter that
     * returns true consumes the report before the pending command sees it. */
    pub fn register_frame_filter(
        &mut self,
        filter: Box<dyn FnMut(&[u8]) -> bool + Send>,
    ) -> FilterToken {
        let token = self.next_filter;
        self.next_filter += 1;
        self.filters.push((token, filter));
        token
    }

    pub fn unregister_frame_filter(&mut self, token: FilterToken) {
        self.filters.retain(|(t, _)| *t != token);
    }

    /* Run queued commands to completion, in order. */
    pub fn run_pending(&mut self) {
        while let Some(command) = self.queue.pop_front() {
            self.process(command);
        }
    }

    /* Discard stale inbound reports. */
    pub fn drain(&mut self) -> Result<usize, TransportError> {
        self.transport.drain()
    }

    pub fn transport(&self) -> &T {
        &self.transport
    }

    pub fn transport_mut(&mut self) -> &mut T {
        &mut self.transport
    }

    /* Post a command and block until it resolves, returning the raw reply. */
    pub fn roundtrip(
        &mut self,
        frame: Vec<u8>,
        accept: Box<dyn FnMut(&[u8]) -> bool + Send>,
    ) -> Result<Vec<u8>, CommandError> {
        let slot: Arc<Mutex<Option<Result<Vec<u8>, CommandError>>>> = Arc::new(Mutex::new(None));
        let reply_slot = Arc::clone(&slot);
        let error_slot = Arc::clone(&slot);

        let posted = self.post(Command {
            frame,
            accept,
            on_reply: Box::new(move |reply| {
                if let Ok(mut guard) = reply_slot.lock() {
                    *guard = Some(Ok(reply.to_vec()));
                }
            }),
            on_error: Box::new(move |err| {
                if let Ok(mut guard) = error_slot.lock() {
                    *guard = Some(Err(err));
                }
            }),
        });
        if !posted {
            return Err(CommandError::QueueFull);
        }

        self.run_pending();
        let result = match slot.lock() {
            Ok(mut guard) => guard.take().unwrap_or(Err(CommandError::Cancelled)),
            Err(_) => Err(CommandError::Cancelled),
        };
        result
    }

    fn process(&mut self, mut command: Command) {
        self.state = State::Sending;
        if let Err(err) = self.transport.write_report(&command.frame) {
            self.state = State::Inactive;
            (command.on_error)(match err {
                TransportError::Timeout => CommandError::Timeout,
                TransportError::Io(errno) => CommandError::Send(errno),
            });
            return;
        }

        self.state = State::AwaitingReply;
        let deadline = Instant::now() + self.timeout;
        let mut buf = vec![0u8; self.read_size];

        loop {
            let frame = match self.transport.read_report(&mut buf, deadline) {
                Ok(n) => &buf[..n],
                Err(TransportError::Timeout) => {
                    self.state = State::Inactive;
                    (command.on_error)(CommandError::Timeout);
                    return;
                }
                Err(TransportError::Io(errno)) => {
                    self.state = State::Inactive;
                    (command.on_error)(CommandError::Receive(errno));
                    return;
                }
            };

            if self.filters.iter_mut().any(|(_, filter)| filter(frame)) {
                continue;
            }
            if (command.accept)(frame) {
                self.state = State::Inactive;
                (command.on_reply)(frame);
                return;
            }
            trace!("discarding unrelated frame {:02x?}", frame);
        }
    }
}

impl<T: Transport> Drop for Endpoint<T> {
    fn drop(&mut self) {
        /* resolve anything still queued so callers see the cancellation */
        for command in self.queue.drain(..) {
            (command.on_error)(CommandError::Cancelled);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hid::testing::{MockTransport, Reply};

    fn endpoint() -> Endpoint<MockTransport> {
        Endpoint::new(MockTransport::new(), 19)
    }

    #[test]
    fn roundtrip_returns_matching_reply() {
        let mut ep = endpoint();
        ep.transport.push_reply(&[0x11, 0xff, 0x00, 0x12, 0x42]);
        let reply = ep
            .roundtrip(vec![0x11, 0xff, 0x00, 0x12], Box::new(|f| f[0] == 0x11))
            .expect("reply");
        assert_eq!(reply[4], 0x42);
        assert_eq!(ep.transport.writes.len(), 1);
    }

    #[test]
    fn unrelated_frames_are_discarded() {
        let mut ep = endpoint();
        ep.transport.push_reply(&[0x01, 0xaa]); /* mouse input noise */
        ep.transport.push_reply(&[0x11, 0xff, 0x00, 0x12, 0x07]);
        let reply = ep
            .roundtrip(vec![0x11, 0xff, 0x00, 0x12], Box::new(|f| f[0] == 0x11))
            .expect("reply");
        assert_eq!(reply[4], 0x07);
    }

    #[test]
    fn timeout_resolves_with_error() {
        let mut ep = endpoint();
        ep.transport.replies.push_back(Reply::Timeout);
        let err = ep
            .roundtrip(vec![0x11, 0xff, 0x00, 0x12], Box::new(|_| true))
            .expect_err("timeout");
        assert_eq!(err, CommandError::Timeout);
    }

    #[test]
    fn receive_failure_resolves_with_error() {
        let mut ep = endpoint();
        ep.transport.replies.push_back(Reply::Error(Errno::ENODEV));
        let err = ep
            .roundtrip(vec![0x11, 0xff, 0x00, 0x12], Box::new(|_| true))
            .expect_err("receive error");
        assert_eq!(err, CommandError::Receive(Errno::ENODEV));
    }

    #[test]
    fn send_failure_resolves_with_error() {
        let mut ep = endpoint();
        ep.transport.write_error = Some(Errno::EIO);
        let err = ep
            .roundtrip(vec![0x11, 0xff, 0x00, 0x12], Box::new(|_| true))
            .expect_err("send error");
        assert_eq!(err, CommandError::Send(Errno::EIO));
    }

    #[test]
    fn queue_is_bounded() {
        let mut ep = endpoint();
        let dummy = || Command {
            frame: vec![0x11],
            accept: Box::new(|_| true),
            on_reply: Box::new(|_| {}),
            on_error: Box::new(|_| {}),
        };
        for _ in 0..QUEUE_SIZE {
            assert!(ep.post(dummy()));
        }
        assert!(!ep.post(dummy()));
    }

    #[test]
    fn frame_filter_consumes_notifications() {
        use std::sync::atomic::{AtomicUsize, Ordering};
        let seen = Arc::new(AtomicUsize::new(0));
        let seen_by_filter = Arc::clone(&seen);

        let mut ep = endpoint();
        let token = ep.register_frame_filter(Box::new(move |frame| {
            if frame[0] == 0x20 {
                seen_by_filter.fetch_add(1, Ordering::SeqCst);
                true
            } else {
                false
            }
        }));

        ep.transport.push_reply(&[0x20, 0x01]); /* notification */
        ep.transport.push_reply(&[0x20, 0x02]); /* notification */
        ep.transport.push_reply(&[0x11, 0xff, 0x00, 0x12, 0x05]);

        let reply = ep
            .roundtrip(vec![0x11, 0xff, 0x00, 0x12], Box::new(|f| f[0] == 0x11))
            .expect("reply");
        assert_eq!(reply[4], 0x05);
        assert_eq!(seen.load(Ordering::SeqCst), 2);

        ep.unregister_frame_filter(token);
        ep.transport.push_reply(&[0x20, 0x03]); /* no longer consumed */
        ep.transport.push_reply(&[0x11, 0xff, 0x00, 0x12, 0x06]);
        let reply = ep
            .roundtrip(vec![0x11, 0xff, 0x00, 0x12], Box::new(|f| f[0] == 0x11))
            .expect("reply");
        assert_eq!(reply[4], 0x06);
    }

    #[test]
    fn dropped_endpoint_cancels_queued_commands() {
        let cancelled = Arc::new(Mutex::new(None));
        let slot = Arc::clone(&cancelled);
        {
            let mut ep = endpoint();
            ep.post(Command {
                frame: vec![0x11],
                accept: Box::new(|_| true),
                on_reply: Box::new(|_| {}),
                on_error: Box::new(move |e| {
                    if let Ok(mut guard) = slot.lock() {
                        *guard = Some(e);
                    }
                }),
            });
        }
        assert_eq!(*cancelled.lock().expect("lock"), Some(CommandError::Cancelled));
    }
}
