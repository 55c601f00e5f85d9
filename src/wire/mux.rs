use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::io;
use std::sync::{Arc, Condvar, Mutex};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use crate::wire::codec::{CodecError, Frame};
use crate::wire::connection::TaggedConnection;

/// Abandoned tags remembered per connection; the oldest is forgotten first.
const ABANDONED_TAG_LIMIT: usize = 256;

#[derive(Debug)]
pub enum MuxError {
    /// The connection closed before the response for this tag arrived.
    Closed { tag: u32 },
    TimedOut { tag: u32, after: Duration },
    Io(io::Error),
    Codec(CodecError),
}

impl fmt::Display for MuxError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Closed { tag } => {
                write!(f, "connection closed while waiting for response tag {tag}")
            }
            Self::TimedOut { tag, after } => write!(
                f,
                "no response for tag {tag} after {} ms",
                after.as_millis()
            ),
            Self::Io(source) => write!(f, "multiplexer io error: {source}"),
            Self::Codec(source) => write!(f, "multiplexer send failed: {source}"),
        }
    }
}

impl std::error::Error for MuxError {}

#[derive(Default)]
struct MuxState {
    responses: HashMap<u32, Frame>,
    waiters: HashMap<u32, Arc<Condvar>>,
    /// Tags whose caller gave up, oldest first; late responses for them are
    /// dropped.
    abandoned: VecDeque<u32>,
    closed: bool,
}

impl MuxState {
    fn abandon(&mut self, tag: u32) {
        if self.abandoned.len() == ABANDONED_TAG_LIMIT {
            self.abandoned.pop_front();
        }
        self.abandoned.push_back(tag);
    }
}

#[derive(Default)]
struct MuxShared {
    state: Mutex<MuxState>,
}

impl MuxShared {
    fn deliver(&self, frame: Frame) {
        let mut state = self.state.lock().expect("multiplexer state lock poisoned");
        if let Some(position) = state.abandoned.iter().position(|tag| *tag == frame.tag) {
            state.abandoned.remove(position);
            return;
        }
        if let Some(waiter) = state.waiters.get(&frame.tag) {
            waiter.notify_all();
        }
        state.responses.insert(frame.tag, frame);
    }

    fn close(&self) -> bool {
        let mut state = self.state.lock().expect("multiplexer state lock poisoned");
        if state.closed {
            return false;
        }
        state.closed = true;
        for waiter in state.waiters.values() {
            waiter.notify_all();
        }
        true
    }
}

/// Lets many threads share one connection: each sends a tagged request and
/// blocks in [`Multiplexer::receive`] until the frame with its tag is read
/// by the single receiver thread.
pub struct Multiplexer {
    connection: Arc<TaggedConnection>,
    shared: Arc<MuxShared>,
    receiver: Mutex<Option<JoinHandle<()>>>,
}

impl Multiplexer {
    pub fn new(connection: TaggedConnection) -> Self {
        Self {
            connection: Arc::new(connection),
            shared: Arc::new(MuxShared::default()),
            receiver: Mutex::new(None),
        }
    }

    /// Spawns the receiver loop. Calling it again is a no-op.
    pub fn start(&self) -> Result<(), MuxError> {
        let mut receiver = self
            .receiver
            .lock()
            .expect("multiplexer receiver lock poisoned");
        if receiver.is_some() {
            return Ok(());
        }

        let connection = Arc::clone(&self.connection);
        let shared = Arc::clone(&self.shared);
        let handle = thread::Builder::new()
            .name("mux-receiver".to_owned())
            .spawn(move || {
                while let Ok(frame) = connection.receive() {
                    shared.deliver(frame);
                }
                shared.close();
            })
            .map_err(MuxError::Io)?;
        *receiver = Some(handle);
        Ok(())
    }

    pub fn send(&self, tag: u32, request_type: u16, payload: Vec<u8>) -> Result<(), MuxError> {
        if self.is_closed() {
            return Err(MuxError::Closed { tag });
        }
        self.connection
            .send_parts(tag, request_type, payload)
            .map_err(MuxError::Codec)
    }

    /// Blocks until the response for `tag` arrives or the connection closes.
    pub fn receive(&self, tag: u32) -> Result<Frame, MuxError> {
        self.wait_for(tag, None)
    }

    /// Like [`Multiplexer::receive`] but gives up after `timeout`.
    pub fn receive_timeout(&self, tag: u32, timeout: Duration) -> Result<Frame, MuxError> {
        self.wait_for(tag, Some(timeout))
    }

    pub fn is_closed(&self) -> bool {
        self.shared
            .state
            .lock()
            .expect("multiplexer state lock poisoned")
            .closed
    }

    /// Responses that arrived before anyone asked for them.
    pub fn buffered_responses(&self) -> usize {
        self.shared
            .state
            .lock()
            .expect("multiplexer state lock poisoned")
            .responses
            .len()
    }

    /// Wakes every pending receive with [`MuxError::Closed`] and shuts the
    /// socket. Safe to call more than once.
    pub fn close(&self) {
        if self.shared.close() {
            let _ = self.connection.shutdown();
        }
        let handle = self
            .receiver
            .lock()
            .expect("multiplexer receiver lock poisoned")
            .take();
        if let Some(handle) = handle {
            if handle.thread().id() != thread::current().id() {
                let _ = handle.join();
            }
        }
    }

    fn wait_for(&self, tag: u32, timeout: Option<Duration>) -> Result<Frame, MuxError> {
        let deadline = timeout.map(|after| (Instant::now() + after, after));
        let mut state = self
            .shared
            .state
            .lock()
            .expect("multiplexer state lock poisoned");

        loop {
            if let Some(frame) = state.responses.remove(&tag) {
                state.waiters.remove(&tag);
                return Ok(frame);
            }
            if state.closed {
                state.waiters.remove(&tag);
                return Err(MuxError::Closed { tag });
            }

            let waiter = Arc::clone(
                state
                    .waiters
                    .entry(tag)
                    .or_insert_with(|| Arc::new(Condvar::new())),
            );

            match deadline {
                None => {
                    state = waiter
                        .wait(state)
                        .expect("multiplexer state lock poisoned");
                }
                Some((at, after)) => {
                    let now = Instant::now();
                    if now >= at {
                        state.waiters.remove(&tag);
                        state.abandon(tag);
                        return Err(MuxError::TimedOut { tag, after });
                    }
                    state = waiter
                        .wait_timeout(state, at - now)
                        .expect("multiplexer state lock poisoned")
                        .0;
                }
            }
        }
    }
}

impl Drop for Multiplexer {
    fn drop(&mut self) {
        self.close();
    }
}

#[cfg(test)]
mod tests {
    use std::net::TcpListener;
    use std::sync::{Arc, Barrier};
    use std::thread;
    use std::time::Duration;

    use crate::wire::codec::WireCodec;
    use crate::wire::connection::TaggedConnection;

    use super::{MuxError, MuxState, Multiplexer, ABANDONED_TAG_LIMIT};

    fn started_pair() -> (Arc<Multiplexer>, TaggedConnection) {
        let listener = TcpListener::bind("127.0.0.1:0").expect("listener should bind");
        let addr = listener.local_addr().expect("listener should have an address");
        let client = TaggedConnection::connect(addr, WireCodec::default())
            .expect("client should connect");
        let (stream, _) = listener.accept().expect("server should accept");
        let server =
            TaggedConnection::from_stream(stream, WireCodec::default()).expect("server side");

        let mux = Arc::new(Multiplexer::new(client));
        mux.start().expect("receiver should start");
        (mux, server)
    }

    #[test]
    fn each_caller_gets_only_its_own_tag_under_reordering() {
        const CALLERS: u32 = 16;
        let (mux, server) = started_pair();
        let barrier = Arc::new(Barrier::new(CALLERS as usize));

        let callers: Vec<_> = (0..CALLERS)
            .map(|tag| {
                let mux = Arc::clone(&mux);
                let barrier = Arc::clone(&barrier);
                thread::spawn(move || {
                    barrier.wait();
                    mux.send(tag, 3, tag.to_be_bytes().to_vec())
                        .expect("request should send");
                    let frame = mux.receive(tag).expect("response should arrive");
                    (tag, frame)
                })
            })
            .collect();

        let mut requests = Vec::new();
        for _ in 0..CALLERS {
            requests.push(server.receive().expect("request should arrive"));
        }
        for request in requests.iter().rev() {
            let mut payload = request.payload.clone();
            payload.push(0xEE);
            server
                .send_parts(request.tag, request.request_type, payload)
                .expect("response should send");
        }

        for caller in callers {
            let (tag, frame) = caller.join().expect("caller thread should finish");
            assert_eq!(frame.tag, tag);
            let mut expected = tag.to_be_bytes().to_vec();
            expected.push(0xEE);
            assert_eq!(frame.payload, expected);
        }
        assert_eq!(mux.buffered_responses(), 0);
    }

    #[test]
    fn response_arriving_before_receive_is_buffered() {
        let (mux, server) = started_pair();
        server.send_parts(7, 4, vec![42]).expect("response should send");

        for _ in 0..200 {
            if mux.buffered_responses() == 1 {
                break;
            }
            thread::sleep(Duration::from_millis(5));
        }
        assert_eq!(mux.buffered_responses(), 1);

        let frame = mux.receive(7).expect("buffered response should be returned");
        assert_eq!(frame.payload, vec![42]);
    }

    #[test]
    fn peer_close_wakes_every_waiter() {
        let (mux, server) = started_pair();
        let waiters: Vec<_> = (1..=3_u32)
            .map(|tag| {
                let mux = Arc::clone(&mux);
                thread::spawn(move || mux.receive(tag))
            })
            .collect();

        thread::sleep(Duration::from_millis(50));
        server.shutdown().expect("server side should shut down");
        drop(server);

        for waiter in waiters {
            let result = waiter.join().expect("waiter should finish");
            assert!(matches!(result, Err(MuxError::Closed { .. })));
        }
        assert!(mux.is_closed());
    }

    #[test]
    fn close_is_idempotent_and_releases_waiters() {
        let (mux, _server) = started_pair();
        let waiter = {
            let mux = Arc::clone(&mux);
            thread::spawn(move || mux.receive(11))
        };

        thread::sleep(Duration::from_millis(50));
        mux.close();
        mux.close();

        assert!(matches!(
            waiter.join().expect("waiter should finish"),
            Err(MuxError::Closed { tag: 11 })
        ));
        assert!(matches!(
            mux.send(12, 1, Vec::new()),
            Err(MuxError::Closed { tag: 12 })
        ));
    }

    #[test]
    fn timed_out_tag_drops_its_late_response() {
        let (mux, server) = started_pair();

        let result = mux.receive_timeout(21, Duration::from_millis(30));
        assert!(matches!(result, Err(MuxError::TimedOut { tag: 21, .. })));

        server.send_parts(21, 3, vec![1]).expect("late response should send");
        server.send_parts(22, 3, vec![2]).expect("next response should send");
        let frame = mux
            .receive_timeout(22, Duration::from_secs(5))
            .expect("next response should arrive");
        assert_eq!(frame.payload, vec![2]);
        assert_eq!(mux.buffered_responses(), 0);
    }

    #[test]
    fn abandoned_tags_are_bounded_and_oldest_go_first() {
        let mut state = MuxState::default();
        let total = u32::try_from(ABANDONED_TAG_LIMIT).expect("limit fits u32") + 10;
        for tag in 0..total {
            state.abandon(tag);
        }

        assert_eq!(state.abandoned.len(), ABANDONED_TAG_LIMIT);
        assert!(!state.abandoned.contains(&9));
        assert_eq!(state.abandoned.front(), Some(&10));
        assert_eq!(state.abandoned.back(), Some(&(total - 1)));
    }

    #[test]
    fn unanswered_timeouts_do_not_accumulate() {
        let (mux, _server) = started_pair();
        let total = u32::try_from(ABANDONED_TAG_LIMIT).expect("limit fits u32") + 5;
        for tag in 0..total {
            let result = mux.receive_timeout(tag, Duration::from_millis(0));
            assert!(matches!(result, Err(MuxError::TimedOut { .. })));
        }

        let state = mux.shared.state.lock().expect("state lock");
        assert_eq!(state.abandoned.len(), ABANDONED_TAG_LIMIT);
        assert!(state.waiters.is_empty());
    }
}
