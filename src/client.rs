//! A client that multiplexes concurrent requests over one UDP socket.
//!
//! Each request is tagged with a random key. A background task receives every
//! datagram and hands it to the request waiting on its key; replies nobody is
//! waiting for (including late replies to timed-out requests) are dropped.
use std::collections::HashMap;
use std::io;
use std::net::{Ipv4Addr, Ipv6Addr, SocketAddr};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use thiserror::Error;
use tokio::net::{lookup_host, ToSocketAddrs, UdpSocket};
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio::time::{self, Instant};
use tracing::{debug, error, trace};

use crate::is_transient_recv_error;
use crate::types::job::{Job, PutAction, QueueStats};
use crate::types::protocol::{
    Message, MAX_KEY_LEN, MAX_MESSAGE_SIZE, REASON_EMPTY, REASON_NOT_FOUND,
};

/// How long a request waits for its reply by default.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(1);
/// How long [`Client::reserve_wait`] sleeps between attempts by default.
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(1);

#[derive(Debug, Error)]
pub enum ClientError {
    #[error("timed out")]
    Timeout,
    #[error("no jobs available")]
    NoJobs,
    #[error("not found")]
    NotFound,
    /// The broker answered with an error reason we don't otherwise handle.
    #[error("{0}")]
    Rejected(String),
    #[error("can't handle message type {0:?}")]
    UnhandledType(&'static str),
    #[error("success reply to put has no action")]
    MissingAction,
    #[error("request of {0} bytes doesn't fit in a datagram")]
    MessageTooLarge(usize),
    #[error("key {0:?} is longer than {MAX_KEY_LEN} bytes")]
    KeyTooLong(String),
    #[error("key {0:?} is already awaiting a reply")]
    KeyInUse(String),
    /// Receiving failed. Every later request fails with the same error.
    #[error("socket failed: {0}")]
    Socket(Arc<io::Error>),
    #[error(transparent)]
    Io(#[from] io::Error),
}

/// Requests awaiting replies, plus the error that stopped the receiver, if
/// any.
#[derive(Default)]
struct Pending {
    state: Mutex<PendingState>,
}

#[derive(Default)]
struct PendingState {
    waiting: HashMap<String, oneshot::Sender<Message>>,
    failure: Option<Arc<io::Error>>,
}

impl Pending {
    fn lock(&self) -> MutexGuard<'_, PendingState> {
        // Nothing panics while holding the lock, and the map is valid at every
        // step regardless.
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn register(
        &self,
        key: &str,
    ) -> Result<oneshot::Receiver<Message>, ClientError> {
        let mut state = self.lock();

        if let Some(error) = &state.failure {
            return Err(ClientError::Socket(error.clone()));
        }
        if state.waiting.contains_key(key) {
            return Err(ClientError::KeyInUse(key.to_owned()));
        }

        let (tx, rx) = oneshot::channel();
        state.waiting.insert(key.to_owned(), tx);
        Ok(rx)
    }

    fn remove(&self, key: &str) {
        self.lock().waiting.remove(key);
    }

    /// Hands a reply to the request waiting on its key, giving it back if
    /// there's no such request.
    fn deliver(&self, reply: Message) -> Result<(), Message> {
        let waiting = self.lock().waiting.remove(reply.key());
        match waiting {
            Some(tx) => tx.send(reply),
            None => Err(reply),
        }
    }

    /// Records a fatal receive error and wakes every waiting request.
    fn fail(&self, error: io::Error) {
        let mut state = self.lock();
        state.failure = Some(Arc::new(error));
        state.waiting.clear();
    }

    fn failure(&self) -> ClientError {
        let error = self.lock().failure.clone().unwrap_or_else(|| {
            Arc::new(io::Error::other("receiver stopped"))
        });
        ClientError::Socket(error)
    }
}

struct Registered<'a> {
    pending: &'a Pending,
    key: &'a str,
}

impl Drop for Registered<'_> {
    fn drop(&mut self) {
        self.pending.remove(self.key);
    }
}

struct Shared {
    socket: UdpSocket,
    pending: Pending,
}

/// A connection to a broker, shareable between tasks by reference.
pub struct Client {
    shared: Arc<Shared>,
    receiver: JoinHandle<()>,
    timeout: Duration,
    poll_interval: Duration,
}

impl Client {
    /// Binds an ephemeral local socket aimed at the broker at `addr` and
    /// starts receiving replies.
    pub async fn connect<A: ToSocketAddrs>(addr: A) -> io::Result<Self> {
        let remote = lookup_host(addr).await?.next().ok_or_else(|| {
            io::Error::new(io::ErrorKind::InvalidInput, "no address found")
        })?;
        let local: SocketAddr = match remote {
            SocketAddr::V4(_) => (Ipv4Addr::UNSPECIFIED, 0).into(),
            SocketAddr::V6(_) => (Ipv6Addr::UNSPECIFIED, 0).into(),
        };

        let socket = UdpSocket::bind(local).await?;
        socket.connect(remote).await?;
        debug!(local = %socket.local_addr()?, %remote, "connected");

        let shared = Arc::new(Shared {
            socket,
            pending: Pending::default(),
        });
        let receiver = tokio::spawn(receive(shared.clone()));

        Ok(Self {
            shared,
            receiver,
            timeout: DEFAULT_TIMEOUT,
            poll_interval: DEFAULT_POLL_INTERVAL,
        })
    }

    /// Sets how long each request waits for its reply.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Sets how long [`reserve_wait`](Self::reserve_wait) sleeps when the
    /// queue is empty.
    pub fn with_poll_interval(mut self, poll_interval: Duration) -> Self {
        self.poll_interval = poll_interval;
        self
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Sends a request and waits for the reply with the same key. A key is
    /// generated if the request's is empty.
    pub async fn request(
        &self,
        mut message: Message,
    ) -> Result<Message, ClientError> {
        if message.key().is_empty() {
            message.set_key(generate_key());
        }
        if message.key().len() > MAX_KEY_LEN {
            return Err(ClientError::KeyTooLong(message.key().to_owned()));
        }

        let frame = message.serialise();
        if frame.len() > MAX_MESSAGE_SIZE {
            return Err(ClientError::MessageTooLarge(frame.len()));
        }

        let key = message.key();
        let reply = self.shared.pending.register(key)?;
        // Unregisters on every exit, including this future being dropped.
        let _registered = Registered {
            pending: &self.shared.pending,
            key,
        };

        trace!(key, message_type = message.tag(), "sending request");
        time::timeout(self.timeout, async {
            self.shared.socket.send(&frame).await?;
            match reply.await {
                Ok(reply) => Ok(reply),
                Err(_) => Err(self.shared.pending.failure()),
            }
        })
        .await
        .unwrap_or(Err(ClientError::Timeout))
    }

    /// Returns the round-trip time of a ping.
    pub async fn ping(&self) -> Result<Duration, ClientError> {
        let started = Instant::now();

        match self.request(Message::Ping { key: String::new() }).await? {
            Message::Ping { .. } => Ok(started.elapsed()),
            other => Err(unhandled(other)),
        }
    }

    /// Puts a job, creating it or merging it into the job with the same ID.
    pub async fn put(&self, job: &Job) -> Result<PutAction, ClientError> {
        let request = Message::Job {
            key: String::new(),
            job: job.clone(),
        };

        match self.request(request).await? {
            Message::Success {
                action: Some(action),
                ..
            } => Ok(action),
            Message::Success { action: None, .. } => {
                Err(ClientError::MissingAction)
            },
            Message::Error { reason, .. } => Err(ClientError::Rejected(reason)),
            other => Err(unhandled(other)),
        }
    }

    /// Reserves the highest-priority eligible job on `queue`.
    pub async fn reserve(&self, queue: &str) -> Result<Job, ClientError> {
        let request = Message::Reserve {
            key: String::new(),
            queue: queue.to_owned(),
        };

        expect_job(self.request(request).await?)
    }

    /// As [`reserve`](Self::reserve), but while the queue is empty, sleeps and
    /// tries again. Any other outcome is returned.
    ///
    /// This never gives up by itself; drop the future to stop waiting.
    pub async fn reserve_wait(&self, queue: &str) -> Result<Job, ClientError> {
        loop {
            match self.reserve(queue).await {
                Err(ClientError::NoJobs) => {
                    time::sleep(self.poll_interval).await
                },
                outcome => return outcome,
            }
        }
    }

    /// Returns the job `reserve` would reserve, without reserving it.
    pub async fn peek(&self, queue: &str) -> Result<Job, ClientError> {
        let request = Message::Peek {
            key: String::new(),
            queue: queue.to_owned(),
        };

        expect_job(self.request(request).await?)
    }

    /// Deletes the job with this ID from `queue`.
    pub async fn delete(
        &self,
        queue: &str,
        id: &str,
    ) -> Result<(), ClientError> {
        let request = Message::Delete {
            key: String::new(),
            queue: queue.to_owned(),
            id: id.to_owned(),
        };

        match self.request(request).await? {
            Message::Success { .. } => Ok(()),
            Message::Error { reason, .. } if reason == REASON_NOT_FOUND => {
                Err(ClientError::NotFound)
            },
            Message::Error { reason, .. } => Err(ClientError::Rejected(reason)),
            other => Err(unhandled(other)),
        }
    }

    pub async fn stats(&self, queue: &str) -> Result<QueueStats, ClientError> {
        let request = Message::Stats {
            key: String::new(),
            queue: queue.to_owned(),
        };

        match self.request(request).await? {
            Message::QueueStats { stats, .. } => Ok(stats),
            Message::Error { reason, .. } => Err(ClientError::Rejected(reason)),
            other => Err(unhandled(other)),
        }
    }
}

impl Drop for Client {
    fn drop(&mut self) {
        self.receiver.abort();
    }
}

/// Receives datagrams until the socket fails, delivering each to the request
/// waiting on its key.
async fn receive(shared: Arc<Shared>) {
    let mut buf = vec![0u8; MAX_MESSAGE_SIZE + 1];

    loop {
        let n = match shared.socket.recv(&mut buf).await {
            Ok(n) => n,
            Err(error) if is_transient_recv_error(&error) => {
                debug!(%error, "ignoring transient receive error");
                continue;
            },
            Err(error) => {
                error!(%error, "receive failed, failing all requests");
                shared.pending.fail(error);
                return;
            },
        };

        match Message::try_from(&buf[..n]) {
            Ok(reply) => {
                if let Err(reply) = shared.pending.deliver(reply) {
                    debug!(key = reply.key(), "discarding unmatched reply");
                }
            },
            Err(error) => debug!(%error, "discarding undecodable datagram"),
        }
    }
}

/// Returns 8 random bytes as lowercase hex.
fn generate_key() -> String {
    hex::encode(rand::random::<[u8; 8]>())
}

fn expect_job(reply: Message) -> Result<Job, ClientError> {
    match reply {
        Message::Job { job, .. } => Ok(job),
        Message::Error { reason, .. } if reason == REASON_EMPTY => {
            Err(ClientError::NoJobs)
        },
        Message::Error { reason, .. } => Err(ClientError::Rejected(reason)),
        other => Err(unhandled(other)),
    }
}

fn unhandled(reply: Message) -> ClientError {
    ClientError::UnhandledType(reply.tag())
}
