//! Receives requests, applies them to the job store and replies.
use std::io;
use std::net::SocketAddr;

use chrono::Utc;
use thiserror::Error;
use tokio::net::{ToSocketAddrs, UdpSocket};
use tokio::select;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, trace, warn};

use crate::is_transient_recv_error;
use crate::parser::ParsingError;
use crate::store::{JobStore, StoreError};
use crate::types::job::Job;
use crate::types::protocol::{
    Message, MAX_MESSAGE_SIZE, REASON_EMPTY, REASON_INTERNAL, REASON_NOT_FOUND,
    REASON_TOO_LARGE,
};

/// Why a single datagram went unanswered.
#[derive(Debug, Error)]
pub enum DispatchError {
    #[error("undecodable datagram: {0}")]
    Parse(#[from] ParsingError),
    #[error("unexpected {0} message")]
    Unexpected(&'static str),
    #[error("sending reply: {0}")]
    Send(#[from] io::Error),
}

pub struct Broker {
    socket: UdpSocket,
    store: JobStore,
}

impl Broker {
    pub async fn bind<A: ToSocketAddrs>(
        addr: A,
        store: JobStore,
    ) -> io::Result<Self> {
        let socket = UdpSocket::bind(addr).await?;
        Ok(Self { socket, store })
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.socket.local_addr()
    }

    /// Handles datagrams one at a time until `cancel` fires or reading from
    /// the socket fails.
    pub async fn run(&self, cancel: CancellationToken) -> io::Result<()> {
        info!(addr = %self.local_addr()?, "listening");

        // One byte larger than the limit, so oversize datagrams are seen as
        // such rather than silently truncated.
        let mut buf = vec![0u8; MAX_MESSAGE_SIZE + 1];
        let mut mnum: u64 = 0;

        loop {
            let (n, peer) = select! {
                recv = self.socket.recv_from(&mut buf) => match recv {
                    Ok(x) => x,
                    Err(error) if is_transient_recv_error(&error) => {
                        debug!(%error, "ignoring transient receive error");
                        continue;
                    },
                    Err(error) => return Err(error),
                },
                _ = cancel.cancelled() => return Ok(()),
            };

            mnum += 1;
            self.handle(mnum, peer, &buf[..n]).await;
        }
    }

    /// The per-datagram error boundary: failures are logged and go no
    /// further.
    #[instrument(
        name = "handle",
        skip_all,
        fields(mnum = mnum, peer = %peer, size = datagram.len())
    )]
    async fn handle(&self, mnum: u64, peer: SocketAddr, datagram: &[u8]) {
        match self.process(peer, datagram).await {
            Ok(()) => debug!("processed message"),
            Err(error) => warn!(%error, "error processing message"),
        }
    }

    async fn process(
        &self,
        peer: SocketAddr,
        datagram: &[u8],
    ) -> Result<(), DispatchError> {
        trace!(datagram = %datagram.escape_ascii(), "received datagram");

        let request = Message::try_from(datagram)?;
        debug!(
            message_type = request.tag(),
            message_key = request.key(),
            "processing message"
        );

        let now = Utc::now().timestamp();
        let reply = dispatch(&self.store, request, now).await?;

        let mut frame = reply.serialise();
        if frame.len() > MAX_MESSAGE_SIZE {
            warn!(size = frame.len(), "reply doesn't fit in a datagram");
            frame = Message::Error {
                key: reply.key().to_owned(),
                reason: REASON_TOO_LARGE.into(),
            }
            .serialise();
        }

        self.socket.send_to(&frame, peer).await?;

        Ok(())
    }
}

/// Applies a request to the store, as of `now`, and returns the reply.
///
/// Store failures are reported to the client as `error` replies. Only
/// messages that aren't requests fail.
pub async fn dispatch(
    store: &JobStore,
    request: Message,
    now: i64,
) -> Result<Message, DispatchError> {
    let reply = match request {
        Message::Ping { key } => Message::Ping { key },
        Message::Job { key, job } => match store.put(job, now).await {
            Ok(action) => Message::Success {
                key,
                action: Some(action),
            },
            Err(error) => store_failure(key, error),
        },
        Message::Reserve { key, queue } => {
            found(key, store.reserve_top(&queue, now).await)
        },
        Message::Peek { key, queue } => {
            found(key, store.peek_top(&queue, now).await)
        },
        Message::Delete { key, queue, id } => {
            match store.delete(&queue, &id).await {
                Ok(true) => Message::Success { key, action: None },
                Ok(false) => Message::Error {
                    key,
                    reason: REASON_NOT_FOUND.into(),
                },
                Err(error) => store_failure(key, error),
            }
        },
        Message::Stats { key, queue } => {
            match store.queue_stats(&queue, now).await {
                Ok(stats) => Message::QueueStats { key, stats },
                Err(error) => store_failure(key, error),
            }
        },
        other @ (Message::QueueStats { .. }
        | Message::Success { .. }
        | Message::Error { .. }) => {
            return Err(DispatchError::Unexpected(other.tag()))
        },
    };

    Ok(reply)
}

fn found(key: String, result: Result<Option<Job>, StoreError>) -> Message {
    match result {
        Ok(Some(job)) => Message::Job { key, job },
        Ok(None) => Message::Error {
            key,
            reason: REASON_EMPTY.into(),
        },
        Err(error) => store_failure(key, error),
    }
}

fn store_failure(key: String, error: StoreError) -> Message {
    let reason = match &error {
        StoreError::Invalid(_) | StoreError::TooLarge => error.to_string(),
        StoreError::Corrupt(_) | StoreError::Database(_) => {
            error!(%error, "store operation failed");
            REASON_INTERNAL.into()
        },
    };

    Message::Error { key, reason }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use tokio::time::timeout;

    use super::*;
    use crate::types::job::PutAction;
    use crate::types::protocol::MAX_KEY_LEN;

    const NOW: i64 = 1_700_000_000;

    async fn store() -> JobStore {
        JobStore::open("sqlite::memory:").await.unwrap()
    }

    fn put(key: &str, id: &str, hold_until: i64) -> Message {
        Message::Job {
            key: key.into(),
            job: Job {
                id: id.into(),
                queue: "jobs".into(),
                priority: 2.0,
                hold_until,
                ttr: 5,
                content: "payload".into(),
            },
        }
    }

    fn error(key: &str, reason: &str) -> Message {
        Message::Error {
            key: key.into(),
            reason: reason.into(),
        }
    }

    #[tokio::test]
    async fn test_dispatch() {
        let store = store().await;

        #[track_caller]
        fn expect(got: Result<Message, DispatchError>, want: Message) {
            assert_eq!(got.unwrap(), want);
        }

        expect(
            dispatch(&store, Message::Ping { key: "p".into() }, NOW).await,
            Message::Ping { key: "p".into() },
        );

        expect(
            dispatch(&store, put("k1", "j1", NOW - 1), NOW).await,
            Message::Success {
                key: "k1".into(),
                action: Some(PutAction::Created),
            },
        );
        expect(
            dispatch(&store, put("k2", "j1", NOW - 1), NOW).await,
            Message::Success {
                key: "k2".into(),
                action: Some(PutAction::Updated),
            },
        );

        let peek = Message::Peek {
            key: "k3".into(),
            queue: "jobs".into(),
        };
        let Message::Job { key, job } =
            dispatch(&store, peek, NOW).await.unwrap()
        else {
            panic!("peek should find the job");
        };
        assert_eq!(key, "k3");
        assert_eq!(job.id, "j1");

        let reserve = |key: &str| Message::Reserve {
            key: key.into(),
            queue: "jobs".into(),
        };
        let Message::Job { job, .. } =
            dispatch(&store, reserve("k4"), NOW).await.unwrap()
        else {
            panic!("reserve should find the job");
        };
        assert_eq!(job.content, "payload");
        expect(
            dispatch(&store, reserve("k5"), NOW).await,
            error("k5", "empty"),
        );

        expect(
            dispatch(
                &store,
                Message::Stats {
                    key: "k6".into(),
                    queue: "jobs".into(),
                },
                NOW,
            )
            .await,
            Message::QueueStats {
                key: "k6".into(),
                stats: crate::types::job::QueueStats {
                    queue: "jobs".into(),
                    total: 1,
                    ready: 0,
                },
            },
        );

        let delete = |key: &str, queue: &str| Message::Delete {
            key: key.into(),
            queue: queue.into(),
            id: "j1".into(),
        };
        expect(
            dispatch(&store, delete("k7", "elsewhere"), NOW).await,
            error("k7", "not found"),
        );
        expect(
            dispatch(&store, delete("k8", "jobs"), NOW).await,
            Message::Success {
                key: "k8".into(),
                action: None,
            },
        );
    }

    #[tokio::test]
    async fn test_dispatch_rejects_replies() {
        let store = store().await;

        let got = dispatch(&store, error("k", "empty"), NOW).await;
        assert!(matches!(got, Err(DispatchError::Unexpected("error"))));
    }

    #[tokio::test]
    async fn test_dispatch_reports_store_failures() {
        let store = store().await;

        let mut bad = put("k1", "j1", NOW);
        if let Message::Job { job, .. } = &mut bad {
            job.priority = f64::NAN;
        }
        assert_eq!(
            dispatch(&store, bad, NOW).await.unwrap(),
            error("k1", "invalid priority")
        );

        store.close().await;
        assert_eq!(
            dispatch(&store, put("k2", "j1", NOW), NOW).await.unwrap(),
            error("k2", "internal error")
        );
    }

    #[tokio::test]
    async fn test_stored_jobs_are_always_deliverable() {
        let store = store().await;

        // The largest put the store accepts, sent with defaults to fill in.
        let mut job = Job::new("jobs", "big", "x");
        job.hold_until = NOW - 1;
        let overhead = Message::max_job_reply_size(&Job {
            ttr: crate::types::job::DEFAULT_TTR,
            ..job.clone()
        }) - 1;
        job.content = "x".repeat(MAX_MESSAGE_SIZE - overhead);

        let put_job = |key: &str, job: &Job| Message::Job {
            key: key.into(),
            job: job.clone(),
        };
        let created = dispatch(&store, put_job("k1", &job), NOW).await.unwrap();
        assert!(matches!(created, Message::Success { .. }), "{created:?}");

        job.id = "bigger".into();
        assert_eq!(
            dispatch(&store, put_job("k2", &job), NOW).await.unwrap(),
            error("k2", "job too large")
        );

        // Reserving with the longest key still yields a sendable reply.
        let reserve = Message::Reserve {
            key: "\u{1}".repeat(MAX_KEY_LEN),
            queue: "jobs".into(),
        };
        let reply = dispatch(&store, reserve, NOW).await.unwrap();
        assert!(matches!(reply, Message::Job { .. }), "{reply:?}");
        assert!(reply.serialise().len() <= MAX_MESSAGE_SIZE);
    }

    #[tokio::test]
    async fn test_run() {
        let broker = Broker::bind("127.0.0.1:0", store().await).await.unwrap();
        let addr = broker.local_addr().unwrap();
        let cancel = CancellationToken::new();

        let running = {
            let cancel = cancel.clone();
            tokio::spawn(async move { broker.run(cancel).await })
        };

        let peer = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        peer.connect(addr).await.unwrap();

        // Garbage, unknown types and oversize datagrams go unanswered, and
        // don't stop later datagrams being handled.
        peer.send(b"\x00\x01garbage").await.unwrap();
        peer.send(b"frobnicate key=1").await.unwrap();
        peer.send(&vec![b'a'; MAX_MESSAGE_SIZE + 1]).await.unwrap();
        peer.send(b"ping key=hello\n").await.unwrap();

        let mut buf = vec![0u8; MAX_MESSAGE_SIZE + 1];
        let n = timeout(Duration::from_secs(5), peer.recv(&mut buf))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(&buf[..n], b"ping key=hello");

        cancel.cancel();
        running.await.unwrap().unwrap();
    }
}
