//! Relay session: two directional copies sharing one cancellation scope.
//!
//! Whichever direction finishes first (EOF or error) cancels the session;
//! the other direction drops its pending read or write and exits. Both
//! endpoints are closed once both directions are done.

use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::filter::ResponseFilter;

const CHUNK_SIZE: usize = 16 * 1024;

/// Upper bound for propagating a close to the destination.
const CLOSE_GRACE: Duration = Duration::from_secs(1);

type BoxReader = Box<dyn AsyncRead + Send + Unpin>;
type BoxWriter = Box<dyn AsyncWrite + Send + Unpin>;

/// One side of a relay session.
pub struct Endpoint {
    reader: BoxReader,
    writer: BoxWriter,
}

impl Endpoint {
    /// Wrap a duplex stream.
    pub fn new<S>(stream: S) -> Self
    where
        S: AsyncRead + AsyncWrite + Send + 'static,
    {
        let (reader, writer) = tokio::io::split(stream);
        Self::from_halves(reader, writer)
    }

    /// Wrap a separate reader and writer, e.g. a process's stdin and stdout.
    pub fn from_halves<R, W>(reader: R, writer: W) -> Self
    where
        R: AsyncRead + Send + Unpin + 'static,
        W: AsyncWrite + Send + Unpin + 'static,
    {
        Self {
            reader: Box::new(reader),
            writer: Box::new(writer),
        }
    }

    /// The hosting process's stdin and stdout.
    pub fn stdio() -> Self {
        Self::from_halves(tokio::io::stdin(), tokio::io::stdout())
    }
}

impl From<TcpStream> for Endpoint {
    fn from(stream: TcpStream) -> Self {
        let (reader, writer) = stream.into_split();
        Self::from_halves(reader, writer)
    }
}

/// Which side ended the session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClosedBy {
    /// Reading from endpoint `a` hit EOF or failed, or writing to `b` failed.
    A,
    /// Reading from endpoint `b` hit EOF or failed, or writing to `a` failed.
    B,
    /// The enclosing scope was cancelled.
    Scope,
}

/// Summary of a finished session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RelayOutcome {
    pub id: Uuid,
    pub a_to_b: u64,
    pub b_to_a: u64,
    pub closed_by: ClosedBy,
}

/// Bidirectional byte relay between two endpoints.
pub struct RelaySession {
    id: Uuid,
    a: Endpoint,
    b: Endpoint,
    filter: Option<Arc<dyn ResponseFilter>>,
}

impl RelaySession {
    /// `a` is the client side, `b` the server side.
    pub fn new(a: Endpoint, b: Endpoint) -> Self {
        Self {
            id: Uuid::new_v4(),
            a,
            b,
            filter: None,
        }
    }

    /// Inspect chunks read from `a` and let `filter` answer some of them.
    #[must_use]
    pub fn with_filter(mut self, filter: Arc<dyn ResponseFilter>) -> Self {
        self.filter = Some(filter);
        self
    }

    pub const fn id(&self) -> Uuid {
        self.id
    }

    /// Relay until either direction ends or `scope` is cancelled.
    ///
    /// The session runs under a child of `scope`: cancelling `scope` ends
    /// the session, ending the session never touches `scope`.
    pub async fn run(self, scope: &CancellationToken) -> RelayOutcome {
        let Self { id, a, b, filter } = self;
        let session = scope.child_token();

        let (tap, injected) = match filter {
            Some(filter) => {
                let (replies, rx) = mpsc::channel(4);
                let (drained_tx, drained) = oneshot::channel();
                (
                    Some(FilterTap {
                        filter,
                        replies,
                        drained,
                    }),
                    Some(Injected {
                        rx,
                        drained: drained_tx,
                    }),
                )
            }
            None => (None, None),
        };

        debug!(session = %id, "Relay session started");
        let forward = tokio::spawn(pump(
            id,
            "a->b",
            a.reader,
            b.writer,
            session.clone(),
            tap,
            None,
        ));
        let backward = tokio::spawn(pump(
            id,
            "b->a",
            b.reader,
            a.writer,
            session.clone(),
            None,
            injected,
        ));

        let (forward, backward) = tokio::join!(forward, backward);
        let forward = forward.unwrap_or_else(|e| DirectionReport::aborted(id, &e));
        let backward = backward.unwrap_or_else(|e| DirectionReport::aborted(id, &e));

        let closed_by = if forward.end != DirectionEnd::Cancelled {
            ClosedBy::A
        } else if backward.end != DirectionEnd::Cancelled {
            ClosedBy::B
        } else {
            ClosedBy::Scope
        };

        let outcome = RelayOutcome {
            id,
            a_to_b: forward.bytes,
            b_to_a: backward.bytes,
            closed_by,
        };
        info!(
            session = %id,
            a_to_b = outcome.a_to_b,
            b_to_a = outcome.b_to_a,
            closed_by = ?outcome.closed_by,
            "Relay session closed"
        );
        outcome
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum DirectionEnd {
    Eof,
    Failed,
    Cancelled,
}

struct DirectionReport {
    bytes: u64,
    end: DirectionEnd,
}

impl DirectionReport {
    fn aborted(id: Uuid, error: &tokio::task::JoinError) -> Self {
        warn!(session = %id, error = %error, "Relay direction aborted");
        Self {
            bytes: 0,
            end: DirectionEnd::Failed,
        }
    }
}

struct FilterTap {
    filter: Arc<dyn ResponseFilter>,
    replies: mpsc::Sender<Vec<u8>>,
    drained: oneshot::Receiver<()>,
}

impl FilterTap {
    /// Close the reply channel and wait until the opposite direction has
    /// written every queued reply.
    async fn drain(self, session: &CancellationToken) {
        let Self { replies, drained, .. } = self;
        drop(replies);
        tokio::select! {
            () = session.cancelled() => {}
            _ = tokio::time::timeout(CLOSE_GRACE, drained) => {}
        }
    }
}

/// Receiving end of a [`FilterTap`].
struct Injected {
    rx: mpsc::Receiver<Vec<u8>>,
    drained: oneshot::Sender<()>,
}

enum Step {
    Data(usize),
    Inject(Vec<u8>),
    InjectClosed,
    Stop(DirectionEnd),
}

/// Copy `reader` into `writer` until EOF, error or cancellation.
///
/// `tap` answers chunks through the opposite direction; `injected` receives
/// those answers and writes them to this direction's destination.
async fn pump(
    id: Uuid,
    direction: &'static str,
    mut reader: BoxReader,
    mut writer: BoxWriter,
    session: CancellationToken,
    tap: Option<FilterTap>,
    mut injected: Option<Injected>,
) -> DirectionReport {
    let mut buf = vec![0u8; CHUNK_SIZE];
    let mut bytes = 0u64;

    let end = loop {
        let step = tokio::select! {
            () = session.cancelled() => Step::Stop(DirectionEnd::Cancelled),
            reply = next_injected(&mut injected) => reply.map_or(Step::InjectClosed, Step::Inject),
            read = reader.read(&mut buf) => match read {
                Ok(0) => Step::Stop(DirectionEnd::Eof),
                Ok(n) => Step::Data(n),
                Err(e) => {
                    debug!(session = %id, direction, error = %e, "Read failed");
                    Step::Stop(DirectionEnd::Failed)
                }
            },
        };

        let chunk = match step {
            Step::Stop(end) => break end,
            Step::InjectClosed => {
                if let Some(done) = injected.take() {
                    done.drained.send(()).ok();
                }
                continue;
            }
            Step::Inject(reply) => {
                // Injected replies are not counted as relayed bytes
                match write_or_cancel(&mut writer, &reply, &session).await {
                    Some(Ok(())) => continue,
                    Some(Err(e)) => {
                        debug!(session = %id, direction, error = %e, "Write failed");
                        break DirectionEnd::Failed;
                    }
                    None => break DirectionEnd::Cancelled,
                }
            }
            Step::Data(n) => &buf[..n],
        };

        let chunk = match &tap {
            Some(tap) => match tap.filter.intercept(chunk) {
                Some(hit) => {
                    debug!(session = %id, direction, consumed = hit.consumed, "Answered chunk locally");
                    tokio::select! {
                        () = session.cancelled() => break DirectionEnd::Cancelled,
                        _ = tap.replies.send(hit.reply) => {}
                    }
                    &chunk[hit.consumed.min(chunk.len())..]
                }
                None => chunk,
            },
            None => chunk,
        };
        if chunk.is_empty() {
            continue;
        }

        match write_or_cancel(&mut writer, chunk, &session).await {
            Some(Ok(())) => bytes += chunk.len() as u64,
            Some(Err(e)) => {
                debug!(session = %id, direction, error = %e, "Write failed");
                break DirectionEnd::Failed;
            }
            None => break DirectionEnd::Cancelled,
        }
    };

    if end != DirectionEnd::Cancelled {
        debug!(session = %id, direction, ?end, bytes, "Direction finished, closing session");
        if let Some(tap) = tap {
            tap.drain(&session).await;
        }
        session.cancel();
        // Pass the close on to the destination; the peer may not be reading.
        tokio::time::timeout(CLOSE_GRACE, writer.shutdown()).await.ok();
    }

    DirectionReport { bytes, end }
}

async fn next_injected(injected: &mut Option<Injected>) -> Option<Vec<u8>> {
    match injected {
        Some(injected) => injected.rx.recv().await,
        None => std::future::pending().await,
    }
}

/// Write and flush `chunk`; `None` if the session was cancelled first.
async fn write_or_cancel(
    writer: &mut BoxWriter,
    chunk: &[u8],
    session: &CancellationToken,
) -> Option<std::io::Result<()>> {
    tokio::select! {
        () = session.cancelled() => None,
        result = async {
            writer.write_all(chunk).await?;
            writer.flush().await
        } => Some(result),
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::relay::filter::SocketNameOverride;
    use std::path::Path;
    use tokio::io::{DuplexStream, duplex};

    const TIMEOUT: Duration = Duration::from_secs(5);

    /// Returns (client, server, session) where the session relays between
    /// the client-facing and server-facing pipes.
    fn pipes(buffer: usize) -> (DuplexStream, DuplexStream, RelaySession) {
        let (client, a) = duplex(buffer);
        let (b, server) = duplex(buffer);
        (client, server, RelaySession::new(Endpoint::new(a), Endpoint::new(b)))
    }

    async fn read_n(stream: &mut DuplexStream, n: usize) -> Vec<u8> {
        let mut buf = vec![0u8; n];
        tokio::time::timeout(TIMEOUT, stream.read_exact(&mut buf))
            .await
            .unwrap()
            .unwrap();
        buf
    }

    #[tokio::test]
    async fn relays_both_directions() {
        let (mut client, mut server, session) = pipes(1024);
        let scope = CancellationToken::new();
        let run = tokio::spawn(async move { session.run(&scope).await });

        client.write_all(b"SERIALNO\n").await.unwrap();
        assert_eq!(read_n(&mut server, 9).await, b"SERIALNO\n");

        server.write_all(b"S SERIALNO D2760001\nOK\n").await.unwrap();
        assert_eq!(read_n(&mut client, 23).await, b"S SERIALNO D2760001\nOK\n");

        drop(client);
        let outcome = tokio::time::timeout(TIMEOUT, run).await.unwrap().unwrap();
        assert_eq!(outcome.a_to_b, 9);
        assert_eq!(outcome.b_to_a, 23);
        assert_eq!(outcome.closed_by, ClosedBy::A);
    }

    #[tokio::test]
    async fn preserves_order_of_large_transfer() {
        let (mut client, mut server, session) = pipes(4096);
        let scope = CancellationToken::new();
        let run = tokio::spawn(async move { session.run(&scope).await });

        let payload: Vec<u8> = (0..1_000_000u32).map(|i| (i % 251) as u8).collect();
        let expected = payload.clone();
        let writer = tokio::spawn(async move {
            // Include empty writes between chunks
            for chunk in payload.chunks(7919) {
                client.write_all(&[]).await.unwrap();
                client.write_all(chunk).await.unwrap();
            }
            client.shutdown().await.unwrap();
            client
        });

        let mut received = Vec::new();
        tokio::time::timeout(TIMEOUT, server.read_to_end(&mut received))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(received, expected);

        let _client = writer.await.unwrap();
        let outcome = tokio::time::timeout(TIMEOUT, run).await.unwrap().unwrap();
        assert_eq!(outcome.a_to_b, 1_000_000);
    }

    #[tokio::test]
    async fn server_eof_closes_client() {
        let (mut client, server, session) = pipes(1024);
        let scope = CancellationToken::new();
        let run = tokio::spawn(async move { session.run(&scope).await });

        drop(server);
        let mut rest = Vec::new();
        tokio::time::timeout(TIMEOUT, client.read_to_end(&mut rest))
            .await
            .unwrap()
            .unwrap();
        assert!(rest.is_empty());

        let outcome = tokio::time::timeout(TIMEOUT, run).await.unwrap().unwrap();
        assert_eq!(outcome.closed_by, ClosedBy::B);
    }

    #[tokio::test]
    async fn client_half_close_stops_server_to_client() {
        let (mut client, mut server, session) = pipes(1024);
        let scope = CancellationToken::new();
        let run = tokio::spawn(async move { session.run(&scope).await });

        client.shutdown().await.unwrap();
        let outcome = tokio::time::timeout(TIMEOUT, run).await.unwrap().unwrap();
        assert_eq!(outcome.closed_by, ClosedBy::A);

        // Server side saw EOF; anything it sends now goes nowhere
        let mut rest = Vec::new();
        server.read_to_end(&mut rest).await.unwrap();
        assert!(rest.is_empty());
        server.write_all(b"OK\n").await.ok();

        let mut to_client = Vec::new();
        tokio::time::timeout(TIMEOUT, client.read_to_end(&mut to_client))
            .await
            .unwrap()
            .unwrap();
        assert!(to_client.is_empty());
    }

    #[tokio::test]
    async fn scope_cancel_ends_session_with_pending_data() {
        let (mut client, _server, session) = pipes(64);
        let scope = CancellationToken::new();
        let session_scope = scope.clone();
        let run = tokio::spawn(async move { session.run(&session_scope).await });

        // The server never reads, so the relay blocks writing to it
        let writer = tokio::spawn(async move {
            let junk = vec![0x55u8; 64 * 1024];
            client.write_all(&junk).await.ok();
        });
        tokio::time::sleep(Duration::from_millis(50)).await;

        scope.cancel();
        let outcome = tokio::time::timeout(TIMEOUT, run).await.unwrap().unwrap();
        assert_eq!(outcome.closed_by, ClosedBy::Scope);
        assert!(outcome.a_to_b < 64 * 1024);
        tokio::time::timeout(TIMEOUT, writer).await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn ending_a_session_leaves_scope_and_siblings_alone() {
        let scope = CancellationToken::new();
        let (first_client, _first_server, first) = pipes(1024);
        let (mut second_client, mut second_server, second) = pipes(1024);

        let s1 = scope.clone();
        let first_run = tokio::spawn(async move { first.run(&s1).await });
        let s2 = scope.clone();
        let second_run = tokio::spawn(async move { second.run(&s2).await });

        drop(first_client);
        tokio::time::timeout(TIMEOUT, first_run).await.unwrap().unwrap();
        assert!(!scope.is_cancelled());

        second_client.write_all(b"RESTART\n").await.unwrap();
        assert_eq!(read_n(&mut second_server, 8).await, b"RESTART\n");

        scope.cancel();
        let outcome = tokio::time::timeout(TIMEOUT, second_run).await.unwrap().unwrap();
        assert_eq!(outcome.closed_by, ClosedBy::Scope);
    }

    #[tokio::test]
    async fn filter_answers_socket_name_locally() {
        let (mut client, mut server, session) = pipes(1024);
        let session = session.with_filter(Arc::new(SocketNameOverride::new(Path::new(
            "/home/u/.gnupg/S.scdaemon",
        ))));
        let scope = CancellationToken::new();
        let run = tokio::spawn(async move { session.run(&scope).await });

        client.write_all(b"GETINFO socket_name\n").await.unwrap();
        let expected = b"D /home/u/.gnupg/S.scdaemon\nOK\n";
        assert_eq!(read_n(&mut client, expected.len()).await, expected);

        client.write_all(b"SERIALNO\n").await.unwrap();
        assert_eq!(read_n(&mut server, 9).await, b"SERIALNO\n");

        drop(client);
        let outcome = tokio::time::timeout(TIMEOUT, run).await.unwrap().unwrap();
        // Only SERIALNO reached the server
        assert_eq!(outcome.a_to_b, 9);
        assert_eq!(outcome.b_to_a, 0);
    }

    #[tokio::test]
    async fn answered_command_survives_immediate_client_close() {
        let (mut client, mut server, session) = pipes(1024);
        let session = session.with_filter(Arc::new(SocketNameOverride::new(Path::new(
            "/home/u/.gnupg/S.scdaemon",
        ))));
        let scope = CancellationToken::new();
        let run = tokio::spawn(async move { session.run(&scope).await });

        client.write_all(b"GETINFO socket_name\n").await.unwrap();
        client.shutdown().await.unwrap();

        let mut reply = Vec::new();
        tokio::time::timeout(TIMEOUT, client.read_to_end(&mut reply))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(reply, b"D /home/u/.gnupg/S.scdaemon\nOK\n");

        let outcome = tokio::time::timeout(TIMEOUT, run).await.unwrap().unwrap();
        assert_eq!(outcome.closed_by, ClosedBy::A);
        let mut forwarded = Vec::new();
        server.read_to_end(&mut forwarded).await.unwrap();
        assert!(forwarded.is_empty());
    }
}
