// Integration tests
//
// End-to-end scenarios over real TCP: bind an ephemeral listener, run
// the relay, connect with plain sockets. Everything is real except the
// completion endpoint, which is a scripted transport so tests control
// chunk timing and failure modes.

use std::collections::VecDeque;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tokio_stream::wrappers::ReceiverStream;
use tokio_util::sync::CancellationToken;

use towline::message::Turn;
use towline::pipeline::ChatSettings;
use towline::sanitize::LegacyCharsetFilter;
use towline::server::RelayServer;
use towline::upstream::{ByteStream, ChatTransport, CompletionRequest, UpstreamError};

// ---------------------------------------------------------------------------
// Infrastructure
// ---------------------------------------------------------------------------

type ChunkResult = Result<Bytes, UpstreamError>;

/// One scripted upstream response.
enum Script {
    /// Fixed chunks, delivered as fast as the reader pulls them.
    Chunks(Vec<ChunkResult>),
    /// Channel-fed stream so the test controls chunk timing.
    Wired(mpsc::Receiver<ChunkResult>),
    /// The call itself fails.
    Fail(UpstreamError),
}

/// Transport double: serves scripts in call order and records every
/// request body it saw.
struct ScriptedTransport {
    scripts: Mutex<VecDeque<Script>>,
    seen: Mutex<Vec<CompletionRequest>>,
}

impl ScriptedTransport {
    fn new() -> Arc<Self> {
        Arc::new(Self {
            scripts: Mutex::new(VecDeque::new()),
            seen: Mutex::new(Vec::new()),
        })
    }

    fn reply_chunks(&self, chunks: &[&str]) {
        let items = chunks
            .iter()
            .map(|c| Ok(Bytes::from(c.to_string())))
            .collect();
        self.scripts
            .lock()
            .unwrap()
            .push_back(Script::Chunks(items));
    }

    fn reply_wired(&self) -> mpsc::Sender<ChunkResult> {
        let (tx, rx) = mpsc::channel(16);
        self.scripts.lock().unwrap().push_back(Script::Wired(rx));
        tx
    }

    fn reply_fail(&self, error: UpstreamError) {
        self.scripts.lock().unwrap().push_back(Script::Fail(error));
    }

    fn requests(&self) -> Vec<CompletionRequest> {
        self.seen.lock().unwrap().clone()
    }
}

#[async_trait]
impl ChatTransport for ScriptedTransport {
    async fn send(&self, request: CompletionRequest) -> Result<ByteStream, UpstreamError> {
        self.seen.lock().unwrap().push(request);
        match self.scripts.lock().unwrap().pop_front() {
            Some(Script::Chunks(items)) => Ok(Box::pin(futures_util::stream::iter(items))),
            Some(Script::Wired(rx)) => Ok(Box::pin(ReceiverStream::new(rx))),
            Some(Script::Fail(e)) => Err(e),
            None => Err(UpstreamError::Transport("script exhausted".to_string())),
        }
    }
}

struct Relay {
    addr: SocketAddr,
    shutdown: CancellationToken,
    handle: JoinHandle<()>,
}

async fn start_relay(transport: Arc<ScriptedTransport>) -> Relay {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let server = RelayServer::new(
        transport,
        Arc::new(LegacyCharsetFilter),
        ChatSettings {
            model: "test-model".to_string(),
            temperature: 1.0,
        },
    );
    let shutdown = CancellationToken::new();
    let handle = tokio::spawn(server.run(listener, shutdown.clone()));
    Relay {
        addr,
        shutdown,
        handle,
    }
}

/// One `data: ` event line carrying a text delta.
fn delta(text: &str) -> String {
    let body = serde_json::json!({"choices": [{"delta": {"content": text}}]});
    format!("data: {body}\n\n")
}

const DONE: &str = "data: [DONE]\n\n";

async fn send_line(stream: &mut TcpStream, line: &str) {
    stream
        .write_all(format!("{line}\n").as_bytes())
        .await
        .unwrap();
}

/// Read until the 5-byte terminator; returns everything before it.
async fn read_turn(stream: &mut TcpStream) -> String {
    let mut buf = Vec::new();
    let mut chunk = [0u8; 256];
    loop {
        if buf.ends_with(b"/done") {
            buf.truncate(buf.len() - 5);
            return String::from_utf8(buf).unwrap();
        }
        let n = timeout(Duration::from_secs(5), stream.read(&mut chunk))
            .await
            .expect("timed out waiting for terminator")
            .expect("read failed");
        assert!(n > 0, "connection closed before terminator");
        buf.extend_from_slice(&chunk[..n]);
    }
}

/// Read exactly `expected.len()` bytes and assert they match.
async fn read_exactly(stream: &mut TcpStream, expected: &str) {
    let mut buf = vec![0u8; expected.len()];
    timeout(Duration::from_secs(5), stream.read_exact(&mut buf))
        .await
        .expect("timed out waiting for bytes")
        .expect("read failed");
    assert_eq!(String::from_utf8(buf).unwrap(), expected);
}

// ---------------------------------------------------------------------------
// Streaming turns
// ---------------------------------------------------------------------------

#[tokio::test]
async fn turn_streams_fragments_as_they_arrive_then_terminates() {
    let transport = ScriptedTransport::new();
    let feed = transport.reply_wired();
    let relay = start_relay(Arc::clone(&transport)).await;

    let mut client = TcpStream::connect(relay.addr).await.unwrap();
    send_line(&mut client, "hello").await;

    // Each fragment reaches the client before the next one even exists
    // upstream, so forwarding cannot be waiting for the full response.
    feed.send(Ok(Bytes::from(delta("Hi")))).await.unwrap();
    read_exactly(&mut client, "Hi").await;

    feed.send(Ok(Bytes::from(delta(" there")))).await.unwrap();
    read_exactly(&mut client, " there").await;

    feed.send(Ok(Bytes::from_static(DONE.as_bytes())))
        .await
        .unwrap();
    read_exactly(&mut client, "/done").await;

    // The next request carries the finished turn: raw user line, then
    // the assembled assistant reply.
    let sure = delta("Sure");
    transport.reply_chunks(&[sure.as_str(), DONE]);
    send_line(&mut client, "again").await;
    assert_eq!(read_turn(&mut client).await, "Sure");

    let requests = transport.requests();
    assert_eq!(requests.len(), 2);
    assert_eq!(requests[0].model, "test-model");
    assert!(requests[0].stream);
    assert_eq!(requests[0].messages, vec![Turn::user("hello")]);
    assert_eq!(
        requests[1].messages,
        vec![
            Turn::user("hello"),
            Turn::assistant("Hi there"),
            Turn::user("again"),
        ]
    );

    relay.shutdown.cancel();
    timeout(Duration::from_secs(5), relay.handle)
        .await
        .expect("relay did not drain")
        .unwrap();
}

#[tokio::test]
async fn upstream_failure_still_terminates_the_turn() {
    let transport = ScriptedTransport::new();
    transport.reply_fail(UpstreamError::Status {
        status: reqwest::StatusCode::INTERNAL_SERVER_ERROR,
        body: "upstream exploded".to_string(),
    });
    let relay = start_relay(Arc::clone(&transport)).await;

    let mut client = TcpStream::connect(relay.addr).await.unwrap();
    send_line(&mut client, "hello").await;

    // No fragments, just the terminator; the connection stays usable.
    assert_eq!(read_turn(&mut client).await, "");

    let ok = delta("ok");
    transport.reply_chunks(&[ok.as_str(), DONE]);
    send_line(&mut client, "second").await;
    assert_eq!(read_turn(&mut client).await, "ok");

    // The failed turn left its user line in the history, nothing else.
    let requests = transport.requests();
    assert_eq!(requests.len(), 2);
    assert_eq!(
        requests[1].messages,
        vec![Turn::user("hello"), Turn::user("second")]
    );

    drop(relay);
}

#[tokio::test]
async fn mid_stream_drop_delivers_partial_text_and_terminates() {
    let transport = ScriptedTransport::new();
    let feed = transport.reply_wired();
    let relay = start_relay(Arc::clone(&transport)).await;

    let mut client = TcpStream::connect(relay.addr).await.unwrap();
    send_line(&mut client, "hello").await;

    feed.send(Ok(Bytes::from(delta("Par")))).await.unwrap();
    feed.send(Err(UpstreamError::Transport(
        "connection reset".to_string(),
    )))
    .await
    .unwrap();

    assert_eq!(read_turn(&mut client).await, "Par");

    // The partial reply is part of the conversation from now on.
    let more = delta("more");
    transport.reply_chunks(&[more.as_str(), DONE]);
    send_line(&mut client, "go on").await;
    read_turn(&mut client).await;

    let requests = transport.requests();
    assert_eq!(
        requests[1].messages,
        vec![
            Turn::user("hello"),
            Turn::assistant("Par"),
            Turn::user("go on"),
        ]
    );

    drop(relay);
}

#[tokio::test]
async fn malformed_event_lines_do_not_break_the_turn() {
    let transport = ScriptedTransport::new();
    let ok = delta("ok");
    transport.reply_chunks(&["data: {broken json\n\n", ok.as_str(), DONE]);
    let relay = start_relay(Arc::clone(&transport)).await;

    let mut client = TcpStream::connect(relay.addr).await.unwrap();
    send_line(&mut client, "hello").await;

    assert_eq!(read_turn(&mut client).await, "ok");

    drop(relay);
}

// ---------------------------------------------------------------------------
// Sanitization
// ---------------------------------------------------------------------------

#[tokio::test]
async fn client_gets_sanitized_text_history_keeps_raw_text() {
    let transport = ScriptedTransport::new();
    let fancy = delta("café™!");
    transport.reply_chunks(&[fancy.as_str(), DONE]);
    let relay = start_relay(Arc::clone(&transport)).await;

    let mut client = TcpStream::connect(relay.addr).await.unwrap();
    send_line(&mut client, "hi").await;

    // The non-ASCII scalars never reach the socket.
    assert_eq!(read_turn(&mut client).await, "caf!");

    let next = delta("y");
    transport.reply_chunks(&[next.as_str(), DONE]);
    send_line(&mut client, "more").await;
    read_turn(&mut client).await;

    let requests = transport.requests();
    assert_eq!(requests[1].messages[1], Turn::assistant("café™!"));

    drop(relay);
}

// ---------------------------------------------------------------------------
// Connection handling
// ---------------------------------------------------------------------------

#[tokio::test]
async fn concurrent_connections_keep_separate_histories() {
    let transport = ScriptedTransport::new();
    let relay = start_relay(Arc::clone(&transport)).await;

    let mut a = TcpStream::connect(relay.addr).await.unwrap();
    let mut b = TcpStream::connect(relay.addr).await.unwrap();

    let alpha = delta("alpha");
    transport.reply_chunks(&[alpha.as_str(), DONE]);
    send_line(&mut a, "from-a").await;
    assert_eq!(read_turn(&mut a).await, "alpha");

    let beta = delta("beta");
    transport.reply_chunks(&[beta.as_str(), DONE]);
    send_line(&mut b, "from-b").await;
    assert_eq!(read_turn(&mut b).await, "beta");

    let gamma = delta("gamma");
    transport.reply_chunks(&[gamma.as_str(), DONE]);
    send_line(&mut a, "a-again").await;
    assert_eq!(read_turn(&mut a).await, "gamma");

    let requests = transport.requests();
    assert_eq!(requests.len(), 3);
    // B never saw A's turns.
    assert_eq!(requests[1].messages, vec![Turn::user("from-b")]);
    // A never saw B's, and continued its own thread.
    assert_eq!(
        requests[2].messages,
        vec![
            Turn::user("from-a"),
            Turn::assistant("alpha"),
            Turn::user("a-again"),
        ]
    );

    drop(relay);
}

#[tokio::test]
async fn empty_lines_do_not_start_turns() {
    let transport = ScriptedTransport::new();
    let hi = delta("hi");
    transport.reply_chunks(&[hi.as_str(), DONE]);
    let relay = start_relay(Arc::clone(&transport)).await;

    let mut client = TcpStream::connect(relay.addr).await.unwrap();
    client.write_all(b"\n\r\n").await.unwrap();
    send_line(&mut client, "real").await;
    assert_eq!(read_turn(&mut client).await, "hi");

    let requests = transport.requests();
    assert_eq!(requests.len(), 1);
    assert_eq!(requests[0].messages, vec![Turn::user("real")]);

    drop(relay);
}

#[tokio::test]
async fn over_long_line_without_newline_closes_the_connection() {
    let transport = ScriptedTransport::new();
    let relay = start_relay(Arc::clone(&transport)).await;

    let mut client = TcpStream::connect(relay.addr).await.unwrap();
    // Just past the 64 KiB line cap, never a newline.
    client.write_all(&vec![b'a'; 70 * 1024]).await.unwrap();

    // A clean close and a reset both mean the relay hung up on us.
    let mut buf = [0u8; 8];
    let closed = match timeout(Duration::from_secs(5), client.read(&mut buf))
        .await
        .expect("timed out waiting for close")
    {
        Ok(0) | Err(_) => true,
        Ok(_) => false,
    };
    assert!(closed, "relay kept the connection open");
    // The oversize line never became a turn.
    assert!(transport.requests().is_empty());

    drop(relay);
}

#[tokio::test]
async fn shutdown_closes_idle_connections_and_returns() {
    let transport = ScriptedTransport::new();
    let relay = start_relay(Arc::clone(&transport)).await;

    let mut idle = TcpStream::connect(relay.addr).await.unwrap();
    // Let the accept loop pick the connection up.
    tokio::time::sleep(Duration::from_millis(50)).await;

    relay.shutdown.cancel();
    timeout(Duration::from_secs(5), relay.handle)
        .await
        .expect("relay did not drain")
        .unwrap();

    // The idle connection was closed at its idle point.
    let mut buf = [0u8; 8];
    let n = timeout(Duration::from_secs(5), idle.read(&mut buf))
        .await
        .expect("timed out waiting for close")
        .expect("read failed");
    assert_eq!(n, 0);
}
