//! End-to-end client behaviour against a scripted peer over the in-memory transport

use bytes::{Bytes, BytesMut};
use proven_mcp::{
    ClientBuilder, ConnectionState, DisconnectReason, Error, ErrorKind, FrameCodec, McpClient,
    Message, RequestOptions, RetryPolicy, Transport, codec,
};
use proven_mcp_transport_memory::{MemoryConnector, MemoryTransport};
use std::collections::HashSet;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tokio_util::codec::Decoder;

/// The far side of a memory transport, speaking raw frames.
struct Peer {
    transport: MemoryTransport,
    framer: FrameCodec,
    buf: BytesMut,
}

impl Peer {
    fn new(transport: MemoryTransport) -> Self {
        Self {
            transport,
            framer: FrameCodec::new(),
            buf: BytesMut::new(),
        }
    }

    /// Next request from the client, or `None` once the client hung up.
    async fn recv(&mut self) -> Option<(u64, Message)> {
        loop {
            if let Some(frame) = self.framer.decode(&mut self.buf).unwrap() {
                return Some(codec::decode(&frame).unwrap());
            }
            let chunk = self.transport.read().await.ok()??;
            self.buf.extend_from_slice(&chunk);
        }
    }

    async fn reply(&self, id: u64, message: &Message) {
        self.send_raw(codec::encode(message, id).unwrap()).await;
    }

    async fn send_raw(&self, bytes: Bytes) {
        self.transport.write(bytes).await.unwrap();
    }

    async fn close(&self) {
        self.transport.close().await.unwrap();
    }
}

/// Answer every request with `respond(request)` until the client hangs up.
fn spawn_responder(
    mut peer: Peer,
    respond: impl Fn(&Message) -> Message + Send + 'static,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        while let Some((id, request)) = peer.recv().await {
            peer.reply(id, &respond(&request)).await;
        }
    })
}

fn pong(_: &Message) -> Message {
    Message::new("pong")
}

/// A connected client, the client's end of the transport and the peer.
async fn connected(builder: ClientBuilder) -> (McpClient, MemoryTransport, Peer) {
    let (client_end, peer_end) = MemoryTransport::pair();
    let client = builder.build(MemoryConnector::new([client_end.clone()]));
    client.connect().await.unwrap();
    (client, client_end, Peer::new(peer_end))
}

fn fast_retries(max_attempts: u32) -> RetryPolicy {
    RetryPolicy::default()
        .with_max_attempts(max_attempts)
        .with_base_delay(Duration::from_millis(10))
        .with_jitter(0.0)
}

#[tokio::test]
async fn test_happy_path() {
    let _ = tracing_subscriber::fmt::try_init();

    let (client, _client_end, peer) = connected(McpClient::builder()).await;
    spawn_responder(peer, pong);

    let response = client.send_message(Message::new("ping")).await.unwrap();

    assert_eq!(response.message().context(), "pong");
    assert_eq!(response.attempts(), 1);
    assert_eq!(client.pending_requests(), 0);
    assert!(client.is_connected());
}

#[tokio::test(start_paused = true)]
async fn test_timeout_without_retry() {
    let (client, _client_end, mut peer) =
        connected(McpClient::builder().retry_policy(RetryPolicy::none())).await;
    client.set_timeout(Duration::from_millis(50));

    // Swallow requests without answering
    tokio::spawn(async move { while peer.recv().await.is_some() {} });

    let start = Instant::now();
    let err = client.send_message(Message::new("ping")).await.unwrap_err();

    assert!(matches!(err, Error::Timeout(d) if d == Duration::from_millis(50)));
    assert!(start.elapsed() >= Duration::from_millis(50));
    assert!(start.elapsed() < Duration::from_millis(60));
    assert_eq!(client.pending_requests(), 0);
}

#[tokio::test(start_paused = true)]
async fn test_retry_then_success() {
    let (client, client_end, peer) =
        connected(McpClient::builder().retry_policy(fast_retries(3))).await;
    spawn_responder(peer, pong);

    client_end.fail_next_writes(2);
    let response = client.send_message(Message::new("ping")).await.unwrap();

    assert_eq!(response.message().context(), "pong");
    assert_eq!(response.attempts(), 3);
}

#[tokio::test(start_paused = true)]
async fn test_retry_reuses_correlation_id_after_timeout() {
    let (client, _client_end, mut peer) = connected(
        McpClient::builder()
            .default_timeout(Duration::from_millis(100))
            .retry_policy(fast_retries(3)),
    )
    .await;

    let handle = client.send_message_async(Message::new("ping"));

    // Ignore the first attempt, answer the second
    let (first, _) = peer.recv().await.unwrap();
    let (second, _) = peer.recv().await.unwrap();
    assert_eq!(first, second);
    peer.reply(second, &Message::new("pong")).await;

    let response = handle.await.unwrap();
    assert_eq!(response.correlation_id(), first);
    assert_eq!(response.attempts(), 2);
}

#[tokio::test(start_paused = true)]
async fn test_exhausted_retries_report_error() {
    let (client, client_end, _peer) =
        connected(McpClient::builder().retry_policy(fast_retries(2))).await;

    let (tx, mut errors) = mpsc::unbounded_channel();
    client.set_on_error(move |err| {
        let _ = tx.send(err.kind());
    });

    client_end.fail_next_writes(5);
    let err = client.send_message(Message::new("ping")).await.unwrap_err();

    assert_eq!(err.kind(), ErrorKind::Transport);
    assert_eq!(errors.recv().await, Some(ErrorKind::Transport));
    // The connection itself is fine
    assert!(client.is_connected());
}

#[tokio::test]
async fn test_malformed_frame_is_skipped() {
    let _ = tracing_subscriber::fmt::try_init();

    let (client, _client_end, mut peer) = connected(McpClient::builder()).await;

    tokio::spawn(async move {
        while let Some((id, _)) = peer.recv().await {
            let mut bad = codec::encode(&Message::new("bad"), id).unwrap().to_vec();
            bad[codec::LENGTH_PREFIX_SIZE] = 99;
            peer.send_raw(Bytes::from(bad)).await;
            peer.reply(id, &Message::new("pong")).await;
        }
    });

    let response = client.send_message(Message::new("ping")).await.unwrap();
    assert_eq!(response.message().context(), "pong");
    assert!(client.is_connected());

    // Still usable afterwards
    let response = client.send_message(Message::new("again")).await.unwrap();
    assert_eq!(response.message().context(), "pong");
}

#[tokio::test(start_paused = true)]
async fn test_malformed_response_fails_its_request() {
    let (client, _client_end, mut peer) = connected(
        McpClient::builder()
            .default_timeout(Duration::from_millis(100))
            .retry_policy(fast_retries(3)),
    )
    .await;

    let (seen_tx, mut seen) = mpsc::unbounded_channel();
    tokio::spawn(async move {
        while let Some((id, _)) = peer.recv().await {
            let _ = seen_tx.send(id);
            // Right id, but the context length runs past the frame
            let mut bad = codec::encode(&Message::new("abc"), id).unwrap().to_vec();
            let at = codec::LENGTH_PREFIX_SIZE + codec::HEADER_SIZE;
            bad[at..at + 4].copy_from_slice(&1000u32.to_be_bytes());
            peer.send_raw(Bytes::from(bad)).await;
        }
    });

    let start = Instant::now();
    let err = client.send_message(Message::new("ping")).await.unwrap_err();

    assert_eq!(err.kind(), ErrorKind::Protocol);
    assert!(start.elapsed() < Duration::from_millis(100));
    assert_eq!(client.pending_requests(), 0);
    assert!(client.is_connected());

    // Not retried
    assert!(seen.recv().await.is_some());
    assert!(seen.try_recv().is_err());
}

#[tokio::test(start_paused = true)]
async fn test_disconnect_during_backoff_drains_request() {
    let policy = RetryPolicy::default()
        .with_max_attempts(3)
        .with_base_delay(Duration::from_secs(2))
        .with_max_delay(Duration::from_secs(2))
        .with_jitter(0.0);
    let (client, client_end, _peer) = connected(McpClient::builder().retry_policy(policy)).await;

    client_end.fail_next_writes(1);
    let handle = client.send_message_async(Message::new("ping"));

    // First attempt has failed and the request is waiting to retry
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(client.pending_requests(), 1);

    let start = Instant::now();
    client.disconnect().await.unwrap();
    let err = handle.await.unwrap_err();

    assert_eq!(err.kind(), ErrorKind::ConnectionClosed);
    assert!(start.elapsed() < Duration::from_millis(100));
    assert_eq!(client.pending_requests(), 0);
}

#[tokio::test(start_paused = true)]
async fn test_cancel_during_backoff() {
    let policy = RetryPolicy::default()
        .with_max_attempts(3)
        .with_base_delay(Duration::from_secs(2))
        .with_max_delay(Duration::from_secs(2))
        .with_jitter(0.0);
    let (client, client_end, _peer) = connected(McpClient::builder().retry_policy(policy)).await;

    client_end.fail_next_writes(1);
    let handle = client.send_message_async(Message::new("ping"));
    tokio::time::sleep(Duration::from_millis(50)).await;

    let start = Instant::now();
    handle.cancel();
    assert_eq!(handle.await.unwrap_err().kind(), ErrorKind::Cancelled);
    assert!(start.elapsed() < Duration::from_millis(100));
    assert_eq!(client.pending_requests(), 0);
}

#[tokio::test]
async fn test_frames_split_across_chunks() {
    let (client, _client_end, mut peer) = connected(McpClient::builder()).await;

    tokio::spawn(async move {
        while let Some((id, request)) = peer.recv().await {
            let encoded = codec::encode(&request, id).unwrap();
            for byte in encoded.chunks(3) {
                peer.send_raw(Bytes::copy_from_slice(byte)).await;
            }
        }
    });

    let message = Message::new("echo")
        .with_content("a longer payload")
        .with_metadata("k", "v");
    let response = client.send_message(message.clone()).await.unwrap();
    assert_eq!(response.message(), &message);
}

#[tokio::test]
async fn test_concurrent_requests_resolve_independently() {
    let _ = tracing_subscriber::fmt::try_init();

    const N: usize = 100;
    let (client, _client_end, mut peer) = connected(McpClient::builder()).await;

    // Collect everything first, then answer in reverse order
    tokio::spawn(async move {
        let mut requests = Vec::with_capacity(N);
        while requests.len() < N {
            requests.push(peer.recv().await.unwrap());
        }
        for (id, request) in requests.into_iter().rev() {
            let reply = Message::new(format!("{}-reply", request.context()));
            peer.reply(id, &reply).await;
        }
    });

    let handles: Vec<_> = (0..N)
        .map(|i| client.send_message_async(Message::new(format!("req-{i}"))))
        .collect();

    let ids: HashSet<u64> = handles.iter().filter_map(|h| h.id()).collect();
    assert_eq!(ids.len(), N);

    for (i, handle) in handles.into_iter().enumerate() {
        let response = handle.await.unwrap();
        assert_eq!(response.message().context(), format!("req-{i}-reply"));
    }
    assert_eq!(client.pending_requests(), 0);
}

#[tokio::test]
async fn test_disconnect_drains_outstanding_requests() {
    let (client, _client_end, mut peer) = connected(McpClient::builder()).await;

    let (tx, mut reasons) = mpsc::unbounded_channel();
    client.set_on_disconnect(move |reason| {
        let _ = tx.send(reason.clone());
    });

    let handles: Vec<_> = (0..5)
        .map(|_| client.send_message_async(Message::new("ping")))
        .collect();
    for _ in 0..5 {
        peer.recv().await.unwrap();
    }
    assert_eq!(client.pending_requests(), 5);

    client.disconnect().await.unwrap();

    for handle in handles {
        let err = handle.await.unwrap_err();
        assert!(matches!(err, Error::ConnectionClosed(DisconnectReason::Closed)));
    }
    assert_eq!(client.pending_requests(), 0);
    assert_eq!(client.state(), ConnectionState::Disconnected);
    assert_eq!(reasons.recv().await, Some(DisconnectReason::Closed));

    // The peer sees the stream end
    assert!(peer.recv().await.is_none());
}

#[tokio::test]
async fn test_send_after_disconnect_is_not_connected() {
    let (client, _client_end, _peer) = connected(McpClient::builder()).await;
    client.disconnect().await.unwrap();

    // Closing twice is harmless
    client.disconnect().await.unwrap();

    let err = client.send_message(Message::new("ping")).await.unwrap_err();
    assert!(matches!(
        err,
        Error::NotConnected(ConnectionState::Disconnected)
    ));
}

#[tokio::test]
async fn test_cancel_discards_late_response() {
    let (client, _client_end, mut peer) = connected(McpClient::builder()).await;

    let handle = client.send_message_async(Message::new("slow"));
    let (id, _) = peer.recv().await.unwrap();
    assert_eq!(handle.id(), Some(id));

    handle.cancel();
    assert_eq!(client.pending_requests(), 0);
    assert!(matches!(handle.await, Err(Error::Cancelled)));

    // The answer arrives after all and is dropped on the floor
    peer.reply(id, &Message::new("too late")).await;

    spawn_responder(peer, pong);
    let response = client.send_message(Message::new("ping")).await.unwrap();
    assert_eq!(response.message().context(), "pong");
    assert!(client.is_connected());
}

#[tokio::test(start_paused = true)]
async fn test_late_response_after_timeout_is_discarded() {
    let (client, _client_end, mut peer) = connected(
        McpClient::builder()
            .default_timeout(Duration::from_millis(20))
            .retry_policy(RetryPolicy::none()),
    )
    .await;

    let handle = client.send_message_async(Message::new("ping"));
    let (id, _) = peer.recv().await.unwrap();
    assert_eq!(handle.await.unwrap_err().kind(), ErrorKind::Timeout);

    peer.reply(id, &Message::new("late")).await;

    let next = client.send_message_async(Message::new("next"));
    let (next_id, _) = peer.recv().await.unwrap();
    assert_ne!(next_id, id);
    peer.reply(next_id, &Message::new("fresh")).await;

    assert_eq!(next.await.unwrap().message().context(), "fresh");
}

#[tokio::test(start_paused = true)]
async fn test_set_timeout_applies_to_later_sends_only() {
    let (client, _client_end, mut peer) = connected(
        McpClient::builder()
            .default_timeout(Duration::from_secs(1))
            .retry_policy(RetryPolicy::none()),
    )
    .await;

    let early = client.send_message_async(Message::new("early"));
    let (early_id, _) = peer.recv().await.unwrap();

    client.set_timeout(Duration::from_millis(50));
    let late = client.send_message_async(Message::new("late"));
    peer.recv().await.unwrap();

    assert_eq!(late.await.unwrap_err().kind(), ErrorKind::Timeout);
    assert!(!early.is_finished());

    peer.reply(early_id, &Message::new("pong")).await;
    assert_eq!(early.await.unwrap().message().context(), "pong");
}

#[tokio::test(start_paused = true)]
async fn test_per_request_options_override_defaults() {
    let (client, _client_end, mut peer) = connected(
        McpClient::builder()
            .default_timeout(Duration::from_secs(30))
            .retry_policy(fast_retries(5)),
    )
    .await;
    tokio::spawn(async move { while peer.recv().await.is_some() {} });

    let start = Instant::now();
    let err = client
        .send_message_with_options(
            Message::new("ping"),
            RequestOptions::default()
                .with_timeout(Duration::from_millis(30))
                .with_retry_policy(RetryPolicy::none()),
        )
        .await
        .unwrap_err();

    assert_eq!(err.kind(), ErrorKind::Timeout);
    assert!(start.elapsed() < Duration::from_secs(1));
}

#[tokio::test]
async fn test_remote_close_and_reconnect() {
    let _ = tracing_subscriber::fmt::try_init();

    let (first_client_end, first_peer_end) = MemoryTransport::pair();
    let (second_client_end, second_peer_end) = MemoryTransport::pair();
    let client = McpClient::new(MemoryConnector::new([first_client_end, second_client_end]));

    let (tx, mut reasons) = mpsc::unbounded_channel();
    client.set_on_disconnect(move |reason| {
        let _ = tx.send(reason.clone());
    });

    client.connect().await.unwrap();
    let mut first = Peer::new(first_peer_end);

    let pending = client.send_message_async(Message::new("ping"));
    first.recv().await.unwrap();
    first.close().await;

    assert_eq!(reasons.recv().await, Some(DisconnectReason::RemoteClosed));
    assert!(matches!(
        pending.await,
        Err(Error::ConnectionClosed(DisconnectReason::RemoteClosed))
    ));
    assert_eq!(client.state(), ConnectionState::Disconnected);

    client.connect().await.unwrap();
    spawn_responder(Peer::new(second_peer_end), pong);

    let response = client.send_message(Message::new("ping")).await.unwrap();
    assert_eq!(response.message().context(), "pong");
}

#[tokio::test]
async fn test_connect_twice_is_invalid() {
    let (client, _client_end, _peer) = connected(McpClient::builder()).await;

    let err = client.connect().await.unwrap_err();
    assert!(matches!(
        err,
        Error::InvalidState(ConnectionState::Connected)
    ));
    assert!(client.is_connected());
}

#[tokio::test]
async fn test_connect_failure_is_reported() {
    let client = McpClient::new(MemoryConnector::default());

    let (tx, mut events) = mpsc::unbounded_channel();
    let errors = tx.clone();
    client.set_on_error(move |err| {
        let _ = errors.send(format!("error:{}", err.kind()));
    });
    client.set_on_disconnect(move |reason| {
        let _ = tx.send(format!("disconnect:{}", matches!(reason, DisconnectReason::ConnectFailed(_))));
    });

    let err = client.connect().await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Transport);
    assert_eq!(client.state(), ConnectionState::Disconnected);

    assert_eq!(events.recv().await.unwrap(), "error:transport");
    assert_eq!(events.recv().await.unwrap(), "disconnect:true");
}

#[tokio::test]
async fn test_panicking_callback_does_not_disturb_the_client() {
    let (first_client_end, first_peer_end) = MemoryTransport::pair();
    let (second_client_end, _second_peer_end) = MemoryTransport::pair();
    let client = McpClient::new(MemoryConnector::new([first_client_end, second_client_end]));

    client.set_on_connect(|| panic!("observer bug"));
    client.connect().await.unwrap();

    spawn_responder(Peer::new(first_peer_end), pong);
    let response = client.send_message(Message::new("ping")).await.unwrap();
    assert_eq!(response.message().context(), "pong");
    client.disconnect().await.unwrap();

    // A replacement callback sees the next connect
    let (tx, mut connects) = mpsc::unbounded_channel();
    client.set_on_connect(move || {
        let _ = tx.send(());
    });
    client.connect().await.unwrap();
    assert_eq!(connects.recv().await, Some(()));
}

#[tokio::test]
async fn test_dropping_client_drains_requests() {
    let (client, _client_end, mut peer) = connected(McpClient::builder()).await;

    let handle = client.send_message_async(Message::new("ping"));
    peer.recv().await.unwrap();

    drop(client);

    let err = handle.await.unwrap_err();
    assert!(matches!(
        err,
        Error::ConnectionClosed(DisconnectReason::Dropped)
    ));

    // The transport is released in the background
    assert!(peer.recv().await.is_none());
}

#[tokio::test]
async fn test_invalid_message_is_rejected_before_sending() {
    let (client, _client_end, _peer) =
        connected(McpClient::builder().max_frame_size(128)).await;

    let err = client
        .send_message(Message::new("big").with_content(vec![7u8; 1024]))
        .await
        .unwrap_err();

    assert_eq!(err.kind(), ErrorKind::Validation);
    assert_eq!(client.pending_requests(), 0);
    assert!(client.is_connected());
}
