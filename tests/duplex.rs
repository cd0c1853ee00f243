//! End-to-end tests with two managers wired back to back: the open
//! handshake, duplex traffic, backpressure propagation and teardown.

mod util;

use bytes::Bytes;
use tokio::time::{Duration, timeout};
use tokio_util::sync::CancellationToken;
use util::{duplex_pair, test_config};
use wirepipe::PipeId;

#[tokio::test]
async fn open_handshake_matches_both_sides_up() {
    let (client, server) = duplex_pair(test_config());

    let client_pipe = client.rent().expect("ids available");
    let client_local = client_pipe.local_id().expect("attached");

    // The open request itself travels in the outer protocol; the peer
    // registers with the initiator's local id.
    let server_pipe = server.register(client_local).await.expect("ids available");
    timeout(Duration::from_secs(1), client_pipe.ready())
        .await
        .expect("ready resolves");

    let expected = PipeId::pack(client_local, server_pipe.local_id().expect("attached"));
    assert_eq!(client_pipe.id(), Some(expected));
    assert_eq!(server_pipe.id(), Some(expected));
}

#[tokio::test]
async fn bytes_flow_both_ways_in_order() {
    let (client, server) = duplex_pair(test_config());
    let client_pipe = client.rent().expect("ids available");
    let server_pipe = server
        .register(client_pipe.local_id().expect("attached"))
        .await
        .expect("ids available");
    client_pipe.ready().await;
    let cancel = CancellationToken::new();

    // Client to server, crossing the 64-byte chunk size.
    let request: Vec<u8> = (0..200u32).map(|n| n as u8).collect();
    client_pipe.output().write(&request).expect("writer open");
    client_pipe.output().flush(&cancel).await.expect("single flush");

    let inbound = server_pipe.input().read(&cancel).await.expect("single read");
    assert_eq!(&inbound.bytes[..], &request[..]);
    server_pipe
        .input()
        .advance(request.len() as u64, request.len() as u64)
        .expect("in range");

    // Server replies on the same pipe.
    server_pipe.output().write(b"pong").expect("writer open");
    server_pipe.output().flush(&cancel).await.expect("single flush");
    let reply = client_pipe.input().read(&cancel).await.expect("single read");
    assert_eq!(&reply.bytes[..], b"pong");
}

#[tokio::test]
async fn backpressure_propagates_to_the_remote_writer() {
    let (client, server) = duplex_pair(test_config());
    let client_pipe = client.rent().expect("ids available");
    let server_pipe = server
        .register(client_pipe.local_id().expect("attached"))
        .await
        .expect("ids available");
    client_pipe.ready().await;
    let cancel = CancellationToken::new();

    // Fill the server's inbound buffer past the high mark (80).
    client_pipe
        .output()
        .write(&vec![0u8; 100])
        .expect("writer open");
    client_pipe.output().flush(&cancel).await.expect("single flush");

    // The pause notification is dispatched asynchronously.
    timeout(Duration::from_secs(1), async {
        loop {
            if client_pipe
                .flags()
                .contains(wirepipe::PipeFlags::SERVER_REQUESTS_PAUSE)
            {
                break;
            }
            tokio::task::yield_now().await;
        }
    })
    .await
    .expect("pause reaches the client");

    // Draining below the low mark (20) resumes the client.
    let inbound = server_pipe.input().read(&cancel).await.expect("single read");
    server_pipe
        .input()
        .advance(inbound.bytes.len() as u64, inbound.bytes.len() as u64)
        .expect("in range");
    timeout(Duration::from_secs(1), async {
        loop {
            if !client_pipe
                .flags()
                .contains(wirepipe::PipeFlags::SERVER_REQUESTS_PAUSE)
            {
                break;
            }
            tokio::task::yield_now().await;
        }
    })
    .await
    .expect("resume reaches the client");
}

#[tokio::test]
async fn completing_the_client_writer_completes_the_server_reader() {
    let (client, server) = duplex_pair(test_config());
    let client_pipe = client.rent().expect("ids available");
    let server_pipe = server
        .register(client_pipe.local_id().expect("attached"))
        .await
        .expect("ids available");
    client_pipe.ready().await;
    let cancel = CancellationToken::new();

    client_pipe.output().write(b"last words").expect("writer open");
    client_pipe.output().flush(&cancel).await.expect("single flush");
    client_pipe.output().complete().await;

    let inbound = server_pipe.input().read(&cancel).await.expect("single read");
    assert_eq!(&inbound.bytes[..], b"last words");
    assert!(inbound.is_completed);

    // Closing the other direction completes both sides.
    server_pipe.output().complete().await;
    timeout(Duration::from_secs(1), client_pipe.completed())
        .await
        .expect("client sees completion");
    timeout(Duration::from_secs(1), server_pipe.completed())
        .await
        .expect("server sees completion");
    assert!(client_pipe.is_complete());
    assert!(server_pipe.is_complete());
}

#[tokio::test]
async fn many_concurrent_pipes_stay_isolated() {
    let (client, server) = duplex_pair(test_config());
    let cancel = CancellationToken::new();

    let mut pairs = Vec::new();
    for n in 0..16u8 {
        let client_pipe = client.rent().expect("ids available");
        let server_pipe = server
            .register(client_pipe.local_id().expect("attached"))
            .await
            .expect("ids available");
        client_pipe.ready().await;
        client_pipe
            .output()
            .write(&[n; 8])
            .expect("writer open");
        pairs.push((client_pipe, server_pipe));
    }

    let flushes = pairs
        .iter()
        .map(|(client_pipe, _)| client_pipe.output().flush(&cancel));
    for result in futures::future::join_all(flushes).await {
        result.expect("single flush");
    }

    for (n, (_, server_pipe)) in pairs.iter().enumerate() {
        let inbound = server_pipe.input().read(&cancel).await.expect("single read");
        assert_eq!(&inbound.bytes[..], &[u8::try_from(n).expect("fits"); 8]);
    }
}
