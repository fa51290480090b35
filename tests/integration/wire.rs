//! Framing behavior on real sockets.

use std::collections::HashMap;

use tokio::io::AsyncWriteExt;
use tokio::net::UnixStream;

use conductor::transport::{Connection, Message, TransportError, DEFAULT_MAX_FRAME_LEN};

use crate::fixtures::aid;

/// Test: truncated frame
/// Given a peer that announces a 100 byte frame but sends 10 bytes and hangs up
/// When the frame is read
/// Then the reader reports the truncation instead of a partial message
#[tokio::test]
async fn test_truncated_frame_is_reported() {
    let (mut raw, ours) = UnixStream::pair().unwrap();
    let mut connection = Connection::new(ours, DEFAULT_MAX_FRAME_LEN);

    raw.write_all(&100u32.to_be_bytes()).await.unwrap();
    raw.write_all(b"{\"version\"").await.unwrap();
    raw.shutdown().await.unwrap();
    drop(raw);

    match connection.recv().await {
        Err(TransportError::Truncated { expected, received }) => {
            assert_eq!(expected, 104);
            assert_eq!(received, 14);
        }
        other => panic!("expected truncation, got {:?}", other.map(|e| e.map(|e| e.message))),
    }
}

/// Test: oversized frame
/// Given a reader limited to 1 KiB frames
/// When the peer announces a larger frame
/// Then the frame is rejected before its payload is buffered
#[tokio::test]
async fn test_oversized_frame_is_rejected() {
    let (mut raw, ours) = UnixStream::pair().unwrap();
    let mut connection = Connection::new(ours, 1024);

    raw.write_all(&(64 * 1024u32).to_be_bytes()).await.unwrap();
    assert!(matches!(
        connection.recv().await,
        Err(TransportError::FrameTooLarge { len: 65536, max: 1024 })
    ));
}

/// Test: concurrent senders
/// Given four tasks sending large messages through clones of one sender
/// When the receiver reads everything
/// Then every frame arrives whole and each sender's messages stay in order
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_senders_never_interleave() {
    const SENDERS: usize = 4;
    const MESSAGES: usize = 50;

    let (left, right) = UnixStream::pair().unwrap();
    let sending = Connection::new(left, DEFAULT_MAX_FRAME_LEN);
    let mut receiving = Connection::new(right, DEFAULT_MAX_FRAME_LEN);
    let padding = "x".repeat(16 * 1024);

    let mut handles = Vec::new();
    for s in 0..SENDERS {
        let sender = sending.sender();
        let padding = padding.clone();
        handles.push(tokio::spawn(async move {
            for i in 0..MESSAGES {
                sender
                    .send(Message::SendInput {
                        agent_id: aid(&format!("s{s}")),
                        input: format!("{i}:{padding}"),
                    })
                    .await
                    .unwrap();
            }
        }));
    }

    let mut next: HashMap<String, usize> = HashMap::new();
    for _ in 0..SENDERS * MESSAGES {
        let envelope = receiving.recv().await.unwrap().unwrap();
        let Message::SendInput { agent_id, input } = envelope.message else {
            panic!("unexpected message");
        };
        let (seq, rest) = input.split_once(':').unwrap();
        assert_eq!(rest.len(), padding.len());
        let expected = next.entry(agent_id.to_string()).or_default();
        assert_eq!(seq.parse::<usize>().unwrap(), *expected);
        *expected += 1;
    }
    for handle in handles {
        handle.await.unwrap();
    }
    assert!(next.values().all(|&n| n == MESSAGES));
}
