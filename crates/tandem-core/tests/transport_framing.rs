//! Frame transport behavior over real loopback sockets.

use std::time::Duration;
use tandem_core::{EngineConfig, FrameTransport, Termination};
use tokio::io::AsyncWriteExt;
use tokio::net::{TcpListener, TcpStream};
use tokio::time::timeout;
use tokio_stream::StreamExt;

const WAIT: Duration = Duration::from_secs(5);

async fn socket_pair() -> (TcpStream, TcpStream) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let (client, accepted) = tokio::join!(TcpStream::connect(addr), listener.accept());
    (client.unwrap(), accepted.unwrap().0)
}

#[tokio::test]
async fn test_back_to_back_frames_arrive_separately() {
    let (mut client, server) = socket_pair().await;
    let transport = FrameTransport::new("server::d", server, &EngineConfig::default()).unwrap();
    let mut frames = transport.start().unwrap();

    client
        .write_all(b"Message1\nMessage2\nMessage3\n")
        .await
        .unwrap();

    let mut received = Vec::new();
    for _ in 0..3 {
        received.push(timeout(WAIT, frames.next()).await.unwrap().unwrap());
    }
    assert_eq!(
        received,
        vec![b"Message1".to_vec(), b"Message2".to_vec(), b"Message3".to_vec()]
    );

    transport.close().await;
}

#[tokio::test]
async fn test_frame_split_across_writes() {
    let (mut client, server) = socket_pair().await;
    let transport = FrameTransport::new("server::d", server, &EngineConfig::default()).unwrap();
    let mut frames = transport.start().unwrap();

    client.write_all(b"Mess").await.unwrap();
    client.flush().await.unwrap();
    tokio::time::sleep(Duration::from_millis(20)).await;
    client.write_all(b"age1\nMessa").await.unwrap();
    tokio::time::sleep(Duration::from_millis(20)).await;
    client.write_all(b"ge2\n").await.unwrap();

    assert_eq!(
        timeout(WAIT, frames.next()).await.unwrap(),
        Some(b"Message1".to_vec())
    );
    assert_eq!(
        timeout(WAIT, frames.next()).await.unwrap(),
        Some(b"Message2".to_vec())
    );

    transport.close().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn test_many_sends_preserve_order_and_bytes() {
    let (a, b) = socket_pair().await;
    let config = EngineConfig::default();
    let sender = FrameTransport::new("test::a", a, &config).unwrap();
    let receiver = FrameTransport::new("test::b", b, &config).unwrap();
    let _unused = sender.start().unwrap();
    let mut frames = receiver.start().unwrap();

    let payloads: Vec<Vec<u8>> = (0..500)
        .map(|i| match i % 4 {
            0 => format!("frame {i}").into_bytes(),
            1 => format!("line\nbreak {i}").into_bytes(),
            2 => format!("back\\slash\\n {i}").into_bytes(),
            _ => Vec::new(),
        })
        .collect();
    for payload in &payloads {
        sender.send(payload).unwrap();
    }

    for expected in &payloads {
        let frame = timeout(WAIT, frames.next()).await.unwrap().unwrap();
        assert_eq!(&frame, expected);
    }

    sender.close().await;
    assert_eq!(timeout(WAIT, frames.next()).await.unwrap(), None);
    assert_eq!(
        receiver.wait_for_peer(WAIT).await,
        Termination::EndOfStream
    );
    receiver.close().await;
}

#[tokio::test]
async fn test_half_close_waits_for_peer() {
    let (a, b) = socket_pair().await;
    let config = EngineConfig::default();
    let left = FrameTransport::new("test::left", a, &config).unwrap();
    let right = FrameTransport::new("test::right", b, &config).unwrap();
    let _left_frames = left.start().unwrap();
    let mut right_frames = right.start().unwrap();

    left.send(b"bye").unwrap();
    let waiting = left.wait_for_peer(WAIT);
    let answering = async {
        assert_eq!(right_frames.next().await, Some(b"bye".to_vec()));
        assert_eq!(right_frames.next().await, None);
        right.send(b"ack").unwrap();
        right.finish_sending();
    };
    let (termination, ()) = tokio::join!(waiting, answering);

    assert_eq!(termination, Termination::EndOfStream);
    assert!(!termination.is_abnormal());

    left.close().await;
    right.close().await;
}

#[tokio::test]
async fn test_close_is_idempotent_and_quiet() {
    let (a, b) = socket_pair().await;
    let transport = FrameTransport::new("test::a", a, &EngineConfig::default()).unwrap();
    let _frames = transport.start().unwrap();
    transport.send(b"pending").unwrap();

    tokio::join!(transport.close(), transport.close());
    drop(b);

    assert_eq!(transport.termination(), Some(Termination::Closed));
    assert!(transport.send(b"late").is_err());
}

#[tokio::test]
async fn test_frame_before_violation_in_same_read_is_delivered() {
    let (a, mut b) = socket_pair().await;
    let config = EngineConfig {
        max_frame_len: 4,
        ..EngineConfig::default()
    };
    let transport = FrameTransport::new("test::a", a, &config).unwrap();
    let mut frames = transport.start().unwrap();

    b.write_all(b"ok\n0123456789abcdef").await.unwrap();

    let first = timeout(WAIT, frames.next()).await.unwrap();
    assert_eq!(first, Some(b"ok".to_vec()));
    assert_eq!(timeout(WAIT, frames.next()).await.unwrap(), None);
    assert!(matches!(
        transport.termination(),
        Some(Termination::Failed(_))
    ));
}

#[tokio::test]
#[allow(deprecated)]
async fn test_peer_reset_is_abnormal() {
    let (a, b) = socket_pair().await;
    let transport = FrameTransport::new("test::a", a, &EngineConfig::default()).unwrap();
    let mut frames = transport.start().unwrap();

    b.set_linger(Some(Duration::ZERO)).unwrap();
    drop(b);

    assert_eq!(timeout(WAIT, frames.next()).await.unwrap(), None);
    let termination = transport.termination().unwrap();
    assert!(matches!(termination, Termination::Failed(_)), "{termination:?}");
    assert!(termination.is_abnormal());

    transport.close().await;
    assert!(matches!(
        transport.termination(),
        Some(Termination::Failed(_))
    ));
}
