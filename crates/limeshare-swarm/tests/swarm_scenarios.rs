use std::time::Duration;

use bytes::Bytes;
use limeshare_crypto::{session_id_for, KeystreamError};
use limeshare_swarm::testing::{init_test_tracing, random_file, wait_completed, MemoryNetwork};
use limeshare_swarm::{SwarmConfig, SwarmTransport, TransferError, TransferEvent, TransferOrchestrator, TransferStage};
use limeshare_types::{RelayFrame, RelayMessage, ShareLink};
use tokio::sync::mpsc;

const FILE_SIZE: usize = 1_000_000;
const FILE_CHUNKS: u32 = 62;
const DEADLINE: Duration = Duration::from_secs(30);

fn config() -> SwarmConfig {
    SwarmConfig {
        sweep_interval: Duration::from_millis(100),
        request_timeout: Duration::from_millis(500),
        ..SwarmConfig::default()
    }
}

/// Wait for the first event matching `pred`.
async fn wait_for(
    events: &mut mpsc::UnboundedReceiver<TransferEvent>,
    within: Duration,
    pred: impl Fn(&TransferEvent) -> bool,
) -> Option<TransferEvent> {
    let wait = async {
        while let Some(event) = events.recv().await {
            if pred(&event) {
                return Some(event);
            }
        }
        None
    };
    tokio::time::timeout(within, wait).await.ok().flatten()
}

#[tokio::test]
async fn test_relay_only_transfer_is_byte_identical() {
    init_test_tracing();
    let net = MemoryNetwork::new().without_links();
    let mut host = TransferOrchestrator::new(net.clone(), config());
    let mut receiver = TransferOrchestrator::new(net.clone(), config());

    let data = random_file(FILE_SIZE);
    let shared = host.share("photo.raw", data.clone()).await.unwrap();
    assert_eq!(shared.id, session_id_for(&data));

    let mut incoming = receiver.receive(&shared.link.to_string()).await.unwrap();
    let done = wait_completed(&mut incoming.events, DEADLINE).await.expect("transfer completes");

    assert_eq!(done.name, "photo.raw");
    assert_eq!(done.data.len(), FILE_SIZE);
    assert!(done.data == data, "reassembled file differs from the source");
    assert_eq!(done.sources.relay, FILE_CHUNKS);
    assert_eq!(done.sources.peer, 0);

    receiver.close_all().await;
    host.close_all().await;
}

#[tokio::test]
async fn test_link_ready_mid_transfer_shares_the_load() {
    init_test_tracing();
    // Both keystreams and the first 25 chunks cross the relay before any link opens.
    let net = MemoryNetwork::new()
        .with_binary_delay(Duration::from_millis(3))
        .with_links_after(2 * u64::from(FILE_CHUNKS) + 25);
    let mut host = TransferOrchestrator::new(net.clone(), config());
    let mut receiver = TransferOrchestrator::new(net.clone(), config());

    let data = random_file(FILE_SIZE);
    let shared = host.share("photo.raw", data.clone()).await.unwrap();
    let mut incoming = receiver.receive(&shared.link.to_string()).await.unwrap();
    let done = wait_completed(&mut incoming.events, DEADLINE).await.expect("transfer completes");

    assert!(done.data == data, "reassembled file differs from the source");
    assert_eq!(done.sources.total(), FILE_CHUNKS);
    assert!(done.sources.relay > 0, "no chunk came over the relay: {:?}", done.sources);
    assert!(done.sources.peer > 0, "no chunk came over the link: {:?}", done.sources);
    // The relay keeps streaming after the link fills the gaps.
    assert!(done.sources.redundant > 0, "no chunk arrived twice: {:?}", done.sources);

    receiver.close_all().await;
    host.close_all().await;
}

#[tokio::test]
async fn test_two_receivers_share_one_swarm() {
    init_test_tracing();
    let net = MemoryNetwork::new().with_binary_delay(Duration::from_millis(1));
    let mut host = TransferOrchestrator::new(net.clone(), config());
    let mut first = TransferOrchestrator::new(net.clone(), config());
    let mut second = TransferOrchestrator::new(net.clone(), config());

    let data = random_file(300_000);
    let shared = host.share("notes.tar", data.clone()).await.unwrap();
    let link = shared.link.to_string();

    let mut a = first.receive(&link).await.unwrap();
    tokio::time::sleep(Duration::from_millis(20)).await;
    let mut b = second.receive(&link).await.unwrap();

    let (done_a, done_b) = tokio::join!(
        wait_completed(&mut a.events, DEADLINE),
        wait_completed(&mut b.events, DEADLINE)
    );
    let done_a = done_a.expect("first receiver completes");
    let done_b = done_b.expect("second receiver completes");
    assert!(done_a.data == data);
    assert!(done_b.data == data);
    assert_eq!(done_b.sources.total(), 19);
    assert_eq!(net.room_size(&shared.id.room()), 3);

    first.close_all().await;
    second.close_all().await;
    host.close_all().await;
}

#[tokio::test]
async fn test_late_requesters_all_get_keystream_b() {
    init_test_tracing();
    let net = MemoryNetwork::new().with_binary_delay(Duration::from_millis(2));
    let mut host = TransferOrchestrator::new(net.clone(), config());
    let mut receivers: Vec<_> = (0..3).map(|_| TransferOrchestrator::new(net.clone(), config())).collect();

    let data = random_file(FILE_SIZE);
    let shared = host.share("photo.raw", data.clone()).await.unwrap();
    let link = shared.link.to_string();

    let mut first = receivers[0].receive(&link).await.unwrap();
    let streaming = wait_for(&mut first.events, DEADLINE, |e| {
        matches!(e, TransferEvent::Progress(p) if p.stage == TransferStage::Transferring)
    })
    .await;
    assert!(streaming.is_some(), "first receiver never got its keys");

    // Both ask while the first stream is still running.
    let mut second = receivers[1].receive(&link).await.unwrap();
    let mut third = receivers[2].receive(&link).await.unwrap();

    let (a, b, c) = tokio::join!(
        wait_completed(&mut first.events, DEADLINE),
        wait_completed(&mut second.events, DEADLINE),
        wait_completed(&mut third.events, DEADLINE)
    );
    for done in [a, b, c] {
        let done = done.expect("every receiver completes");
        assert!(done.data == data, "reassembled file differs from the source");
        assert_eq!(done.sources.total(), FILE_CHUNKS);
    }

    for receiver in &mut receivers {
        receiver.close_all().await;
    }
    host.close_all().await;
}

#[tokio::test]
async fn test_staggered_joiners_during_stream() {
    init_test_tracing();
    let net = MemoryNetwork::new().with_binary_delay(Duration::from_millis(2));
    let mut host = TransferOrchestrator::new(net.clone(), config());
    let mut receivers: Vec<_> = (0..4).map(|_| TransferOrchestrator::new(net.clone(), config())).collect();

    let data = random_file(FILE_SIZE);
    let shared = host.share("photo.raw", data.clone()).await.unwrap();
    let link = shared.link.to_string();

    let mut incoming = Vec::new();
    for receiver in &mut receivers {
        incoming.push(receiver.receive(&link).await.unwrap());
        tokio::time::sleep(Duration::from_millis(15)).await;
    }

    let results = futures_util::future::join_all(
        incoming.iter_mut().map(|session| wait_completed(&mut session.events, DEADLINE)),
    )
    .await;
    for (n, done) in results.into_iter().enumerate() {
        let done = done.unwrap_or_else(|| panic!("receiver {n} never completed"));
        assert!(done.data == data, "receiver {n} reassembled a different file");
        assert_eq!(done.sources.total(), FILE_CHUNKS);
    }
    assert_eq!(net.room_size(&shared.id.room()), 5);

    for receiver in &mut receivers {
        receiver.close_all().await;
    }
    host.close_all().await;
}

#[tokio::test]
async fn test_absurd_metadata_leaves_receiver_waiting() {
    init_test_tracing();
    let net = MemoryNetwork::new();
    let mut receiver = TransferOrchestrator::new(net.clone(), config());
    let data = random_file(100_000);
    let link = ShareLink::new(session_id_for(&data), "real.bin");

    let mut incoming = receiver.receive(&link.to_string()).await.unwrap();
    wait_for(&mut incoming.events, DEADLINE, |e| matches!(e, TransferEvent::SenderOffline))
        .await
        .unwrap();

    // Another room member announcing files that cannot be real.
    let rogue = net.open_relay(link.session_id.room()).await.unwrap();
    let bogus = [
        (4_000_000_000, 4_000_000_000, 1),
        (100_000, 7, 1024),
        (u64::MAX / 2, 12, 16_384),
        (100_000, 4_000_000_000, 16_384),
    ];
    for (size, total_chunks, chunk_size) in bogus {
        rogue
            .sender
            .send_control(RelayMessage::FileStart {
                name: "real.bin".into(),
                size,
                total_chunks,
                session: link.session_id.clone(),
                chunk_size,
            })
            .unwrap();
    }
    rogue.sender.send(RelayFrame::Binary(Bytes::from_static(b"junk"))).unwrap();
    tokio::time::sleep(Duration::from_millis(50)).await;

    let mut host = TransferOrchestrator::new(net.clone(), config());
    host.share("real.bin", data.clone()).await.unwrap();
    let done = wait_completed(&mut incoming.events, DEADLINE).await.expect("transfer completes");
    assert!(done.data == data);

    drop(rogue);
    receiver.close_all().await;
    host.close_all().await;
}

#[tokio::test]
async fn test_oversized_file_refused_before_relay() {
    let net = MemoryNetwork::new();
    let config = SwarmConfig {
        max_chunks: 2,
        ..config()
    };
    let mut host = TransferOrchestrator::new(net.clone(), config);
    match host.share("big.bin", random_file(40_000)).await {
        Err(TransferError::FileTooLarge { size, max_chunks }) => {
            assert_eq!(size, 40_000);
            assert_eq!(max_chunks, 2);
        }
        other => panic!("expected FileTooLarge, got {other:?}"),
    }
    assert_eq!(net.relay_opens(), 0);
}

#[tokio::test]
async fn test_provider_failure_aborts_before_streaming() {
    init_test_tracing();
    let net = MemoryNetwork::new().fail_provider_after(10, 1011);
    let mut host = TransferOrchestrator::new(net.clone(), config());

    let err = host.share("photo.raw", random_file(FILE_SIZE)).await.unwrap_err();
    match err {
        TransferError::KeyAcquisition(KeystreamError::AbnormalClose { code, received }) => {
            assert_eq!(code, 1011);
            assert_eq!(received, 10);
        }
        other => panic!("expected a key acquisition failure, got {other:?}"),
    }
    // Nothing was ever sent: the relay room was never joined.
    assert_eq!(net.relay_opens(), 0);
    assert!(host.active_sessions().is_empty());
}

#[tokio::test]
async fn test_empty_file_rejected() {
    let net = MemoryNetwork::new();
    let mut host = TransferOrchestrator::new(net.clone(), config());
    assert!(matches!(
        host.share("empty.txt", Bytes::new()).await,
        Err(TransferError::EmptyFile)
    ));
    assert_eq!(net.relay_opens(), 0);
}

#[tokio::test]
async fn test_bad_link_rejected() {
    let mut receiver = TransferOrchestrator::new(MemoryNetwork::new(), config());
    assert!(matches!(
        receiver.receive("https://example.com/file").await,
        Err(TransferError::Link(_))
    ));
}

#[tokio::test]
async fn test_one_receive_per_session() {
    init_test_tracing();
    let net = MemoryNetwork::new();
    let mut receiver = TransferOrchestrator::new(net.clone(), config());
    let data = random_file(50_000);
    let link = ShareLink::new(session_id_for(&data), "report.pdf").to_string();

    let _waiting = receiver.receive(&link).await.unwrap();
    assert!(matches!(
        receiver.receive(&link).await,
        Err(TransferError::ReceiveInProgress(_))
    ));

    let mut host = TransferOrchestrator::new(net.clone(), config());
    host.share("report.pdf", data.clone()).await.unwrap();
    assert!(matches!(
        host.share("report.pdf", data).await,
        Err(TransferError::AlreadySharing(_))
    ));

    receiver.close_all().await;
    host.close_all().await;
}

#[tokio::test]
async fn test_receiver_waits_for_late_host() {
    init_test_tracing();
    let net = MemoryNetwork::new();
    let mut receiver = TransferOrchestrator::new(net.clone(), config());
    let data = random_file(100_000);
    let link = ShareLink::new(session_id_for(&data), "late.bin").to_string();

    let mut incoming = receiver.receive(&link).await.unwrap();
    assert!(
        wait_for(&mut incoming.events, DEADLINE, |e| matches!(e, TransferEvent::SenderOffline))
            .await
            .is_some()
    );

    let mut host = TransferOrchestrator::new(net.clone(), config());
    host.share("late.bin", data.clone()).await.unwrap();

    let done = wait_completed(&mut incoming.events, DEADLINE).await.expect("transfer completes");
    assert!(done.data == data);

    receiver.close_all().await;
    host.close_all().await;
}

#[tokio::test]
async fn test_progress_reaches_complete() {
    init_test_tracing();
    let net = MemoryNetwork::new().without_links();
    let mut host = TransferOrchestrator::new(net.clone(), config());
    let mut receiver = TransferOrchestrator::new(net.clone(), config());

    let shared = host.share("small.bin", random_file(40_000)).await.unwrap();
    let mut incoming = receiver.receive(&shared.link.to_string()).await.unwrap();

    let mut last_percent = 0.0;
    let mut reached_complete = false;
    let wait = async {
        while let Some(event) = incoming.events.recv().await {
            match event {
                TransferEvent::Progress(p) if p.stage == TransferStage::Transferring => {
                    assert!(p.percent >= last_percent, "progress went backwards");
                    last_percent = p.percent;
                }
                TransferEvent::Progress(p) if p.stage == TransferStage::Complete => {
                    assert_eq!(p.percent, 100.0);
                    assert_eq!(p.sources.total(), 3);
                    reached_complete = true;
                }
                TransferEvent::Completed(_) => break,
                TransferEvent::Failed(e) => panic!("transfer failed: {e}"),
                _ => {}
            }
        }
    };
    tokio::time::timeout(DEADLINE, wait).await.unwrap();
    assert!(reached_complete);

    receiver.close_all().await;
    host.close_all().await;
}

#[tokio::test]
async fn test_relay_loss_fails_receiver() {
    init_test_tracing();
    let net = MemoryNetwork::new();
    let mut receiver = TransferOrchestrator::new(net.clone(), config());
    let data = random_file(10_000);
    let link = ShareLink::new(session_id_for(&data), "gone.bin");

    let mut incoming = receiver.receive(&link.to_string()).await.unwrap();
    wait_for(&mut incoming.events, DEADLINE, |e| matches!(e, TransferEvent::SenderOffline))
        .await
        .unwrap();

    net.drop_room(&link.session_id.room());
    let failed = wait_for(&mut incoming.events, DEADLINE, |e| matches!(e, TransferEvent::Failed(_)))
        .await
        .unwrap();
    assert!(matches!(failed, TransferEvent::Failed(TransferError::RelayClosed)));

    // The dead session no longer blocks a fresh receive.
    tokio::time::sleep(Duration::from_millis(20)).await;
    assert!(receiver.receive(&link.to_string()).await.is_ok());
    receiver.close_all().await;
}
