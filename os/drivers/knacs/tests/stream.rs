#![cfg(feature = "soft-dma")]

mod common;

use common::wait_for;
use kernel_memory_addresses::PAGE_SIZE;
use knacs::{
    DmaChannel, DmaError, DmaPacket, FrameSource, HeapFrames, PageManager, SoftChannel,
    StreamConfig, StreamEngine,
};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Barrier};
use std::thread;

struct Engine {
    mgr: Arc<PageManager>,
    tx: Arc<SoftChannel>,
    rx: Arc<SoftChannel>,
    engine: StreamEngine,
}

fn engine(config: StreamConfig) -> Engine {
    engine_with(config, HeapFrames::new())
}

fn engine_with(config: StreamConfig, frames: HeapFrames) -> Engine {
    let frames: Arc<dyn FrameSource> = Arc::new(frames);
    let mgr = PageManager::new(frames, 64).unwrap();
    let tx = SoftChannel::new("axidma0").unwrap();
    let rx = SoftChannel::new("axidma1").unwrap();
    let engine = StreamEngine::start(
        config,
        Arc::clone(&mgr),
        Arc::clone(&tx) as Arc<dyn DmaChannel>,
        Arc::clone(&rx) as Arc<dyn DmaChannel>,
    )
    .unwrap();
    Engine { mgr, tx, rx, engine }
}

fn tx_packet(mgr: &Arc<PageManager>, tag: u8) -> DmaPacket {
    let packet = DmaPacket::fresh(mgr, 1).unwrap();
    packet.pages()[0].fill(tag);
    packet
}

#[test]
fn packets_are_transmitted_in_order_and_freed() {
    let e = engine(StreamConfig::default().with_receive(false));
    for tag in 0..10 {
        e.engine.send(tx_packet(&e.mgr, tag)).unwrap();
    }

    assert!(wait_for(|| e.engine.stats().sent == 10));
    assert!(wait_for(|| e.mgr.outstanding() == 0));
    let tags: Vec<u8> = e.tx.transmitted().iter().map(|bytes| bytes[0]).collect();
    assert_eq!(tags, (0..10).collect::<Vec<_>>());
    assert_eq!(e.tx.live_mappings(), 0);
}

#[test]
fn submission_failure_drops_only_that_packet() {
    let e = engine(StreamConfig::default().with_receive(false));
    e.tx.pause();
    e.tx.fail_next_submit();
    e.engine.send(tx_packet(&e.mgr, 1)).unwrap();
    assert!(wait_for(|| e.engine.stats().send_failures == 1));

    e.engine.send(tx_packet(&e.mgr, 2)).unwrap();
    assert!(wait_for(|| e.engine.depths().written_wait == 1));
    e.tx.resume();

    assert!(wait_for(|| e.engine.stats().sent == 1));
    assert!(wait_for(|| e.mgr.outstanding() == 0));
    assert_eq!(e.tx.transmitted(), vec![vec![2; PAGE_SIZE]]);
}

#[test]
fn descriptor_exhaustion_is_not_fatal() {
    let e = engine(StreamConfig::default().with_receive(false));
    e.tx.fail_next_prep();
    e.engine.send(tx_packet(&e.mgr, 1)).unwrap();
    e.engine.send(tx_packet(&e.mgr, 2)).unwrap();

    assert!(wait_for(|| {
        let stats = e.engine.stats();
        stats.send_failures + stats.sent == 2
    }));
    assert_eq!(e.engine.stats().send_failures, 1);
    assert!(wait_for(|| e.mgr.outstanding() == 0));
    assert_eq!(e.engine.depths().tx_pending(), 0);
}

#[test]
fn shutdown_with_a_pending_signal_terminates() {
    for _ in 0..20 {
        let e = engine(StreamConfig::default().with_receive(false));
        e.tx.pause();
        e.engine.send(tx_packet(&e.mgr, 7)).unwrap();
        e.engine.shutdown();

        assert_eq!(e.tx.in_flight(), 0);
        assert_eq!(e.tx.live_mappings(), 0);
        assert_eq!(e.mgr.outstanding(), 0);
        e.engine.shutdown();
    }
}

#[test]
fn no_transmit_packet_goes_missing_while_moving() {
    let e = Arc::new(engine(StreamConfig::default().with_receive(false)));
    e.tx.pause();

    let total = 200;
    let done = Arc::new(AtomicBool::new(false));
    let start = Arc::new(Barrier::new(2));

    let observer = {
        let e = Arc::clone(&e);
        let done = Arc::clone(&done);
        let start = Arc::clone(&start);
        thread::spawn(move || {
            start.wait();
            let mut seen = 0;
            while !done.load(Ordering::Acquire) {
                let pending = e.engine.depths().tx_pending();
                assert!(pending >= seen, "{pending} < {seen}");
                seen = pending;
            }
        })
    };

    start.wait();
    for tag in 0..total {
        e.engine.send(tx_packet(&e.mgr, tag as u8)).unwrap();
    }
    assert!(wait_for(|| e.engine.depths().written_wait == total));
    done.store(true, Ordering::Release);
    observer.join().unwrap();

    let depths = e.engine.depths();
    assert_eq!(depths.to_write, 0);
    assert_eq!(depths.submitting, 0);
    e.tx.resume();
    assert!(wait_for(|| e.engine.stats().sent == total as u64));
}

#[test]
fn receive_buffers_are_delivered() {
    let config = StreamConfig::default()
        .with_rx_depth(2)
        .with_rx_packet_pages(2)
        .with_rx_backlog(4);
    let e = engine(config);
    assert!(wait_for(|| e.engine.depths().to_read == 2));

    e.rx.feed(b"first frame".to_vec());
    e.rx.feed(vec![0xEE; PAGE_SIZE + 3]);

    assert!(wait_for(|| e.engine.depths().read_wait == 2));
    // Refilled behind the consumed buffers.
    assert!(wait_for(|| e.engine.depths().to_read == 2));

    let first = e.engine.try_recv().unwrap();
    assert_eq!(first.to_vec(), b"first frame");
    let second = e.engine.try_recv().unwrap();
    assert_eq!(second.len(), PAGE_SIZE + 3);
    assert!(second.to_vec().iter().all(|&b| b == 0xEE));
    assert!(e.engine.try_recv().is_none());
    assert_eq!(e.engine.stats().received, 2);

    drop((first, second));
    e.engine.shutdown();
    assert_eq!(e.mgr.outstanding(), 0);
}

#[test]
fn receive_backlog_is_bounded() {
    let config = StreamConfig::default()
        .with_rx_depth(1)
        .with_rx_packet_pages(1)
        .with_rx_backlog(2);
    let e = engine(config);

    for i in 0..5u8 {
        assert!(wait_for(|| e.engine.depths().to_read == 1));
        e.rx.feed(vec![i; 8]);
        assert!(wait_for(|| e.engine.stats().received == u64::from(i) + 1));
    }

    assert!(wait_for(|| e.engine.stats().rx_dropped == 3));
    assert_eq!(e.engine.depths().read_wait, 2);
    assert_eq!(e.engine.try_recv().unwrap().to_vec(), vec![3; 8]);
    assert_eq!(e.engine.try_recv().unwrap().to_vec(), vec![4; 8]);
}

#[test]
fn receive_without_backlog_frees_immediately() {
    let e = engine(StreamConfig::default().with_rx_depth(1).with_rx_packet_pages(1));
    assert!(wait_for(|| e.engine.depths().to_read == 1));
    e.rx.feed(vec![1; 16]);

    assert!(wait_for(|| e.engine.stats().rx_dropped == 1));
    assert!(e.engine.try_recv().is_none());
    assert!(wait_for(|| e.mgr.outstanding() == 1));
}

#[test]
fn receive_queue_recovers_once_pages_come_back() {
    let config = StreamConfig::default()
        .with_rx_depth(2)
        .with_rx_packet_pages(1)
        .with_rx_backlog(2);
    let e = engine_with(config, HeapFrames::with_limit(2));
    assert!(wait_for(|| e.engine.depths().to_read == 2));

    e.rx.feed(vec![1; 8]);
    e.rx.feed(vec![2; 8]);
    assert!(wait_for(|| e.engine.depths().read_wait == 2));
    // Both frames sit in the backlog, so the top-up has nothing to work with.
    assert_eq!(e.engine.depths().to_read, 0);

    let first = e.engine.try_recv().unwrap();
    let second = e.engine.try_recv().unwrap();
    assert_eq!(first.to_vec(), vec![1; 8]);
    assert_eq!(second.to_vec(), vec![2; 8]);
    drop((first, second));

    assert!(wait_for(|| e.engine.depths().to_read == 2));
    e.rx.feed(vec![3; 8]);
    assert!(wait_for(|| e.engine.stats().received == 3));
    assert!(wait_for(|| e.engine.depths().read_wait == 1));
    assert_eq!(e.engine.try_recv().unwrap().to_vec(), vec![3; 8]);
}

#[test]
fn send_racing_shutdown_leaves_nothing_behind() {
    for _ in 0..20 {
        let e = Arc::new(engine(StreamConfig::default().with_receive(false)));
        e.tx.pause();
        let start = Arc::new(Barrier::new(3));

        let senders: Vec<_> = (0..2)
            .map(|_| {
                let e = Arc::clone(&e);
                let start = Arc::clone(&start);
                thread::spawn(move || {
                    start.wait();
                    loop {
                        match e.engine.send(tx_packet(&e.mgr, 1)) {
                            Ok(()) => {}
                            Err(DmaError::Busy(_)) => break,
                            Err(err) => panic!("unexpected send error: {err}"),
                        }
                    }
                })
            })
            .collect();

        start.wait();
        e.engine.shutdown();
        for sender in senders {
            sender.join().unwrap();
        }

        assert_eq!(e.engine.depths().tx_pending(), 0);
        assert_eq!(e.tx.in_flight(), 0);
        assert_eq!(e.tx.live_mappings(), 0);
        assert_eq!(e.mgr.outstanding(), 0);
    }
}
