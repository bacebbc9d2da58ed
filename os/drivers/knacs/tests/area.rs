use knacs::{DmaArea, FrameSource, HeapFrames, PageManager};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Barrier};
use std::thread;

fn manager() -> (Arc<HeapFrames>, Arc<PageManager>) {
    let frames = Arc::new(HeapFrames::new());
    let mgr = PageManager::new(Arc::clone(&frames) as Arc<dyn FrameSource>, 64).unwrap();
    (frames, mgr)
}

#[test]
fn page_five_then_page_zero() {
    let (_frames, mgr) = manager();
    let area = DmaArea::new(&mgr);

    area.get_page(5, true).unwrap();
    {
        let guard = area.lock();
        assert_eq!(guard.capacity(), 8);
        for index in 0..8 {
            assert_eq!(guard.page(index).is_some(), index == 5, "slot {index}");
        }
        guard.unlock();
    }

    area.get_page(0, true).unwrap();
    let guard = area.lock();
    assert_eq!(guard.capacity(), 8);
    assert!(guard.page(0).is_some());
    assert!(guard.page(5).is_some());
    assert_eq!(
        guard.pages().iter().filter(|slot| slot.is_some()).count(),
        2
    );
}

#[test]
fn growth_preserves_content() {
    let (_frames, mgr) = manager();
    let area = DmaArea::new(&mgr);

    for index in 0..4u8 {
        let page = area.get_page(i64::from(index), true).unwrap();
        page.write(0, &[index; 32]).unwrap();
    }
    let before: Vec<_> = (0..4).map(|i| area.get_page(i, false).unwrap()).collect();

    area.get_page(40, true).unwrap();
    assert_eq!(area.capacity(), 64);

    for (index, page) in before.iter().enumerate() {
        let again = area.get_page(index as i64, false).unwrap();
        assert!(Arc::ptr_eq(page, &again));
        let mut buf = [0u8; 32];
        again.read(0, &mut buf).unwrap();
        assert_eq!(buf, [index as u8; 32]);
    }
}

#[test]
fn concurrent_faults_allocate_once() {
    for _ in 0..50 {
        let (frames, mgr) = manager();
        let area = DmaArea::new(&mgr);
        let start = Arc::new(Barrier::new(2));

        let handles: Vec<_> = (0..2)
            .map(|_| {
                let area = Arc::clone(&area);
                let start = Arc::clone(&start);
                thread::spawn(move || {
                    start.wait();
                    area.get_page(3, true).unwrap()
                })
            })
            .collect();
        let pages: Vec<_> = handles.into_iter().map(|h| h.join().unwrap()).collect();

        assert!(Arc::ptr_eq(&pages[0], &pages[1]));
        assert_eq!(frames.allocated(), 1);
        assert_eq!(mgr.outstanding(), 1);

        drop(pages);
        drop(area);
        assert_eq!(mgr.outstanding(), 0);
    }
}

#[test]
fn many_threads_many_indices() {
    let (_frames, mgr) = manager();
    let area = DmaArea::new(&mgr);
    let threads = 8;
    let start = Arc::new(Barrier::new(threads));
    let failures = Arc::new(AtomicUsize::new(0));

    let handles: Vec<_> = (0..threads)
        .map(|t| {
            let area = Arc::clone(&area);
            let start = Arc::clone(&start);
            let failures = Arc::clone(&failures);
            thread::spawn(move || {
                start.wait();
                for i in 0..32 {
                    let index = (i * 7 + t) % 32;
                    let page = area.get_page(index as i64, true).unwrap();
                    if page.index() as usize != index {
                        failures.fetch_add(1, Ordering::Relaxed);
                    }
                }
            })
        })
        .collect();
    for h in handles {
        h.join().unwrap();
    }

    assert_eq!(failures.load(Ordering::Relaxed), 0);
    assert_eq!(area.capacity(), 32);
    assert_eq!(area.num_pages(), 32);
    assert_eq!(mgr.outstanding(), 32);
}
