// Copyright (c) 2024-2025 Jesse Morgan / Morgan Forge
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Download worker and priority tests against a scripted fetcher.

mod common;

use std::time::Duration;

use common::{content, download_tunables, url, wait_until, Library, Script};
use lectern::catalog::Catalog;
use lectern::config::DownloadTunables;
use lectern::download::{DownloadQueue, DownloadWorker};
use lectern::error::DownloadError;

const SIZE: u64 = 20_000;
const JOIN_TIMEOUT: Duration = Duration::from_secs(5);

#[tokio::test]
async fn test_drains_in_queue_order() {
    let lib = Library::new(3, SIZE);
    for n in 1..=3 {
        lib.serve(n, Script::default());
    }
    for n in [3, 1, 2] {
        lib.enqueue(n);
    }

    let worker = lib.worker();
    worker.start();
    let summary = tokio::time::timeout(JOIN_TIMEOUT, worker.join())
        .await
        .expect("drain timed out")
        .expect("run result")
        .expect("drain failed");

    assert_eq!(summary.completed, vec![lib.key(3), lib.key(1), lib.key(2)]);
    assert!(summary.failed.is_empty());
    assert!(!summary.cancelled);

    let opened: Vec<_> = lib.fetcher.requests();
    assert_eq!(
        opened,
        vec![(url(3), None), (url(1), None), (url(2), None)]
    );
    for n in 1..=3 {
        assert_eq!(std::fs::read(lib.path(n)).unwrap(), content(n, SIZE));
    }
    assert!(lib.queue.read().unwrap().is_empty());
    assert!(!worker.is_active());
}

#[tokio::test]
async fn test_queue_file_reflects_completed_downloads() {
    let lib = Library::new(2, SIZE);
    lib.serve(1, Script::default());
    lib.serve(2, Script::default());
    lib.enqueue(1);
    lib.enqueue(2);

    let worker = lib.worker();
    worker.start();
    tokio::time::timeout(JOIN_TIMEOUT, worker.join()).await.unwrap();

    let reloaded = DownloadQueue::open(lib.dir.path().join("queue.json")).unwrap();
    assert!(reloaded.is_empty());
}

#[tokio::test]
async fn test_resumes_partial_file_with_range() {
    let lib = Library::new(1, SIZE);
    lib.serve(1, Script::default());
    lib.write_partial(1, 5000);
    lib.enqueue(1);

    let worker = lib.worker();
    worker.start();
    let summary = worker.join().await.unwrap().unwrap();

    assert_eq!(summary.completed, vec![lib.key(1)]);
    assert_eq!(lib.fetcher.requests(), vec![(url(1), Some(5000))]);
    assert_eq!(std::fs::read(lib.path(1)).unwrap(), content(1, SIZE));
}

#[tokio::test]
async fn test_resume_length_mismatch_restarts_from_zero() {
    let lib = Library::new(1, SIZE);
    lib.serve(
        1,
        Script {
            ignore_range: true,
            ..Script::default()
        },
    );
    lib.write_partial(1, 5000);
    lib.enqueue(1);

    let worker = lib.worker();
    worker.start();
    let summary = worker.join().await.unwrap().unwrap();

    assert_eq!(summary.completed, vec![lib.key(1)]);
    assert_eq!(
        lib.fetcher.requests(),
        vec![(url(1), Some(5000)), (url(1), None)]
    );
    assert_eq!(std::fs::read(lib.path(1)).unwrap(), content(1, SIZE));
}

#[tokio::test]
async fn test_ignored_range_with_matching_length_restarts() {
    let lib = Library::new(1, SIZE);
    // the whole file happens to be as long as the missing tail
    let served = content(1, SIZE - 5000);
    lib.fetcher.serve(
        &url(1),
        served.clone(),
        Script {
            ignore_range: true,
            ..Script::default()
        },
    );
    lib.write_partial(1, 5000);
    lib.enqueue(1);

    let worker = lib.worker();
    worker.start();
    let summary = worker.join().await.unwrap().unwrap();

    assert_eq!(summary.completed, vec![lib.key(1)]);
    assert_eq!(
        lib.fetcher.requests(),
        vec![(url(1), Some(5000)), (url(1), None)]
    );
    assert_eq!(std::fs::read(lib.path(1)).unwrap(), served);
    assert_eq!(lib.catalog.section(lib.key(1)).unwrap().size_bytes, SIZE - 5000);
}

#[tokio::test]
async fn test_repairs_catalog_size_from_server() {
    let lib = Library::new(1, SIZE);
    // server has more bytes than the catalog claims
    lib.fetcher
        .serve(&url(1), content(1, SIZE + 4000), Script::default());
    lib.enqueue(1);

    let worker = lib.worker();
    worker.start();
    let summary = worker.join().await.unwrap().unwrap();

    assert_eq!(summary.completed, vec![lib.key(1)]);
    assert_eq!(lib.catalog.section(lib.key(1)).unwrap().size_bytes, SIZE + 4000);
    assert_eq!(lib.on_disk(1), SIZE + 4000);
}

#[tokio::test]
async fn test_oversized_partial_file_restarts() {
    let lib = Library::new(1, SIZE);
    lib.serve(1, Script::default());
    let path = lib.path(1);
    std::fs::create_dir_all(path.parent().unwrap()).unwrap();
    std::fs::write(&path, vec![0u8; SIZE as usize + 10]).unwrap();
    lib.enqueue(1);

    let worker = lib.worker();
    worker.start();
    worker.join().await.unwrap().unwrap();

    assert_eq!(lib.fetcher.requests(), vec![(url(1), None)]);
    assert_eq!(std::fs::read(&path).unwrap(), content(1, SIZE));
}

#[tokio::test]
async fn test_complete_file_skips_network() {
    let lib = Library::new(1, SIZE);
    lib.write_complete(1);
    lib.enqueue(1);

    let worker = lib.worker();
    worker.start();
    let summary = worker.join().await.unwrap().unwrap();

    assert_eq!(summary.completed, vec![lib.key(1)]);
    assert!(lib.fetcher.requests().is_empty());
    assert!(!lib.is_queued(1));
}

#[tokio::test]
async fn test_failed_section_is_skipped_and_kept() {
    let lib = Library::new(2, SIZE);
    lib.serve(
        1,
        Script {
            fail_after: Some(4096),
            ..Script::default()
        },
    );
    lib.serve(2, Script::default());
    lib.enqueue(1);
    lib.enqueue(2);

    let worker = lib.worker();
    worker.start();
    let summary = worker.join().await.unwrap().unwrap();

    assert_eq!(summary.completed, vec![lib.key(2)]);
    assert_eq!(summary.failed, vec![lib.key(1)]);
    assert!(lib.is_queued(1));
    assert!(!lib.is_queued(2));
    // partial bytes stay on disk for the next attempt
    assert_eq!(lib.on_disk(1), 4096);
    assert_eq!(lib.queue.read().unwrap().get(lib.key(1)).unwrap().downloaded_bytes, 4096);
}

#[tokio::test]
async fn test_missing_content_length_fails_section() {
    let lib = Library::new(1, SIZE);
    lib.serve(
        1,
        Script {
            omit_length: true,
            ..Script::default()
        },
    );
    lib.enqueue(1);

    let worker = lib.worker();
    worker.start();
    let summary = worker.join().await.unwrap().unwrap();

    assert_eq!(summary.failed, vec![lib.key(1)]);
    assert!(lib.is_queued(1));
    assert_eq!(lib.on_disk(1), 0);
}

#[tokio::test]
async fn test_unknown_url_fails_section() {
    let lib = Library::new(1, SIZE);
    lib.enqueue(1);

    let worker = lib.worker();
    worker.start();
    let summary = worker.join().await.unwrap().unwrap();

    assert_eq!(summary.failed, vec![lib.key(1)]);
    assert!(lib.is_queued(1));
}

#[tokio::test]
async fn test_empty_queue_when_work_expected() {
    let lib = Library::new(1, SIZE);
    let worker = lib.worker();
    worker.start_expecting_work();

    let outcome = worker.join().await.expect("run result");
    assert!(matches!(outcome, Err(DownloadError::EmptyQueue)));
}

#[tokio::test]
async fn test_empty_queue_plain_start_is_fine() {
    let lib = Library::new(1, SIZE);
    let worker = lib.worker();
    worker.start();

    let summary = worker.join().await.unwrap().unwrap();
    assert!(summary.completed.is_empty());
    assert!(summary.failed.is_empty());
}

#[tokio::test]
async fn test_cancel_keeps_entry_and_progress() {
    let lib = Library::new(1, SIZE);
    lib.serve(
        1,
        Script {
            stall_after: Some(10_240),
            ..Script::default()
        },
    );
    lib.enqueue(1);

    let worker = lib.worker();
    let mut progress = worker.subscribe();
    worker.start();

    tokio::time::timeout(
        JOIN_TIMEOUT,
        progress.wait_for(|p| p.as_ref().is_some_and(|p| p.downloaded_bytes >= 10_240)),
    )
    .await
    .expect("progress timed out")
    .unwrap();
    assert_eq!(worker.current(), Some(lib.key(1)));

    worker.cancel();
    let summary = tokio::time::timeout(JOIN_TIMEOUT, worker.join())
        .await
        .expect("cancel timed out")
        .unwrap()
        .unwrap();

    assert!(summary.cancelled);
    assert!(summary.completed.is_empty());
    assert!(lib.is_queued(1));
    assert_eq!(lib.on_disk(1), 10_240);
    let reloaded = DownloadQueue::open(lib.dir.path().join("queue.json")).unwrap();
    assert_eq!(reloaded.get(lib.key(1)).unwrap().downloaded_bytes, 10_240);
    assert_eq!(worker.current(), None);
}

#[tokio::test]
async fn test_promote_preempts_current_download() {
    let lib = Library::new(3, SIZE);
    let slow = Script {
        delay: Duration::from_millis(10),
        ..Script::default()
    };
    for n in 1..=3 {
        lib.serve(n, slow.clone());
    }
    for n in 1..=3 {
        lib.enqueue(n);
    }

    let priority = lib.priority();
    let worker = priority.worker().clone();
    worker.start();
    assert!(
        wait_until(JOIN_TIMEOUT, || lib.on_disk(1) > 0).await,
        "first section never started"
    );

    priority.promote(&lib.section(3)).await.unwrap();
    assert_eq!(
        lib.queue.read().unwrap().jump_entry().map(|e| e.key()),
        Some(lib.key(3))
    );

    let summary = tokio::time::timeout(JOIN_TIMEOUT, worker.join())
        .await
        .expect("drain timed out")
        .unwrap()
        .unwrap();
    assert_eq!(summary.completed, vec![lib.key(3), lib.key(1), lib.key(2)]);

    let requests = lib.fetcher.requests();
    assert_eq!(requests[0], (url(1), None));
    assert_eq!(requests[1], (url(3), None));
    // the interrupted section resumes where it stopped
    assert_eq!(requests[2].0, url(1));
    assert!(requests[2].1.is_some_and(|start| start > 0));
    for n in 1..=3 {
        assert_eq!(std::fs::read(lib.path(n)).unwrap(), content(n, SIZE));
    }
}

#[tokio::test]
async fn test_demote_keeps_request() {
    let lib = Library::new(2, SIZE);
    lib.serve(
        1,
        Script {
            stall_after: Some(2048),
            ..Script::default()
        },
    );
    let priority = lib.priority();
    priority.promote(&lib.section(1)).await.unwrap();
    assert!(lib.queue.read().unwrap().get(lib.key(1)).unwrap().is_jump());

    priority.demote(lib.key(1)).await.unwrap();
    let queue = lib.queue.read().unwrap();
    assert!(queue.contains(lib.key(1)));
    assert!(queue.jump_entry().is_none());
    drop(queue);

    priority.worker().cancel();
}

#[tokio::test]
async fn test_cancel_request_removes_entry() {
    let lib = Library::new(2, SIZE);
    lib.enqueue(1);
    lib.enqueue(2);
    let priority = lib.priority();

    assert!(priority.cancel_request(lib.key(1)).await.unwrap());
    assert!(!priority.cancel_request(lib.key(1)).await.unwrap());
    assert!(!lib.is_queued(1));
    assert!(lib.is_queued(2));
    priority.worker().cancel();
}

#[tokio::test]
async fn test_can_buffer_enough_to_start() {
    let lib = Library::new(1, SIZE);
    let priority = lib.priority();
    let key = lib.key(1);

    assert!(!priority.can_buffer_enough_to_start(key, 0.0).unwrap());
    lib.write_partial(1, 8192);
    assert!(priority.can_buffer_enough_to_start(key, 0.0).unwrap());
    assert!(!priority.can_buffer_enough_to_start(key, 0.5).unwrap());
    lib.write_partial(1, 10_000);
    assert!(priority.can_buffer_enough_to_start(key, 0.5).unwrap());
    lib.write_complete(1);
    assert!(priority.can_buffer_enough_to_start(key, 1.0).unwrap());
}

#[tokio::test]
async fn test_wait_until_buffered_times_out() {
    let lib = Library::new(1, SIZE);
    let priority = lib.priority();
    let buffered = priority
        .wait_until_buffered(lib.key(1), 0.0, Duration::from_millis(100))
        .await
        .unwrap();
    assert!(!buffered);
}

#[tokio::test]
async fn test_demote_without_request_leaves_worker_running() {
    let lib = Library::new(2, SIZE);
    lib.serve(
        2,
        Script {
            delay: Duration::from_millis(5),
            ..Script::default()
        },
    );
    lib.enqueue(2);
    let priority = lib.priority();
    priority.worker().start();
    assert!(wait_until(JOIN_TIMEOUT, || lib.on_disk(2) > 0).await);

    // section 1 already finished, so it has no request left
    priority.demote(lib.key(1)).await.unwrap();
    assert!(priority.worker().is_active());

    let summary = tokio::time::timeout(JOIN_TIMEOUT, priority.worker().join())
        .await
        .expect("drain timed out")
        .expect("run result")
        .expect("drain failed");
    assert_eq!(summary.completed, vec![lib.key(2)]);
    assert_eq!(lib.fetcher.requests(), vec![(url(2), None)]);
}

// =============================================================================
// PROGRESS PERSISTENCE
// =============================================================================

#[tokio::test]
async fn test_progress_persisted_at_most_every_interval() {
    const PERSIST_MS: u64 = 100;
    const END: u64 = 15_360;

    let lib = Library::new(1, SIZE);
    lib.serve(
        1,
        Script {
            delay: Duration::from_millis(20),
            fail_after: Some(END),
            ..Script::default()
        },
    );
    lib.enqueue(1);
    let worker = DownloadWorker::builder(lib.queue.clone(), lib.store.clone(), lib.fetcher.clone())
        .tunables(DownloadTunables {
            progress_persist_ms: PERSIST_MS,
            ..download_tunables()
        })
        .build();

    let persisted = || {
        let queue = lib.queue.read().unwrap();
        let entry = queue.get(lib.key(1)).unwrap();
        (entry.updated_at, entry.downloaded_bytes)
    };
    let initial = persisted();
    let mut writes = vec![];

    worker.start();
    let sampler = async {
        loop {
            let current = persisted();
            if current != initial && writes.last() != Some(&current) {
                writes.push(current);
            }
            tokio::time::sleep(Duration::from_millis(2)).await;
        }
    };
    let summary = tokio::select! {
        result = worker.join() => result.unwrap().unwrap(),
        _ = sampler => unreachable!(),
    };
    let last = persisted();
    if writes.last() != Some(&last) {
        writes.push(last);
    }

    assert_eq!(summary.failed, vec![lib.key(1)]);
    // 15 chunks 20 ms apart, but far fewer writes
    assert!(writes.len() >= 2, "writes: {:?}", writes);
    assert!(writes.len() < 15, "writes: {:?}", writes);

    // throttled writes are spaced by the interval; the last one is the
    // end-of-stream write and may follow sooner
    let throttled = &writes[..writes.len() - 1];
    for pair in throttled.windows(2) {
        let gap = (pair[1].0 - pair[0].0).num_milliseconds();
        assert!(gap >= PERSIST_MS as i64 - 5, "writes {:?} only {} ms apart", pair, gap);
    }

    assert_eq!(last.1, END);
    assert_eq!(lib.on_disk(1), END);
    let reloaded = DownloadQueue::open(lib.dir.path().join("queue.json")).unwrap();
    assert_eq!(reloaded.get(lib.key(1)).unwrap().downloaded_bytes, END);
}
