mod common;

use std::sync::Arc;
use std::time::Duration;

use common::{eventually, group_text_frame, temp_store, RecordingSink};
use meshgate::decryptor::ChannelKey;
use meshgate::processor::{HistoricalDecryptor, HistoricalStart, PacketProcessor};
use meshgate::reconcile::{PendingAcks, PendingRepeats};
use meshgate::storage::{GatewayStore, SledStore};

fn setup() -> (tempfile::TempDir, Arc<SledStore>, Arc<RecordingSink>, Arc<PacketProcessor>) {
    let (dir, store) = temp_store();
    let sink = RecordingSink::new();
    let processor = Arc::new(PacketProcessor::new(
        store.clone(),
        sink.clone(),
        Arc::new(PendingAcks::new()),
        Arc::new(PendingRepeats::new()),
    ));
    (dir, store, sink, processor)
}

#[tokio::test]
async fn new_key_recovers_stored_frames() {
    let (_dir, store, sink, processor) = setup();
    let secret = ChannelKey::from_name("#lateknown");
    let other = ChannelKey::from_name("#elsewhere");

    for (ts, text) in [(1_700_000_010u32, "ann: first"), (1_700_000_020, "ben: second")] {
        processor
            .process_raw_frame(&group_text_frame(&secret.key, ts, text), None, None)
            .unwrap();
    }
    processor
        .process_raw_frame(&group_text_frame(&other.key, 1_700_000_030, "cy: other"), None, None)
        .unwrap();
    assert_eq!(store.undecrypted_count().unwrap(), 3);
    sink.clear();

    let decryptor = HistoricalDecryptor::new(processor.clone());
    let HistoricalStart::Finished(progress) = decryptor.run(&secret).await.unwrap() else {
        panic!("foreground run finishes");
    };
    assert_eq!(progress.total, 3);
    assert_eq!(progress.processed, 3);
    assert_eq!(progress.decrypted, 2);
    assert!(!progress.in_progress);
    assert_eq!(decryptor.progress(), Some(progress));

    assert_eq!(store.undecrypted_count().unwrap(), 1);
    let leftover = store.undecrypted_packets().unwrap();
    assert_eq!(leftover[0].decrypt_attempts, 1);
    assert_eq!(sink.count("message"), 2);

    // running again only sees the frame that still fails
    let HistoricalStart::Finished(again) = decryptor.run(&secret).await.unwrap() else {
        panic!("second run finishes");
    };
    assert_eq!((again.total, again.decrypted), (1, 0));
    assert_eq!(store.counts().unwrap().messages, 2);
}

#[tokio::test]
async fn nothing_to_do_without_undecrypted_frames() {
    let (_dir, _store, _sink, processor) = setup();
    let decryptor = Arc::new(HistoricalDecryptor::new(processor));
    let key = ChannelKey::from_name("#empty");
    assert_eq!(decryptor.run(&key).await.unwrap(), HistoricalStart::NothingToDo);
    assert_eq!(decryptor.start(key).unwrap(), HistoricalStart::NothingToDo);
    assert_eq!(decryptor.progress(), None);
}

#[tokio::test]
async fn background_run_reports_progress() {
    let (_dir, store, _sink, processor) = setup();
    let key = ChannelKey::from_name("#bulk");
    for i in 0..20u32 {
        let frame = group_text_frame(&key.key, 1_700_000_000 + i, &format!("bot: reading {}", i));
        processor.process_raw_frame(&frame, None, None).unwrap();
    }

    let decryptor = Arc::new(HistoricalDecryptor::new(processor));
    assert_eq!(
        decryptor.start(key.clone()).unwrap(),
        HistoricalStart::Started { total: 20 }
    );
    let watcher = decryptor.clone();
    assert!(
        eventually(Duration::from_secs(5), || {
            watcher.progress().map(|p| !p.in_progress).unwrap_or(false)
        })
        .await
    );
    let done = decryptor.progress().expect("progress recorded");
    assert_eq!((done.processed, done.decrypted), (20, 20));
    assert_eq!(store.counts().unwrap().messages, 20);
    assert_eq!(store.undecrypted_count().unwrap(), 0);
}
