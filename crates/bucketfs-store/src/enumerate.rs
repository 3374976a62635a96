//! Concurrent bucket enumeration.
//!
//! A full pass splits the key space into 256 shards by the first hash byte.
//! Shards are consumed strictly in order so records come out in ascending
//! hash order, but their page fetching overlaps: a producer enqueues one
//! result channel per shard into a bounded channel-of-channels and spawns
//! the shard's listing task; the consumer drains the channels in order. The
//! channel bound is what limits how many shard listings run at once.

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::error::{StoreError, StoreResult};
use crate::key::{fresh_within, parse_block_key, BlockKey, BLOCK_PREFIX};
use crate::state::{HashAndState, StateBuilder};
use crate::store::BucketBlockStore;

/// Streams the accumulated `(hash, state)` record of every block whose hex
/// rendering starts with `prefix_hex`, in ascending hash order.
///
/// Cancellation is checked at every page boundary and every listed entry.
pub async fn iterate_prefix(
    store: &BucketBlockStore,
    cancel: &CancellationToken,
    prefix_hex: &str,
    mut f: impl FnMut(HashAndState),
) -> StoreResult<()> {
    let bucket = store.raw_access();
    let full_prefix = format!("{}/{}", BLOCK_PREFIX, prefix_hex);
    let freshness_window = store.config().freshness_window;
    let page_size = store.config().list_page_size;

    let mut builder = StateBuilder::new(store.participant_id());
    let mut token: Option<String> = None;
    loop {
        if cancel.is_cancelled() {
            return Err(StoreError::Cancelled);
        }
        let page = bucket
            .list_page(&full_prefix, token.as_deref(), page_size)
            .await?;

        for entry in &page.entries {
            if cancel.is_cancelled() {
                return Err(StoreError::Cancelled);
            }
            let emitted = match parse_block_key(&entry.key) {
                BlockKey::Data { hash_hex } => builder.add_data(&hash_hex),
                BlockKey::Use {
                    hash_hex,
                    participant,
                } => builder.add_use(&hash_hex, &participant),
                BlockKey::Delete { hash_hex } => {
                    // stale deletion markers are leftovers from crashed
                    // reclaimers and carry no meaning
                    if fresh_within(entry.modified, freshness_window) {
                        builder.add_delete(&hash_hex)
                    } else {
                        None
                    }
                }
                BlockKey::Other => None,
            };
            if let Some(d) = emitted {
                f(d);
            }
        }

        match page.next_token {
            Some(next) => token = Some(next),
            None => break,
        }
    }

    if let Some(d) = builder.finish() {
        f(d);
    }
    Ok(())
}

/// Streams every block in the bucket, in ascending hash order, through `f`.
///
/// Shards are listed concurrently (bounded by `parallel_requests`, spread
/// over `parallel_connections` bucket handles) and merged back in shard
/// order. Any shard error aborts the whole pass.
pub async fn iterate_blocks(
    store: &BucketBlockStore,
    cancel: &CancellationToken,
    mut f: impl FnMut(HashAndState),
) -> StoreResult<()> {
    let parallel = store.config().parallel_requests.max(1);
    let mut connections = vec![store.clone()];
    for _ in 1..store.config().parallel_connections.max(1) {
        connections.push(store.reconnect()?);
    }

    let (shard_tx, mut shard_rx) =
        mpsc::channel::<mpsc::Receiver<StoreResult<HashAndState>>>(parallel.saturating_sub(1).max(1));

    let producer_cancel = cancel.clone();
    tokio::spawn(async move {
        for shard in 0u16..256 {
            if producer_cancel.is_cancelled() {
                return;
            }
            let prefix = format!("{:02x}", shard as u8);
            let (tx, rx) = mpsc::channel(1);
            if shard_tx.send(rx).await.is_err() {
                // consumer gave up
                return;
            }
            let conn = connections[shard as usize % connections.len()].clone();
            let shard_cancel = producer_cancel.clone();
            tokio::spawn(async move {
                let mut records = Vec::new();
                let result =
                    iterate_prefix(&conn, &shard_cancel, &prefix, |d| records.push(d)).await;
                for d in records {
                    if tx.send(Ok(d)).await.is_err() {
                        return;
                    }
                }
                if let Err(err) = result {
                    let _ = tx.send(Err(err)).await;
                }
            });
        }
    });

    while let Some(mut rx) = shard_rx.recv().await {
        if cancel.is_cancelled() {
            return Err(StoreError::Cancelled);
        }
        while let Some(item) = rx.recv().await {
            if cancel.is_cancelled() {
                return Err(StoreError::Cancelled);
            }
            f(item?);
        }
    }

    if cancel.is_cancelled() {
        return Err(StoreError::Cancelled);
    }
    Ok(())
}
