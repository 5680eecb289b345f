use std::sync::Arc;
use std::time::Duration;

use futures_util::{pin_mut, StreamExt};
use tgstream_mtproto::emulated::EmulatedTelegram;
use tgstream_mtproto::{DcId, RpcError};
use tgstream_range::BlockPlan;
use tgstream_streamer::{StreamError, Streamer, StreamerConfig};

const MIB: u64 = 1024 * 1024;
const CHAT: i64 = -1_001_234_567_890;
const MSG: i32 = 42;

fn content(len: usize) -> Vec<u8> {
    (0..len).map(|i| (i % 251) as u8).collect()
}

fn cluster() -> EmulatedTelegram {
    EmulatedTelegram::new(DcId(2), "bot-token")
}

async fn ready_streamer(cluster: &EmulatedTelegram) -> Streamer {
    let config = StreamerConfig::new(cluster.home_dc(), "bot-token");
    let streamer = Streamer::new(Arc::new(cluster.clone()), config);
    streamer.connect_home().await.expect("home session");
    streamer
}

async fn collect(
    streamer: &Streamer,
    plan: BlockPlan,
) -> Result<Vec<u8>, StreamError> {
    let media = streamer.media(CHAT, MSG).await?;
    let stream = streamer.stream(CHAT, MSG, media, plan);
    pin_mut!(stream);
    let mut out = Vec::new();
    while let Some(item) = stream.next().await {
        out.extend_from_slice(&item?);
    }
    Ok(out)
}

#[tokio::test]
async fn full_fetch_is_byte_exact_and_block_aligned() {
    let cluster = cluster();
    let file = content(3_000_000);
    cluster.add_document(CHAT, MSG, file.clone(), "video/mp4", "movie.mp4");
    let streamer = ready_streamer(&cluster).await;

    let plan = BlockPlan::for_whole_file(file.len() as u64).unwrap();
    let got = collect(&streamer, plan).await.unwrap();
    assert_eq!(got, file);

    let calls = cluster.served_calls();
    assert_eq!(
        calls.iter().map(|c| c.offset).collect::<Vec<_>>(),
        vec![0, MIB, 2 * MIB]
    );
    for call in &calls {
        assert_eq!(call.offset % 4096, 0);
        assert_eq!(call.limit as u64, MIB);
        assert_eq!(call.dc_id, DcId(2));
    }
}

#[tokio::test]
async fn unaligned_tail_range_is_cut_exactly() {
    let cluster = cluster();
    let file = content(3_000_000);
    cluster.add_document(CHAT, MSG, file.clone(), "video/mp4", "movie.mp4");
    let streamer = ready_streamer(&cluster).await;

    let plan = BlockPlan::for_range(1_500_000, 2_500_000, file.len() as u64).unwrap();
    let got = collect(&streamer, plan).await.unwrap();
    assert_eq!(got.len(), 1_000_001);
    assert_eq!(got, &file[1_500_000..=2_500_000]);

    // Two aligned fetches, not three: the range spans one chunk boundary.
    assert_eq!(
        cluster
            .served_calls()
            .iter()
            .map(|c| c.offset)
            .collect::<Vec<_>>(),
        vec![MIB, 2 * MIB]
    );
}

#[tokio::test]
async fn tiny_interior_range_costs_one_fetch() {
    let cluster = cluster();
    let file = content(3_000_000);
    cluster.add_document(CHAT, MSG, file.clone(), "video/mp4", "movie.mp4");
    let streamer = ready_streamer(&cluster).await;

    let plan = BlockPlan::for_range(100, 200, file.len() as u64).unwrap();
    let got = collect(&streamer, plan).await.unwrap();
    assert_eq!(got, &file[100..=200]);
    assert_eq!(cluster.served_calls().len(), 1);
    assert_eq!(cluster.served_calls()[0].offset, 0);
}

#[tokio::test]
async fn migration_reroutes_the_same_part_and_memoises_the_dc() {
    let cluster = cluster();
    let file = content(2 * MIB as usize);
    cluster.add_video_on(DcId(4), CHAT, MSG, file.clone(), "movie.mp4");
    let streamer = ready_streamer(&cluster).await;

    let plan = BlockPlan::for_range(0, 2 * MIB - 1, file.len() as u64).unwrap();
    let got = collect(&streamer, plan).await.unwrap();
    assert_eq!(got, file);

    // Part 1 hit home, migrated, was re-issued on DC 4; part 2 went straight
    // to DC 4. No part was fetched twice successfully.
    assert_eq!(cluster.migration_count(), 1);
    let calls = cluster.served_calls();
    assert_eq!(calls.len(), 2);
    assert!(calls.iter().all(|c| c.dc_id == DcId(4)));
    assert_eq!(streamer.dc_map().get(CHAT, MSG), Some(DcId(4)));
    assert_eq!(cluster.export_count(), 1);
    assert_eq!(cluster.import_count(), 1);

    // A second stream uses the memoised DC: exactly one migration dance per
    // file, ever.
    let got = collect(&streamer, plan).await.unwrap();
    assert_eq!(got, file);
    assert_eq!(cluster.migration_count(), 1);
    assert_eq!(cluster.connect_count(DcId(4)), 1);
    assert_eq!(cluster.export_count(), 1);
}

#[tokio::test]
async fn expired_reference_refreshes_the_handle_mid_stream() {
    let cluster = cluster();
    let file = content(MIB as usize + 10_000);
    let media_id = cluster.add_document(CHAT, MSG, file.clone(), "video/mp4", "movie.mp4");
    let streamer = ready_streamer(&cluster).await;

    // Decode and cache the handle, then invalidate its reference.
    let stale = streamer.media(CHAT, MSG).await.unwrap();
    cluster.rotate_file_reference(media_id);

    let plan = BlockPlan::for_whole_file(file.len() as u64).unwrap();
    let stream = streamer.stream(CHAT, MSG, stale, plan);
    pin_mut!(stream);
    let mut out = Vec::new();
    while let Some(item) = stream.next().await {
        out.extend_from_slice(&item.unwrap());
    }
    assert_eq!(out, file);

    // The refreshed handle replaced the stale cache entry.
    let fresh = streamer.media(CHAT, MSG).await.unwrap();
    assert!(
        !fresh.handle.file_reference.is_empty(),
        "refreshed handle carries a reference"
    );
}

#[tokio::test(start_paused = true)]
async fn short_flood_wait_is_slept_through() {
    let cluster = cluster();
    let file = content(20_000);
    cluster.add_document(CHAT, MSG, file.clone(), "video/mp4", "movie.mp4");
    cluster.inject_get_file_error(RpcError::FloodWait { seconds: 5 });
    let streamer = ready_streamer(&cluster).await;

    let before = tokio::time::Instant::now();
    let plan = BlockPlan::for_whole_file(file.len() as u64).unwrap();
    let got = collect(&streamer, plan).await.unwrap();
    assert_eq!(got, file);
    assert!(before.elapsed() >= Duration::from_secs(5));
}

#[tokio::test(start_paused = true)]
async fn long_flood_wait_installs_backoff_and_aborts() {
    let cluster = cluster();
    let file = content(20_000);
    cluster.add_document(CHAT, MSG, file.clone(), "video/mp4", "movie.mp4");
    cluster.inject_get_file_error(RpcError::FloodWait { seconds: 120 });
    let streamer = ready_streamer(&cluster).await;

    let plan = BlockPlan::for_whole_file(file.len() as u64).unwrap();
    let err = collect(&streamer, plan).await.unwrap_err();
    assert!(
        matches!(err, StreamError::BackoffActive { dc: DcId(2), .. }),
        "{err:?}"
    );
    assert!(streamer.registry().backoff_remaining(DcId(2)).is_some());
}

#[tokio::test(start_paused = true)]
async fn transient_transport_errors_retry_with_linear_backoff() {
    let cluster = cluster();
    let file = content(20_000);
    cluster.add_document(CHAT, MSG, file.clone(), "video/mp4", "movie.mp4");
    for _ in 0..3 {
        cluster.inject_get_file_error(RpcError::Transport("connection reset".into()));
    }
    let streamer = ready_streamer(&cluster).await;

    let before = tokio::time::Instant::now();
    let plan = BlockPlan::for_whole_file(file.len() as u64).unwrap();
    let got = collect(&streamer, plan).await.unwrap();
    assert_eq!(got, file);
    // 1 s + 2 s + 3 s of linear back-off.
    assert!(before.elapsed() >= Duration::from_secs(6));
}

#[tokio::test(start_paused = true)]
async fn transport_retries_exhaust_after_five() {
    let cluster = cluster();
    let file = content(20_000);
    cluster.add_document(CHAT, MSG, file.clone(), "video/mp4", "movie.mp4");
    for _ in 0..6 {
        cluster.inject_get_file_error(RpcError::Transport("connection reset".into()));
    }
    let streamer = ready_streamer(&cluster).await;

    let plan = BlockPlan::for_whole_file(file.len() as u64).unwrap();
    let err = collect(&streamer, plan).await.unwrap_err();
    assert_eq!(
        err,
        StreamError::TransportExhausted {
            attempts: 5,
            last: "connection reset".into(),
        }
    );
}

#[tokio::test(start_paused = true)]
async fn hung_block_fetch_times_out_and_retries() {
    let cluster = cluster();
    let file = content(20_000);
    cluster.add_document(CHAT, MSG, file.clone(), "video/mp4", "movie.mp4");
    cluster.inject_get_file_hang();
    let streamer = ready_streamer(&cluster).await;

    let plan = BlockPlan::for_whole_file(file.len() as u64).unwrap();
    let got = collect(&streamer, plan).await.unwrap();
    assert_eq!(got, file);
}

#[tokio::test]
async fn upstream_eof_terminates_cleanly() {
    let cluster = cluster();
    // One chunk of real data, but a plan sized as if there were two.
    let file = content(MIB as usize);
    cluster.add_document(CHAT, MSG, file.clone(), "video/mp4", "movie.mp4");
    let streamer = ready_streamer(&cluster).await;

    let plan = BlockPlan::for_range(0, 2 * MIB - 1, 2 * MIB).unwrap();
    let got = collect(&streamer, plan).await.unwrap();
    assert_eq!(got, file);
}

#[tokio::test]
async fn missing_message_is_not_found() {
    let cluster = cluster();
    let streamer = ready_streamer(&cluster).await;
    let err = streamer.media(CHAT, MSG).await.unwrap_err();
    assert_eq!(
        err,
        StreamError::NotFound {
            chat_id: CHAT,
            message_id: MSG,
        }
    );
}
