//! 端到端流式交换：真实 TCP 连接上的拉取、推送、终止与分发隔离。

mod support;

use std::{sync::atomic::Ordering, time::Duration};

use futures::future::join_all;
use spark_stream::{
    ChannelSettings, ClientBootstrap, PeerInfo, PipelineConfig, ServerBootstrap, StreamError,
    TransferError,
    util::receive_file,
};
use support::{
    Alpha, Beta, Broken, Count, FetchFile, Fixture, Upload, client, count_chunk, pattern, serve,
    temp_path, wait_flushed,
};

const TEN_MB: usize = 10 * 1024 * 1024;
const CHUNK: usize = 64 * 1024;

#[tokio::test(flavor = "multi_thread")]
async fn ten_megabyte_file_arrives_intact_and_channel_is_reused() -> anyhow::Result<()> {
    let fixture = Fixture::new()?;
    let (server, addr) = serve(PipelineConfig::new(), fixture.registry.clone()).await?;
    let client = client(addr, PipelineConfig::new())?;
    let channel = client.connect().await?;

    let content = pattern(TEN_MB);
    let source = temp_path("ten-mb.bin");
    tokio::fs::write(&source, &content).await?;

    let mut transfer = channel
        .pull(&FetchFile(source.display().to_string()))
        .await?;
    let mut received = Vec::with_capacity(TEN_MB);
    while let Some(chunk) = transfer.next_chunk().await? {
        assert!(chunk.len() <= CHUNK, "块大小 {} 超过 64 KiB", chunk.len());
        received.extend_from_slice(&chunk);
    }
    assert_eq!(transfer.bytes_received(), TEN_MB as u64);
    assert!(received == content, "内容必须逐字节一致");
    drop(transfer);

    // 同一连接继续服务下一次拉取，这次直接落盘。
    let target = temp_path("ten-mb.copy");
    let again = channel
        .pull(&FetchFile(source.display().to_string()))
        .await?;
    let written = receive_file(again, &target).await?;
    assert_eq!(written, TEN_MB as u64);
    assert!(tokio::fs::read(&target).await? == content);
    assert!(channel.is_open());
    assert_eq!(channel.active_exchanges(), 0);

    tokio::fs::remove_file(&source).await?;
    tokio::fs::remove_file(&target).await?;
    client.release().await;
    server.release().await;
    Ok(())
}

#[tokio::test(flavor = "multi_thread")]
async fn chunks_arrive_in_write_order() -> anyhow::Result<()> {
    let fixture = Fixture::new()?;
    let (server, addr) = serve(PipelineConfig::new(), fixture.registry.clone()).await?;
    let client = client(addr, PipelineConfig::new())?;
    let channel = client.connect().await?;

    let mut transfer = channel.pull(&Count("500".to_owned())).await?;
    let mut index = 0;
    while let Some(chunk) = transfer.next_chunk().await? {
        assert_eq!(&chunk[..], count_chunk(index).as_bytes());
        index += 1;
    }
    assert_eq!(index, 500);
    assert!(transfer.is_finished());
    assert_eq!(transfer.next_chunk().await?, None);

    client.release().await;
    server.release().await;
    Ok(())
}

#[tokio::test(flavor = "multi_thread")]
async fn idle_exchange_does_not_stall_its_neighbour() -> anyhow::Result<()> {
    let fixture = Fixture::new()?;
    let (server, addr) = serve(PipelineConfig::new(), fixture.registry.clone()).await?;
    let client = client(addr, PipelineConfig::new())?;
    let channel = client.connect().await?;

    // 两次拉取都远超额度窗口；读第一个时，第二个的数据无人读取。
    let expected: String = (0..5000).map(count_chunk).collect();
    let (first, second) = tokio::time::timeout(Duration::from_secs(10), async {
        let first = channel.pull(&Count("5000".to_owned())).await?;
        let second = channel.pull(&Count("5000".to_owned())).await?;
        let first = first.read_to_end().await?;
        let second = second.read_to_end().await?;
        Ok::<_, StreamError>((first, second))
    })
    .await??;
    assert_eq!(&first[..], expected.as_bytes());
    assert_eq!(&second[..], expected.as_bytes());
    assert!(channel.is_open());

    client.release().await;
    server.release().await;
    Ok(())
}

#[tokio::test(flavor = "multi_thread")]
async fn compressed_pipeline_is_transparent_end_to_end() -> anyhow::Result<()> {
    let fixture = Fixture::new()?;
    let pipeline = PipelineConfig::new().with_compression(true);
    let (server, addr) = serve(pipeline.clone(), fixture.registry.clone()).await?;
    let client = client(addr, pipeline)?;
    let channel = client.connect().await?;

    let content = channel.pull(&Count("64".to_owned())).await?.read_to_end().await?;
    let expected: String = (0..64).map(count_chunk).collect();
    assert_eq!(&content[..], expected.as_bytes());

    let server_channel = server.channels().pop().expect("服务端持有接入连接");
    assert_eq!(server_channel.stages(), channel.stages());

    client.release().await;
    server.release().await;
    Ok(())
}

#[tokio::test(flavor = "multi_thread")]
async fn push_streams_content_to_the_server_handler() -> anyhow::Result<()> {
    let mut fixture = Fixture::new()?;
    let (server, addr) = serve(PipelineConfig::new(), fixture.registry.clone()).await?;
    let client = client(addr, PipelineConfig::new())?;
    let channel = client.connect().await?;

    let mut transfer = channel.push(&Upload("report.csv".to_owned())).await?;
    transfer.write(pattern(200_000)).await?;
    transfer.write("tail").await?;
    assert_eq!(transfer.close().await?, 200_004);

    let (name, outcome) = fixture.uploads.recv().await.expect("处理器回报结果");
    assert_eq!(name, "report.csv");
    let body = outcome?;
    assert_eq!(body.len(), 200_004);
    assert_eq!(&body[..200_000], &pattern(200_000)[..]);
    assert_eq!(&body[200_000..], b"tail");

    client.release().await;
    server.release().await;
    Ok(())
}

#[tokio::test(flavor = "multi_thread")]
async fn finished_transfers_reject_close_and_abort() -> anyhow::Result<()> {
    let mut fixture = Fixture::new()?;
    let (server, addr) = serve(PipelineConfig::new(), fixture.registry.clone()).await?;
    let client = client(addr, PipelineConfig::new())?;
    let channel = client.connect().await?;

    let mut transfer = channel.push(&Upload("twice".to_owned())).await?;
    transfer.write("once").await?;
    transfer.close().await?;
    assert_eq!(
        transfer.close().await,
        Err(TransferError::AlreadyFinished { state: "closed" })
    );
    assert_eq!(
        transfer.abort("too late").await,
        Err(TransferError::AlreadyFinished { state: "closed" })
    );
    assert!(matches!(
        transfer.write("more").await,
        Err(TransferError::AlreadyFinished { .. })
    ));

    let (_, outcome) = fixture.uploads.recv().await.expect("处理器回报结果");
    assert_eq!(&outcome?[..], b"once");

    client.release().await;
    server.release().await;
    Ok(())
}

#[tokio::test(flavor = "multi_thread")]
async fn aborts_report_immediate_or_partial_failure() -> anyhow::Result<()> {
    let mut fixture = Fixture::new()?;
    let (server, addr) = serve(PipelineConfig::new(), fixture.registry.clone()).await?;
    let client = client(addr, PipelineConfig::new())?;
    let channel = client.connect().await?;

    // 处理器一个字节都没写就终止。
    let immediate = channel.pull(&Broken("0".to_owned())).await?;
    match immediate.read_to_end().await {
        Err(TransferError::ImmediateFailure { reason }) => assert!(reason.contains("disk failure")),
        other => panic!("期望 ImmediateFailure，实际 {other:?}"),
    }

    // 处理器写出 1000 字节后终止。
    let partial = channel.pull(&Broken("1000".to_owned())).await?;
    let err = partial.read_to_end().await.unwrap_err();
    assert_eq!(err.transferred(), 1000);
    assert!(matches!(err, TransferError::PartialTransfer { .. }));

    // 推送方在刷出部分数据后终止，服务端处理器看到 PartialTransfer。
    let mut push = channel.push(&Upload("aborted".to_owned())).await?;
    push.write(pattern(4096)).await?;
    wait_flushed(&push, 4096).await;
    push.abort("client gave up").await?;
    let (name, outcome) = fixture.uploads.recv().await.expect("处理器回报结果");
    assert_eq!(name, "aborted");
    assert_eq!(
        outcome,
        Err(TransferError::PartialTransfer {
            transferred: 4096,
            reason: "client gave up".to_owned(),
        })
    );

    assert!(channel.is_open());
    client.release().await;
    server.release().await;
    Ok(())
}

#[tokio::test(flavor = "multi_thread")]
async fn unknown_or_malformed_messages_fail_only_their_exchange() -> anyhow::Result<()> {
    let fixture = Fixture::new()?;
    let (server, addr) = serve(PipelineConfig::new(), fixture.registry.clone()).await?;
    let client = client(addr, PipelineConfig::new())?;
    let channel = client.connect().await?;

    let unknown = channel.pull_raw("test.Unknown", "payload").await?;
    match unknown.read_to_end().await {
        Err(TransferError::ImmediateFailure { reason }) => {
            assert!(reason.contains("no pull handler"), "{reason}");
        }
        other => panic!("期望 ImmediateFailure，实际 {other:?}"),
    }

    let malformed = channel.pull_raw("test.Count", vec![0xff, 0xfe]).await?;
    match malformed.read_to_end().await {
        Err(TransferError::ImmediateFailure { reason }) => {
            assert!(reason.contains("could not be decoded"), "{reason}");
        }
        other => panic!("期望 ImmediateFailure，实际 {other:?}"),
    }

    let content = channel.pull(&Count("3".to_owned())).await?.read_to_end().await?;
    assert_eq!(&content[..], b"chunk-0000;chunk-0001;chunk-0002;");

    client.release().await;
    server.release().await;
    Ok(())
}

#[tokio::test(flavor = "multi_thread")]
async fn concurrent_exchanges_reach_their_own_handlers() -> anyhow::Result<()> {
    let fixture = Fixture::new()?;
    let (server, addr) = serve(PipelineConfig::new(), fixture.registry.clone()).await?;
    let client = client(addr, PipelineConfig::new())?;
    let channel = client.connect().await?;

    let alphas = (0..20).map(|index| {
        let channel = channel.clone();
        async move {
            let bytes = channel.pull(&Alpha(index.to_string())).await?.read_to_end().await?;
            Ok::<_, StreamError>((format!("alpha:{index}"), bytes))
        }
    });
    let betas = (0..20).map(|index| {
        let channel = channel.clone();
        async move {
            let bytes = channel.pull(&Beta(index.to_string())).await?.read_to_end().await?;
            Ok::<_, StreamError>((format!("beta:{index}"), bytes))
        }
    });
    let (alphas, betas) = tokio::join!(join_all(alphas), join_all(betas));
    for result in alphas.into_iter().chain(betas) {
        let (expected, bytes) = result?;
        assert_eq!(&bytes[..], expected.as_bytes());
    }
    assert_eq!(fixture.counters.alpha.load(Ordering::SeqCst), 20);
    assert_eq!(fixture.counters.beta.load(Ordering::SeqCst), 20);

    client.release().await;
    server.release().await;
    Ok(())
}

#[tokio::test(flavor = "multi_thread")]
async fn releasing_the_server_fails_pending_transfers() -> anyhow::Result<()> {
    let fixture = Fixture::new()?;
    let (server, addr) = serve(PipelineConfig::new(), fixture.registry.clone()).await?;
    let client = ClientBootstrap::builder(PeerInfo::from(addr))
        .settings(ChannelSettings {
            chunk_size: 1024,
            ..ChannelSettings::default()
        })
        .build()?;
    let channel = client.connect().await?;

    // 推送方保持交换打开，服务端释放后连接随之关闭。
    let mut push = channel.push(&Upload("pending".to_owned())).await?;
    push.write("partial").await?;
    wait_flushed(&push, 7).await;
    server.release().await;

    channel.closed().await;
    assert!(!channel.is_open());
    assert!(push.close().await.is_err());
    assert!(matches!(
        channel.pull(&Count("1".to_owned())).await,
        Err(StreamError::Connection(_))
    ));
    assert!(server.channels().is_empty());

    client.release().await;
    Ok(())
}

#[tokio::test(flavor = "multi_thread")]
async fn one_server_serves_independent_clients() -> anyhow::Result<()> {
    let fixture = Fixture::new()?;
    let server = ServerBootstrap::builder(PeerInfo::new("127.0.0.1", 0))
        .registry(fixture.registry.clone())
        .build()?;
    let addr = server.bind().await?;
    let first = client(addr, PipelineConfig::new())?;
    let second = client(addr, PipelineConfig::new())?;

    let a = first.connect().await?;
    let b = second.connect().await?;
    let (left, right) = tokio::join!(
        async { a.pull(&Count("2".to_owned())).await?.read_to_end().await.map_err(StreamError::from) },
        async { b.pull(&Count("3".to_owned())).await?.read_to_end().await.map_err(StreamError::from) },
    );
    assert_eq!(left?.len(), 2 * count_chunk(0).len());
    assert_eq!(right?.len(), 3 * count_chunk(0).len());

    first.release().await;
    // 另一个客户端的连接不受影响。
    assert!(b.is_open());
    let again = b.pull(&Count("1".to_owned())).await?.read_to_end().await?;
    assert_eq!(&again[..], count_chunk(0).as_bytes());

    second.release().await;
    server.release().await;
    Ok(())
}
