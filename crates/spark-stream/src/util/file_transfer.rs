//! 文件内容源：把磁盘文件流式写入 [`TransferOut`]，或把 [`TransferIn`] 落盘。
//!
//! # 教案式注释
//!
//! ## 意图 (Why)
//! - 文件体量可能远超内存，读取必须按分块大小进行，并沿用传输的背压：
//!   出站队列满时读取随写入一起挂起。
//!
//! ## 逻辑 (How)
//! - 发送：以 `chunk_size` 为单位读取，每块交给 `TransferOut::write`，读到末尾后 `close`；
//!   打开或读取失败时先终止交换，让对端得到确定的失败；
//! - 接收：逐块写入目标文件，失败时删除半成品。
//!
//! ## 契约 (What)
//! - 成功返回传输的字节数；
//! - `delete_after_send` 只在交换成功关闭后删除源文件。

use std::path::Path;

use bytes::BytesMut;
use tokio::{fs, io::AsyncReadExt};
use tracing::{debug, warn};

use crate::{
    error::StreamError,
    transfer::{TransferIn, TransferOut},
};

/// 把 `path` 的内容写入 `sink` 并关闭它。
pub async fn send_file(
    path: impl AsRef<Path>,
    sink: &mut TransferOut,
    delete_after_send: bool,
) -> Result<u64, StreamError> {
    let path = path.as_ref();
    let mut file = match fs::File::open(path).await {
        Ok(file) => file,
        Err(err) => {
            let _ = sink
                .abort(format!("cannot open {}: {err}", path.display()))
                .await;
            return Err(err.into());
        }
    };

    let chunk_size = sink.chunk_size();
    loop {
        let mut buffer = BytesMut::with_capacity(chunk_size);
        let read = match file.read_buf(&mut buffer).await {
            Ok(read) => read,
            Err(err) => {
                let _ = sink
                    .abort(format!("cannot read {}: {err}", path.display()))
                    .await;
                return Err(err.into());
            }
        };
        if read == 0 {
            break;
        }
        sink.write(buffer.freeze()).await?;
    }

    let sent = sink.close().await?;
    debug!(path = %path.display(), bytes = sent, "file sent");
    if delete_after_send && let Err(err) = fs::remove_file(path).await {
        warn!(path = %path.display(), error = %err, "failed to delete sent file");
    }
    Ok(sent)
}

/// 把 `source` 的全部内容写入 `path`；失败时删除不完整的文件。
pub async fn receive_file(source: TransferIn, path: impl AsRef<Path>) -> Result<u64, StreamError> {
    let path = path.as_ref();
    let mut file = fs::File::create(path).await?;
    match source.copy_to(&mut file).await {
        Ok(received) => {
            file.sync_all().await?;
            debug!(path = %path.display(), bytes = received, "file received");
            Ok(received)
        }
        Err(err) => {
            drop(file);
            if let Err(cleanup) = fs::remove_file(path).await {
                warn!(path = %path.display(), error = %cleanup, "failed to remove partial file");
            }
            Err(err)
        }
    }
}
