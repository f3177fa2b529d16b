//! 交换两端的流式端点：[`TransferOut`] 写出，[`TransferIn`] 读入。
//!
//! 传输要么完整成功，要么整体失败；失败时报告失败前已传输的字节数，不支持断点续传。

mod sink;
mod source;

pub use sink::TransferOut;
pub use source::TransferIn;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Phase {
    Open,
    Closed,
    Aborted,
}

impl Phase {
    fn as_str(self) -> &'static str {
        match self {
            Self::Open => "open",
            Self::Closed => "closed",
            Self::Aborted => "aborted",
        }
    }
}
