//! 传输之外的协作方工具。

pub mod file_transfer;

pub use file_transfer::{receive_file, send_file};
