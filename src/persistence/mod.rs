//! 断点持久化模块
//!
//! 下载过程中按固定间隔把 {下载描述列表, 当前任务进度, 当前分段偏移} 写入单个 JSON 文件，
//! 进程重启后据此恢复，精确地从每个分段已写入的位置继续。
//!
//! ## 文件结构
//!
//! ```text
//! downloader.checkpoint.json      # 断点记录（JSON 格式）
//! downloader.checkpoint.json.tmp  # 写入中的临时文件，完成后原子重命名
//! ```
//!
//! 全部文件下载完成后删除断点文件；文件缺失或无法解析时视为冷启动

pub mod checkpoint;
pub mod types;

pub use checkpoint::CheckpointStore;
pub use types::{CheckpointRecord, JobSnapshot, SegmentSnapshot, CHECKPOINT_VERSION};
