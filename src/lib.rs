// Resumable Downloader Library
// 多线程断点续传下载核心库

// 配置管理模块
pub mod config;

// 日志模块
pub mod logging;

// 错误类型
pub mod error;

// HTTP 传输模块
pub mod http;

// 下载引擎模块
pub mod downloader;

// 断点持久化模块
pub mod persistence;

// 解包模块
pub mod archive;

// 导出常用类型
pub use archive::{UnpackResult, Unpacker, ZipUnpacker};
pub use config::{AppConfig, CliArgs, FolderStore, TomlFolderStore};
pub use downloader::{
    DownloadCoordinator, FileDescriptor, FileJob, JobStatus, LogProgressView, Manifest,
    ProgressView, RunOutcome, TransferControl,
};
pub use error::{DownloadError, ManifestError};
pub use http::HttpClient;
pub use persistence::{CheckpointRecord, CheckpointStore};
