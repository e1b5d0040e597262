//! 持久化模块核心类型定义
//!
//! 断点文件只保存纯数据快照，不直接序列化正在运行的任务对象

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

use crate::downloader::{FileDescriptor, JobStatus};

/// 断点文件格式版本
pub const CHECKPOINT_VERSION: u32 = 1;

/// 分段快照
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SegmentSnapshot {
    /// 在所属部分内的偏移
    pub seg_offset: u64,
    pub length: u64,
    pub bytes_written: u64,
}

/// 正在下载的文件任务快照
///
/// 在任务锁内一次性生成，各字段彼此一致
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobSnapshot {
    pub url: String,
    /// 目标文件路径
    pub destination: PathBuf,
    pub total_size: u64,
    pub status: JobStatus,
    pub downloaded_bytes: u64,
    /// 正在下载的部分序号（之前的部分均已完成）
    pub current_part_index: u64,
    pub thread_count: usize,
    /// 当前部分的分段进度
    #[serde(default)]
    pub segments: Vec<SegmentSnapshot>,
}

/// 断点记录
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CheckpointRecord {
    pub version: u32,
    pub saved_at: DateTime<Utc>,
    /// 全部下载描述（完成标记以此为准）
    pub descriptors: Vec<FileDescriptor>,
    /// 退出时正在下载的文件
    #[serde(default)]
    pub active_job: Option<JobSnapshot>,
}

impl CheckpointRecord {
    pub fn new(descriptors: Vec<FileDescriptor>, active_job: Option<JobSnapshot>) -> Self {
        Self {
            version: CHECKPOINT_VERSION,
            saved_at: Utc::now(),
            descriptors,
            active_job,
        }
    }

    /// 查找指定地址的描述
    pub fn descriptor(&self, url: &str) -> Option<&FileDescriptor> {
        self.descriptors.iter().find(|d| d.url == url)
    }
}
