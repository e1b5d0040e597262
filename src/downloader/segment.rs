use anyhow::{Context, Result};
use futures::StreamExt;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

use super::control::SegmentSignal;
use crate::http::HttpClient;

/// 分段状态
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SegmentStatus {
    NotStarted,
    Started,
    Finished,
    Failed,
    /// 收到停止信号（用户停止或线程数变更）
    Stopped,
}

/// 分段：一个部分中由单个连接负责的连续区间
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Segment {
    /// 在当前部分中的序号
    pub index: usize,
    /// 所属部分在文件中的偏移
    pub part_offset: u64,
    /// 在部分内的偏移
    pub seg_offset: u64,
    pub length: u64,
    /// 已交付写入的字节数
    pub bytes_written: u64,
    pub status: SegmentStatus,
}

impl Segment {
    pub fn new(index: usize, part_offset: u64, seg_offset: u64, length: u64) -> Self {
        Self {
            index,
            part_offset,
            seg_offset,
            length,
            bytes_written: 0,
            status: SegmentStatus::NotStarted,
        }
    }

    /// 在文件中的起始偏移
    pub fn start(&self) -> u64 {
        self.part_offset + self.seg_offset
    }

    /// 在文件中的结束偏移（不含）
    pub fn end(&self) -> u64 {
        self.start() + self.length
    }

    /// 续传起点：跳过已写入的字节
    pub fn resume_offset(&self) -> u64 {
        self.start() + self.bytes_written
    }

    pub fn remaining(&self) -> u64 {
        self.length.saturating_sub(self.bytes_written)
    }

    pub fn is_complete(&self) -> bool {
        self.bytes_written >= self.length
    }
}

/// 把一个部分切成 `n` 个连续分段，余数并入最后一段
///
/// `n` 会被限制在 `[1, size]` 内，保证每个分段非空
pub fn split_part(part_offset: u64, size: u64, n: usize) -> Vec<Segment> {
    let n = (n.max(1) as u64).min(size.max(1));
    let seg_size = size / n;

    (0..n)
        .map(|i| {
            let seg_offset = i * seg_size;
            let length = if i == n - 1 {
                size - seg_offset
            } else {
                seg_size
            };
            Segment::new(i as usize, part_offset, seg_offset, length)
        })
        .collect()
}

/// 线程数变化后重新切分同一部分
///
/// 新分段继承旧布局中从其起点开始连续已写入的前缀，其余字节重新下载
pub fn relayout_segments(part_offset: u64, size: u64, n: usize, old: &[Segment]) -> Vec<Segment> {
    let mut covered: Vec<(u64, u64)> = old
        .iter()
        .filter(|s| s.bytes_written > 0)
        .map(|s| (s.start(), s.start() + s.bytes_written.min(s.length)))
        .collect();
    covered.sort_unstable();

    let mut segments = split_part(part_offset, size, n);
    for seg in &mut segments {
        let mut pos = seg.start();
        for &(start, end) in &covered {
            if start <= pos && pos < end {
                pos = end;
            }
        }
        seg.bytes_written = pos.min(seg.end()) - seg.start();
        if seg.is_complete() {
            seg.status = SegmentStatus::Finished;
        }
    }
    segments
}

/// 分段中止原因
enum Abort {
    Stopped,
    Failed(anyhow::Error),
}

impl From<anyhow::Error> for Abort {
    fn from(e: anyhow::Error) -> Self {
        Abort::Failed(e)
    }
}

/// 分段下载线程
///
/// 对 `[resume_offset, end)` 发起一次区间请求，按数据块交付给所属任务
pub struct SegmentWorker {
    segment: Segment,
    url: String,
    http: Arc<HttpClient>,
    signal: SegmentSignal,
    /// 两个数据块之间允许的最长等待
    idle_timeout: Duration,
}

impl SegmentWorker {
    pub fn new(
        segment: Segment,
        url: String,
        http: Arc<HttpClient>,
        signal: SegmentSignal,
        idle_timeout: Duration,
    ) -> Self {
        Self {
            segment,
            url,
            http,
            signal,
            idle_timeout,
        }
    }

    /// 执行下载，返回结束时的分段状态
    ///
    /// # 参数
    /// * `deliver` - 交付回调，参数为文件绝对偏移和数据；返回错误时分段以失败结束
    pub async fn run<F>(mut self, mut deliver: F) -> Segment
    where
        F: FnMut(u64, &[u8]) -> Result<()> + Send,
    {
        if self.segment.is_complete() {
            self.segment.status = SegmentStatus::Finished;
            return self.segment;
        }
        if self.signal.is_stopped() {
            self.segment.status = SegmentStatus::Stopped;
            return self.segment;
        }

        self.segment.status = SegmentStatus::Started;
        debug!(
            "[分段{}] 开始下载: bytes={}-{}, 已写入 {} bytes",
            self.segment.index,
            self.segment.resume_offset(),
            self.segment.end() - 1,
            self.segment.bytes_written
        );

        self.segment.status = match self.transfer(&mut deliver).await {
            Ok(()) => {
                debug!(
                    "[分段{}] 下载完成，大小: {} bytes",
                    self.segment.index, self.segment.length
                );
                SegmentStatus::Finished
            }
            Err(Abort::Stopped) => {
                debug!(
                    "[分段{}] 收到停止信号，已写入 {}/{} bytes",
                    self.segment.index, self.segment.bytes_written, self.segment.length
                );
                SegmentStatus::Stopped
            }
            Err(Abort::Failed(e)) => {
                warn!(
                    "[分段{}] 下载失败: {:#} (已写入 {}/{} bytes)",
                    self.segment.index, e, self.segment.bytes_written, self.segment.length
                );
                SegmentStatus::Failed
            }
        };
        self.segment
    }

    async fn transfer<F>(&mut self, deliver: &mut F) -> Result<(), Abort>
    where
        F: FnMut(u64, &[u8]) -> Result<()> + Send,
    {
        let start = self.segment.resume_offset();
        let end_inclusive = self.segment.end() - 1;

        let resp = tokio::select! {
            _ = self.signal.stopped() => return Err(Abort::Stopped),
            resp = self.http.get_range(&self.url, start, end_inclusive) => resp?,
        };

        let mut stream = resp.bytes_stream();
        while !self.segment.is_complete() {
            let next = tokio::select! {
                _ = self.signal.stopped() => return Err(Abort::Stopped),
                next = tokio::time::timeout(self.idle_timeout, stream.next()) => next,
            };

            let data = match next {
                Err(_) => {
                    return Err(Abort::Failed(anyhow::anyhow!(
                        "{} 秒内未收到数据",
                        self.idle_timeout.as_secs()
                    )))
                }
                Ok(None) => break,
                Ok(Some(chunk)) => chunk.context("读取数据流失败")?,
            };

            // 暂停时持有数据块不交付，恢复后从同一位置继续
            if !self.signal.wait_while_paused().await {
                return Err(Abort::Stopped);
            }

            let take = (self.segment.remaining() as usize).min(data.len());
            deliver(self.segment.resume_offset(), &data[..take])?;
            self.segment.bytes_written += take as u64;
        }

        if !self.segment.is_complete() {
            return Err(Abort::Failed(anyhow::anyhow!(
                "连接提前关闭: 已接收 {}/{} bytes",
                self.segment.bytes_written,
                self.segment.length
            )));
        }
        Ok(())
    }
}
