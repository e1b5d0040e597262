//! 单文件下载任务
//!
//! 文件按固定大小切成若干部分，严格按偏移顺序逐个下载；
//! 每个部分再切成 N 个分段并发请求，数据经任务锁按绝对偏移写入同一个输出文件。
//!
//! 状态流转：
//!
//! ```text
//! NotStarted -> Started -> Finished
//!                       -> Failed          (探测失败 / 分段失败)
//!                       -> CreateFailed    (无法创建输出文件)
//!                       -> MergeFailed     (写入失败)
//!                       -> Stopped         (停止信号)
//!                       -> ManifestDrifted (清单校验和变化)
//! ```

use futures::future::join_all;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::control::TransferControl;
use super::output::OutputFile;
use super::segment::{relayout_segments, split_part, Segment, SegmentStatus, SegmentWorker};
use crate::config::DownloadConfig;
use crate::http::HttpClient;
use crate::persistence::{JobSnapshot, SegmentSnapshot};

/// 文件任务状态
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    NotStarted,
    Started,
    Finished,
    Failed,
    MergeFailed,
    CreateFailed,
    Stopped,
    ManifestDrifted,
}

impl JobStatus {
    /// 是否为终态
    pub fn is_terminal(&self) -> bool {
        !matches!(self, Self::NotStarted | Self::Started)
    }
}

impl std::fmt::Display for JobStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::NotStarted => "not_started",
            Self::Started => "started",
            Self::Finished => "finished",
            Self::Failed => "failed",
            Self::MergeFailed => "merge_failed",
            Self::CreateFailed => "create_failed",
            Self::Stopped => "stopped",
            Self::ManifestDrifted => "manifest_drifted",
        };
        f.write_str(s)
    }
}

/// 任务参数
#[derive(Debug, Clone)]
pub struct JobOptions {
    /// 部分大小
    pub part_size: u64,
    /// 分段两次收到数据之间的最长等待
    pub idle_timeout: Duration,
}

impl JobOptions {
    pub fn from_config(config: &DownloadConfig) -> Self {
        Self {
            part_size: config.part_size,
            idle_timeout: Duration::from_secs(config.read_idle_timeout_secs),
        }
    }
}

/// 部分数量（向上取整）
pub fn part_count(total_size: u64, part_size: u64) -> u64 {
    if total_size == 0 {
        return 0;
    }
    (total_size + part_size - 1) / part_size
}

/// 第 `index` 个部分的 (偏移, 大小)
pub fn part_range(index: u64, total_size: u64, part_size: u64) -> (u64, u64) {
    let offset = index * part_size;
    (offset, part_size.min(total_size.saturating_sub(offset)))
}

/// 一次部分执行的结果
enum PartResult {
    Completed,
    Failed,
    /// 分段被停止信号打断（用户停止、线程数变更或清单变化）
    Interrupted,
}

/// 任务锁保护的共享状态
///
/// 输出文件句柄和两个进度计数器只在持有该锁时修改
struct JobState {
    status: JobStatus,
    total_size: Option<u64>,
    downloaded_bytes: u64,
    /// 上次轮询以来新增的字节数
    increment: u64,
    current_part_index: u64,
    /// 当前部分的分段表
    segments: Vec<Segment>,
    output: Option<OutputFile>,
    merge_error: Option<String>,
}

struct JobInner {
    url: String,
    destination: PathBuf,
    http: Arc<HttpClient>,
    options: JobOptions,
    control: TransferControl,
    /// 任务级停止令牌（用户停止令牌的子令牌）
    job_token: CancellationToken,
    /// 当前部分的停止令牌（任务令牌的子令牌），线程数变更时只取消它
    part_token: Mutex<CancellationToken>,
    thread_count: AtomicUsize,
    thread_count_changed: AtomicBool,
    drifted: AtomicBool,
    state: Mutex<JobState>,
}

/// 单文件下载任务
pub struct FileJob {
    inner: Arc<JobInner>,
    handle: Mutex<Option<JoinHandle<()>>>,
}

impl FileJob {
    /// 创建新任务
    ///
    /// # 参数
    /// * `url` - 下载地址
    /// * `destination` - 目标文件
    /// * `thread_count` - 每个部分的分段数
    /// * `control` - 用户级传输控制，停止与暂停信号由此派生
    pub fn new(
        url: String,
        destination: PathBuf,
        thread_count: usize,
        http: Arc<HttpClient>,
        control: &TransferControl,
        options: JobOptions,
    ) -> Self {
        let state = JobState {
            status: JobStatus::NotStarted,
            total_size: None,
            downloaded_bytes: 0,
            increment: 0,
            current_part_index: 0,
            segments: Vec::new(),
            output: None,
            merge_error: None,
        };
        Self::with_state(url, destination, thread_count, http, control, options, state)
    }

    /// 从断点快照恢复任务，分段从各自已写入的位置继续
    pub fn resume(
        snapshot: JobSnapshot,
        http: Arc<HttpClient>,
        control: &TransferControl,
        options: JobOptions,
    ) -> Self {
        let (part_offset, _) = part_range(
            snapshot.current_part_index,
            snapshot.total_size,
            options.part_size,
        );
        let segments: Vec<Segment> = snapshot
            .segments
            .iter()
            .enumerate()
            .map(|(index, s)| {
                let mut segment = Segment::new(index, part_offset, s.seg_offset, s.length);
                segment.bytes_written = s.bytes_written.min(s.length);
                if segment.is_complete() {
                    segment.status = SegmentStatus::Finished;
                }
                segment
            })
            .collect();
        let downloaded_bytes =
            part_offset + segments.iter().map(|s| s.bytes_written).sum::<u64>();

        info!(
            "从断点恢复任务: {}, 第 {} 部分, 已下载 {}/{} bytes",
            snapshot.url, snapshot.current_part_index, downloaded_bytes, snapshot.total_size
        );

        let state = JobState {
            status: JobStatus::NotStarted,
            total_size: Some(snapshot.total_size),
            downloaded_bytes,
            increment: 0,
            current_part_index: snapshot.current_part_index,
            segments,
            output: None,
            merge_error: None,
        };
        Self::with_state(
            snapshot.url,
            snapshot.destination,
            snapshot.thread_count,
            http,
            control,
            options,
            state,
        )
    }

    fn with_state(
        url: String,
        destination: PathBuf,
        thread_count: usize,
        http: Arc<HttpClient>,
        control: &TransferControl,
        options: JobOptions,
        state: JobState,
    ) -> Self {
        let job_token = control.stop_token().child_token();
        let part_token = job_token.child_token();
        Self {
            inner: Arc::new(JobInner {
                url,
                destination,
                http,
                options,
                control: control.clone(),
                job_token,
                part_token: Mutex::new(part_token),
                thread_count: AtomicUsize::new(thread_count.max(1)),
                thread_count_changed: AtomicBool::new(false),
                drifted: AtomicBool::new(false),
                state: Mutex::new(state),
            }),
            handle: Mutex::new(None),
        }
    }

    /// 启动后台下载（重复调用无效）
    pub fn start(&self) {
        {
            let mut state = self.inner.state.lock();
            if state.status != JobStatus::NotStarted {
                return;
            }
            state.status = JobStatus::Started;
        }

        let inner = Arc::clone(&self.inner);
        let handle = tokio::spawn(async move { inner.run().await });
        *self.handle.lock() = Some(handle);
    }

    pub fn url(&self) -> &str {
        &self.inner.url
    }

    pub fn destination(&self) -> &Path {
        &self.inner.destination
    }

    pub fn status(&self) -> JobStatus {
        self.inner.state.lock().status
    }

    /// 文件总大小（探测成功前为 None）
    pub fn total_size(&self) -> Option<u64> {
        self.inner.state.lock().total_size
    }

    pub fn downloaded_bytes(&self) -> u64 {
        self.inner.state.lock().downloaded_bytes
    }

    /// 取出上次轮询以来新增的字节数并清零
    pub fn take_increment(&self) -> u64 {
        std::mem::take(&mut self.inner.state.lock().increment)
    }

    pub fn current_part_index(&self) -> u64 {
        self.inner.state.lock().current_part_index
    }

    pub fn thread_count(&self) -> usize {
        self.inner.thread_count.load(Ordering::SeqCst)
    }

    /// 写入失败的原因
    pub fn merge_error(&self) -> Option<String> {
        self.inner.state.lock().merge_error.clone()
    }

    /// 修改线程数：打断当前部分的分段，并以新线程数重新执行同一部分
    pub fn update_thread_count(&self, thread_count: usize) {
        let thread_count = thread_count.max(1);
        let old = self.inner.thread_count.swap(thread_count, Ordering::SeqCst);
        if old == thread_count {
            return;
        }
        info!(
            "任务线程数变更: {} ({} -> {})",
            self.inner.url, old, thread_count
        );
        self.inner
            .thread_count_changed
            .store(true, Ordering::SeqCst);
        self.inner.part_token.lock().cancel();
    }

    /// 清单校验和变化：尽快结束任务，状态为 ManifestDrifted
    pub fn mark_drifted(&self) {
        warn!("⚠️ 任务清单已变化，停止下载: {}", self.inner.url);
        self.inner.drifted.store(true, Ordering::SeqCst);
        self.inner.part_token.lock().cancel();
    }

    /// 停止任务（不影响其他任务）
    pub fn stop(&self) {
        self.inner.job_token.cancel();
    }

    /// 等待后台任务结束，超时返回 false
    pub async fn wait_for_finish(&self, timeout: Duration) -> bool {
        let Some(mut handle) = self.handle.lock().take() else {
            return true;
        };

        match tokio::time::timeout(timeout, &mut handle).await {
            Ok(result) => {
                if let Err(e) = result {
                    error!("下载任务异常退出: {}, {}", self.inner.url, e);
                }
                true
            }
            Err(_) => {
                *self.handle.lock() = Some(handle);
                false
            }
        }
    }

    /// 强制终止（停止信号未能及时生效时使用）
    pub fn terminate(&self) {
        if let Some(handle) = self.handle.lock().take() {
            warn!("强制终止下载任务: {}", self.inner.url);
            handle.abort();
        }
        let mut state = self.inner.state.lock();
        if !state.status.is_terminal() {
            state.status = JobStatus::Stopped;
        }
    }

    /// 在任务锁内生成快照
    pub fn snapshot(&self) -> JobSnapshot {
        let state = self.inner.state.lock();
        JobSnapshot {
            url: self.inner.url.clone(),
            destination: self.inner.destination.clone(),
            total_size: state.total_size.unwrap_or(0),
            status: state.status,
            downloaded_bytes: state.downloaded_bytes,
            current_part_index: state.current_part_index,
            thread_count: self.inner.thread_count.load(Ordering::SeqCst),
            segments: state
                .segments
                .iter()
                .map(|s| SegmentSnapshot {
                    seg_offset: s.seg_offset,
                    length: s.length,
                    bytes_written: s.bytes_written,
                })
                .collect(),
        }
    }
}

impl JobInner {
    async fn run(self: Arc<Self>) {
        let status = self.execute().await;
        let mut state = self.state.lock();
        state.status = status;
        // 释放文件句柄，后续校验与删除不受影响
        state.output = None;
        match status {
            JobStatus::Finished => info!("✓ 下载完成: {}", self.url),
            JobStatus::Stopped => info!("下载已停止: {}", self.url),
            _ => warn!("下载结束: {}, 状态={}", self.url, status),
        }
    }

    async fn execute(self: &Arc<Self>) -> JobStatus {
        // 1. 探测文件大小
        let fetched = tokio::select! {
            _ = self.job_token.cancelled() => return JobStatus::Stopped,
            fetched = self.http.fetch_size(&self.url) => fetched,
        };
        let total_size = match fetched {
            Ok(size) => size,
            Err(e) => {
                warn!("探测文件大小失败: {}, 错误: {:#}", self.url, e);
                return JobStatus::Failed;
            }
        };
        self.reconcile_resume(total_size);

        // 2. 打开输出文件
        let output = match OutputFile::open(&self.destination, total_size) {
            Ok(f) => f,
            Err(e) => {
                error!("创建输出文件失败: {:?}, 错误: {}", self.destination, e);
                return JobStatus::CreateFailed;
            }
        };
        {
            let mut state = self.state.lock();
            state.output = Some(output);
            state.total_size = Some(total_size);
        }

        // 3. 按顺序下载各部分
        let part_size = self.options.part_size;
        let parts = part_count(total_size, part_size);
        info!(
            "开始下载: {} -> {:?}, 大小={} bytes, 共 {} 个部分",
            self.url, self.destination, total_size, parts
        );

        loop {
            let part_index = self.state.lock().current_part_index;
            if part_index >= parts {
                break;
            }

            let (offset, size) = part_range(part_index, total_size, part_size);
            if let Some(status) = self.run_part_to_end(part_index, offset, size).await {
                return status;
            }

            let mut state = self.state.lock();
            state.current_part_index += 1;
            state.segments.clear();
        }

        if self.drifted.load(Ordering::SeqCst) {
            return JobStatus::ManifestDrifted;
        }

        if let Some(output) = self.state.lock().output.as_ref() {
            if let Err(e) = output.sync() {
                warn!("刷新输出文件失败: {:?}, 错误: {}", self.destination, e);
            }
        }
        JobStatus::Finished
    }

    /// 断点与服务器文件不一致时从头下载
    fn reconcile_resume(&self, total_size: u64) {
        let mut state = self.state.lock();
        let Some(expected) = state.total_size else {
            return;
        };

        let on_disk = std::fs::metadata(&self.destination).map(|m| m.len()).ok();
        if expected == total_size && on_disk == Some(total_size) {
            return;
        }

        warn!(
            "断点与服务器文件不一致，重新下载: {} (断点={}, 服务器={}, 本地={:?})",
            self.url, expected, total_size, on_disk
        );
        state.current_part_index = 0;
        state.segments.clear();
        state.downloaded_bytes = 0;
    }

    /// 执行一个部分直到完成；线程数变更时以新线程数重跑同一部分
    ///
    /// 返回 `None` 表示该部分完成，否则为任务终态
    async fn run_part_to_end(
        self: &Arc<Self>,
        part_index: u64,
        offset: u64,
        size: u64,
    ) -> Option<JobStatus> {
        loop {
            if self.job_token.is_cancelled() {
                return Some(JobStatus::Stopped);
            }
            if self.drifted.load(Ordering::SeqCst) {
                return Some(JobStatus::ManifestDrifted);
            }

            // 先清除变更标记再换上新的部分令牌
            self.thread_count_changed.store(false, Ordering::SeqCst);
            let part_token = self.job_token.child_token();
            *self.part_token.lock() = part_token.clone();
            let thread_count = self.thread_count.load(Ordering::SeqCst);

            self.prepare_segments(offset, size, thread_count);
            debug!(
                "执行第 {} 部分: offset={}, size={}, 线程数={}",
                part_index, offset, size, thread_count
            );

            match self.run_part(&part_token).await {
                PartResult::Completed => return None,
                PartResult::Failed => {
                    let merge_failed = self.state.lock().merge_error.is_some();
                    return Some(if merge_failed {
                        JobStatus::MergeFailed
                    } else {
                        JobStatus::Failed
                    });
                }
                PartResult::Interrupted => {
                    if self.job_token.is_cancelled() {
                        return Some(JobStatus::Stopped);
                    }
                    if self.drifted.load(Ordering::SeqCst) {
                        return Some(JobStatus::ManifestDrifted);
                    }
                    // 只有任务令牌被取消才是真正的停止，其余打断都来自线程数变更
                    if !self.thread_count_changed.load(Ordering::SeqCst) {
                        debug!("部分令牌被取消但变更标记已清除: {}", self.url);
                    }
                    info!(
                        "线程数已变更为 {}，重新执行第 {} 部分",
                        self.thread_count.load(Ordering::SeqCst),
                        part_index
                    );
                }
            }
        }
    }

    /// 准备当前部分的分段表
    fn prepare_segments(&self, offset: u64, size: u64, thread_count: usize) {
        let mut state = self.state.lock();
        let expected_len = (thread_count.max(1) as u64).min(size.max(1)) as usize;
        let same_part = state
            .segments
            .first()
            .map(|s| s.part_offset == offset)
            .unwrap_or(false);

        if !same_part {
            state.segments = split_part(offset, size, thread_count);
        } else if state.segments.len() != expected_len {
            state.segments = relayout_segments(offset, size, thread_count, &state.segments);
        }

        state.downloaded_bytes = offset + state.segments.iter().map(|s| s.bytes_written).sum::<u64>();
    }

    /// 并发执行当前部分的全部分段，等待全部结束后汇总
    async fn run_part(self: &Arc<Self>, part_token: &CancellationToken) -> PartResult {
        let segments = self.state.lock().segments.clone();

        let handles: Vec<_> = segments
            .into_iter()
            .filter(|s| !s.is_complete())
            .map(|segment| {
                let index = segment.index;
                let worker = SegmentWorker::new(
                    segment,
                    self.url.clone(),
                    Arc::clone(&self.http),
                    self.control.segment_signal(part_token.clone()),
                    self.options.idle_timeout,
                );
                let job = Arc::clone(self);
                tokio::spawn(async move {
                    worker
                        .run(move |offset, data| job.notify_progress(index, offset, data))
                        .await
                })
            })
            .collect();

        // 即使有分段失败也要等其余分段结束，避免遗留写入者
        let results = join_all(handles).await;

        let mut state = self.state.lock();
        let mut failed = false;
        let mut stopped = false;
        for result in results {
            match result {
                Ok(segment) => {
                    if let Some(slot) = state.segments.get_mut(segment.index) {
                        slot.status = segment.status;
                    }
                    match segment.status {
                        SegmentStatus::Failed => failed = true,
                        SegmentStatus::Stopped => stopped = true,
                        _ => {}
                    }
                }
                Err(e) => {
                    error!("分段任务异常退出: {}", e);
                    failed = true;
                }
            }
        }

        if state.merge_error.is_some() {
            return PartResult::Failed;
        }
        if part_token.is_cancelled() && (failed || stopped) {
            return PartResult::Interrupted;
        }
        if failed || stopped {
            return PartResult::Failed;
        }

        let written: u64 = state.segments.iter().map(|s| s.bytes_written).sum();
        let expected: u64 = state.segments.iter().map(|s| s.length).sum();
        if written != expected {
            error!(
                "部分完成但字节数不符: {} (已写入 {}, 应为 {})",
                self.url, written, expected
            );
            return PartResult::Failed;
        }
        PartResult::Completed
    }

    /// 分段交付数据：持锁写入输出文件并更新计数器
    fn notify_progress(&self, index: usize, offset: u64, data: &[u8]) -> anyhow::Result<()> {
        let mut state = self.state.lock();

        let result = match state.output.as_ref() {
            Some(output) => output.write_at(offset, data),
            None => Err(std::io::Error::new(
                std::io::ErrorKind::NotFound,
                "输出文件未打开",
            )),
        };
        if let Err(e) = result {
            error!(
                "写入文件失败: {:?}, offset={}, 错误: {}",
                self.destination, offset, e
            );
            if state.merge_error.is_none() {
                state.merge_error = Some(e.to_string());
            }
            return Err(anyhow::Error::new(e).context("写入文件失败"));
        }

        let len = data.len() as u64;
        state.downloaded_bytes += len;
        state.increment += len;
        if let Some(segment) = state.segments.get_mut(index) {
            segment.bytes_written += len;
        }
        Ok(())
    }
}
