//! 下载协调器
//!
//! 负责整个运行过程：
//! 1. 获取每个地址的清单，与断点中的下载描述合并
//! 2. 优先恢复断点中正在下载的文件
//! 3. 反复扫描描述列表，逐个下载未完成的文件并解释任务终态
//! 4. 全部完成后删除断点并解包
//!
//! 只有协调器决定重试、中止或回滚；下层组件只报告"这一单元失败"

use futures::future::join_all;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::{interval, interval_at, Instant, MissedTickBehavior};
use tracing::{debug, error, info, warn};

use super::control::TransferControl;
use super::job::{FileJob, JobOptions, JobStatus};
use super::manifest::{FileDescriptor, ManifestClient};
use super::progress::{percent, MessageKind, ProgressView, SpeedCalculator};
use super::verifier::IntegrityVerifier;
use crate::archive::{should_unpack, UnpackResult, Unpacker};
use crate::config::{AppConfig, FolderStore};
use crate::error::DownloadError;
use crate::http::{file_name_from_url, HttpClient};
use crate::persistence::{CheckpointRecord, CheckpointStore, JobSnapshot};

/// 运行结果
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RunOutcome {
    /// 全部文件下载、校验完成
    Completed,
    /// 用户取消
    Cancelled,
    Failed(DownloadError),
}

/// 一次运行的可变状态，只由协调器的控制流修改
struct RunState {
    folder: PathBuf,
    descriptors: Vec<FileDescriptor>,
    /// 与描述一一对应的文件名
    names: Vec<String>,
    /// 探测到的文件大小
    sizes: Vec<Option<u64>>,
    /// 上次失败或中断时保存的任务快照
    pending_resume: Option<JobSnapshot>,
    /// 清单变化后需要回退扫描到的位置
    rewind_to: Option<usize>,
    /// 本轮扫描是否有失败
    failed_in_pass: bool,
}

impl RunState {
    fn destination(&self, index: usize) -> PathBuf {
        self.folder.join(&self.names[index])
    }

    fn all_finished(&self) -> bool {
        self.descriptors.iter().all(|d| d.finished)
    }

    fn finished_bytes(&self) -> u64 {
        self.descriptors
            .iter()
            .filter(|d| d.finished)
            .filter_map(|d| d.file_size)
            .sum()
    }

    /// 预估总大小
    fn grand_total(&self) -> u64 {
        self.descriptors
            .iter()
            .zip(&self.sizes)
            .map(|(d, size)| size.or(d.file_size).unwrap_or(0))
            .sum()
    }

    fn next_unfinished(&self, from: usize) -> Option<usize> {
        (from..self.descriptors.len()).find(|&i| !self.descriptors[i].finished)
    }
}

/// 下载协调器
pub struct DownloadCoordinator {
    config: AppConfig,
    http: Arc<HttpClient>,
    manifests: ManifestClient,
    folders: Arc<dyn FolderStore>,
    unpacker: Arc<dyn Unpacker>,
    view: Arc<dyn ProgressView>,
    checkpoint: CheckpointStore,
    verifier: IntegrityVerifier,
    control: TransferControl,
}

impl DownloadCoordinator {
    /// 创建协调器
    ///
    /// # 参数
    /// * `config` - 应用配置
    /// * `http` - 共享 HTTP 客户端
    /// * `folders` - 下载目录记忆
    /// * `unpacker` - 解包器
    /// * `view` - 进度界面
    pub fn new(
        config: &AppConfig,
        http: Arc<HttpClient>,
        folders: Arc<dyn FolderStore>,
        unpacker: Arc<dyn Unpacker>,
        view: Arc<dyn ProgressView>,
    ) -> Self {
        Self {
            manifests: ManifestClient::new(Arc::clone(&http)),
            checkpoint: CheckpointStore::new(config.persistence.checkpoint_path.clone()),
            verifier: IntegrityVerifier::new(
                config.download.part_size,
                config.download.verify_buffer_size,
            ),
            config: config.clone(),
            http,
            folders,
            unpacker,
            view,
            control: TransferControl::new(),
        }
    }

    /// 传输控制句柄（交给界面或信号处理）
    pub fn control(&self) -> TransferControl {
        self.control.clone()
    }

    /// 执行整个下载流程
    pub async fn run(&self) -> RunOutcome {
        match self.run_inner().await {
            Ok(()) => {
                info!("✓ 全部下载完成");
                RunOutcome::Completed
            }
            Err(e) if !e.is_user_visible() => {
                info!("下载已取消");
                RunOutcome::Cancelled
            }
            Err(e) => {
                error!("下载失败: {}", e);
                self.view.show_message(MessageKind::Error, &e.to_string());
                RunOutcome::Failed(e)
            }
        }
    }

    async fn run_inner(&self) -> Result<(), DownloadError> {
        let folder = self.resolve_folder()?;
        info!("下载目录: {:?}", folder);

        let record = self.checkpoint.load();
        let mut state = self.build_state(folder, record).await?;

        self.fetch_sizes(&mut state).await;
        self.check_free_space(&state)?;

        // 断点中的任务优先
        let mut cursor = 0;
        if let Some(snapshot) = &state.pending_resume {
            if let Some(index) = state.descriptors.iter().position(|d| d.url == snapshot.url) {
                info!("优先恢复断点任务: {}", snapshot.url);
                cursor = index;
            }
        }

        loop {
            if self.control.is_stop_requested() {
                return Err(DownloadError::Cancelled);
            }
            if self.view.is_closed_by_user() {
                self.control.request_stop();
                return Err(DownloadError::Cancelled);
            }

            let Some(index) = state.next_unfinished(cursor) else {
                if state.all_finished() {
                    break;
                }
                // 一轮扫描结束但仍有未完成的文件：从头再来
                if state.failed_in_pass {
                    self.wait_retry_delay().await?;
                }
                state.failed_in_pass = false;
                cursor = 0;
                continue;
            };

            self.run_descriptor(&mut state, index).await?;
            cursor = index + 1;

            if let Some(rewind) = state.rewind_to.take() {
                debug!("清单变化，扫描回退到第 {} 项", rewind);
                cursor = cursor.min(rewind);
            }
        }

        if let Err(e) = self.checkpoint.erase() {
            warn!("删除断点文件失败: {}", e);
        }

        if self.config.download.unpack_after_download {
            self.unpack_all(&state).await?;
        }
        Ok(())
    }

    // ========================================================================
    // 准备阶段
    // ========================================================================

    /// 确定下载目录：优先使用记忆的目录，否则使用配置目录并记住
    fn resolve_folder(&self) -> Result<PathBuf, DownloadError> {
        if let Some(saved) = self.folders.get_saved_folder() {
            if saved.is_dir() {
                return Ok(saved);
            }
            warn!("记忆的下载目录不可用: {:?}", saved);
        }

        let folder = self.config.download.download_dir.clone();
        std::fs::create_dir_all(&folder).map_err(|e| {
            DownloadError::LocalResource(format!("无法创建下载目录 {:?}: {}", folder, e))
        })?;

        if let Err(e) = self.folders.save_folder(&folder) {
            warn!("保存下载目录失败: {:#}", e);
        }
        Ok(folder)
    }

    /// 获取全部清单并与断点合并
    async fn build_state(
        &self,
        folder: PathBuf,
        record: Option<CheckpointRecord>,
    ) -> Result<RunState, DownloadError> {
        let urls = &self.config.download.urls;
        let results = join_all(urls.iter().map(|url| self.manifests.fetch_manifest(url))).await;

        let mut descriptors = Vec::new();
        let mut names = Vec::new();
        let mut fetched = 0;

        for (url, result) in urls.iter().zip(results) {
            let name = match file_name_from_url(url) {
                Ok(name) => name,
                Err(e) => {
                    warn!("跳过无效地址: {}", url);
                    self.view.show_message(MessageKind::Error, &e.to_string());
                    continue;
                }
            };
            let path = folder.join(&name);
            let previous = record.as_ref().and_then(|r| r.descriptor(url));

            let mut descriptor = match (result, previous) {
                (Ok(manifest), Some(previous)) => {
                    fetched += 1;
                    let mut descriptor = previous.clone();
                    if descriptor.update(manifest).checksums_changed {
                        remove_stale_file(&path);
                        descriptor.mark_unfinished();
                    }
                    descriptor
                }
                (Ok(manifest), None) => {
                    fetched += 1;
                    FileDescriptor::new(url.clone(), manifest)
                }
                (Err(e), Some(previous)) => {
                    warn!("获取清单失败，使用断点中的描述: {}, 错误: {}", url, e);
                    previous.clone()
                }
                (Err(e), None) => {
                    warn!("获取清单失败: {}, 错误: {}", url, e);
                    continue;
                }
            };

            if descriptor.finished && !finished_file_intact(&path, descriptor.file_size) {
                warn!("已完成的文件缺失或大小不符，重新下载: {:?}", path);
                descriptor.mark_unfinished();
            }

            descriptors.push(descriptor);
            names.push(name);
        }

        if fetched == 0 || descriptors.is_empty() {
            return Err(DownloadError::NoManifest);
        }

        // 断点任务只有在仍然有效时才恢复
        let pending_resume = record.and_then(|r| r.active_job).filter(|snapshot| {
            descriptors
                .iter()
                .zip(&names)
                .any(|(d, name)| {
                    d.url == snapshot.url
                        && !d.finished
                        && !d.change_flags.checksums_changed
                        && snapshot.destination == folder.join(name)
                })
        });

        info!(
            "下载描述: {} 项, 已完成 {} 项",
            descriptors.len(),
            descriptors.iter().filter(|d| d.finished).count()
        );

        let sizes = vec![None; descriptors.len()];
        Ok(RunState {
            folder,
            descriptors,
            names,
            sizes,
            pending_resume,
            rewind_to: None,
            failed_in_pass: false,
        })
    }

    /// 探测未完成文件的大小，用于总进度和空间检查
    async fn fetch_sizes(&self, state: &mut RunState) {
        let lookups = state.descriptors.iter().map(|d| async move {
            if d.finished {
                return d.file_size;
            }
            match self.http.fetch_size(&d.url).await {
                Ok(size) => Some(size),
                Err(e) => {
                    warn!("探测文件大小失败: {}, 错误: {:#}", d.url, e);
                    None
                }
            }
        });
        state.sizes = join_all(lookups).await;
        info!("预计下载总大小: {} bytes", state.grand_total());
    }

    /// 检查下载目录所在磁盘的剩余空间
    fn check_free_space(&self, state: &RunState) -> Result<(), DownloadError> {
        if !self.config.download.check_free_space {
            return Ok(());
        }

        let required: u64 = state
            .descriptors
            .iter()
            .enumerate()
            .filter(|(_, d)| !d.finished)
            .map(|(i, _)| {
                let size = state.sizes[i].unwrap_or(0);
                let on_disk = std::fs::metadata(state.destination(i))
                    .map(|m| m.len())
                    .unwrap_or(0);
                size.saturating_sub(on_disk)
            })
            .sum();

        let Some(available) = available_space(&state.folder) else {
            warn!("⚠️ 无法确定 {:?} 所在磁盘的剩余空间，跳过检查", state.folder);
            return Ok(());
        };

        debug!("磁盘剩余空间: {} bytes, 需要: {} bytes", available, required);
        if available < required {
            return Err(DownloadError::LocalResource(format!(
                "{:?} 所在磁盘空间不足 (需要 {} bytes, 剩余 {} bytes)，请清理磁盘或选择其他目录",
                state.folder, required, available
            )));
        }
        Ok(())
    }

    // ========================================================================
    // 单个文件
    // ========================================================================

    /// 下载第 `index` 个描述对应的文件并解释任务终态
    async fn run_descriptor(&self, state: &mut RunState, index: usize) -> Result<(), DownloadError> {
        let url = state.descriptors[index].url.clone();

        // 开始前刷新清单
        match self.manifests.fetch_manifest(&url).await {
            Ok(manifest) => {
                if state.descriptors[index].update(manifest).checksums_changed {
                    remove_stale_file(&state.destination(index));
                    state.descriptors[index].mark_unfinished();
                    if state.pending_resume.as_ref().map(|s| s.url == url).unwrap_or(false) {
                        state.pending_resume = None;
                    }
                }
            }
            Err(e) => {
                self.retry_later(state, DownloadError::Transient(format!("{}: {}", url, e)));
                return Ok(());
            }
        }

        let destination = state.destination(index);
        let thread_count = state.descriptors[index].thread_count();
        let options = JobOptions::from_config(&self.config.download);

        let job = match state.pending_resume.take() {
            Some(snapshot) if snapshot.url == url => {
                let job =
                    FileJob::resume(snapshot, Arc::clone(&self.http), &self.control, options);
                job.update_thread_count(thread_count);
                job
            }
            other => {
                state.pending_resume = other;
                FileJob::new(
                    url.clone(),
                    destination.clone(),
                    thread_count,
                    Arc::clone(&self.http),
                    &self.control,
                    options,
                )
            }
        };

        job.start();
        self.monitor(state, index, &job).await;

        let status = job.status();
        let snapshot = job.snapshot();
        if let Some(size) = job.total_size() {
            state.sizes[index] = Some(size);
        }

        match status {
            JobStatus::Finished => self.finish_file(state, index, &destination).await,
            JobStatus::Failed => {
                self.retry_later(state, DownloadError::Transient(format!("下载 {} 中断", url)));
                // 大小探测成功后的进度才值得恢复
                if snapshot.total_size > 0 {
                    state.pending_resume = Some(snapshot);
                }
                self.save_checkpoint(state, state.pending_resume.as_ref());
                Ok(())
            }
            JobStatus::CreateFailed | JobStatus::MergeFailed => Err(local_resource_error(
                status,
                &destination,
                job.merge_error(),
            )),
            JobStatus::ManifestDrifted => {
                self.apply_drift(state, index);
                Ok(())
            }
            JobStatus::Stopped | JobStatus::NotStarted | JobStatus::Started => {
                self.save_checkpoint(state, Some(&snapshot));
                Err(DownloadError::Cancelled)
            }
        }
    }

    /// 轮询任务直到结束：更新进度、定期保存断点、定期复查清单、响应停止
    async fn monitor(&self, state: &mut RunState, index: usize, job: &FileJob) {
        let download = &self.config.download;
        let mut poll = interval(Duration::from_millis(download.poll_interval_ms));
        let checkpoint_every =
            Duration::from_millis(self.config.persistence.checkpoint_interval_ms.max(1));
        let mut checkpoint_tick = interval_at(Instant::now() + checkpoint_every, checkpoint_every);
        let recheck_every = Duration::from_secs(download.manifest_recheck_secs.max(1));
        let mut recheck = interval_at(Instant::now() + recheck_every, recheck_every);
        poll.set_missed_tick_behavior(MissedTickBehavior::Skip);
        recheck.set_missed_tick_behavior(MissedTickBehavior::Delay);

        let stop_timeout = Duration::from_millis(download.stop_timeout_ms);
        let mut speed = SpeedCalculator::new();
        let mut was_paused = self.control.is_paused();

        loop {
            tokio::select! {
                _ = poll.tick() => {
                    let paused = self.control.is_paused();
                    if paused != was_paused {
                        speed.reset_baseline();
                        was_paused = paused;
                    }

                    let increment = job.take_increment();
                    if !paused {
                        speed.sample(increment);
                    }
                    if state.sizes[index].is_none() {
                        state.sizes[index] = job.total_size();
                    }
                    self.report_progress(state, index, job, &speed);

                    if job.status().is_terminal() {
                        break;
                    }
                    if self.view.is_closed_by_user() {
                        info!("界面已关闭，停止下载");
                        self.control.request_stop();
                    }
                }
                _ = checkpoint_tick.tick() => {
                    if job.status() == JobStatus::Started {
                        self.save_checkpoint(state, Some(&job.snapshot()));
                    }
                }
                _ = recheck.tick() => {
                    self.recheck_manifests(state, index, job).await;
                }
                _ = self.control.stop_token().cancelled() => {
                    if !job.wait_for_finish(stop_timeout).await {
                        job.terminate();
                    }
                    break;
                }
            }
        }

        if !job.wait_for_finish(stop_timeout).await {
            job.terminate();
        }
    }

    fn report_progress(&self, state: &RunState, index: usize, job: &FileJob, speed: &SpeedCalculator) {
        let downloaded = job.downloaded_bytes();
        let file_percent = percent(downloaded, job.total_size().unwrap_or(0));
        let total_percent = percent(state.finished_bytes() + downloaded, state.grand_total());
        self.view.set_displayed_data(
            &state.names[index],
            speed.speed_kib(),
            file_percent,
            total_percent,
        );
    }

    /// 复查所有清单
    ///
    /// 当前文件校验和变化时停止当前任务；线程数变化时重新切分当前部分；
    /// 其他文件校验和变化时删除其数据并回退扫描
    async fn recheck_manifests(&self, state: &mut RunState, active: usize, job: &FileJob) {
        debug!("复查清单: {} 项", state.descriptors.len());
        let results = join_all(
            state
                .descriptors
                .iter()
                .map(|d| self.manifests.fetch_manifest(&d.url)),
        )
        .await;

        for (index, result) in results.into_iter().enumerate() {
            let manifest = match result {
                Ok(m) => m,
                Err(e) => {
                    debug!("复查清单失败: {}, 错误: {}", state.descriptors[index].url, e);
                    continue;
                }
            };

            let flags = state.descriptors[index].update(manifest);
            if index == active {
                if flags.checksums_changed {
                    job.mark_drifted();
                } else if flags.thread_count_changed {
                    job.update_thread_count(state.descriptors[index].thread_count());
                }
            } else if flags.checksums_changed {
                self.apply_drift(state, index);
            }
        }
    }

    /// 清单校验和变化：删除旧数据、清除完成标记并回退扫描
    fn apply_drift(&self, state: &mut RunState, index: usize) {
        let path = state.destination(index);
        warn!("⚠️ 服务器文件已更新，删除旧数据并重新下载: {:?}", path);
        remove_stale_file(&path);

        let url = state.descriptors[index].url.clone();
        state.descriptors[index].mark_unfinished();
        state.sizes[index] = None;
        if state.pending_resume.as_ref().map(|s| s.url == url).unwrap_or(false) {
            state.pending_resume = None;
        }
        state.rewind_to = Some(state.rewind_to.map_or(index, |r| r.min(index)));

        self.view.show_message(
            MessageKind::Info,
            &DownloadError::Drift(state.names[index].clone()).to_string(),
        );
    }

    /// 任务完成：校验并标记
    async fn finish_file(
        &self,
        state: &mut RunState,
        index: usize,
        destination: &Path,
    ) -> Result<(), DownloadError> {
        let checksums = state.descriptors[index].checksums().to_vec();
        let outcome = self
            .verifier
            .verify_file(destination, &checksums)
            .await
            .map_err(|e| DownloadError::LocalResource(format!("{:#}", e)))?;

        if !outcome.is_match() {
            error!("文件校验失败: {:?}, {}", destination, outcome);
            self.save_checkpoint(state, None);
            return Err(DownloadError::Integrity(format!(
                "{} ({})",
                state.names[index], outcome
            )));
        }

        let size = std::fs::metadata(destination).map(|m| m.len()).unwrap_or(0);
        let name = state.names[index].clone();
        state.descriptors[index].mark_finished(name, size);
        state.sizes[index] = Some(size);
        self.save_checkpoint(state, None);
        Ok(())
    }

    /// 可重试的失败：提示后留给下一轮扫描
    fn retry_later(&self, state: &mut RunState, error: DownloadError) {
        warn!("{}，稍后重试", error);
        state.failed_in_pass = true;
        self.view.show_message(MessageKind::Info, &error.to_string());
    }

    fn save_checkpoint(&self, state: &RunState, active_job: Option<&JobSnapshot>) {
        if let Err(e) = self.checkpoint.save(&state.descriptors, active_job) {
            warn!("保存断点失败: {:?}, 错误: {}", self.checkpoint.path(), e);
        }
    }

    /// 一轮扫描存在失败时，下一轮开始前等待
    async fn wait_retry_delay(&self) -> Result<(), DownloadError> {
        let delay = Duration::from_millis(self.config.download.retry_delay_ms);
        debug!("等待 {:?} 后重试未完成的文件", delay);
        tokio::select! {
            _ = tokio::time::sleep(delay) => Ok(()),
            _ = self.control.stop_token().cancelled() => Err(DownloadError::Cancelled),
        }
    }

    // ========================================================================
    // 解包
    // ========================================================================

    async fn unpack_all(&self, state: &RunState) -> Result<(), DownloadError> {
        for (index, name) in state.names.iter().enumerate() {
            if !should_unpack(name) {
                debug!("跳过分卷: {}", name);
                continue;
            }

            let file = state.destination(index);
            let dest = state.folder.clone();
            let unpacker = Arc::clone(&self.unpacker);
            let source = file.clone();
            let result = tokio::task::spawn_blocking(move || unpacker.unpack(&source, &dest))
                .await
                .unwrap_or_else(|e| {
                    error!("解包任务异常退出: {}", e);
                    UnpackResult::SystemError
                });

            match result {
                UnpackResult::Success => info!("✓ 已解包: {}", name),
                UnpackResult::NotAnArchive => debug!("不是压缩包，跳过: {}", name),
                UnpackResult::NoSpace => {
                    return Err(DownloadError::NoSpace(state.folder.display().to_string()))
                }
                other => {
                    let message = match other {
                        UnpackResult::NoPassword => format!("解包 {} 需要密码", name),
                        UnpackResult::InvalidArchive => format!("压缩包 {} 已损坏", name),
                        _ => format!("解包 {} 失败", name),
                    };
                    self.view.show_message(MessageKind::Error, &message);
                }
            }
        }
        Ok(())
    }
}

/// 无法创建或写入目标文件时的运行错误
fn local_resource_error(
    status: JobStatus,
    destination: &Path,
    merge_error: Option<String>,
) -> DownloadError {
    match (status, merge_error) {
        (JobStatus::MergeFailed, Some(reason)) => {
            DownloadError::LocalResource(format!("写入文件 {:?} 失败: {}", destination, reason))
        }
        (JobStatus::MergeFailed, None) => {
            DownloadError::LocalResource(format!("写入文件 {:?} 失败", destination))
        }
        _ => DownloadError::LocalResource(format!("无法创建文件 {:?}", destination)),
    }
}

/// 删除失效的数据文件（不存在视为成功）
fn remove_stale_file(path: &Path) {
    match std::fs::remove_file(path) {
        Ok(()) => info!("已删除失效文件: {:?}", path),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => warn!("删除失效文件失败: {:?}, 错误: {}", path, e),
    }
}

/// 已完成的文件是否仍然存在且大小一致
fn finished_file_intact(path: &Path, expected: Option<u64>) -> bool {
    match std::fs::metadata(path) {
        Ok(meta) => expected.map(|size| size == meta.len()).unwrap_or(true),
        Err(_) => false,
    }
}

/// 路径所在磁盘的剩余空间（按最长挂载点前缀匹配）
fn available_space(path: &Path) -> Option<u64> {
    let path = std::fs::canonicalize(path).unwrap_or_else(|_| path.to_path_buf());
    let disks = sysinfo::Disks::new_with_refreshed_list();
    disks
        .list()
        .iter()
        .filter(|disk| path.starts_with(disk.mount_point()))
        .max_by_key(|disk| disk.mount_point().as_os_str().len())
        .map(|disk| disk.available_space())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::downloader::segment::split_part;
    use crate::downloader::Manifest;
    use crate::persistence::SegmentSnapshot;
    use mockito::{Mock, ServerGuard};
    use parking_lot::Mutex;
    use std::io::Write;
    use tempfile::TempDir;

    const PART: u64 = 10;

    #[derive(Default)]
    struct MemoryFolders {
        folder: Mutex<Option<PathBuf>>,
    }

    impl FolderStore for MemoryFolders {
        fn get_saved_folder(&self) -> Option<PathBuf> {
            self.folder.lock().clone()
        }

        fn save_folder(&self, path: &Path) -> anyhow::Result<()> {
            *self.folder.lock() = Some(path.to_path_buf());
            Ok(())
        }
    }

    #[derive(Default)]
    struct RecordingUnpacker {
        calls: Mutex<Vec<PathBuf>>,
    }

    impl Unpacker for RecordingUnpacker {
        fn unpack(&self, file: &Path, _dest_dir: &Path) -> UnpackResult {
            self.calls.lock().push(file.to_path_buf());
            UnpackResult::NotAnArchive
        }
    }

    #[derive(Default)]
    struct RecordingView {
        messages: Mutex<Vec<(MessageKind, String)>>,
        updates: Mutex<u32>,
    }

    impl ProgressView for RecordingView {
        fn set_displayed_data(&self, _name: &str, _speed: f64, file: f64, total: f64) {
            assert!((0.0..=100.0).contains(&file));
            assert!((0.0..=100.0).contains(&total));
            *self.updates.lock() += 1;
        }

        fn show_message(&self, kind: MessageKind, message: &str) {
            self.messages.lock().push((kind, message.to_string()));
        }
    }

    struct Fixture {
        dir: TempDir,
        config: AppConfig,
        folders: Arc<MemoryFolders>,
        unpacker: Arc<RecordingUnpacker>,
        view: Arc<RecordingView>,
    }

    impl Fixture {
        fn new(urls: Vec<String>) -> Self {
            let dir = TempDir::new().unwrap();
            let mut config = AppConfig::default();
            config.download.urls = urls;
            config.download.download_dir = dir.path().join("downloads");
            config.download.part_size = PART;
            config.download.verify_buffer_size = 7;
            config.download.poll_interval_ms = 10;
            config.download.retry_delay_ms = 10;
            config.download.check_free_space = false;
            config.persistence.checkpoint_path = dir.path().join("cp.json");
            config.persistence.checkpoint_interval_ms = 20;
            Self {
                dir,
                config,
                folders: Arc::new(MemoryFolders::default()),
                unpacker: Arc::new(RecordingUnpacker::default()),
                view: Arc::new(RecordingView::default()),
            }
        }

        fn coordinator(&self) -> DownloadCoordinator {
            let http = Arc::new(HttpClient::new(&self.config.download).unwrap());
            DownloadCoordinator::new(
                &self.config,
                http,
                self.folders.clone(),
                self.unpacker.clone(),
                self.view.clone(),
            )
        }

        fn downloads(&self) -> PathBuf {
            self.dir.path().join("downloads")
        }
    }

    fn content(len: usize, seed: u8) -> Vec<u8> {
        (0..len).map(|i| (i as u8).wrapping_mul(31).wrapping_add(seed)).collect()
    }

    fn manifest_text(data: &[u8], threads: usize) -> String {
        let mut text = format!("{}\n", threads);
        for chunk in data.chunks(PART as usize) {
            text.push_str(&format!("{:x}\n", md5::compute(chunk)));
        }
        text.push_str(&format!("{:x}\n", md5::compute(data)));
        text
    }

    async fn serve_file(
        server: &mut ServerGuard,
        path: &str,
        data: &[u8],
        threads: usize,
        manifest: &str,
    ) -> Vec<Mock> {
        let total = data.len() as u64;
        let mut mocks = vec![
            server
                .mock("GET", format!("{}.md5", path).as_str())
                .with_status(200)
                .with_body(manifest)
                .create_async()
                .await,
            server
                .mock("GET", path)
                .match_header("range", "bytes=0-0")
                .with_status(206)
                .with_header("content-range", &format!("bytes 0-0/{}", total))
                .with_body(&data[..1])
                .create_async()
                .await,
        ];

        let mut offset = 0;
        while offset < total {
            let size = PART.min(total - offset);
            for seg in split_part(offset, size, threads) {
                let (start, end) = (seg.start(), seg.end() - 1);
                mocks.push(
                    server
                        .mock("GET", path)
                        .match_header("range", format!("bytes={}-{}", start, end).as_str())
                        .with_status(206)
                        .with_body(&data[start as usize..=end as usize])
                        .create_async()
                        .await,
                );
            }
            offset += size;
        }
        mocks
    }

    /// 先发送前 `head` 字节，停顿 `pause` 后再发送其余部分
    async fn mock_slow_range(
        server: &mut ServerGuard,
        path: &str,
        data: &[u8],
        (start, end): (u64, u64),
        head: usize,
        pause: Duration,
    ) -> Mock {
        let body = data[start as usize..=end as usize].to_vec();
        server
            .mock("GET", path)
            .match_header("range", format!("bytes={}-{}", start, end).as_str())
            .with_status(206)
            .with_chunked_body(move |w| {
                w.write_all(&body[..head])?;
                std::thread::sleep(pause);
                w.write_all(&body[head..])
            })
            .expect(1)
            .create_async()
            .await
    }

    async fn mock_range(server: &mut ServerGuard, path: &str, data: &[u8], start: u64, end: u64) -> Mock {
        server
            .mock("GET", path)
            .match_header("range", format!("bytes={}-{}", start, end).as_str())
            .with_status(206)
            .with_body(&data[start as usize..=end as usize])
            .expect(1)
            .create_async()
            .await
    }

    async fn wait_for_file(path: &Path) {
        for _ in 0..1000 {
            if path.exists() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("file never appeared: {:?}", path);
    }

    #[tokio::test]
    async fn test_downloads_verifies_and_unpacks_first_volume() {
        let mut server = mockito::Server::new_async().await;
        let a = content(25, 1);
        let b = content(14, 2);
        serve_file(&mut server, "/game.part1.rar", &a, 2, &manifest_text(&a, 2)).await;
        serve_file(&mut server, "/game.part2.rar", &b, 3, &manifest_text(&b, 3)).await;

        let fixture = Fixture::new(vec![
            format!("{}/game.part1.rar", server.url()),
            format!("{}/game.part2.rar", server.url()),
        ]);
        let outcome = fixture.coordinator().run().await;
        assert_eq!(outcome, RunOutcome::Completed);

        let downloads = fixture.downloads();
        assert_eq!(std::fs::read(downloads.join("game.part1.rar")).unwrap(), a);
        assert_eq!(std::fs::read(downloads.join("game.part2.rar")).unwrap(), b);

        // 断点在全部完成后删除
        assert!(!fixture.config.persistence.checkpoint_path.exists());
        // 下载目录被记住
        assert_eq!(fixture.folders.get_saved_folder(), Some(downloads.clone()));
        // 只解包第 1 卷
        assert_eq!(
            *fixture.unpacker.calls.lock(),
            vec![downloads.join("game.part1.rar")]
        );
        assert!(*fixture.view.updates.lock() > 0);
    }

    #[tokio::test]
    async fn test_checksum_mismatch_is_integrity_failure() {
        let mut server = mockito::Server::new_async().await;
        let data = content(12, 3);
        let mut manifest = manifest_text(&data, 2);
        manifest.push_str("00000000000000000000000000000000\n");
        serve_file(&mut server, "/a.bin", &data, 2, &manifest).await;

        let fixture = Fixture::new(vec![format!("{}/a.bin", server.url())]);
        let outcome = fixture.coordinator().run().await;
        assert!(matches!(
            outcome,
            RunOutcome::Failed(DownloadError::Integrity(_))
        ));

        // 断点保留，描述未完成
        let record = CheckpointStore::new(&fixture.config.persistence.checkpoint_path)
            .load()
            .unwrap();
        assert!(!record.descriptors[0].finished);
        assert!(record.active_job.is_none());
        assert!(fixture.unpacker.calls.lock().is_empty());
        assert!(fixture
            .view
            .messages
            .lock()
            .iter()
            .any(|(kind, _)| *kind == MessageKind::Error));
    }

    #[tokio::test]
    async fn test_no_manifest_aborts() {
        let server = mockito::Server::new_async().await;
        let fixture = Fixture::new(vec![format!("{}/missing.bin", server.url())]);
        let outcome = fixture.coordinator().run().await;
        assert_eq!(outcome, RunOutcome::Failed(DownloadError::NoManifest));
    }

    #[tokio::test]
    async fn test_invalid_url_is_reported_and_skipped() {
        let mut server = mockito::Server::new_async().await;
        let data = content(5, 4);
        serve_file(&mut server, "/ok.bin", &data, 1, &manifest_text(&data, 1)).await;

        let fixture = Fixture::new(vec![
            format!("{}/", server.url()),
            format!("{}/ok.bin", server.url()),
        ]);
        let outcome = fixture.coordinator().run().await;
        assert_eq!(outcome, RunOutcome::Completed);
        assert!(fixture
            .view
            .messages
            .lock()
            .iter()
            .any(|(kind, msg)| *kind == MessageKind::Error && msg.contains("无效")));
    }

    #[tokio::test]
    async fn test_stop_before_run_is_cancelled() {
        let mut server = mockito::Server::new_async().await;
        let data = content(5, 5);
        serve_file(&mut server, "/a.bin", &data, 1, &manifest_text(&data, 1)).await;

        let fixture = Fixture::new(vec![format!("{}/a.bin", server.url())]);
        let coordinator = fixture.coordinator();
        coordinator.control().request_stop();
        assert_eq!(coordinator.run().await, RunOutcome::Cancelled);
        assert!(fixture.view.messages.lock().is_empty());
    }

    #[tokio::test]
    async fn test_resumes_checkpointed_part_without_refetching_earlier_parts() {
        let mut server = mockito::Server::new_async().await;
        let data = content(30, 6);
        let manifest = manifest_text(&data, 2);
        let url = format!("{}/big.bin", server.url());

        server
            .mock("GET", "/big.bin.md5")
            .with_body(&manifest)
            .create_async()
            .await;
        server
            .mock("GET", "/big.bin")
            .match_header("range", "bytes=0-0")
            .with_status(206)
            .with_header("content-range", "bytes 0-0/30")
            .with_body(&data[..1])
            .create_async()
            .await;
        // 第 2 部分 [20,30) 两段各写了 2 和 5 字节
        let remaining = server
            .mock("GET", "/big.bin")
            .match_header("range", "bytes=22-24")
            .with_status(206)
            .with_body(&data[22..25])
            .expect(1)
            .create_async()
            .await;

        let fixture = Fixture::new(vec![url.clone()]);
        let downloads = fixture.downloads();
        std::fs::create_dir_all(&downloads).unwrap();
        let dest = downloads.join("big.bin");
        let mut partial = data.clone();
        partial[22..25].fill(0);
        std::fs::write(&dest, &partial).unwrap();

        let descriptor = FileDescriptor::new(url.clone(), Manifest::parse(&manifest).unwrap());
        let snapshot = JobSnapshot {
            url: url.clone(),
            destination: dest.clone(),
            total_size: 30,
            status: JobStatus::Started,
            downloaded_bytes: 27,
            current_part_index: 2,
            thread_count: 2,
            segments: vec![
                SegmentSnapshot {
                    seg_offset: 0,
                    length: 5,
                    bytes_written: 2,
                },
                SegmentSnapshot {
                    seg_offset: 5,
                    length: 5,
                    bytes_written: 5,
                },
            ],
        };
        CheckpointStore::new(&fixture.config.persistence.checkpoint_path)
            .save(&[descriptor], Some(&snapshot))
            .unwrap();

        let outcome = fixture.coordinator().run().await;
        assert_eq!(outcome, RunOutcome::Completed);
        assert_eq!(std::fs::read(&dest).unwrap(), data);
        remaining.assert_async().await;
    }

    #[tokio::test]
    async fn test_drift_on_other_file_deletes_and_rewinds() {
        let fixture = Fixture::new(Vec::new());
        let coordinator = fixture.coordinator();
        let folder = fixture.downloads();
        std::fs::create_dir_all(&folder).unwrap();
        std::fs::write(folder.join("b.bin"), b"old bytes").unwrap();

        let manifest = Manifest {
            thread_count: 1,
            checksums: vec!["AA".to_string()],
        };
        let mut finished = FileDescriptor::new("http://h/b.bin".to_string(), manifest.clone());
        finished.mark_finished("b.bin".to_string(), 9);

        let mut state = RunState {
            folder: folder.clone(),
            descriptors: vec![
                FileDescriptor::new("http://h/a.bin".to_string(), manifest),
                finished,
            ],
            names: vec!["a.bin".to_string(), "b.bin".to_string()],
            sizes: vec![Some(1), Some(9)],
            pending_resume: None,
            rewind_to: None,
            failed_in_pass: false,
        };

        coordinator.apply_drift(&mut state, 1);
        assert!(!folder.join("b.bin").exists());
        assert!(!state.descriptors[1].finished);
        assert_eq!(state.rewind_to, Some(1));
        assert_eq!(state.next_unfinished(1), Some(1));

        // 提示是信息而不是错误
        let messages = fixture.view.messages.lock();
        assert_eq!(messages.len(), 1);
        assert_eq!(messages[0].0, MessageKind::Info);
    }

    #[tokio::test]
    async fn test_manifest_change_for_finished_file_during_download() {
        let mut server = mockito::Server::new_async().await;
        let b_old = content(12, 7);
        let b_new = content(15, 9);
        let a = content(20, 8);

        let b_mocks = serve_file(&mut server, "/b.bin", &b_old, 1, &manifest_text(&b_old, 1)).await;
        server
            .mock("GET", "/a.bin.md5")
            .with_body(manifest_text(&a, 1))
            .create_async()
            .await;
        server
            .mock("GET", "/a.bin")
            .match_header("range", "bytes=0-0")
            .with_status(206)
            .with_header("content-range", "bytes 0-0/20")
            .with_body(&a[..1])
            .create_async()
            .await;
        let a_slow = mock_slow_range(
            &mut server,
            "/a.bin",
            &a,
            (0, 9),
            3,
            Duration::from_millis(2500),
        )
        .await;
        let a_tail = mock_range(&mut server, "/a.bin", &a, 10, 19).await;

        let mut fixture = Fixture::new(vec![
            format!("{}/b.bin", server.url()),
            format!("{}/a.bin", server.url()),
        ]);
        fixture.config.download.manifest_recheck_secs = 1;
        let coordinator = fixture.coordinator();
        let downloads = fixture.downloads();
        let a_dest = downloads.join("a.bin");

        let (outcome, ()) = tokio::join!(coordinator.run(), async {
            // a.bin 出现时 b.bin 已下载并校验完成
            wait_for_file(&a_dest).await;
            assert_eq!(std::fs::read(downloads.join("b.bin")).unwrap(), b_old);

            for mock in b_mocks {
                mock.remove_async().await;
            }
            serve_file(&mut server, "/b.bin", &b_new, 1, &manifest_text(&b_new, 1)).await;
        });

        assert_eq!(outcome, RunOutcome::Completed);
        assert_eq!(std::fs::read(&a_dest).unwrap(), a);
        assert_eq!(std::fs::read(downloads.join("b.bin")).unwrap(), b_new);
        // a.bin 的任务没有被打断
        a_slow.assert_async().await;
        a_tail.assert_async().await;
        assert!(fixture
            .view
            .messages
            .lock()
            .iter()
            .any(|(kind, msg)| *kind == MessageKind::Info
                && msg.contains("已更新")
                && msg.contains("b.bin")));
    }

    #[tokio::test]
    async fn test_thread_count_recheck_restarts_active_part() {
        let mut server = mockito::Server::new_async().await;
        let data = content(20, 10);

        let one_thread = server
            .mock("GET", "/a.bin.md5")
            .with_body(manifest_text(&data, 1))
            .create_async()
            .await;
        server
            .mock("GET", "/a.bin")
            .match_header("range", "bytes=0-0")
            .with_status(206)
            .with_header("content-range", "bytes 0-0/20")
            .with_body(&data[..1])
            .create_async()
            .await;
        let mut mocks = vec![
            mock_slow_range(
                &mut server,
                "/a.bin",
                &data,
                (0, 9),
                3,
                Duration::from_millis(2500),
            )
            .await,
        ];
        // 线程数改为 2 后：第 0 部分保留已写入的 3 字节，第 1 部分按新线程数切分
        for (start, end) in [(3, 4), (5, 9), (10, 14), (15, 19)] {
            mocks.push(mock_range(&mut server, "/a.bin", &data, start, end).await);
        }

        let mut fixture = Fixture::new(vec![format!("{}/a.bin", server.url())]);
        fixture.config.download.manifest_recheck_secs = 1;
        let coordinator = fixture.coordinator();
        let dest = fixture.downloads().join("a.bin");

        let (outcome, ()) = tokio::join!(coordinator.run(), async {
            wait_for_file(&dest).await;
            one_thread.remove_async().await;
            server
                .mock("GET", "/a.bin.md5")
                .with_body(manifest_text(&data, 2))
                .create_async()
                .await;
        });

        assert_eq!(outcome, RunOutcome::Completed);
        assert_eq!(std::fs::read(&dest).unwrap(), data);
        for mock in mocks {
            mock.assert_async().await;
        }
        assert!(!fixture.config.persistence.checkpoint_path.exists());
    }

    #[test]
    fn test_write_failure_is_local_resource_error() {
        let dest = Path::new("/data/a.bin");

        let err = local_resource_error(
            JobStatus::MergeFailed,
            dest,
            Some("Bad file descriptor".to_string()),
        );
        assert!(matches!(err, DownloadError::LocalResource(_)));
        assert!(err.to_string().contains("Bad file descriptor"));
        assert!(err.is_user_visible());

        let err = local_resource_error(JobStatus::CreateFailed, dest, None);
        assert!(matches!(err, DownloadError::LocalResource(ref m) if m.contains("无法创建")));
    }
}
