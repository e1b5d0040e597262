//! 进度显示
//!
//! 协调器按轮询间隔把 (文件名, 速度, 文件百分比, 总百分比) 推给界面；
//! 界面通过 [`TransferControl`](super::TransferControl) 发出暂停、恢复、停止请求

use parking_lot::Mutex;
use std::time::{Duration, Instant};
use tracing::{error, info};

/// EWMA 平滑系数（旧值权重）
const SPEED_SMOOTHING: f64 = 0.85;

/// 速度计算器
///
/// 速度 = 上次采样以来交付的字节数 / 经过的时间，再做 EWMA 平滑。
/// 暂停和恢复时调用 [`reset_baseline`](Self::reset_baseline)，暂停期间的时间不计入
#[derive(Debug, Clone)]
pub struct SpeedCalculator {
    last_sample: Instant,
    /// 平滑后的速度（bytes/s）
    speed: f64,
    has_sample: bool,
}

impl Default for SpeedCalculator {
    fn default() -> Self {
        Self::new()
    }
}

impl SpeedCalculator {
    pub fn new() -> Self {
        Self {
            last_sample: Instant::now(),
            speed: 0.0,
            has_sample: false,
        }
    }

    /// 记录新增字节并返回当前速度（bytes/s）
    pub fn sample(&mut self, bytes: u64) -> f64 {
        self.sample_at(bytes, Instant::now())
    }

    fn sample_at(&mut self, bytes: u64, now: Instant) -> f64 {
        let elapsed = now.duration_since(self.last_sample);
        if elapsed < Duration::from_millis(1) {
            return self.speed;
        }
        self.last_sample = now;

        let instant = bytes as f64 / elapsed.as_secs_f64();
        if self.has_sample {
            self.speed = self.speed * SPEED_SMOOTHING + instant * (1.0 - SPEED_SMOOTHING);
        } else {
            self.speed = instant;
            self.has_sample = true;
        }
        self.speed
    }

    /// 重置时间基线并清空平滑状态
    pub fn reset_baseline(&mut self) {
        self.last_sample = Instant::now();
        self.speed = 0.0;
        self.has_sample = false;
    }

    /// 当前速度（KB/s）
    pub fn speed_kib(&self) -> f64 {
        self.speed / 1024.0
    }
}

/// 百分比（0-100），总数未知时为 0
pub fn percent(done: u64, total: u64) -> f64 {
    if total == 0 {
        return 0.0;
    }
    (done as f64 / total as f64 * 100.0).clamp(0.0, 100.0)
}

/// 提示消息类型
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageKind {
    Info,
    Error,
}

/// 进度界面
pub trait ProgressView: Send + Sync {
    /// 更新显示
    ///
    /// # 参数
    /// * `name` - 当前文件名
    /// * `speed_kib_s` - 速度（KB/s）
    /// * `file_percent` - 当前文件进度
    /// * `total_percent` - 全部文件进度
    fn set_displayed_data(&self, name: &str, speed_kib_s: f64, file_percent: f64, total_percent: f64);

    /// 用户是否关闭了界面
    fn is_closed_by_user(&self) -> bool {
        false
    }

    /// 显示提示或错误
    fn show_message(&self, kind: MessageKind, message: &str);
}

/// 通过日志输出进度（无界面运行时使用）
pub struct LogProgressView {
    interval: Duration,
    last_report: Mutex<Option<Instant>>,
}

impl LogProgressView {
    /// # 参数
    /// * `interval` - 两次进度日志之间的最小间隔
    pub fn new(interval: Duration) -> Self {
        Self {
            interval,
            last_report: Mutex::new(None),
        }
    }
}

impl Default for LogProgressView {
    fn default() -> Self {
        Self::new(Duration::from_secs(2))
    }
}

impl ProgressView for LogProgressView {
    fn set_displayed_data(&self, name: &str, speed_kib_s: f64, file_percent: f64, total_percent: f64) {
        let now = Instant::now();
        let mut last = self.last_report.lock();
        if let Some(prev) = *last {
            if now.duration_since(prev) < self.interval && file_percent < 100.0 {
                return;
            }
        }
        *last = Some(now);

        info!(
            "📥 {} | {:.1} KB/s | 文件 {:.1}% | 总计 {:.1}%",
            name, speed_kib_s, file_percent, total_percent
        );
    }

    fn show_message(&self, kind: MessageKind, message: &str) {
        match kind {
            MessageKind::Info => info!("{}", message),
            MessageKind::Error => error!("❌ {}", message),
        }
    }
}
