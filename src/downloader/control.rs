//! 传输控制信号
//!
//! 停止使用 `CancellationToken` 广播，暂停使用 `watch` 通道广播。
//! 每个分段线程持有同一组信号，在每个数据块边界检查

use std::sync::Arc;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::info;

/// 用户级传输控制句柄（可克隆，交给界面或信号处理）
#[derive(Debug, Clone)]
pub struct TransferControl {
    stop: CancellationToken,
    pause: Arc<watch::Sender<bool>>,
}

impl Default for TransferControl {
    fn default() -> Self {
        Self::new()
    }
}

impl TransferControl {
    pub fn new() -> Self {
        let (pause, _) = watch::channel(false);
        Self {
            stop: CancellationToken::new(),
            pause: Arc::new(pause),
        }
    }

    /// 请求停止（不可撤销）
    pub fn request_stop(&self) {
        if !self.stop.is_cancelled() {
            info!("收到停止请求");
            self.stop.cancel();
        }
    }

    pub fn is_stop_requested(&self) -> bool {
        self.stop.is_cancelled()
    }

    /// 请求暂停：连接保持，只是暂停交付数据
    pub fn request_pause(&self) {
        if !self.pause.send_replace(true) {
            info!("下载已暂停");
        }
    }

    /// 恢复下载
    pub fn request_resume(&self) {
        if self.pause.send_replace(false) {
            info!("下载已恢复");
        }
    }

    pub fn is_paused(&self) -> bool {
        *self.pause.borrow()
    }

    /// 用户级停止令牌
    pub fn stop_token(&self) -> &CancellationToken {
        &self.stop
    }

    /// 订阅暂停状态
    pub fn subscribe_pause(&self) -> watch::Receiver<bool> {
        self.pause.subscribe()
    }

    /// 为一组分段创建信号（`stop` 通常是当前分段的子令牌）
    pub fn segment_signal(&self, stop: CancellationToken) -> SegmentSignal {
        SegmentSignal {
            stop,
            pause: self.subscribe_pause(),
        }
    }
}

/// 分段线程持有的信号
#[derive(Debug, Clone)]
pub struct SegmentSignal {
    stop: CancellationToken,
    pause: watch::Receiver<bool>,
}

impl SegmentSignal {
    pub fn is_stopped(&self) -> bool {
        self.stop.is_cancelled()
    }

    /// 等待停止信号
    pub async fn stopped(&self) {
        self.stop.cancelled().await
    }

    /// 如处于暂停状态则等待恢复
    ///
    /// 返回 `false` 表示等待期间（或之前）收到了停止信号
    pub async fn wait_while_paused(&mut self) -> bool {
        loop {
            if self.stop.is_cancelled() {
                return false;
            }
            if !*self.pause.borrow_and_update() {
                return true;
            }
            tokio::select! {
                _ = self.stop.cancelled() => return false,
                changed = self.pause.changed() => {
                    // 发送端已释放，不会再有暂停
                    if changed.is_err() {
                        return !self.stop.is_cancelled();
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn test_not_paused_returns_immediately() {
        let control = TransferControl::new();
        let mut signal = control.segment_signal(control.stop_token().child_token());
        assert!(signal.wait_while_paused().await);
    }

    #[tokio::test]
    async fn test_pause_then_resume() {
        let control = TransferControl::new();
        control.request_pause();
        assert!(control.is_paused());

        let mut signal = control.segment_signal(control.stop_token().child_token());
        let waiter = tokio::spawn(async move { signal.wait_while_paused().await });

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!waiter.is_finished());

        control.request_resume();
        assert!(waiter.await.unwrap());
    }

    #[tokio::test]
    async fn test_stop_while_paused() {
        let control = TransferControl::new();
        control.request_pause();

        let mut signal = control.segment_signal(control.stop_token().child_token());
        let waiter = tokio::spawn(async move { signal.wait_while_paused().await });

        tokio::time::sleep(Duration::from_millis(20)).await;
        control.request_stop();
        assert!(!waiter.await.unwrap());
    }

    #[tokio::test]
    async fn test_child_token_does_not_stop_user() {
        let control = TransferControl::new();
        let part = control.stop_token().child_token();
        let signal = control.segment_signal(part.clone());

        part.cancel();
        assert!(signal.is_stopped());
        assert!(!control.is_stop_requested());
    }
}
