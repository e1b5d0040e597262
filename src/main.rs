use resumable_downloader::{
    config::LogConfig, logging, AppConfig, CliArgs, DownloadCoordinator, HttpClient,
    TomlFolderStore, LogProgressView, RunOutcome, ZipUnpacker,
};
use clap::Parser;
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info, warn};

/// 退出码
const EXIT_OK: i32 = 0;
const EXIT_FAILED: i32 = 1;
const EXIT_USAGE: i32 = 2; // 与 clap 的参数错误退出码一致
const EXIT_CANCELLED: i32 = 130;

/// 加载日志配置（配置文件缺失或无效时使用默认值）
async fn load_log_config(config_path: &str) -> LogConfig {
    if let Ok(content) = tokio::fs::read_to_string(config_path).await {
        if let Ok(config) = toml::from_str::<toml::Value>(&content) {
            if let Some(log_table) = config.get("log") {
                if let Ok(log_config) = log_table.clone().try_into::<LogConfig>() {
                    return log_config;
                }
            }
        }
    }

    LogConfig::default()
}

#[tokio::main]
async fn main() {
    // 参数错误时由 clap 输出用法并以退出码 2 退出
    let args = CliArgs::parse();

    // 🔥 先加载日志配置（必须保持 log_guard 存活）
    let log_config = load_log_config(&args.config_path).await;
    let log_guard = logging::init_logging(&log_config);

    info!("Resumable Downloader v{} 启动中...", env!("CARGO_PKG_VERSION"));

    let code = run(args).await;

    // process::exit 不会执行析构，先刷新日志
    drop(log_guard);
    std::process::exit(code);
}

async fn run(args: CliArgs) -> i32 {
    let mut config = AppConfig::load_or_default(&args.config_path).await;
    config.download.add_urls(args.urls);

    if config.download.urls.is_empty() {
        error!(
            "没有下载地址：请在 {} 的 [download].urls 中配置，或在命令行中传入",
            args.config_path
        );
        return EXIT_USAGE;
    }
    if let Err(e) = config.download.validate() {
        error!("下载配置无效: {:#}", e);
        return EXIT_USAGE;
    }

    let http = match HttpClient::new(&config.download) {
        Ok(client) => Arc::new(client),
        Err(e) => {
            error!("初始化 HTTP 客户端失败: {:#}", e);
            return EXIT_FAILED;
        }
    };

    let folders = Arc::new(TomlFolderStore::open(config.persistence.state_file.clone()));
    let coordinator = DownloadCoordinator::new(
        &config,
        http,
        folders,
        Arc::new(ZipUnpacker::new()),
        Arc::new(LogProgressView::new(Duration::from_secs(2))),
    );

    // Ctrl+C 触发停止，断点会在退出前保存
    let control = coordinator.control();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("收到 Ctrl+C，正在停止下载...");
            control.request_stop();
        }
    });

    match coordinator.run().await {
        RunOutcome::Completed => EXIT_OK,
        RunOutcome::Cancelled => {
            warn!("下载已中断，下次运行将从断点继续");
            EXIT_CANCELLED
        }
        RunOutcome::Failed(e) => {
            error!("运行失败: {}", e);
            EXIT_FAILED
        }
    }
}
