//! 下载用 HTTP 客户端
//!
//! 封装共享的 reqwest 连接池，提供三种请求：
//! - 文件大小探测（HEAD，失败时退回 `Range: bytes=0-0`）
//! - 文本获取（清单文件，缓冲区按需增长）
//! - 区间请求（分段下载）

use anyhow::{Context, Result};
use futures::StreamExt;
use reqwest::header::{CONTENT_LENGTH, CONTENT_RANGE, RANGE};
use reqwest::{Client, Response, StatusCode, Url};
use std::time::Duration;
use tracing::debug;

use crate::config::DownloadConfig;
use crate::error::DownloadError;

/// 文本请求允许的最大响应体（1MB）
pub const MAX_TEXT_SIZE: usize = 1024 * 1024;

/// 共享 HTTP 客户端
#[derive(Debug, Clone)]
pub struct HttpClient {
    client: Client,
    /// 短请求（探测、清单）超时
    request_timeout: Duration,
}

impl HttpClient {
    /// 根据下载配置创建客户端
    pub fn new(config: &DownloadConfig) -> Result<Self> {
        let client = Client::builder()
            .user_agent(config.user_agent.as_str())
            .connect_timeout(Duration::from_secs(config.connect_timeout_secs))
            .pool_max_idle_per_host(32)
            .pool_idle_timeout(Duration::from_secs(90))
            .tcp_keepalive(Duration::from_secs(60))
            .tcp_nodelay(true)
            .redirect(reqwest::redirect::Policy::limited(10))
            .build()
            .context("创建 HTTP 客户端失败")?;

        Ok(Self {
            client,
            request_timeout: Duration::from_secs(config.request_timeout_secs),
        })
    }

    /// 探测远程文件大小
    pub async fn fetch_size(&self, url: &str) -> Result<u64> {
        let resp = self
            .client
            .head(url)
            .timeout(self.request_timeout)
            .send()
            .await
            .context("发送 HEAD 请求失败")?;

        if resp.status().is_success() {
            if let Some(size) = header_u64(&resp, CONTENT_LENGTH) {
                debug!("HEAD 探测文件大小: {} -> {} bytes", url, size);
                return Ok(size);
            }
        }

        debug!(
            "HEAD 未返回文件大小 (status={})，改用 Range 探测: {}",
            resp.status(),
            url
        );

        let resp = self
            .client
            .get(url)
            .header(RANGE, "bytes=0-0")
            .timeout(self.request_timeout)
            .send()
            .await
            .context("发送 Range 探测请求失败")?;

        match resp.status() {
            StatusCode::PARTIAL_CONTENT => resp
                .headers()
                .get(CONTENT_RANGE)
                .and_then(|v| v.to_str().ok())
                .and_then(parse_content_range_total)
                .context("响应缺少有效的 Content-Range"),
            StatusCode::OK => header_u64(&resp, CONTENT_LENGTH).context("响应缺少 Content-Length"),
            // 空文件对 bytes=0-0 返回 416
            StatusCode::RANGE_NOT_SATISFIABLE => Ok(resp
                .headers()
                .get(CONTENT_RANGE)
                .and_then(|v| v.to_str().ok())
                .and_then(parse_content_range_total)
                .unwrap_or(0)),
            status => anyhow::bail!("探测文件大小失败: HTTP {}", status),
        }
    }

    /// 获取文本内容
    ///
    /// 不信任 Content-Length，边读边扩充缓冲区，超过 [`MAX_TEXT_SIZE`] 视为错误
    pub async fn fetch_text(&self, url: &str) -> Result<String> {
        let resp = self
            .client
            .get(url)
            .timeout(self.request_timeout)
            .send()
            .await
            .context("发送HTTP请求失败")?;

        if !resp.status().is_success() {
            anyhow::bail!("HTTP错误: {}", resp.status());
        }

        let mut body = Vec::new();
        let mut stream = resp.bytes_stream();
        while let Some(chunk) = stream.next().await {
            let chunk = chunk.context("读取数据流失败")?;
            if body.len() + chunk.len() > MAX_TEXT_SIZE {
                anyhow::bail!("响应内容超过 {} bytes 上限", MAX_TEXT_SIZE);
            }
            body.extend_from_slice(&chunk);
        }

        Ok(String::from_utf8_lossy(&body).into_owned())
    }

    /// 发起区间请求 `[start, end_inclusive]`
    ///
    /// 服务器必须返回 206；只有请求从 0 开始且覆盖整个资源时才接受 200
    pub async fn get_range(&self, url: &str, start: u64, end_inclusive: u64) -> Result<Response> {
        let resp = self
            .client
            .get(url)
            .header(RANGE, format!("bytes={}-{}", start, end_inclusive))
            .send()
            .await
            .context("发送HTTP请求失败")?;

        match resp.status() {
            StatusCode::PARTIAL_CONTENT => Ok(resp),
            StatusCode::OK
                if start == 0 && header_u64(&resp, CONTENT_LENGTH) == Some(end_inclusive + 1) =>
            {
                Ok(resp)
            }
            StatusCode::OK => anyhow::bail!("服务器不支持 Range 请求"),
            status => anyhow::bail!("HTTP错误: {}", status),
        }
    }
}

fn header_u64(resp: &Response, name: reqwest::header::HeaderName) -> Option<u64> {
    resp.headers()
        .get(name)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.trim().parse().ok())
}

/// 解析 `Content-Range: bytes 0-0/12345` 中的总大小
fn parse_content_range_total(value: &str) -> Option<u64> {
    let (_, total) = value.rsplit_once('/')?;
    total.trim().parse().ok()
}

/// 从地址中取出文件名（最后一个路径段，百分号解码）
pub fn file_name_from_url(url: &str) -> Result<String, DownloadError> {
    let parsed = Url::parse(url).map_err(|_| DownloadError::InvalidUrl(url.to_string()))?;
    let segment = parsed
        .path_segments()
        .and_then(|segments| segments.last())
        .unwrap_or_default();

    let decoded = urlencoding::decode(segment)
        .map(|s| s.into_owned())
        .unwrap_or_else(|_| segment.to_string());

    // 文件名中不允许出现路径分隔符
    let name = decoded.trim();
    if name.is_empty() || name == "." || name == ".." || name.contains(['/', '\\']) {
        return Err(DownloadError::InvalidUrl(url.to_string()));
    }
    Ok(name.to_string())
}
