use crate::delivery::model::error_code;
use futures::StreamExt;
use reqwest::header::{HeaderMap, HeaderValue, USER_AGENT};
use reqwest::StatusCode;
use sanitize_filename::sanitize;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::time::sleep;
use url::Url;

#[derive(Debug, Clone)]
pub struct FetchContext {
    pub user_agent: String,
    pub timeout_secs: u64,
    pub retries: u32,
    pub retry_backoff_ms: u64,
}

impl Default for FetchContext {
    fn default() -> Self {
        Self {
            user_agent: "GreenShopFeatures/0.1".to_string(),
            timeout_secs: 60,
            retries: 2,
            retry_backoff_ms: 400,
        }
    }
}

#[derive(thiserror::Error, Debug)]
pub enum FetchError {
    #[error("module package not found: {0}")]
    NotFound(String),

    #[error("http status error: {0}")]
    Status(StatusCode),

    #[error("network error: {0}")]
    Network(#[from] reqwest::Error),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl FetchError {
    /// Error code reported to install listeners.
    pub fn error_code(&self) -> i32 {
        match self {
            Self::NotFound(_) => error_code::MODULE_UNAVAILABLE,
            Self::Status(s) if *s == StatusCode::NOT_FOUND || *s == StatusCode::GONE => {
                error_code::MODULE_UNAVAILABLE
            }
            Self::Status(_) | Self::Network(_) => error_code::NETWORK_ERROR,
            Self::Io(_) => error_code::INTERNAL_ERROR,
        }
    }
}

/// Where module packages (`<id>.split`) are published.
#[derive(Debug, Clone)]
pub enum ModuleSource {
    Http(Url),
    Directory(PathBuf),
}

impl ModuleSource {
    /// Accepts `http(s)://` and `file://` URLs, or a plain directory path.
    pub fn parse(raw: &str) -> anyhow::Result<Self> {
        match Url::parse(raw) {
            Ok(u) if u.scheme() == "http" || u.scheme() == "https" => Ok(Self::Http(u)),
            Ok(u) if u.scheme() == "file" => u
                .to_file_path()
                .map(Self::Directory)
                .map_err(|_| anyhow::anyhow!("invalid file url: {}", raw)),
            Ok(u) if u.scheme().len() > 1 => anyhow::bail!("unsupported repository scheme: {}", u.scheme()),
            // bare paths, including windows drive letters parsed as a scheme
            _ => Ok(Self::Directory(PathBuf::from(raw))),
        }
    }

    pub fn package_name(module: &str) -> String {
        format!("{}.split", sanitize(module))
    }

    pub fn describe(&self) -> String {
        match self {
            Self::Http(u) => u.to_string(),
            Self::Directory(p) => p.display().to_string(),
        }
    }
}

pub struct ModuleFetcher {
    client: reqwest::Client,
    source: ModuleSource,
    ctx: FetchContext,
}

impl ModuleFetcher {
    pub fn new(source: ModuleSource, ctx: FetchContext) -> anyhow::Result<Self> {
        let client = reqwest::Client::builder()
            .redirect(reqwest::redirect::Policy::limited(10))
            .build()?;
        Ok(Self { client, source, ctx })
    }

    /// Writes the package for `module` to `dest`, reporting
    /// `(bytes_downloaded, total_bytes)`; total is 0 when unknown.
    pub async fn fetch_to_file<F>(&self, module: &str, dest: &Path, mut on_progress: F) -> Result<u64, FetchError>
    where
        F: FnMut(u64, u64) + Send,
    {
        if let Some(parent) = dest.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        match &self.source {
            ModuleSource::Http(base) => self.fetch_http(base, module, dest, &mut on_progress).await,
            ModuleSource::Directory(dir) => {
                copy_with_progress(&dir.join(ModuleSource::package_name(module)), dest, &mut on_progress).await
            }
        }
    }

    fn package_url(base: &Url, module: &str) -> Result<Url, FetchError> {
        let mut base = base.clone();
        if !base.path().ends_with('/') {
            let p = format!("{}/", base.path());
            base.set_path(&p);
        }
        base.join(&ModuleSource::package_name(module))
            .map_err(|e| FetchError::NotFound(format!("{}: {}", module, e)))
    }

    fn should_retry_status(status: StatusCode) -> bool {
        status == StatusCode::TOO_MANY_REQUESTS
            || status == StatusCode::REQUEST_TIMEOUT
            || status.is_server_error()
    }

    async fn sleep_backoff(ctx: &FetchContext, attempt: u32) {
        let base = ctx.retry_backoff_ms.max(1);
        let shift = attempt.min(16);
        let mul = 1u64 << shift;
        let ms = base.saturating_mul(mul).min(30_000);
        sleep(Duration::from_millis(ms)).await;
    }

    async fn open_http(&self, url: &Url) -> Result<reqwest::Response, FetchError> {
        let mut headers = HeaderMap::new();
        if let Ok(ua) = HeaderValue::from_str(&self.ctx.user_agent) {
            headers.insert(USER_AGENT, ua);
        }

        let mut last_err: Option<FetchError> = None;
        for attempt in 0..=self.ctx.retries {
            if attempt > 0 {
                Self::sleep_backoff(&self.ctx, attempt - 1).await;
            }

            let resp = match self
                .client
                .get(url.clone())
                .headers(headers.clone())
                .timeout(Duration::from_secs(self.ctx.timeout_secs))
                .send()
                .await
            {
                Ok(r) => r,
                Err(e) => {
                    tracing::debug!("[FETCH] attempt {} for {} failed: {}", attempt, url, e);
                    last_err = Some(e.into());
                    continue;
                }
            };

            match resp.status() {
                s if s.is_success() => return Ok(resp),
                StatusCode::NOT_FOUND | StatusCode::GONE => return Err(FetchError::NotFound(url.to_string())),
                s if Self::should_retry_status(s) => {
                    last_err = Some(FetchError::Status(s));
                    continue;
                }
                s => return Err(FetchError::Status(s)),
            }
        }

        Err(last_err.unwrap_or(FetchError::Status(StatusCode::REQUEST_TIMEOUT)))
    }

    async fn fetch_http<F>(&self, base: &Url, module: &str, dest: &Path, on_progress: &mut F) -> Result<u64, FetchError>
    where
        F: FnMut(u64, u64) + Send,
    {
        let url = Self::package_url(base, module)?;
        let resp = self.open_http(&url).await?;
        let total = resp.content_length().unwrap_or(0);

        let mut file = tokio::fs::File::create(dest).await?;
        let mut downloaded = 0u64;
        on_progress(downloaded, total);

        let mut stream = Box::pin(resp.bytes_stream());
        while let Some(chunk) = stream.next().await {
            let chunk = chunk?;
            file.write_all(&chunk).await?;
            downloaded += chunk.len() as u64;
            on_progress(downloaded, total);
        }
        file.flush().await?;
        Ok(downloaded)
    }
}

async fn copy_with_progress<F>(src: &Path, dest: &Path, on_progress: &mut F) -> Result<u64, FetchError>
where
    F: FnMut(u64, u64) + Send,
{
    let mut input = match tokio::fs::File::open(src).await {
        Ok(f) => f,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            return Err(FetchError::NotFound(src.display().to_string()))
        }
        Err(e) => return Err(e.into()),
    };
    let total = input.metadata().await?.len();
    let mut output = tokio::fs::File::create(dest).await?;

    let mut buf = vec![0u8; 64 * 1024];
    let mut copied = 0u64;
    on_progress(copied, total);
    loop {
        let n = input.read(&mut buf).await?;
        if n == 0 {
            break;
        }
        output.write_all(&buf[..n]).await?;
        copied += n as u64;
        on_progress(copied, total);
    }
    output.flush().await?;
    Ok(copied)
}
