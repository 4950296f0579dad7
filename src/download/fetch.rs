use std::io::Read;
use std::time::Duration;
use anyhow::{Result, Context};
use reqwest::blocking::Client;
use reqwest::header::CONTENT_TYPE;
use reqwest::StatusCode;

use crate::error::FetchError;

const USER_AGENT: &str =
    "Mozilla/5.0 (X11; Linux x86_64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/124.0 Safari/537.36";

#[derive(Debug, Clone)]
pub struct Fetched {
    pub bytes: Vec<u8>,
    pub content_type: Option<String>,
    pub final_url: String,
}

/// Network access for pages and images. Shared by all workers.
pub trait Fetcher: Send + Sync {
    fn fetch(&self, url: &str) -> Result<Fetched, FetchError>;
}

pub struct HttpFetcher {
    client: Client,
    max_bytes: u64,
}

impl HttpFetcher {
    pub fn new(timeout: Duration, max_bytes: u64) -> Result<Self> {
        let client = Client::builder()
            .timeout(timeout)
            .connect_timeout(timeout.min(Duration::from_secs(10)))
            .user_agent(USER_AGENT)
            .build()
            .context("Failed to build HTTP client")?;
        Ok(Self { client, max_bytes })
    }
}

impl Fetcher for HttpFetcher {
    fn fetch(&self, url: &str) -> Result<Fetched, FetchError> {
        let response = self.client.get(url).send().map_err(classify_reqwest)?;

        let status = response.status();
        if !status.is_success() {
            return Err(classify_status(status));
        }
        if let Some(len) = response.content_length() {
            if len > self.max_bytes {
                return Err(FetchError::Permanent(format!("payload of {} bytes exceeds {}", len, self.max_bytes)));
            }
        }

        let final_url = response.url().to_string();
        let content_type = response
            .headers()
            .get(CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string);

        let mut bytes = Vec::new();
        response
            .take(self.max_bytes + 1)
            .read_to_end(&mut bytes)
            .map_err(|e| FetchError::Transient(format!("body read failed: {}", e)))?;
        if bytes.len() as u64 > self.max_bytes {
            return Err(FetchError::Permanent(format!("payload exceeds {} bytes", self.max_bytes)));
        }

        Ok(Fetched { bytes, content_type, final_url })
    }
}

/// 4xx is final except for rate limiting and request timeouts; 5xx may clear up.
pub fn classify_status(status: StatusCode) -> FetchError {
    let message = format!("HTTP {}", status.as_u16());
    if status.is_server_error()
        || status == StatusCode::TOO_MANY_REQUESTS
        || status == StatusCode::REQUEST_TIMEOUT
    {
        FetchError::Transient(message)
    } else {
        FetchError::Permanent(message)
    }
}

fn classify_reqwest(err: reqwest::Error) -> FetchError {
    if err.is_builder() || err.is_redirect() {
        FetchError::Permanent(err.to_string())
    } else {
        // timeouts, refused/reset connections, truncated bodies
        FetchError::Transient(err.to_string())
    }
}

/// Whether a declared Content-Type can plausibly carry an image. A missing
/// or generic binary type is allowed through; the payload is sniffed later.
pub fn is_image_content_type(content_type: Option<&str>) -> bool {
    let Some(ct) = content_type else { return true };
    let mime = ct.split(';').next().unwrap_or("").trim().to_ascii_lowercase();
    mime.is_empty()
        || mime.starts_with("image/")
        || mime == "application/octet-stream"
        || mime == "binary/octet-stream"
}
