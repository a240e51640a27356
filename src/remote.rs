use crate::import::FileKind;
use log::{debug, info};
use reqwest::redirect::Policy;
use reqwest::Client as HttpClient;
use thiserror::Error;
use url::Url;

#[derive(Debug, Error)]
pub enum DownloadError {
    #[error("please use a direct download link")]
    ShareLink,
    #[error("invalid link: {0}")]
    InvalidUrl(#[from] url::ParseError),
    #[error("unsupported link scheme `{0}`")]
    UnsupportedScheme(String),
    #[error("failed to download file: HTTP {0}")]
    Http(u16),
    #[error("error downloading file: {0}")]
    Request(#[from] reqwest::Error),
}

/// A file fetched from a shared link, held in memory until imported.
#[derive(Debug, Clone)]
pub struct Download {
    pub file_name: String,
    pub kind: FileKind,
    pub bytes: Vec<u8>,
}

pub struct DownloadClient {
    pub http: HttpClient,
}

impl DownloadClient {
    /// Redirects are not followed: anything but a plain 200 is reported as an error.
    pub fn new() -> Result<Self, DownloadError> {
        let http = HttpClient::builder().redirect(Policy::none()).build()?;
        Ok(Self { http })
    }

    pub async fn fetch(&self, link: &str) -> Result<Download, DownloadError> {
        let link = crate::utils::normalize_url(link);
        if is_share_link(&link) {
            return Err(DownloadError::ShareLink);
        }
        let url = Url::parse(&link)?;
        if !matches!(url.scheme(), "http" | "https") {
            return Err(DownloadError::UnsupportedScheme(url.scheme().to_string()));
        }

        debug!("Downloading {}", url);
        let resp = self.http.get(url.clone()).send().await?;
        if resp.status().as_u16() != 200 {
            return Err(DownloadError::Http(resp.status().as_u16()));
        }

        let file_name = url
            .path_segments()
            .and_then(|mut segments| segments.next_back())
            .unwrap_or_default()
            .to_string();
        let content_type = resp
            .headers()
            .get(reqwest::header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string);
        let kind = infer_kind(content_type.as_deref(), &file_name);
        let bytes = resp.bytes().await?.to_vec();
        info!("Downloaded {} bytes from {} as {:?}", bytes.len(), url, kind);

        Ok(Download { file_name, kind, bytes })
    }
}

/// OneDrive sharing pages need converting to a direct link first.
pub fn is_share_link(link: &str) -> bool {
    link.contains("1drv.ms") || link.contains("onedrive.live.com/share")
}

fn infer_kind(content_type: Option<&str>, file_name: &str) -> FileKind {
    let content_type = content_type.unwrap_or_default().to_ascii_lowercase();
    let name = file_name.to_ascii_lowercase();
    if content_type.contains("excel")
        || content_type.contains("spreadsheet")
        || name.ends_with(".xls")
        || name.ends_with(".xlsx")
    {
        FileKind::Spreadsheet
    } else {
        FileKind::Csv
    }
}
