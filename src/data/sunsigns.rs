//! SunSigns.com horoscope source
//!
//! This module defines the content source boundary used by the refresh engine
//! and provides the HTTP implementation that downloads horoscope pages and
//! sign images from sunsigns.com.

use std::sync::{Arc, LazyLock};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{Datelike, Local};
use regex::Regex;
use reqwest::header::USER_AGENT;
use reqwest::Client;
use thiserror::Error;

use super::{Period, Sign};

/// Base URL for horoscope pages
const SUNSIGNS_BASE_URL: &str = "https://www.sunsigns.com/horoscopes";

/// Base URL for the per-sign artwork
const SUNSIGNS_IMAGE_BASE_URL: &str =
    "https://www.sunsigns.com/wp-content/themes/sunsigns/assets/images/_sun-signs";

/// The site serves a reduced page to unknown agents
const BROWSER_USER_AGENT: &str = "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/91.0.4472.124 Safari/537.36";

/// Default bound on a single request
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(10);

/// Errors that can occur when fetching horoscope content
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum FetchError {
    /// The request did not complete within the configured timeout
    #[error("request timed out")]
    Timeout,

    /// Connection or transport failure
    #[error("network error: {0}")]
    Network(String),

    /// The page was fetched but no horoscope text could be extracted
    #[error("no horoscope content found on the page")]
    NoContentFound,

    /// The server answered with a non-success status
    #[error("HTTP error: status {0}")]
    Http(u16),
}

impl From<reqwest::Error> for FetchError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            FetchError::Timeout
        } else if let Some(status) = err.status() {
            FetchError::Http(status.as_u16())
        } else {
            FetchError::Network(err.to_string())
        }
    }
}

/// Something that can produce horoscope text and sign images
///
/// The refresh engine only talks to this trait, so tests and alternative
/// providers can stand in for the real website.
#[async_trait]
pub trait ContentSource: Send + Sync {
    /// Fetches the horoscope text for a sign and period
    async fn fetch(&self, sign: Sign, period: &Period) -> Result<String, FetchError>;

    /// Fetches the raw image bytes for a sign
    async fn fetch_image(&self, sign: Sign) -> Result<Vec<u8>, FetchError>;
}

/// Turns a downloaded page into horoscope text
pub trait ContentExtractor: Send + Sync {
    /// Returns `None` when the page holds no usable text
    fn extract(&self, html: &str) -> Option<String>;
}

static PARAGRAPH: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?is)<p\b[^>]*>(.*?)</p>").expect("paragraph pattern is valid"));

static TAG: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?s)<[^>]+>").expect("tag pattern is valid"));

/// Collects the text of every `<p>` element, one paragraph per block
#[derive(Debug, Clone, Copy, Default)]
pub struct ParagraphExtractor;

impl ContentExtractor for ParagraphExtractor {
    fn extract(&self, html: &str) -> Option<String> {
        let paragraphs: Vec<String> = PARAGRAPH
            .captures_iter(html)
            .filter_map(|caps| caps.get(1))
            .map(|inner| decode_entities(TAG.replace_all(inner.as_str(), "").trim()))
            .filter(|text| !text.is_empty())
            .collect();

        if paragraphs.is_empty() {
            None
        } else {
            Some(paragraphs.join("\n\n"))
        }
    }
}

/// Replaces the handful of HTML entities that show up in horoscope prose
fn decode_entities(text: &str) -> String {
    text.replace("&nbsp;", " ")
        .replace("&rsquo;", "'")
        .replace("&lsquo;", "'")
        .replace("&#39;", "'")
        .replace("&#8217;", "'")
        .replace("&quot;", "\"")
        .replace("&ldquo;", "\"")
        .replace("&rdquo;", "\"")
        .replace("&lt;", "<")
        .replace("&gt;", ">")
        .replace("&amp;", "&")
}

/// Client for fetching horoscopes and images from sunsigns.com
#[derive(Clone)]
pub struct SunSignsClient {
    client: Client,
    base_url: String,
    image_base_url: String,
    timeout: Duration,
    extractor: Arc<dyn ContentExtractor>,
}

impl Default for SunSignsClient {
    fn default() -> Self {
        Self::new()
    }
}

impl SunSignsClient {
    /// Create a new SunSignsClient with default settings
    pub fn new() -> Self {
        Self {
            client: Client::new(),
            base_url: SUNSIGNS_BASE_URL.to_string(),
            image_base_url: SUNSIGNS_IMAGE_BASE_URL.to_string(),
            timeout: DEFAULT_TIMEOUT,
            extractor: Arc::new(ParagraphExtractor),
        }
    }

    /// Sets the per-request timeout
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Replaces the page extractor
    pub fn with_extractor(mut self, extractor: Arc<dyn ContentExtractor>) -> Self {
        self.extractor = extractor;
        self
    }

    /// Points the client at different hosts (for testing)
    pub fn with_base_urls(
        mut self,
        base_url: impl Into<String>,
        image_base_url: impl Into<String>,
    ) -> Self {
        self.base_url = base_url.into();
        self.image_base_url = image_base_url.into();
        self
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Builds the page URL for a sign and period
    ///
    /// Yearly pages are published per calendar year, so `year` selects which
    /// one to read.
    pub fn horoscope_url(&self, sign: Sign, period: &Period, year: i32) -> String {
        let base = &self.base_url;
        match period {
            Period::Daily => format!("{}/daily/{}", base, sign),
            Period::Tomorrow => format!("{}/daily/{}/tomorrow", base, sign),
            Period::Weekly => format!("{}/weekly/{}", base, sign),
            Period::Monthly => format!("{}/monthly/{}", base, sign),
            Period::Yearly => format!("{}/yearly{}/{}", base, year, sign),
            Period::Other(name) => format!("{}/{}/{}", base, name, sign),
        }
    }

    /// Builds the artwork URL for a sign
    pub fn image_url(&self, sign: Sign) -> String {
        format!("{}/{}/wrappable.png", self.image_base_url, sign)
    }

    async fn get(&self, url: &str) -> Result<reqwest::Response, FetchError> {
        let response = self
            .client
            .get(url)
            .header(USER_AGENT, BROWSER_USER_AGENT)
            .timeout(self.timeout)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            return Err(FetchError::Http(status.as_u16()));
        }
        Ok(response)
    }
}

#[async_trait]
impl ContentSource for SunSignsClient {
    async fn fetch(&self, sign: Sign, period: &Period) -> Result<String, FetchError> {
        let url = self.horoscope_url(sign, period, Local::now().year());
        tracing::debug!("Fetching {} horoscope for {} from {}", period, sign, url);

        let html = self.get(&url).await?.text().await?;
        match self.extractor.extract(&html) {
            Some(content) => {
                tracing::debug!(
                    "Fetched {} horoscope for {}, {} characters",
                    period,
                    sign,
                    content.len()
                );
                Ok(content)
            }
            None => {
                tracing::warn!("No horoscope content found for {} {} at {}", period, sign, url);
                Err(FetchError::NoContentFound)
            }
        }
    }

    async fn fetch_image(&self, sign: Sign) -> Result<Vec<u8>, FetchError> {
        let url = self.image_url(sign);
        tracing::debug!("Fetching image for {} from {}", sign, url);

        let bytes = self.get(&url).await?.bytes().await?;
        Ok(bytes.to_vec())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use httpmock::prelude::*;

    fn client_for(server: &MockServer) -> SunSignsClient {
        SunSignsClient::new().with_base_urls(server.url("/horoscopes"), server.url("/images"))
    }

    #[test]
    fn test_horoscope_urls_per_period() {
        let client = SunSignsClient::new();
        let base = "https://www.sunsigns.com/horoscopes";

        assert_eq!(
            client.horoscope_url(Sign::Leo, &Period::Daily, 2024),
            format!("{}/daily/leo", base)
        );
        assert_eq!(
            client.horoscope_url(Sign::Leo, &Period::Tomorrow, 2024),
            format!("{}/daily/leo/tomorrow", base)
        );
        assert_eq!(
            client.horoscope_url(Sign::Aries, &Period::Weekly, 2024),
            format!("{}/weekly/aries", base)
        );
        assert_eq!(
            client.horoscope_url(Sign::Aries, &Period::Monthly, 2024),
            format!("{}/monthly/aries", base)
        );
        assert_eq!(
            client.horoscope_url(Sign::Pisces, &Period::Yearly, 2025),
            format!("{}/yearly2025/pisces", base)
        );
        assert_eq!(
            client.horoscope_url(Sign::Pisces, &Period::Other("love".to_string()), 2025),
            format!("{}/love/pisces", base)
        );
    }

    #[test]
    fn test_image_url() {
        let client = SunSignsClient::new();
        assert_eq!(
            client.image_url(Sign::Virgo),
            "https://www.sunsigns.com/wp-content/themes/sunsigns/assets/images/_sun-signs/virgo/wrappable.png"
        );
    }

    #[test]
    fn test_default_timeout_is_ten_seconds() {
        assert_eq!(SunSignsClient::new().timeout(), Duration::from_secs(10));
    }

    #[test]
    fn test_paragraph_extractor_joins_paragraphs() {
        let html = r#"<html><body><div class="horoscope-content">
            <p>You will meet a <strong>stranger</strong>.</p>
            <p class="x">Don&rsquo;t panic &amp; stay calm.</p>
            <p>   </p>
        </div></body></html>"#;

        let text = ParagraphExtractor.extract(html).expect("should extract text");

        assert_eq!(text, "You will meet a stranger.\n\nDon't panic & stay calm.");
    }

    #[test]
    fn test_paragraph_extractor_returns_none_without_paragraphs() {
        assert!(ParagraphExtractor.extract("<div>nothing here</div>").is_none());
        assert!(ParagraphExtractor.extract("<p>  </p>").is_none());
    }

    #[tokio::test]
    async fn test_fetch_returns_extracted_text() {
        let server = MockServer::start_async().await;
        server
            .mock_async(|when, then| {
                when.method(GET)
                    .path("/horoscopes/daily/leo/tomorrow")
                    .header("user-agent", BROWSER_USER_AGENT);
                then.status(200).body("<p>Tomorrow looks bright.</p>");
            })
            .await;

        let client = client_for(&server);
        let content = client.fetch(Sign::Leo, &Period::Tomorrow).await.unwrap();

        assert_eq!(content, "Tomorrow looks bright.");
    }

    #[tokio::test]
    async fn test_fetch_uses_custom_extractor() {
        struct WholePage;
        impl ContentExtractor for WholePage {
            fn extract(&self, html: &str) -> Option<String> {
                Some(html.trim().to_uppercase())
            }
        }

        let server = MockServer::start_async().await;
        server
            .mock_async(|when, then| {
                when.method(GET).path("/horoscopes/daily/virgo");
                then.status(200).body(" plain text page ");
            })
            .await;

        let client = client_for(&server).with_extractor(Arc::new(WholePage));
        let content = client.fetch(Sign::Virgo, &Period::Daily).await.unwrap();

        assert_eq!(content, "PLAIN TEXT PAGE");
    }

    #[tokio::test]
    async fn test_fetch_maps_status_to_http_error() {
        let server = MockServer::start_async().await;
        server
            .mock_async(|when, then| {
                when.method(GET).path("/horoscopes/weekly/leo");
                then.status(503).body("unavailable");
            })
            .await;

        let client = client_for(&server);
        let result = client.fetch(Sign::Leo, &Period::Weekly).await;

        assert_eq!(result, Err(FetchError::Http(503)));
    }

    #[tokio::test]
    async fn test_fetch_without_paragraphs_is_no_content() {
        let server = MockServer::start_async().await;
        server
            .mock_async(|when, then| {
                when.method(GET).path("/horoscopes/monthly/gemini");
                then.status(200).body("<html><div>redesigned page</div></html>");
            })
            .await;

        let client = client_for(&server);
        let result = client.fetch(Sign::Gemini, &Period::Monthly).await;

        assert_eq!(result, Err(FetchError::NoContentFound));
    }

    #[tokio::test]
    async fn test_fetch_times_out() {
        let server = MockServer::start_async().await;
        server
            .mock_async(|when, then| {
                when.method(GET).path("/horoscopes/daily/aries");
                then.status(200)
                    .delay(Duration::from_secs(2))
                    .body("<p>late</p>");
            })
            .await;

        let client = client_for(&server).with_timeout(Duration::from_millis(100));
        let result = client.fetch(Sign::Aries, &Period::Daily).await;

        assert_eq!(result, Err(FetchError::Timeout));
    }

    #[tokio::test]
    async fn test_fetch_image_returns_bytes() {
        let server = MockServer::start_async().await;
        server
            .mock_async(|when, then| {
                when.method(GET).path("/images/cancer/wrappable.png");
                then.status(200).body(vec![0x89, b'P', b'N', b'G']);
            })
            .await;

        let client = client_for(&server);
        let bytes = client.fetch_image(Sign::Cancer).await.unwrap();

        assert_eq!(bytes, vec![0x89, b'P', b'N', b'G']);
    }

    #[tokio::test]
    async fn test_unreachable_host_is_network_error() {
        let client = SunSignsClient::new()
            .with_base_urls("http://127.0.0.1:9/horoscopes", "http://127.0.0.1:9/images");

        let result = client.fetch(Sign::Libra, &Period::Daily).await;

        assert!(matches!(result, Err(FetchError::Network(_))));
    }
}
