use std::time::Duration;

use reqwest::StatusCode;
use reqwest::blocking::{Client, Response};
use reqwest::header::RETRY_AFTER;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use bulklabel_ai::{
    Classification, ClassificationError, ClassificationService, ContentSource, Cursor, Page,
    SourceError, SourceItem,
};
use bulklabel_core::{ClassificationParams, SourceRef};

fn build_client(timeout: Duration) -> Result<Client, reqwest::Error> {
    Client::builder()
        .timeout(timeout)
        .pool_max_idle_per_host(4)
        .build()
}

fn trim_base(base_url: &str) -> String {
    base_url.trim_end_matches('/').to_string()
}

/// Content source served at `GET {base}/sources/{source_ref}/items`.
#[derive(Debug, Clone)]
pub struct HttpContentSource {
    client: Client,
    base_url: String,
}

#[derive(Deserialize)]
struct PageResponse {
    items: Vec<SourceItem>,
    #[serde(default)]
    next_cursor: Option<String>,
    #[serde(default)]
    total_estimate: Option<u64>,
}

impl HttpContentSource {
    pub fn new(base_url: &str, timeout: Duration) -> Result<Self, reqwest::Error> {
        Ok(Self {
            client: build_client(timeout)?,
            base_url: trim_base(base_url),
        })
    }

    fn map_response(source_ref: &SourceRef, response: Response) -> Result<Page, SourceError> {
        let status = response.status();
        if let Some(err) = source_error_for(status, source_ref) {
            return Err(err);
        }
        let body: PageResponse = response
            .json()
            .map_err(|e| SourceError::Malformed(e.to_string()))?;
        Ok(Page {
            items: body.items,
            next_cursor: body.next_cursor.filter(|c| !c.is_empty()).map(Cursor::new),
            total_estimate: body.total_estimate,
        })
    }
}

impl ContentSource for HttpContentSource {
    fn fetch_page(
        &self,
        source_ref: &SourceRef,
        cursor: Option<&Cursor>,
        page_size: usize,
    ) -> Result<Page, SourceError> {
        let url = format!("{}/sources/{}/items", self.base_url, source_ref.as_str());
        let mut query: Vec<(&str, String)> = vec![("page_size", page_size.to_string())];
        if let Some(cursor) = cursor {
            query.push(("cursor", cursor.as_str().to_string()));
        }

        debug!(source_ref = %source_ref, cursor = ?cursor.map(Cursor::as_str), page_size, "fetching page");
        let response = self
            .client
            .get(&url)
            .query(&query)
            .send()
            .map_err(|e| {
                if e.is_timeout() {
                    SourceError::Timeout
                } else {
                    SourceError::Unavailable(e.to_string())
                }
            })?;
        Self::map_response(source_ref, response)
    }
}

fn source_error_for(status: StatusCode, source_ref: &SourceRef) -> Option<SourceError> {
    if status.is_success() {
        return None;
    }
    Some(match status {
        StatusCode::NOT_FOUND => SourceError::NotFound(source_ref.to_string()),
        StatusCode::TOO_MANY_REQUESTS => SourceError::RateLimited,
        StatusCode::REQUEST_TIMEOUT | StatusCode::GATEWAY_TIMEOUT => SourceError::Timeout,
        s if s.is_client_error() => SourceError::Malformed(format!("HTTP {s}")),
        s => SourceError::Unavailable(format!("HTTP {s}")),
    })
}

/// Classifier served at `POST {base}/classify`.
#[derive(Debug, Clone)]
pub struct HttpClassificationService {
    client: Client,
    base_url: String,
}

#[derive(Serialize)]
struct ClassifyRequest<'a> {
    model: &'a str,
    #[serde(skip_serializing_if = "<[String]>::is_empty")]
    labels: &'a [String],
    #[serde(skip_serializing_if = "Option::is_none")]
    language: Option<&'a str>,
    texts: &'a [String],
}

#[derive(Deserialize)]
struct ClassifyResponse {
    results: Vec<Classification>,
}

impl HttpClassificationService {
    pub fn new(base_url: &str, timeout: Duration) -> Result<Self, reqwest::Error> {
        Ok(Self {
            client: build_client(timeout)?,
            base_url: trim_base(base_url),
        })
    }
}

impl ClassificationService for HttpClassificationService {
    fn classify(
        &self,
        params: &ClassificationParams,
        batch: &[String],
    ) -> Result<Vec<Classification>, ClassificationError> {
        let request = ClassifyRequest {
            model: &params.model,
            labels: &params.labels,
            language: params.language.as_deref(),
            texts: batch,
        };
        let response = self
            .client
            .post(format!("{}/classify", self.base_url))
            .json(&request)
            .send()
            .map_err(|e| {
                if e.is_timeout() {
                    ClassificationError::Timeout
                } else {
                    ClassificationError::Unavailable(e.to_string())
                }
            })?;

        let status = response.status();
        if !status.is_success() {
            let retry_after = response
                .headers()
                .get(RETRY_AFTER)
                .and_then(|v| v.to_str().ok())
                .and_then(parse_retry_after);
            let body = response.text().unwrap_or_default();
            warn!(status = %status, body = %truncate(&body, 200), "classifier call failed");
            return Err(classification_error_for(status, retry_after, body));
        }

        let body: ClassifyResponse = response
            .json()
            .map_err(|e| ClassificationError::Malformed(e.to_string()))?;
        Ok(body.results)
    }
}

fn classification_error_for(
    status: StatusCode,
    retry_after: Option<Duration>,
    body: String,
) -> ClassificationError {
    match status {
        StatusCode::TOO_MANY_REQUESTS => ClassificationError::RateLimited { retry_after },
        StatusCode::REQUEST_TIMEOUT | StatusCode::GATEWAY_TIMEOUT => ClassificationError::Timeout,
        s if s.is_client_error() => {
            ClassificationError::Rejected(if body.is_empty() { format!("HTTP {s}") } else { body })
        }
        s => ClassificationError::Unavailable(format!("HTTP {s}")),
    }
}

/// Delta-seconds form only; HTTP dates are ignored.
fn parse_retry_after(value: &str) -> Option<Duration> {
    value.trim().parse::<u64>().ok().map(Duration::from_secs)
}

fn truncate(s: &str, max: usize) -> &str {
    match s.char_indices().nth(max) {
        Some((idx, _)) => &s[..idx],
        None => s,
    }
}
