use crate::config::Config;
use async_trait::async_trait;
use reqwest::header::{HeaderMap, RETRY_AFTER};
use reqwest::multipart::{Form, Part};
use reqwest::{Client, StatusCode};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::time::Duration;
use thiserror::Error;

/// One detection result returned by the scan backend for one unit.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ScanFinding {
    pub level: String,
    pub module: String,
    pub message: String,
    pub score: i64,
    pub context: FindingContext,
    #[serde(rename = "matches")]
    pub sub_matches: Vec<SubMatch>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct FindingContext {
    pub ext: String,
    pub file: String,
    pub firstbytes: String,
    pub md5: String,
    pub reasons_count: i64,
    pub sample_id: i64,
    pub sha1: String,
    pub sha256: String,
    pub size: i64,
    #[serde(rename = "type")]
    pub file_type: String,
}

/// A single rule hit contributing to a finding.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SubMatch {
    pub author: String,
    pub matched: Vec<String>,
    pub reason: String,
    #[serde(rename = "ref")]
    pub reference: String,
    #[serde(rename = "ruledate")]
    pub rule_date: String,
    #[serde(rename = "rulename")]
    pub rule_name: String,
    #[serde(rename = "sigclass")]
    pub sig_class: String,
    #[serde(rename = "sigtype")]
    pub sig_type: String,
    pub subscore: i64,
    pub tags: BTreeSet<String>,
}

#[derive(Debug, Error)]
pub enum ScanError {
    #[error("scan backend retry budget exceeded - backend seems to be down")]
    RetryExceeded,
    #[error("sending scan request failed: {0}")]
    Transport(#[source] reqwest::Error),
    #[error("parsing scan response failed: {0}")]
    Parse(#[source] serde_json::Error),
}

/// Submits one named unit to a scanning backend.
#[async_trait]
pub trait Scanner: Send + Sync {
    async fn scan(&self, unit_name: &str, bytes: &[u8]) -> Result<Vec<ScanFinding>, ScanError>;
}

/// HTTP client for the scan backend. Uploads are multipart with a single
/// `file` field; non-200 answers are retried after the advertised
/// `Retry-After` delay until the attempt budget is spent.
pub struct ScanClient {
    client: Client,
    endpoint: String,
    retries: u32,
    default_wait: Duration,
}

impl ScanClient {
    pub fn new(
        endpoint: &str,
        timeout: Duration,
        retries: u32,
        default_wait: Duration,
    ) -> anyhow::Result<Self> {
        let client = Client::builder().timeout(timeout).build()?;
        Ok(ScanClient {
            client,
            endpoint: endpoint.to_string(),
            retries,
            default_wait,
        })
    }

    pub fn from_config(config: &Config) -> anyhow::Result<Self> {
        Self::new(
            &config.scan_endpoint,
            config.scan_timeout(),
            config.scan_retries,
            config.retry_wait(),
        )
    }

    /// Upload with an explicit remaining-attempts budget. A budget of `n`
    /// allows `n + 1` requests; a negative budget fails without a request.
    pub async fn scan_with_budget(
        &self,
        unit_name: &str,
        bytes: &[u8],
        remaining_attempts: i64,
    ) -> Result<Vec<ScanFinding>, ScanError> {
        let mut remaining = remaining_attempts;
        loop {
            if remaining < 0 {
                return Err(ScanError::RetryExceeded);
            }

            let part = Part::bytes(bytes.to_vec()).file_name(unit_name.to_string());
            let form = Form::new().part("file", part);
            let response = self
                .client
                .post(&self.endpoint)
                .multipart(form)
                .send()
                .await
                .map_err(ScanError::Transport)?;

            let status = response.status();
            if status == StatusCode::OK {
                let body = response.bytes().await.map_err(ScanError::Transport)?;
                return serde_json::from_slice(&body).map_err(ScanError::Parse);
            }

            let wait = retry_after(response.headers()).unwrap_or(self.default_wait);
            log::warn!(
                "scan backend answered {} for '{}', retrying in {}s ({} attempts left)",
                status,
                unit_name,
                wait.as_secs(),
                remaining
            );
            tokio::time::sleep(wait).await;
            remaining -= 1;
        }
    }
}

#[async_trait]
impl Scanner for ScanClient {
    async fn scan(&self, unit_name: &str, bytes: &[u8]) -> Result<Vec<ScanFinding>, ScanError> {
        self.scan_with_budget(unit_name, bytes, i64::from(self.retries))
            .await
    }
}

fn retry_after(headers: &HeaderMap) -> Option<Duration> {
    headers
        .get(RETRY_AFTER)?
        .to_str()
        .ok()?
        .trim()
        .parse::<u64>()
        .ok()
        .map(Duration::from_secs)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::{Arc, Mutex};
    use std::time::Instant;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::{TcpListener, TcpStream};

    const FINDINGS: &str = r#"[{
        "level": "Alert",
        "module": "Filescan",
        "message": "Malicious file found",
        "score": 85,
        "context": {"ext": ".exe", "file": "setup.exe", "firstbytes": "4d5a", "md5": "abc",
                    "reasons_count": 1, "sample_id": 7, "sha1": "def", "sha256": "0123",
                    "size": 2, "type": "EXE"},
        "matches": [{"author": "Florian", "matched": ["MZ"], "reason": "Suspicious PE",
                     "ref": "https://example.org", "ruledate": "2021-01-01",
                     "rulename": "SUSP_PE", "sigclass": "YARA Rule", "sigtype": "internal",
                     "subscore": 85, "tags": ["EXE", "SUSP"]}]
    }]"#;

    struct StubBackend {
        url: String,
        requests: Arc<AtomicUsize>,
        last_request: Arc<Mutex<Vec<u8>>>,
    }

    fn response(status: &str, extra_headers: &str, body: &str) -> String {
        format!(
            "HTTP/1.1 {status}\r\nContent-Type: application/json\r\nContent-Length: {}\r\nConnection: close\r\n{extra_headers}\r\n{body}",
            body.len()
        )
    }

    async fn read_request(stream: &mut TcpStream) -> Vec<u8> {
        let mut buf = Vec::new();
        let mut chunk = [0u8; 8192];
        loop {
            let n = stream.read(&mut chunk).await.unwrap();
            if n == 0 {
                break;
            }
            buf.extend_from_slice(&chunk[..n]);
            let Some(end) = buf.windows(4).position(|w| w == b"\r\n\r\n") else {
                continue;
            };
            let head = String::from_utf8_lossy(&buf[..end]).to_ascii_lowercase();
            let received = buf.len() - end - 4;
            let content_length = head
                .lines()
                .find_map(|l| l.strip_prefix("content-length:"))
                .and_then(|v| v.trim().parse::<usize>().ok());
            match content_length {
                Some(len) if received >= len => break,
                None if buf.ends_with(b"0\r\n\r\n") => break,
                _ => {}
            }
        }
        buf
    }

    /// Serves the canned responses in order, one per connection.
    async fn stub_backend(responses: Vec<String>) -> StubBackend {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let url = format!("http://{}/api/check", listener.local_addr().unwrap());
        let requests = Arc::new(AtomicUsize::new(0));
        let last_request = Arc::new(Mutex::new(Vec::new()));

        let counter = requests.clone();
        let last = last_request.clone();
        tokio::spawn(async move {
            for canned in responses {
                let (mut stream, _) = listener.accept().await.unwrap();
                let request = read_request(&mut stream).await;
                *last.lock().unwrap() = request;
                counter.fetch_add(1, Ordering::SeqCst);
                stream.write_all(canned.as_bytes()).await.unwrap();
                stream.shutdown().await.ok();
            }
        });

        StubBackend {
            url,
            requests,
            last_request,
        }
    }

    fn client(url: &str, retries: u32) -> ScanClient {
        ScanClient::new(url, Duration::from_secs(5), retries, Duration::from_millis(10)).unwrap()
    }

    #[tokio::test]
    async fn test_successful_scan_parses_findings() {
        let backend = stub_backend(vec![response("200 OK", "", FINDINGS)]).await;
        let findings = client(&backend.url, 1)
            .scan("setup.exe", b"MZ")
            .await
            .unwrap();

        assert_eq!(findings.len(), 1);
        let finding = &findings[0];
        assert_eq!(finding.score, 85);
        assert_eq!(finding.context.file_type, "EXE");
        assert_eq!(finding.context.sample_id, 7);
        assert_eq!(finding.sub_matches[0].rule_name, "SUSP_PE");
        assert!(finding.sub_matches[0].tags.contains("SUSP"));

        let request = String::from_utf8_lossy(&backend.last_request.lock().unwrap()).to_string();
        assert!(request.starts_with("POST /api/check"));
        assert!(request.contains("name=\"file\""));
        assert!(request.contains("filename=\"setup.exe\""));
        assert_eq!(backend.requests.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_empty_finding_list() {
        let backend = stub_backend(vec![response("200 OK", "", "[]")]).await;
        let findings = client(&backend.url, 0).scan("text/plain-0", b"hi").await.unwrap();
        assert!(findings.is_empty());
    }

    #[tokio::test]
    async fn test_retry_after_is_honoured() {
        let backend = stub_backend(vec![
            response("503 Service Unavailable", "Retry-After: 1\r\n", ""),
            response("200 OK", "", FINDINGS),
        ])
        .await;

        let started = Instant::now();
        let findings = client(&backend.url, 1).scan("setup.exe", b"MZ").await.unwrap();

        assert_eq!(findings.len(), 1);
        assert!(started.elapsed() >= Duration::from_secs(1));
        assert_eq!(backend.requests.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_budget_exhaustion_is_retry_exceeded() {
        let backend = stub_backend(vec![
            response("503 Service Unavailable", "Retry-After: 0\r\n", ""),
            response("500 Internal Server Error", "", ""),
        ])
        .await;

        let result = client(&backend.url, 1).scan("setup.exe", b"MZ").await;

        assert!(matches!(result, Err(ScanError::RetryExceeded)));
        assert_eq!(backend.requests.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_negative_budget_sends_nothing() {
        let backend = stub_backend(vec![response("200 OK", "", "[]")]).await;
        let result = client(&backend.url, 0)
            .scan_with_budget("setup.exe", b"MZ", -1)
            .await;
        assert!(matches!(result, Err(ScanError::RetryExceeded)));
        assert_eq!(backend.requests.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_malformed_json_is_parse_error() {
        let backend = stub_backend(vec![response("200 OK", "", "<html>oops</html>")]).await;
        let result = client(&backend.url, 1).scan("setup.exe", b"MZ").await;
        assert!(matches!(result, Err(ScanError::Parse(_))));
        assert_eq!(backend.requests.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_transport_failure_is_not_retried() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let url = format!("http://{}/api/check", listener.local_addr().unwrap());
        drop(listener);

        let started = Instant::now();
        let result = client(&url, 3).scan("setup.exe", b"MZ").await;
        assert!(matches!(result, Err(ScanError::Transport(_))));
        assert!(started.elapsed() < Duration::from_secs(5));
    }

    #[test]
    fn test_retry_after_parsing() {
        let mut headers = HeaderMap::new();
        assert_eq!(retry_after(&headers), None);
        headers.insert(RETRY_AFTER, "7".parse().unwrap());
        assert_eq!(retry_after(&headers), Some(Duration::from_secs(7)));
        headers.insert(RETRY_AFTER, "Wed, 21 Oct 2015 07:28:00 GMT".parse().unwrap());
        assert_eq!(retry_after(&headers), None);
    }
}
