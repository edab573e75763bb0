use std::time::Duration;

use async_trait::async_trait;

use blindbox_core::Snapshot;

use super::{Transport, TransportKind};

/// Poll transport over an HTTP key/value resource.
///
/// `GET` reads the snapshot, `POST` replaces it, `DELETE` removes it.
/// There is no push channel: stores pull every [`poll_interval`](Transport::poll_interval).
pub struct PollTransport {
    url: String,
    http: reqwest::Client,
    poll_interval: Duration,
    request_timeout: Duration,
}

impl PollTransport {
    pub fn new(url: impl Into<String>, poll_interval: Duration, request_timeout: Duration) -> Self {
        Self {
            url: url.into(),
            http: reqwest::Client::new(),
            poll_interval,
            request_timeout,
        }
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    async fn fetch(&self) -> Result<Option<Snapshot>, String> {
        let response = self
            .http
            .get(&self.url)
            .timeout(self.request_timeout)
            .send()
            .await
            .map_err(|e| e.to_string())?;
        if !response.status().is_success() {
            log::debug!("GET {} returned {}", self.url, response.status());
            return Ok(None);
        }
        let body = response.bytes().await.map_err(|e| e.to_string())?;
        let text = String::from_utf8_lossy(&body);
        if text.trim().is_empty() || text.trim() == "null" {
            return Ok(None);
        }
        Snapshot::from_json(&body).map(Some).map_err(|e| e.to_string())
    }
}

#[async_trait]
impl Transport for PollTransport {
    fn kind(&self) -> TransportKind {
        TransportKind::Poll
    }

    fn describe(&self) -> String {
        format!("poll {} every {:?}", self.url, self.poll_interval)
    }

    async fn pull(&self) -> Option<Snapshot> {
        match self.fetch().await {
            Ok(snapshot) => snapshot,
            Err(e) => {
                log::warn!("GET {} failed: {e}", self.url);
                None
            }
        }
    }

    async fn push(&self, snapshot: &Snapshot) -> bool {
        let body = match snapshot.to_json() {
            Ok(body) => body,
            Err(e) => {
                log::error!("Cannot encode snapshot: {e}");
                return false;
            }
        };
        let result = self
            .http
            .post(&self.url)
            .header(reqwest::header::CONTENT_TYPE, "application/json")
            .timeout(self.request_timeout)
            .body(body)
            .send()
            .await;
        match result {
            Ok(response) if response.status().is_success() => true,
            Ok(response) => {
                log::warn!("POST {} returned {}", self.url, response.status());
                false
            }
            Err(e) => {
                log::warn!("POST {} failed: {e}", self.url);
                false
            }
        }
    }

    async fn clear(&self) {
        let result = self
            .http
            .delete(&self.url)
            .timeout(self.request_timeout)
            .send()
            .await;
        match result {
            Ok(response) if response.status().is_success() => {}
            Ok(response) => log::error!("DELETE {} returned {}", self.url, response.status()),
            Err(e) => log::error!("DELETE {} failed: {e}", self.url),
        }
    }

    fn poll_interval(&self) -> Option<Duration> {
        Some(self.poll_interval)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn unreachable() -> PollTransport {
        PollTransport::new(
            "http://127.0.0.1:1/blindbox",
            Duration::from_millis(100),
            Duration::from_millis(200),
        )
    }

    #[tokio::test]
    async fn test_unreachable_backend_degrades() {
        let transport = unreachable();
        assert!(transport.pull().await.is_none());
        assert!(!transport.push(&Snapshot::default()).await);
        transport.clear().await;
    }

    #[tokio::test]
    async fn test_has_no_push_channel() {
        let transport = unreachable();
        let listener: crate::transport::SnapshotListener = std::sync::Arc::new(|_| {});
        assert!(transport.subscribe(listener).await.is_none());
        assert_eq!(transport.poll_interval(), Some(Duration::from_millis(100)));
    }
}
