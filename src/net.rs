use async_trait::async_trait;

use crate::error::{PromoError, PromoResult};

/// Text the ad backend embeds in a 200 response when a request hit a
/// server-side fault.
pub(crate) const SERVER_ERROR_MARKER: &str = "There was an error";

/// Network access used by the engine. Production wires in [`HttpFetcher`];
/// tests supply scripted responses.
#[async_trait]
pub trait Fetcher: Send + Sync {
    /// True once the network is up; the refresh driver polls this before
    /// starting a cycle.
    async fn reachable(&self) -> bool;

    async fn fetch_text(&self, url: &str) -> PromoResult<String>;

    async fn fetch_bytes(&self, url: &str) -> PromoResult<Vec<u8>>;
}

/// reqwest-backed fetcher.
pub struct HttpFetcher {
    client: reqwest::Client,
}

impl HttpFetcher {
    pub fn new() -> Self {
        Self {
            client: reqwest::Client::new(),
        }
    }

    async fn get(&self, url: &str) -> PromoResult<reqwest::Response> {
        let response = self
            .client
            .get(url)
            .send()
            .await
            .map_err(|err| PromoError::Transport(format!("GET {url}: {err}")))?;

        let status = response.status();
        if !status.is_success() {
            return Err(PromoError::Transport(format!("GET {url}: status {status}")));
        }
        Ok(response)
    }
}

impl Default for HttpFetcher {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Fetcher for HttpFetcher {
    async fn reachable(&self) -> bool {
        // A generate_204 probe; any response at all means the network is up
        self.client
            .head("http://connectivitycheck.gstatic.com/generate_204")
            .send()
            .await
            .is_ok()
    }

    async fn fetch_text(&self, url: &str) -> PromoResult<String> {
        self.get(url)
            .await?
            .text()
            .await
            .map_err(|err| PromoError::Transport(format!("GET {url}: body read: {err}")))
    }

    async fn fetch_bytes(&self, url: &str) -> PromoResult<Vec<u8>> {
        Ok(self
            .get(url)
            .await?
            .bytes()
            .await
            .map_err(|err| PromoError::Transport(format!("GET {url}: body read: {err}")))?
            .to_vec())
    }
}
