use std::str::FromStr;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::{Client, Method};
use tokio_util::sync::CancellationToken;

use super::{NotifyError, Notify};

/// Fires a single HTTP request at the scraper's reload endpoint. Method is
/// validated as a syntactically legal HTTP token at construction time.
pub struct HttpNotifier {
    method: Method,
    url: String,
    timeout: Duration,
    client: Client,
}

impl HttpNotifier {
    pub fn new(url: String, method: String, timeout: Duration) -> Result<Self, NotifyError> {
        let method = Method::from_str(&method).map_err(|_| NotifyError::InvalidMethod(method))?;
        Ok(Self {
            method,
            url,
            timeout,
            client: Client::new(),
        })
    }
}

#[async_trait]
impl Notify for HttpNotifier {
    async fn notify(&self, _cancel: &CancellationToken) -> Result<(), NotifyError> {
        let response = self
            .client
            .request(self.method.clone(), &self.url)
            .timeout(self.timeout)
            .send()
            .await?;

        if response.status().is_success() {
            Ok(())
        } else {
            Err(NotifyError::UnexpectedStatus(response.status()))
        }
    }
}
