//! Address release through the external IPAM

use std::net::Ipv4Addr;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::GcError;

/// Returns an address to the IPAM that handed it out
#[async_trait::async_trait]
pub trait AddressReleaser: Send + Sync {
    /// Release `ip`
    async fn release(&self, ip: Ipv4Addr) -> Result<(), GcError>;
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct RecycleRequest<'a> {
    operator: &'a str,
    ip_list: Vec<String>,
}

#[derive(Debug, Deserialize)]
struct RecycleResponse {
    #[serde(rename = "Code", alias = "code", default)]
    code: i64,
    #[serde(rename = "Msg", alias = "msg", default)]
    msg: String,
    #[serde(default)]
    data: Vec<RecycleResult>,
}

#[derive(Debug, Deserialize)]
struct RecycleResult {
    #[serde(rename = "Detail", alias = "detail", default)]
    detail: String,
    #[serde(rename = "Result", alias = "result", default)]
    result: i64,
}

impl RecycleResponse {
    fn check(self, ip: Ipv4Addr) -> Result<(), GcError> {
        let fail = |message: String| GcError::Release { ip, message };
        if self.code != 0 {
            return Err(fail(self.msg));
        }
        let first = self
            .data
            .into_iter()
            .next()
            .ok_or_else(|| fail("no result returned from recycle api".to_string()))?;
        if first.result != 0 {
            return Err(fail(first.detail));
        }
        Ok(())
    }
}

/// POSTs `{"operator", "ipList"}` to a recycle URL
#[derive(Debug, Clone)]
pub struct HttpReleaser {
    client: reqwest::Client,
    url: String,
    operator: String,
}

impl HttpReleaser {
    /// Client for `url` with a per-request `timeout`
    ///
    /// # Errors
    ///
    /// Returns `InvalidConfig` for an empty URL, or an HTTP error if the client cannot be built.
    pub fn new(url: &str, operator: &str, timeout: Duration) -> Result<Self, GcError> {
        if url.is_empty() {
            return Err(GcError::InvalidConfig("recycle url is empty".to_string()));
        }
        let client = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self {
            client,
            url: url.to_string(),
            operator: operator.to_string(),
        })
    }
}

#[async_trait::async_trait]
impl AddressReleaser for HttpReleaser {
    async fn release(&self, ip: Ipv4Addr) -> Result<(), GcError> {
        debug!("Recycling {} through {}", ip, self.url);
        let response = self
            .client
            .post(&self.url)
            .json(&RecycleRequest {
                operator: &self.operator,
                ip_list: vec![ip.to_string()],
            })
            .send()
            .await?;
        let status = response.status();
        if !status.is_success() {
            return Err(GcError::Release {
                ip,
                message: format!("recycle api status code {status}"),
            });
        }
        response.json::<RecycleResponse>().await?.check(ip)
    }
}
