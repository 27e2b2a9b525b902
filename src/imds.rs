//! IMDSv2 metadata fetcher.
//!
//! Speaks the token-authenticated instance metadata protocol: PUT the
//! token path with a TTL header to obtain an opaque token, then GET
//! target paths echoing the token in a header. Only GET and PUT are
//! ever issued; anything else is rejected before touching the network.

use reqwest::{Client, Method, Response, Url};

use crate::constants;
use crate::errors::{PreinitError, PreinitResult};
use crate::vmspec::VMSpec;

const PATH_TOKEN: &str = "/latest/api/token";
const PATH_USER_DATA: &str = "/latest/user-data";
const PATH_REGION: &str = "/latest/meta-data/placement/region";

const HEADER_TOKEN: &str = "X-aws-ec2-metadata-token";
const HEADER_TOKEN_TTL: &str = "X-aws-ec2-metadata-token-ttl-seconds";
const TOKEN_TTL_SECONDS: &str = "21600";

/// Client for the instance metadata service.
pub struct ImdsClient {
    endpoint: String,
    http: Client,
}

impl ImdsClient {
    /// Client against the standard link-local metadata address.
    pub fn new() -> Self {
        Self::with_endpoint(constants::ENDPOINT_METADATA_DEFAULT)
    }

    /// Client against `endpoint` (`host[:port]`), for tests.
    pub fn with_endpoint(endpoint: impl Into<String>) -> Self {
        Self {
            endpoint: endpoint.into(),
            http: Client::new(),
        }
    }

    /// Fetch the user-data spec. A 404 means no user data was defined
    /// and degrades to the zero-value spec; any other failure
    /// propagates.
    pub async fn fetch_user_data(&self) -> PreinitResult<VMSpec> {
        let resp = match self.get(PATH_USER_DATA).await {
            Ok(resp) => resp,
            Err(PreinitError::Status(404)) => {
                tracing::info!("no user data defined, using defaults only");
                return Ok(VMSpec::default());
            }
            Err(err) => return Err(err),
        };

        let body = resp.text().await.map_err(PreinitError::BodyUnreadable)?;
        Ok(serde_yaml::from_str(&body)?)
    }

    /// Fetch the region this instance is placed in.
    pub async fn fetch_region(&self) -> PreinitResult<String> {
        let resp = self.get(PATH_REGION).await?;
        resp.text().await.map_err(PreinitError::BodyUnreadable)
    }

    async fn token(&self) -> PreinitResult<String> {
        let url = format!("http://{}{}", self.endpoint, PATH_TOKEN);
        let resp = self
            .request(Method::PUT, &url, &[(HEADER_TOKEN_TTL, TOKEN_TTL_SECONDS)])
            .await?;
        resp.text().await.map_err(PreinitError::BodyUnreadable)
    }

    async fn get(&self, path: &str) -> PreinitResult<Response> {
        let token = self.token().await?;
        let url = format!("http://{}{}", self.endpoint, path);
        self.request(Method::GET, &url, &[(HEADER_TOKEN, token.as_str())])
            .await
    }

    async fn request(
        &self,
        method: Method,
        request_url: &str,
        headers: &[(&str, &str)],
    ) -> PreinitResult<Response> {
        if method != Method::GET && method != Method::PUT {
            return Err(PreinitError::InvalidMethod(method.to_string()));
        }

        let url =
            Url::parse(request_url).map_err(|_| PreinitError::InvalidUrl(request_url.into()))?;

        let mut req = self.http.request(method, url);
        for (name, value) in headers {
            req = req.header(*name, *value);
        }

        let resp = req.send().await.map_err(PreinitError::Transport)?;

        let status = resp.status().as_u16();
        if status >= 400 {
            return Err(PreinitError::Status(status));
        }
        Ok(resp)
    }
}

impl Default for ImdsClient {
    fn default() -> Self {
        Self::new()
    }
}
