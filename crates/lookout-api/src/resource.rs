// Authenticated resource fetches
//
// `GET <root>/<resource>?<query>` with a bearer token, one transparent
// token refresh on 401, and cooperative cancellation. Payloads are opaque
// JSON -- callers decide what shape they expect.

use std::sync::Arc;

use indexmap::IndexMap;
use reqwest::StatusCode;
use reqwest::header::{HeaderMap, HeaderName, HeaderValue};
use secrecy::{ExposeSecret, SecretString};
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};
use url::Url;

use crate::auth::CredentialProvider;
use crate::error::Error;

/// Ordered query parameters. Serialized in insertion order.
pub type QueryParams = IndexMap<String, String>;

/// Per-request options layered on top of the client defaults.
#[derive(Debug, Clone, Default)]
pub struct FetchOptions {
    /// Extra headers sent with every fetch of this resource.
    pub headers: HeaderMap,
}

impl FetchOptions {
    /// Add one header, validating name and value.
    pub fn with_header(mut self, name: &str, value: &str) -> Result<Self, Error> {
        let name = HeaderName::from_bytes(name.as_bytes())
            .map_err(|e| Error::InvalidHeader(format!("{name}: {e}")))?;
        let value =
            HeaderValue::from_str(value).map_err(|e| Error::InvalidHeader(format!("{name}: {e}")))?;
        self.headers.insert(name, value);
        Ok(self)
    }
}

/// Join a relative path onto the API root, tolerating slashes on either side.
pub fn endpoint_url(root: &Url, path: &str) -> Result<Url, Error> {
    let base = root.as_str().trim_end_matches('/');
    let path = path.trim_start_matches('/');
    Ok(Url::parse(&format!("{base}/{path}"))?)
}

/// HTTP client for monitoring-platform resources.
///
/// Cheap to share behind an `Arc`; every subscription fetches through the
/// same instance so they also share the credential provider's single-flight
/// refresh.
pub struct ResourceClient {
    http: reqwest::Client,
    api_root: Url,
    credentials: Arc<CredentialProvider>,
}

impl ResourceClient {
    pub fn new(http: reqwest::Client, api_root: Url, credentials: Arc<CredentialProvider>) -> Self {
        Self {
            http,
            api_root,
            credentials,
        }
    }

    pub fn api_root(&self) -> &Url {
        &self.api_root
    }

    pub fn credentials(&self) -> &Arc<CredentialProvider> {
        &self.credentials
    }

    /// Build `<root>/<resource>?<query>`. An empty query adds no `?`.
    pub fn resource_url(&self, resource: &str, query: &QueryParams) -> Result<Url, Error> {
        let mut url = endpoint_url(&self.api_root, resource)?;
        if !query.is_empty() {
            url.query_pairs_mut()
                .extend_pairs(query.iter().map(|(k, v)| (k.as_str(), v.as_str())));
        }
        Ok(url)
    }

    /// Fetch a resource and parse the body as JSON.
    ///
    /// Resolves to [`Error::Cancelled`] as soon as `cancel` fires; the
    /// in-flight request future is dropped, which aborts it.
    pub async fn get_json(
        &self,
        resource: &str,
        query: &QueryParams,
        options: &FetchOptions,
        cancel: &CancellationToken,
    ) -> Result<serde_json::Value, Error> {
        let url = self.resource_url(resource, query)?;

        tokio::select! {
            biased;
            () = cancel.cancelled() => {
                trace!(%url, "fetch cancelled");
                Err(Error::Cancelled)
            }
            result = self.get_with_refresh(url.clone(), options) => result,
        }
    }

    async fn get_with_refresh(
        &self,
        url: Url,
        options: &FetchOptions,
    ) -> Result<serde_json::Value, Error> {
        let token = self.credentials.require_token()?;

        let mut resp = self.send_get(&url, options, &token).await?;

        if resp.status() == StatusCode::UNAUTHORIZED {
            debug!(%url, "401 from backend, refreshing token");
            let fresh = self.credentials.refresh(&token).await?;
            resp = self.send_get(&url, options, &fresh).await?;
            if resp.status() == StatusCode::UNAUTHORIZED {
                return Err(Error::SessionExpired);
            }
        }

        parse_json(resp).await
    }

    async fn send_get(
        &self,
        url: &Url,
        options: &FetchOptions,
        token: &SecretString,
    ) -> Result<reqwest::Response, Error> {
        debug!("GET {}", url);

        self.http
            .get(url.clone())
            .headers(options.headers.clone())
            .bearer_auth(token.expose_secret())
            .send()
            .await
            .map_err(Error::Transport)
    }
}

/// Map a non-2xx status to [`Error::Http`], otherwise parse the body.
async fn parse_json(resp: reqwest::Response) -> Result<serde_json::Value, Error> {
    let status = resp.status();

    if !status.is_success() {
        let status_text = status
            .canonical_reason()
            .map_or_else(|| status.as_str().to_owned(), str::to_owned);
        return Err(Error::Http {
            status: status.as_u16(),
            status_text,
        });
    }

    let body = resp.text().await.map_err(Error::Transport)?;

    serde_json::from_str(&body).map_err(|e| {
        let preview = body.chars().take(200).collect::<String>();
        Error::Deserialization {
            message: format!("{e} (body preview: {preview:?})"),
            body,
        }
    })
}
