//! MyFoodRepo client for the collaborator JSON:API.
//!
//! The collaborator API authenticates every request with three headers
//! (`uid`, `client`, `access-token`) and answers with JSON:API documents:
//!
//! ```json
//! {
//!     "data": [ { "id": "...", "type": "annotation", "attributes": {}, "relationships": {} } ],
//!     "included": [ ... ],
//!     "meta": { "next": 2 }
//! }
//! ```
//!
//! This client performs exactly one HTTP exchange per call. Pagination,
//! retries and cancellation live in `larder_core::Harvester`.

use larder_core::error::AppError;
use larder_core::models::{DocumentPage, Participant, Resource};
use larder_core::traits::PartnerApi;
use larder_core::{HttpConfig, PartnerCredentials, PartnerEnvironment};
use reqwest::header::{ACCEPT, CONTENT_TYPE, HeaderMap, HeaderName, HeaderValue};
use reqwest::{Client, RequestBuilder, StatusCode, Url};
use serde::Deserialize;
use serde::de::DeserializeOwned;

const JSON_MEDIA_TYPE: &str = "application/json";

/// Response of a single-resource endpoint such as participation creation.
#[derive(Deserialize, Debug)]
struct SingleDocument {
    data: Resource,
}

/// HTTP client for a MyFoodRepo deployment.
///
/// # Examples
///
/// ```no_run
/// use larder_client::MyFoodRepoClient;
/// use larder_core::{HttpConfig, PartnerCredentials, PartnerEnvironment};
///
/// # fn example() -> Result<(), Box<dyn std::error::Error>> {
/// let credentials = PartnerCredentials::from_env()?;
/// let client = MyFoodRepoClient::for_environment(
///     PartnerEnvironment::Staging,
///     &credentials,
///     &HttpConfig::default(),
/// )?;
/// assert_eq!(client.base_url().as_str(), "https://staging-v2.myfoodrepo.org/");
/// # Ok(())
/// # }
/// ```
#[derive(Clone)]
pub struct MyFoodRepoClient {
    client: Client,
    base_url: Url,
    timeout_secs: u64,
}

impl MyFoodRepoClient {
    /// Creates a client for an arbitrary base URL.
    ///
    /// # Errors
    ///
    /// Returns `AppError::InvalidUrl` if the URL cannot be parsed.
    /// Returns `AppError::ConfigError` if a credential is not a valid header value.
    /// Returns `AppError::ClientError` if the HTTP client cannot be built.
    pub fn new(
        base_url_str: &str,
        credentials: &PartnerCredentials,
        config: &HttpConfig,
    ) -> Result<Self, AppError> {
        let base_url =
            Url::parse(base_url_str).map_err(|_| AppError::InvalidUrl(base_url_str.to_string()))?;

        let client = Client::builder()
            .user_agent(config.user_agent.as_str())
            .timeout(config.timeout)
            .default_headers(auth_headers(credentials)?)
            .build()
            .map_err(|e| AppError::ClientError(e.to_string()))?;

        Ok(Self {
            client,
            base_url,
            timeout_secs: config.timeout.as_secs(),
        })
    }

    /// Creates a client for one of the known deployments (always HTTPS).
    pub fn for_environment(
        environment: PartnerEnvironment,
        credentials: &PartnerCredentials,
        config: &HttpConfig,
    ) -> Result<Self, AppError> {
        Self::new(&environment.base_url(), credentials, config)
    }

    pub fn base_url(&self) -> &Url {
        &self.base_url
    }

    fn endpoint(&self, path: &str) -> Result<Url, AppError> {
        self.base_url
            .join(path)
            .map_err(|e| AppError::InvalidUrl(format!("{}: {}", path, e)))
    }

    /// Sends `request` and decodes a successful body as `T`.
    ///
    /// Transport failures are classified for the retry layer: timeouts and
    /// connection failures become `Timeout` and `NetworkError`, any other
    /// non-success status becomes `ApiError` carrying the body.
    async fn send<T: DeserializeOwned>(&self, request: RequestBuilder) -> Result<T, AppError> {
        let resp = request.send().await.map_err(|e| self.classify(e))?;
        let status = resp.status();

        if status == StatusCode::TOO_MANY_REQUESTS {
            tracing::debug!("Partner API rate limit hit");
            return Err(AppError::RateLimitExceeded);
        }
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            tracing::debug!(status = status.as_u16(), "Partner API returned an error status");
            return Err(AppError::ApiError {
                status: status.as_u16(),
                body,
            });
        }

        let bytes = resp.bytes().await.map_err(|e| self.classify(e))?;
        serde_json::from_slice(&bytes).map_err(|e| AppError::MalformedDocument(e.to_string()))
    }

    fn classify(&self, e: reqwest::Error) -> AppError {
        if e.is_timeout() {
            AppError::Timeout(self.timeout_secs)
        } else if e.is_connect() {
            AppError::NetworkError(format!("Connection failed: {}", e))
        } else {
            AppError::ClientError(e.to_string())
        }
    }
}

fn auth_headers(credentials: &PartnerCredentials) -> Result<HeaderMap, AppError> {
    let value = |name: &str, raw: &str| {
        HeaderValue::from_str(raw)
            .map_err(|_| AppError::ConfigError(format!("{} is not a valid header value", name)))
    };

    let mut token = value(PartnerCredentials::ACCESS_TOKEN_VAR, &credentials.access_token)?;
    token.set_sensitive(true);

    let mut headers = HeaderMap::new();
    headers.insert(
        HeaderName::from_static("uid"),
        value(PartnerCredentials::UID_VAR, &credentials.uid)?,
    );
    headers.insert(
        HeaderName::from_static("client"),
        value(PartnerCredentials::CLIENT_VAR, &credentials.client)?,
    );
    headers.insert(HeaderName::from_static("access-token"), token);
    headers.insert(CONTENT_TYPE, HeaderValue::from_static(JSON_MEDIA_TYPE));
    headers.insert(ACCEPT, HeaderValue::from_static(JSON_MEDIA_TYPE));
    Ok(headers)
}

impl PartnerApi for MyFoodRepoClient {
    async fn fetch_page(
        &self,
        path: &str,
        query: &[(String, String)],
    ) -> Result<DocumentPage, AppError> {
        let url = self.endpoint(path)?;
        tracing::trace!(%url, ?query, "GET");
        self.send(self.client.get(url).query(query)).await
    }

    async fn create_participation(&self, cohort_id: &str) -> Result<Participant, AppError> {
        let url = self.endpoint(&format!(
            "/collab/api/v1/cohorts/{}/participations",
            cohort_id
        ))?;
        tracing::debug!(%url, "POST");

        let document: SingleDocument = self
            .send(self.client.post(url).json(&serde_json::json!({})))
            .await?;

        Participant::from_resource(&document.data).ok_or_else(|| {
            AppError::MalformedDocument(format!(
                "participation {} has no key attribute",
                document.data.id
            ))
        })
    }
}
