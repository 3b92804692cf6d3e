//! HTTP plumbing shared by every WOPI call.

use reqwest::header::{LOCATION, USER_AGENT};
use reqwest::{redirect, Certificate, Client, Method, RequestBuilder, Response, StatusCode};
use tracing::{trace, warn};
use url::Url;
use wopi_storage_core::{
    process_identifier, sanitize_uri, Anonymizer, Authorization, SslSettings, StorageError,
    StorageSettings,
};

/// Maximum number of redirects followed for one request.
pub const REDIRECTION_LIMIT: u32 = 21;

pub const WOPI_AGENT: &str = concat!("wopi-storage/", env!("CARGO_PKG_VERSION"));

/// Identifies this server to the host, for correlating logs across a cluster.
pub const SERVER_ID_HEADER: &str = "X-COOL-WOPI-ServerId";

pub fn is_redirect(status: StatusCode) -> bool {
    matches!(
        status,
        StatusCode::MOVED_PERMANENTLY
            | StatusCode::FOUND
            | StatusCode::TEMPORARY_REDIRECT
            | StatusCode::PERMANENT_REDIRECT
    )
}

/// A `reqwest` client configured from [`StorageSettings`].
///
/// Redirects are never followed by `reqwest` itself; see
/// [`WopiClient::get_following_redirects`].
#[derive(Debug, Clone)]
pub struct WopiClient {
    http: Client,
    ssl: SslSettings,
    anonymizer: Anonymizer,
}

impl WopiClient {
    pub fn from_settings(settings: &StorageSettings) -> Result<Self, StorageError> {
        let mut builder = Client::builder()
            .redirect(redirect::Policy::none())
            .connect_timeout(settings.connection_timeout());

        if let Some(ca_file) = &settings.ssl.ca_file_path {
            let pem = std::fs::read(ca_file).map_err(|e| {
                StorageError::Config(format!(
                    "Failed to read CA file {}: {}",
                    ca_file.display(),
                    e
                ))
            })?;
            let certificate = Certificate::from_pem(&pem).map_err(|e| {
                StorageError::Config(format!(
                    "Invalid CA certificate {}: {}",
                    ca_file.display(),
                    e
                ))
            })?;
            builder = builder.add_root_certificate(certificate);
        }

        let http = builder
            .build()
            .map_err(|e| StorageError::Config(format!("Failed to build HTTP client: {}", e)))?;

        Ok(Self {
            http,
            ssl: settings.ssl.clone(),
            anonymizer: Anonymizer::from_settings(&settings.anonymization),
        })
    }

    pub fn anonymizer(&self) -> &Anonymizer {
        &self.anonymizer
    }

    /// `uri` without its access token and with the filename anonymized.
    pub fn loggable(&self, uri: &Url) -> String {
        self.anonymizer.url(sanitize_uri(uri).as_str())
    }

    /// The URI actually requested: with `ssl.as_scheme` off and `ssl.enable`
    /// on, plain HTTP is upgraded to HTTPS.
    pub fn effective_uri(&self, uri: &Url) -> Url {
        let mut uri = uri.clone();
        if !self.ssl.as_scheme && self.ssl.enable && uri.scheme() == "http" {
            // Only fails for non-special schemes.
            let _ = uri.set_scheme("https");
        }
        uri
    }

    /// A request carrying the common WOPI headers and the credentials.
    pub fn request(&self, method: Method, uri: &Url, auth: &Authorization) -> RequestBuilder {
        let mut request = self
            .http
            .request(method, self.effective_uri(uri))
            .header(USER_AGENT, WOPI_AGENT)
            .header(SERVER_ID_HEADER, process_identifier());
        for (name, value) in auth.headers() {
            request = request.header(name, value);
        }
        request
    }

    /// GET `uri`, following up to [`REDIRECTION_LIMIT`] redirects.
    ///
    /// Returns the first non-redirect response and the URI that produced it.
    /// With `reauthorize` the access token is set on every hop.
    pub async fn get_following_redirects(
        &self,
        uri: &Url,
        auth: &Authorization,
        reauthorize: bool,
        label: &str,
    ) -> Result<(Response, Url), StorageError> {
        let mut current = uri.clone();
        let mut remaining = REDIRECTION_LIMIT;

        loop {
            let mut target = current.clone();
            if reauthorize {
                auth.authorize_uri(&mut target);
            }
            trace!("{} requesting [{}]", label, self.loggable(&target));

            let response = self
                .request(Method::GET, &target, auth)
                .send()
                .await
                .map_err(|e| {
                    StorageError::Connection(format!(
                        "{} [{}] failed: {}",
                        label,
                        self.loggable(&target),
                        e
                    ))
                })?;

            if !is_redirect(response.status()) {
                return Ok((response, target));
            }

            if remaining == 0 {
                warn!(
                    "{} redirected too many times - URI [{}]",
                    label,
                    self.loggable(&target)
                );
                return Err(StorageError::Connection(format!(
                    "{} [{}] failed: redirected too many times",
                    label,
                    self.loggable(uri)
                )));
            }

            let location = response
                .headers()
                .get(LOCATION)
                .and_then(|value| value.to_str().ok())
                .ok_or_else(|| {
                    StorageError::Connection(format!(
                        "{} redirect without a valid Location header",
                        label
                    ))
                })?;
            let next = target.join(location).map_err(|e| {
                StorageError::Connection(format!("{} invalid redirect location: {}", label, e))
            })?;
            trace!("{} redirect to URI [{}]", label, self.loggable(&next));

            current = next;
            remaining -= 1;
        }
    }
}
