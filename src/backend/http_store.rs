//! Generic authenticated HTTP blob store.
//!
//! `GET {url}/{key}` fetches a blob, `PUT {url}/{key}` replaces it. A
//! response `ETag` is the blob version; conditional writes send `If-Match`
//! (or `If-None-Match: *` for a key that does not exist yet) and treat
//! `412 Precondition Failed` as a version conflict.

use std::sync::Arc;
use std::time::Duration;

use reqwest::header::{CONTENT_TYPE, ETAG, IF_MATCH, IF_NONE_MATCH};
use reqwest::{Client, RequestBuilder, StatusCode, Url};
use tokio::sync::OnceCell;

use super::{
    Backend, BackendError, BackendFuture, BackendKind, BackendParameters, BlobVersion, SetOutcome,
    SetupField, StoredBlob,
};

const URL_PARAM: &str = "url";
const TOKEN_PARAM: &str = "token";
const USERNAME_PARAM: &str = "username";
const PASSWORD_PARAM: &str = "password";
const TIMEOUT_PARAM: &str = "timeout_secs";
const CONDITIONAL_PARAM: &str = "conditional_writes";
const DEFAULT_TIMEOUT_SECS: u64 = 30;

#[derive(Clone, Debug, Eq, PartialEq)]
enum HttpAuth {
    Bearer(String),
    Basic { username: String, password: String },
}

#[derive(Clone, Debug, Eq, PartialEq)]
struct HttpSettings {
    base: Url,
    auth: HttpAuth,
    timeout: Duration,
    conditional: bool,
}

impl HttpSettings {
    fn from_parameters(parameters: &BackendParameters) -> Result<Self, BackendError> {
        let kind = BackendKind::Http;
        let raw_url = parameters.require(kind, URL_PARAM)?;
        let base = Url::parse(raw_url)
            .map_err(|err| BackendError::configuration(kind, format!("invalid url: {err}")))?;
        if !matches!(base.scheme(), "http" | "https") {
            return Err(BackendError::configuration(
                kind,
                format!("url scheme must be http or https, got `{}`", base.scheme()),
            ));
        }

        let auth = match (
            parameters.get(TOKEN_PARAM),
            parameters.get(USERNAME_PARAM),
            parameters.get(PASSWORD_PARAM),
        ) {
            (Some(token), None, None) => HttpAuth::Bearer(token.to_owned()),
            (None, Some(username), Some(password)) => HttpAuth::Basic {
                username: username.to_owned(),
                password: password.to_owned(),
            },
            (None, None, None) => {
                return Err(BackendError::configuration(
                    kind,
                    "set either `token` or both `username` and `password`",
                ));
            }
            (Some(_), _, _) => {
                return Err(BackendError::configuration(
                    kind,
                    "`token` cannot be combined with `username`/`password`",
                ));
            }
            (None, _, _) => {
                return Err(BackendError::configuration(
                    kind,
                    "basic auth needs both `username` and `password`",
                ));
            }
        };

        let timeout_secs = match parameters.get(TIMEOUT_PARAM) {
            None => DEFAULT_TIMEOUT_SECS,
            Some(raw) => raw.parse::<u64>().map_err(|err| {
                BackendError::configuration(kind, format!("invalid `{TIMEOUT_PARAM}`: {err}"))
            })?,
        };

        Ok(Self {
            base,
            auth,
            timeout: Duration::from_secs(timeout_secs),
            conditional: parameters.flag(kind, CONDITIONAL_PARAM, true)?,
        })
    }

    fn key_url(&self, key: &str) -> Result<Url, BackendError> {
        let joined = format!("{}/{key}", self.base.as_str().trim_end_matches('/'));
        Url::parse(&joined).map_err(|err| {
            BackendError::configuration(BackendKind::Http, format!("invalid key url: {err}"))
        })
    }
}

#[derive(Debug)]
struct HttpConnection {
    client: Client,
    settings: HttpSettings,
}

impl HttpConnection {
    fn authorised(&self, request: RequestBuilder) -> RequestBuilder {
        match &self.settings.auth {
            HttpAuth::Bearer(token) => request.bearer_auth(token),
            HttpAuth::Basic { username, password } => {
                request.basic_auth(username, Some(password))
            }
        }
    }
}

/// Backend talking to a REST-style blob store.
#[derive(Clone, Debug)]
pub struct HttpBackend {
    parameters: BackendParameters,
    connection: Arc<OnceCell<HttpConnection>>,
}

impl HttpBackend {
    /// Creates a backend; parameters are validated on first use.
    #[must_use]
    pub fn new(parameters: BackendParameters) -> Self {
        Self {
            parameters,
            connection: Arc::new(OnceCell::new()),
        }
    }

    async fn connection(&self) -> Result<&HttpConnection, BackendError> {
        self.connection
            .get_or_try_init(|| async {
                let settings = HttpSettings::from_parameters(&self.parameters)?;
                let client = Client::builder()
                    .timeout(settings.timeout)
                    .build()
                    .map_err(|err| {
                        BackendError::configuration(
                            BackendKind::Http,
                            format!("cannot build HTTP client: {err}"),
                        )
                    })?;
                Ok(HttpConnection { client, settings })
            })
            .await
    }

    async fn put(
        &self,
        key: &str,
        bytes: &[u8],
        precondition: Option<Option<&BlobVersion>>,
    ) -> Result<SetOutcome, BackendError> {
        let connection = self.connection().await?;
        let url = connection.settings.key_url(key)?;
        let mut request = connection
            .authorised(connection.client.put(url))
            .header(CONTENT_TYPE, "application/json")
            .body(bytes.to_vec());
        request = match precondition {
            None => request,
            Some(Some(version)) => request.header(IF_MATCH, version.as_str()),
            Some(None) => request.header(IF_NONE_MATCH, "*"),
        };
        let response = request.send().await.map_err(transport_error)?;
        let status = response.status();
        if status.is_success() {
            return Ok(SetOutcome::Written);
        }
        if precondition.is_some()
            && matches!(status, StatusCode::PRECONDITION_FAILED | StatusCode::CONFLICT)
        {
            return Ok(SetOutcome::VersionConflict);
        }
        Err(status_error(status, "PUT", key))
    }
}

fn transport_error(err: reqwest::Error) -> BackendError {
    BackendError::unavailable(format!("HTTP request failed: {err}"))
}

fn status_error(status: StatusCode, method: &str, key: &str) -> BackendError {
    if matches!(status, StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN) {
        return BackendError::configuration(
            BackendKind::Http,
            format!("{method} {key} rejected credentials with status {status}"),
        );
    }
    BackendError::unavailable(format!("{method} {key} returned status {status}"))
}

impl Backend for HttpBackend {
    fn kind(&self) -> BackendKind {
        BackendKind::Http
    }

    fn parameters(&self) -> &BackendParameters {
        &self.parameters
    }

    fn initialize(&self) -> BackendFuture<'_, (), BackendError> {
        Box::pin(async move { self.connection().await.map(|_| ()) })
    }

    fn get<'a>(&'a self, key: &'a str) -> BackendFuture<'a, Option<StoredBlob>, BackendError> {
        Box::pin(async move {
            let connection = self.connection().await?;
            let url = connection.settings.key_url(key)?;
            let response = connection
                .authorised(connection.client.get(url))
                .send()
                .await
                .map_err(transport_error)?;
            let status = response.status();
            if status == StatusCode::NOT_FOUND {
                return Ok(None);
            }
            if !status.is_success() {
                return Err(status_error(status, "GET", key));
            }
            let version = response
                .headers()
                .get(ETAG)
                .and_then(|value| value.to_str().ok())
                .map(BlobVersion::new);
            let bytes = response.bytes().await.map_err(transport_error)?.to_vec();
            Ok(Some(StoredBlob { bytes, version }))
        })
    }

    fn set<'a>(&'a self, key: &'a str, bytes: &'a [u8]) -> BackendFuture<'a, (), BackendError> {
        Box::pin(async move { self.put(key, bytes, None).await.map(|_| ()) })
    }

    fn supports_conditional_set(&self) -> bool {
        HttpSettings::from_parameters(&self.parameters).is_ok_and(|settings| settings.conditional)
    }

    fn set_if_version<'a>(
        &'a self,
        key: &'a str,
        bytes: &'a [u8],
        expected: Option<&'a BlobVersion>,
    ) -> BackendFuture<'a, SetOutcome, BackendError> {
        Box::pin(async move {
            if !self.connection().await?.settings.conditional {
                return Err(BackendError::Unsupported {
                    kind: BackendKind::Http,
                    operation: "set_if_version",
                });
            }
            self.put(key, bytes, Some(expected)).await
        })
    }

    fn requires_interactive_setup(&self) -> bool {
        HttpSettings::from_parameters(&self.parameters).is_err()
    }

    fn setup_fields(&self) -> Vec<SetupField> {
        vec![
            SetupField::new(URL_PARAM, "Base URL of the blob store", false, true),
            SetupField::new(TOKEN_PARAM, "Bearer token (leave empty for basic auth)", true, false),
            SetupField::new(USERNAME_PARAM, "Basic auth username", false, false),
            SetupField::new(PASSWORD_PARAM, "Basic auth password", true, false),
        ]
    }
}
