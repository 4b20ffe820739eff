use std::fmt;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::info;

/// Fastly API endpoint.
pub const FASTLY_API_URL: &str = "https://api.fastly.com";

/// Purge tag that selects a full-service purge.
pub const PURGE_ALL_TAG: &str = "purge_all";

#[derive(Debug, thiserror::Error)]
pub enum PurgeError {
    #[error("fastly request failed: {0}")]
    Transport(#[from] reqwest::Error),

    #[error("unexpected Fastly purge status: {status} (HTTP {http_status})")]
    Rejected { http_status: u16, status: String },

    #[error("cannot decode Fastly response: {0}")]
    Decode(#[source] serde_json::Error),

    #[error("invalid Fastly API url {url:?}: {reason}")]
    InvalidUrl { url: String, reason: String },
}

/// What to invalidate.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PurgeTarget {
    /// Everything cached for the service.
    All,
    /// Objects carrying this surrogate key.
    Key(String),
}

impl PurgeTarget {
    /// An empty tag or `purge_all` purges everything; any other tag purges
    /// that surrogate key.
    pub fn from_tag(tag: &str) -> Self {
        let tag = tag.trim();
        if tag.is_empty() || tag == PURGE_ALL_TAG {
            PurgeTarget::All
        } else {
            PurgeTarget::Key(tag.to_string())
        }
    }
}

impl fmt::Display for PurgeTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PurgeTarget::All => f.write_str(PURGE_ALL_TAG),
            PurgeTarget::Key(key) => write!(f, "key {key}"),
        }
    }
}

/// Body returned by the purge endpoints.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PurgeResponse {
    pub status: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
}

/// Minimal Fastly purge API client.
#[derive(Debug, Clone)]
pub struct FastlyClient {
    http: reqwest::Client,
    base_url: String,
    api_key: String,
    service_id: String,
}

impl FastlyClient {
    /// Build a client; `timeout` bounds each request.
    pub fn new(
        api_key: impl Into<String>,
        service_id: impl Into<String>,
        timeout: Option<Duration>,
    ) -> Result<Self, PurgeError> {
        let mut builder = reqwest::Client::builder();
        if let Some(timeout) = timeout.filter(|t| !t.is_zero()) {
            builder = builder.timeout(timeout);
        }
        Ok(Self {
            http: builder.build()?,
            base_url: FASTLY_API_URL.to_string(),
            api_key: api_key.into(),
            service_id: service_id.into(),
        })
    }

    /// Send requests to `base_url` instead of the public API.
    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into().trim_end_matches('/').to_string();
        self
    }

    pub fn service_id(&self) -> &str {
        &self.service_id
    }

    /// Endpoint for `target`. The service id and surrogate key are
    /// percent-encoded as single path segments.
    fn url(&self, target: &PurgeTarget) -> Result<reqwest::Url, PurgeError> {
        let invalid = |reason: String| PurgeError::InvalidUrl {
            url: self.base_url.clone(),
            reason,
        };
        let mut url = reqwest::Url::parse(&self.base_url).map_err(|e| invalid(e.to_string()))?;
        {
            let mut segments = url
                .path_segments_mut()
                .map_err(|()| invalid("not a base url".to_string()))?;
            segments.pop_if_empty().push("service").push(&self.service_id);
            match target {
                PurgeTarget::All => segments.push(PURGE_ALL_TAG),
                PurgeTarget::Key(key) => segments.push("purge").push(key),
            };
        }
        Ok(url)
    }

    /// Invalidate `target`. Anything but an `"ok"` status is an error.
    pub async fn purge(&self, target: &PurgeTarget) -> Result<PurgeResponse, PurgeError> {
        let url = self.url(target)?;
        info!(service = %self.service_id, target = %target, "purging CDN cache");

        let response = self
            .http
            .post(url)
            .header("Fastly-Key", &self.api_key)
            .header("Accept", "application/json")
            .send()
            .await?;
        let http_status = response.status();
        let body = response.bytes().await?;

        let parsed: PurgeResponse = match serde_json::from_slice(&body) {
            Ok(parsed) => parsed,
            Err(_) if !http_status.is_success() => {
                return Err(PurgeError::Rejected {
                    http_status: http_status.as_u16(),
                    status: String::from_utf8_lossy(&body).trim().to_string(),
                });
            }
            Err(e) => return Err(PurgeError::Decode(e)),
        };

        if !http_status.is_success() || parsed.status != "ok" {
            return Err(PurgeError::Rejected {
                http_status: http_status.as_u16(),
                status: parsed.status,
            });
        }
        Ok(parsed)
    }
}

/// Purge the cache of `service_id`, selecting the target from `purge_tag`.
pub async fn purge(
    api_key: &str,
    service_id: &str,
    purge_tag: &str,
    timeout: Option<Duration>,
) -> Result<PurgeResponse, PurgeError> {
    FastlyClient::new(api_key, service_id, timeout)?
        .purge(&PurgeTarget::from_tag(purge_tag))
        .await
}

#[cfg(test)]
mod tests {
    use std::thread;

    use tiny_http::{Header, Response, Server, StatusCode};

    use super::*;

    struct Recorded {
        method: String,
        url: String,
        fastly_key: Option<String>,
    }

    struct FakeFastly {
        base_url: String,
        handle: thread::JoinHandle<Recorded>,
    }

    fn spawn_fastly(status: u16, body: &'static str) -> FakeFastly {
        let server = Server::http("127.0.0.1:0").expect("server");
        let base_url = format!("http://{}", server.server_addr());
        let handle = thread::spawn(move || {
            let req = server.recv().expect("request");
            let recorded = Recorded {
                method: req.method().to_string(),
                url: req.url().to_string(),
                fastly_key: req
                    .headers()
                    .iter()
                    .find(|h| h.field.equiv("Fastly-Key"))
                    .map(|h| h.value.to_string()),
            };
            let resp = Response::from_string(body)
                .with_status_code(StatusCode(status))
                .with_header(Header::from_bytes("Content-Type", "application/json").expect("header"));
            req.respond(resp).expect("respond");
            recorded
        });
        FakeFastly { base_url, handle }
    }

    fn client(fake: &FakeFastly) -> FastlyClient {
        FastlyClient::new("secret", "SVC123", Some(Duration::from_secs(5)))
            .unwrap()
            .with_base_url(&fake.base_url)
    }

    #[test]
    fn target_from_tag() {
        assert_eq!(PurgeTarget::from_tag(""), PurgeTarget::All);
        assert_eq!(PurgeTarget::from_tag("purge_all"), PurgeTarget::All);
        assert_eq!(
            PurgeTarget::from_tag("mykey"),
            PurgeTarget::Key("mykey".to_string())
        );
    }

    #[tokio::test]
    async fn empty_tag_purges_everything() {
        let fake = spawn_fastly(200, r#"{"status":"ok"}"#);

        let response = client(&fake).purge(&PurgeTarget::from_tag("")).await.unwrap();

        let recorded = fake.handle.join().unwrap();
        assert_eq!(response.status, "ok");
        assert_eq!(recorded.method, "POST");
        assert_eq!(recorded.url, "/service/SVC123/purge_all");
        assert_eq!(recorded.fastly_key.as_deref(), Some("secret"));
    }

    #[tokio::test]
    async fn tag_purges_by_surrogate_key() {
        let fake = spawn_fastly(200, r#"{"status":"ok","id":"108-1391560174-974124"}"#);

        let response = client(&fake).purge(&PurgeTarget::from_tag("mykey")).await.unwrap();

        let recorded = fake.handle.join().unwrap();
        assert_eq!(recorded.url, "/service/SVC123/purge/mykey");
        assert_eq!(response.id.as_deref(), Some("108-1391560174-974124"));
    }

    #[tokio::test]
    async fn surrogate_key_is_sent_as_one_escaped_segment() {
        let fake = spawn_fastly(200, r#"{"status":"ok"}"#);

        client(&fake)
            .purge(&PurgeTarget::from_tag("my#key/a b?x=1"))
            .await
            .unwrap();

        let recorded = fake.handle.join().unwrap();
        assert_eq!(recorded.url, "/service/SVC123/purge/my%23key%2Fa%20b%3Fx=1");
    }

    #[test]
    fn unparsable_base_url_is_reported() {
        let client = FastlyClient::new("secret", "SVC123", None)
            .unwrap()
            .with_base_url("not a url");

        let err = client.url(&PurgeTarget::All).unwrap_err();
        assert!(matches!(err, PurgeError::InvalidUrl { .. }));
    }

    #[tokio::test]
    async fn non_ok_status_is_rejected() {
        let fake = spawn_fastly(200, r#"{"status":"error"}"#);

        let err = client(&fake).purge(&PurgeTarget::All).await.unwrap_err();

        fake.handle.join().unwrap();
        assert_eq!(
            err.to_string(),
            "unexpected Fastly purge status: error (HTTP 200)"
        );
    }

    #[tokio::test]
    async fn http_error_is_rejected() {
        let fake = spawn_fastly(401, r#"{"msg":"Provided credentials are missing or invalid"}"#);

        let err = client(&fake).purge(&PurgeTarget::All).await.unwrap_err();

        fake.handle.join().unwrap();
        assert!(matches!(err, PurgeError::Rejected { http_status: 401, .. }));
    }

    #[tokio::test]
    async fn garbage_body_is_a_decode_error() {
        let fake = spawn_fastly(200, "<html>");

        let err = client(&fake).purge(&PurgeTarget::All).await.unwrap_err();

        fake.handle.join().unwrap();
        assert!(matches!(err, PurgeError::Decode(_)));
    }

    #[tokio::test]
    async fn unreachable_api_is_a_transport_error() {
        let server = Server::http("127.0.0.1:0").expect("server");
        let base_url = format!("http://{}", server.server_addr());
        drop(server);

        let err = FastlyClient::new("secret", "SVC123", Some(Duration::from_secs(2)))
            .unwrap()
            .with_base_url(base_url)
            .purge(&PurgeTarget::All)
            .await
            .unwrap_err();

        assert!(matches!(err, PurgeError::Transport(_)));
    }
}
