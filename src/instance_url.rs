//! Instance URL handling: canonical keys, display slugs, and endpoint probing.
//!
//! Users type instance addresses in every shape imaginable (`Chat.Example`,
//! `https://chat.example/api/`, ` http://10.0.0.5:8000 `). Everything that is
//! stored or compared goes through [`normalize`] first so that equal keys mean
//! "same instance".

use std::borrow::Borrow;
use std::fmt;

use futures::future::BoxFuture;
use serde::Serialize;
use serde_json::Value;

/// Path suffix most deployments mount their API under.
pub const API_SUFFIX: &str = "/api";

/// Canonical identity of an instance, produced by [`normalize`].
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(transparent)]
pub struct InstanceKey(String);

impl InstanceKey {
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Host component of the key, if the key parses as a URL.
    pub fn hostname(&self) -> Option<String> {
        reqwest::Url::parse(&self.0)
            .ok()?
            .host_str()
            .map(str::to_owned)
    }

    pub fn slug(&self) -> String {
        slug(&self.0)
    }
}

impl fmt::Display for InstanceKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl Borrow<str> for InstanceKey {
    fn borrow(&self) -> &str {
        &self.0
    }
}

impl AsRef<str> for InstanceKey {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

/// Normalize user input into an [`InstanceKey`].
///
/// - Trims surrounding whitespace and lower-cases.
/// - Prefixes `https://` unless the input already names `http://` or `https://`.
/// - Strips trailing slashes.
///
/// Never fails, and `normalize(normalize(x).as_str()) == normalize(x)`.
pub fn normalize(input: &str) -> InstanceKey {
    let lowered = input.trim().to_lowercase();
    let (scheme, rest) = if let Some(rest) = lowered.strip_prefix("https://") {
        ("https://", rest)
    } else if let Some(rest) = lowered.strip_prefix("http://") {
        ("http://", rest)
    } else {
        ("https://", lowered.as_str())
    };
    let rest = rest.trim_end_matches(|c: char| c == '/' || c.is_whitespace());
    InstanceKey(format!("{scheme}{rest}"))
}

/// Derive a label safe for file names and element ids, e.g.
/// `https://stoat.chat/api` becomes `stoat-chat`.
pub fn slug(url: &str) -> String {
    match normalize(url).hostname() {
        Some(host) => host.replace('.', "-"),
        None => url
            .chars()
            .map(|c| {
                if c.is_ascii_alphanumeric() {
                    c.to_ascii_lowercase()
                } else {
                    '-'
                }
            })
            .collect(),
    }
}

/// Outcome of probing a user-supplied endpoint.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "result", rename_all = "snake_case")]
pub enum Validation {
    /// A service root answered at `api_url`.
    Valid { name: String, api_url: String },
    /// Nothing answered, but only because the network refused us. The caller
    /// may let the user continue against the best guess.
    CorsBlocked { name: String, api_url: String },
    /// The endpoint answered and is not a service root, or the input is not a URL.
    Invalid { error: String },
}

#[derive(Debug, thiserror::Error)]
pub enum ProbeError {
    /// Connect failure, timeout, TLS failure: no HTTP answer at all.
    #[error("unreachable: {0}")]
    Network(String),
    #[error("HTTP status {0}")]
    Status(u16),
    #[error("{0} is not a service root")]
    NotServiceRoot(String),
}

/// Fetches the root document of a candidate API base URL.
pub trait ServiceProbe: Send + Sync {
    fn fetch_root<'a>(&'a self, base_url: &'a str) -> BoxFuture<'a, Result<Value, ProbeError>>;
}

/// A root document is accepted only if it names a realtime endpoint.
pub fn is_service_root(root: &Value) -> bool {
    root.get("ws").is_some_and(Value::is_string)
}

/// Check whether `raw_url` looks like a chat-service API root.
///
/// Tries the normalized URL first, then with [`API_SUFFIX`] appended. Network
/// failures are reported as [`Validation::CorsBlocked`] rather than a hard
/// failure, since such instances frequently work once credentials are sent.
pub async fn validate<P: ServiceProbe + ?Sized>(probe: &P, raw_url: &str) -> Validation {
    let key = normalize(raw_url);
    let Some(name) = key.hostname() else {
        return Validation::Invalid {
            error: format!("'{}' is not a valid URL", raw_url.trim()),
        };
    };

    let mut candidates = vec![key.as_str().to_string()];
    if !key.as_str().ends_with(API_SUFFIX) {
        candidates.push(format!("{key}{API_SUFFIX}"));
    }

    let mut network_failure = false;
    let mut last_error = None;
    for candidate in &candidates {
        match probe.fetch_root(candidate).await {
            Ok(root) if is_service_root(&root) => {
                return Validation::Valid {
                    name,
                    api_url: candidate.clone(),
                };
            }
            Ok(_) => last_error = Some(ProbeError::NotServiceRoot(candidate.clone())),
            Err(e) => {
                tracing::debug!(candidate = %candidate, error = %e, "probe failed");
                network_failure |= matches!(e, ProbeError::Network(_));
                last_error = Some(e);
            }
        }
    }

    if network_failure {
        let api_url = if key.as_str().ends_with(API_SUFFIX) {
            key.as_str().to_string()
        } else {
            format!("{key}{API_SUFFIX}")
        };
        return Validation::CorsBlocked { name, api_url };
    }

    Validation::Invalid {
        error: last_error
            .map(|e| e.to_string())
            .unwrap_or_else(|| format!("no service root found at {key}")),
    }
}

/// [`ServiceProbe`] over HTTP.
pub struct HttpProbe {
    client: reqwest::Client,
}

impl HttpProbe {
    pub fn new(client: reqwest::Client) -> Self {
        Self { client }
    }
}

impl ServiceProbe for HttpProbe {
    fn fetch_root<'a>(&'a self, base_url: &'a str) -> BoxFuture<'a, Result<Value, ProbeError>> {
        Box::pin(async move {
            let resp = self
                .client
                .get(format!("{base_url}/"))
                .header(reqwest::header::ACCEPT, "application/json")
                .send()
                .await
                .map_err(|e| ProbeError::Network(e.to_string()))?;

            let status = resp.status();
            if !status.is_success() {
                return Err(ProbeError::Status(status.as_u16()));
            }
            resp.json::<Value>()
                .await
                .map_err(|_| ProbeError::NotServiceRoot(base_url.to_string()))
        })
    }
}
