//! Login against a single instance.

use futures::future::BoxFuture;
use serde::{Deserialize, Serialize};

use crate::instance_url::InstanceKey;
use crate::sessions::SessionCredentials;
use crate::storage::StoreError;

/// Path of the login endpoint relative to the instance's API base.
pub const LOGIN_PATH: &str = "/auth/session/login";

#[derive(Debug, Clone, Serialize)]
#[serde(untagged)]
pub enum Credentials {
    Password {
        email: String,
        password: String,
    },
    /// Second step after [`LoginError::MfaRequired`].
    Mfa {
        mfa_ticket: String,
        mfa_response: MfaResponse,
    },
}

#[derive(Debug, Clone, Serialize)]
#[serde(untagged)]
pub enum MfaResponse {
    Password { password: String },
    Totp { totp_code: String },
    Recovery { recovery_code: String },
}

/// Body of the login call.
#[derive(Debug, Clone, Serialize)]
pub struct LoginRequest {
    #[serde(flatten)]
    pub credentials: Credentials,
    /// Label the instance shows in the user's session list.
    pub friendly_name: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MfaChallenge {
    pub ticket: String,
    #[serde(default)]
    pub allowed_methods: Vec<String>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "result")]
pub enum LoginResponse {
    Success(SessionCredentials),
    #[serde(rename = "MFA")]
    Mfa(MfaChallenge),
    Disabled { user_id: String },
}

#[derive(Debug, thiserror::Error)]
pub enum AuthError {
    #[error("could not reach {url}: {message}")]
    Unreachable { url: String, message: String },
    #[error("login rejected with HTTP {status}: {}", .kind.as_deref().unwrap_or("no reason given"))]
    Rejected { status: u16, kind: Option<String> },
    #[error("unexpected login response: {0}")]
    InvalidResponse(String),
}

/// Why a login did not produce a connected session.
#[derive(Debug, thiserror::Error)]
pub enum LoginError {
    /// Not a failure as such: the caller must collect a second factor and
    /// log in again with [`Credentials::Mfa`].
    #[error("multi-factor authentication required")]
    MfaRequired(MfaChallenge),
    #[error("account is disabled")]
    Disabled,
    #[error(transparent)]
    Auth(#[from] AuthError),
    #[error("could not store session: {0}")]
    Store(#[from] StoreError),
}

impl LoginError {
    /// Short machine-readable tag.
    pub fn reason(&self) -> &'static str {
        match self {
            Self::MfaRequired(_) => "mfa",
            Self::Disabled => "disabled",
            Self::Auth(_) | Self::Store(_) => "failed",
        }
    }
}

pub trait Authenticator: Send + Sync {
    fn login<'a>(
        &'a self,
        instance: &'a InstanceKey,
        request: &'a LoginRequest,
    ) -> BoxFuture<'a, Result<LoginResponse, AuthError>>;
}

/// [`Authenticator`] posting JSON to the instance's login endpoint.
pub struct HttpAuthenticator {
    client: reqwest::Client,
}

impl HttpAuthenticator {
    pub fn new(client: reqwest::Client) -> Self {
        Self { client }
    }
}

impl Authenticator for HttpAuthenticator {
    fn login<'a>(
        &'a self,
        instance: &'a InstanceKey,
        request: &'a LoginRequest,
    ) -> BoxFuture<'a, Result<LoginResponse, AuthError>> {
        Box::pin(async move {
            let url = format!("{instance}{LOGIN_PATH}");
            let resp = self
                .client
                .post(&url)
                .json(request)
                .send()
                .await
                .map_err(|e| AuthError::Unreachable {
                    url: url.clone(),
                    message: e.to_string(),
                })?;

            let status = resp.status();
            if !status.is_success() {
                let kind = resp
                    .json::<serde_json::Value>()
                    .await
                    .ok()
                    .and_then(|body| body["type"].as_str().map(str::to_owned));
                return Err(AuthError::Rejected {
                    status: status.as_u16(),
                    kind,
                });
            }

            resp.json::<LoginResponse>()
                .await
                .map_err(|e| AuthError::InvalidResponse(e.to_string()))
        })
    }
}
