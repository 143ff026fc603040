//! Fyers Credential Exchange
//!
//! Obtains the bearer token that gates the data socket.
//!
//! # Direct Login Flow
//!
//! Four sequential round-trips, each consuming the previous key:
//!
//! 1. **OTP**: `POST {login}/send_login_otp_v2` with the account id,
//!    returns `request_key`
//! 2. **TOTP**: `POST {login}/verify_otp` with that key and a code
//!    derived from the TOTP seed, returns a new `request_key`
//! 3. **PIN**: `POST {login}/verify_pin_v2` with the key and PIN,
//!    returns `data.auth_code`
//! 4. **TOKEN**: `POST {api}/validate-authcode` with the code and
//!    `appIdHash`, returns `access_token`
//!
//! A failure at any stage aborts the flow with `AuthError { stage }`.
//! Nothing is retried; the caller starts again from stage 1.
//!
//! # Redirect Flow
//!
//! [`CredentialExchange::login_url`] builds the provider login page URL.
//! After the user signs in, the provider redirects back with an
//! `auth_code`, which [`CredentialExchange::exchange_code`] trades for a
//! token (stage 4 only).

use std::fmt;

use reqwest::{Client, Url};
use serde::Serialize;
use serde::de::DeserializeOwned;
use sha2::{Digest, Sha256};

use super::messages::{
    ApiStatus, RequestKeyResponse, SendLoginOtpRequest, ValidateAuthCodeRequest,
    ValidateAuthCodeResponse, VerifyOtpRequest, VerifyPinRequest, VerifyPinResponse,
};
use super::totp;
use crate::domain::credentials::BearerToken;
use crate::infrastructure::config::{AppCredentials, AuthSettings};

/// Login channel id the provider expects for the TOTP flow.
const TOTP_LOGIN_CHANNEL: &str = "2";

// =============================================================================
// Errors
// =============================================================================

/// Stage of the login handshake.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum AuthStage {
    /// One-time-passcode issuance.
    Otp,
    /// Time-based second factor.
    Totp,
    /// PIN verification.
    Pin,
    /// Authorization code to token exchange.
    Token,
}

impl AuthStage {
    /// Wire name of the stage.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Otp => "OTP",
            Self::Totp => "TOTP",
            Self::Pin => "PIN",
            Self::Token => "TOKEN",
        }
    }
}

impl fmt::Display for AuthStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Credential exchange failure, tagged with the stage that failed.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{stage} stage failed: {message}")]
pub struct AuthError {
    /// Stage that failed.
    pub stage: AuthStage,
    /// Provider or transport message.
    pub message: String,
}

impl AuthError {
    fn new(stage: AuthStage, message: impl Into<String>) -> Self {
        Self {
            stage,
            message: message.into(),
        }
    }
}

/// Errors building the exchange client.
#[derive(Debug, thiserror::Error)]
pub enum ExchangeSetupError {
    /// The HTTP client could not be built.
    #[error("failed to build HTTP client: {0}")]
    Client(#[from] reqwest::Error),

    /// A configured base URL is not a valid URL.
    #[error("invalid base URL {url}: {reason}")]
    InvalidBaseUrl {
        /// The offending URL.
        url: String,
        /// Parser message.
        reason: String,
    },
}

// =============================================================================
// Handshake Keys
// =============================================================================

/// Short-lived key threading one stage into the next. Consumed on use.
struct RequestKey(String);

/// Authorization code produced by the PIN stage. Consumed on use.
struct AuthCode(String);

// =============================================================================
// Credential Exchange
// =============================================================================

/// HTTP client for the Fyers login API.
#[derive(Debug, Clone)]
pub struct CredentialExchange {
    client: Client,
    credentials: AppCredentials,
    login_base_url: String,
    api_base_url: String,
    authorize_url: Url,
}

impl CredentialExchange {
    /// Create a client from the app credentials and endpoint settings.
    ///
    /// # Errors
    ///
    /// Returns an error if the HTTP client cannot be built or the API
    /// base URL does not parse.
    pub fn new(
        credentials: AppCredentials,
        settings: &AuthSettings,
    ) -> Result<Self, ExchangeSetupError> {
        let client = Client::builder().timeout(settings.request_timeout).build()?;

        let api_base_url = settings.api_base_url.trim_end_matches('/').to_string();
        let authorize = format!("{api_base_url}/generate-authcode");
        let authorize_url =
            Url::parse(&authorize).map_err(|e| ExchangeSetupError::InvalidBaseUrl {
                url: authorize.clone(),
                reason: e.to_string(),
            })?;

        Ok(Self {
            client,
            credentials,
            login_base_url: settings.login_base_url.trim_end_matches('/').to_string(),
            api_base_url,
            authorize_url,
        })
    }

    /// Provider login page for the redirect flow.
    #[must_use]
    pub fn login_url(&self, state: &str) -> String {
        let mut url = self.authorize_url.clone();
        url.query_pairs_mut()
            .append_pair("client_id", &self.credentials.app_id)
            .append_pair("redirect_uri", &self.credentials.redirect_uri)
            .append_pair("response_type", "code")
            .append_pair("state", state);
        url.into()
    }

    /// Run the direct four-stage login.
    ///
    /// # Errors
    ///
    /// Returns `AuthError` tagged with the first stage that failed. Later
    /// stages are never attempted.
    pub async fn login(
        &self,
        account_id: &str,
        pin: &str,
        totp_seed: &str,
    ) -> Result<BearerToken, AuthError> {
        tracing::info!(account_id = %account_id, "Starting direct login");

        let otp_key = self.send_login_otp(account_id).await?;
        let code = totp::generate_now(totp_seed)
            .map_err(|e| AuthError::new(AuthStage::Totp, e.to_string()))?;
        let totp_key = self.verify_totp(otp_key, &code).await?;
        let auth_code = self.verify_pin(totp_key, pin).await?;

        self.exchange_code(&auth_code.0).await
    }

    /// Exchange an authorization code for a bearer token (stage 4).
    ///
    /// # Errors
    ///
    /// Returns `AuthError { stage: TOKEN }` on any failure.
    pub async fn exchange_code(&self, auth_code: &str) -> Result<BearerToken, AuthError> {
        let stage = AuthStage::Token;
        let app_id_hash = self.app_id_hash();
        let url = format!("{}/validate-authcode", self.api_base_url);

        let response: ValidateAuthCodeResponse = self
            .post(
                stage,
                &url,
                &ValidateAuthCodeRequest {
                    grant_type: "authorization_code",
                    app_id_hash: &app_id_hash,
                    code: auth_code,
                },
            )
            .await?;

        let token = require(stage, &response.status, response.access_token, "access_token")?;
        let token = BearerToken::new(token)
            .ok_or_else(|| AuthError::new(stage, "provider returned an empty access_token"))?;

        tracing::info!(stage = %stage, "Bearer token issued");
        Ok(token)
    }

    /// Lowercase hex SHA-256 of `{appId}:{appSecret}`.
    #[must_use]
    pub fn app_id_hash(&self) -> String {
        let mut hasher = Sha256::new();
        hasher.update(format!(
            "{}:{}",
            self.credentials.app_id, self.credentials.app_secret
        ));
        hex::encode(hasher.finalize())
    }

    async fn send_login_otp(&self, account_id: &str) -> Result<RequestKey, AuthError> {
        let stage = AuthStage::Otp;
        let url = format!("{}/send_login_otp_v2", self.login_base_url);

        let response: RequestKeyResponse = self
            .post(
                stage,
                &url,
                &SendLoginOtpRequest {
                    fy_id: account_id,
                    app_id: TOTP_LOGIN_CHANNEL,
                },
            )
            .await?;

        let key = require(stage, &response.status, response.request_key, "request_key")?;
        tracing::debug!(stage = %stage, "Stage complete");
        Ok(RequestKey(key))
    }

    async fn verify_totp(&self, key: RequestKey, code: &str) -> Result<RequestKey, AuthError> {
        let stage = AuthStage::Totp;
        let url = format!("{}/verify_otp", self.login_base_url);

        let response: RequestKeyResponse = self
            .post(
                stage,
                &url,
                &VerifyOtpRequest {
                    request_key: &key.0,
                    otp: code,
                },
            )
            .await?;

        let key = require(stage, &response.status, response.request_key, "request_key")?;
        tracing::debug!(stage = %stage, "Stage complete");
        Ok(RequestKey(key))
    }

    async fn verify_pin(&self, key: RequestKey, pin: &str) -> Result<AuthCode, AuthError> {
        let stage = AuthStage::Pin;
        let url = format!("{}/verify_pin_v2", self.login_base_url);

        let response: VerifyPinResponse = self
            .post(
                stage,
                &url,
                &VerifyPinRequest {
                    request_key: &key.0,
                    identity_type: "pin",
                    identifier: pin,
                },
            )
            .await?;

        let code = response.data.and_then(|data| data.auth_code);
        let code = require(stage, &response.status, code, "auth_code")?;
        tracing::debug!(stage = %stage, "Stage complete");
        Ok(AuthCode(code))
    }

    /// POST a JSON body and decode the JSON response.
    ///
    /// Transport errors and non-2xx statuses become `AuthError` for
    /// `stage`; the provider's own message is used when the body has one.
    #[allow(clippy::future_not_send)]
    async fn post<B: Serialize, T: DeserializeOwned>(
        &self,
        stage: AuthStage,
        url: &str,
        body: &B,
    ) -> Result<T, AuthError> {
        let response = self
            .client
            .post(url)
            .json(body)
            .send()
            .await
            .map_err(|e| {
                tracing::warn!(stage = %stage, error = %e, "Login request failed");
                AuthError::new(stage, format!("request failed: {e}"))
            })?;

        let status = response.status();
        let text = response
            .text()
            .await
            .map_err(|e| AuthError::new(stage, format!("failed to read response: {e}")))?;

        if !status.is_success() {
            let message = serde_json::from_str::<ApiStatus>(&text)
                .map_or_else(|_| format!("HTTP {}", status.as_u16()), |s| s.describe());
            tracing::warn!(
                stage = %stage,
                status = status.as_u16(),
                message = %message,
                "Login stage rejected"
            );
            return Err(AuthError::new(stage, message));
        }

        serde_json::from_str(&text)
            .map_err(|e| AuthError::new(stage, format!("invalid response body: {e}")))
    }
}

/// Check the status flag and pull out the stage's result field.
fn require(
    stage: AuthStage,
    status: &ApiStatus,
    value: Option<String>,
    field: &str,
) -> Result<String, AuthError> {
    if !status.is_ok() {
        let message = status.describe();
        tracing::warn!(stage = %stage, message = %message, "Login stage rejected");
        return Err(AuthError::new(stage, message));
    }

    value
        .filter(|v| !v.is_empty())
        .ok_or_else(|| AuthError::new(stage, format!("response is missing {field}")))
}

// =============================================================================
// Tests
// =============================================================================
