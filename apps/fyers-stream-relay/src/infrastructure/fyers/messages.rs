//! Fyers Message Types
//!
//! Wire format types for the Fyers data socket control frames and the
//! JSON bodies of the login API.
//!
//! # Data Socket (text frames, relay → provider)
//! - `SUB_DATA`: start streaming the listed symbols
//! - `UNSUB_DATA`: stop streaming the listed symbols
//!
//! # Login API
//! Every response carries `s` (`"ok"` or `"error"`) plus an optional
//! `message`. Stage-specific payloads hold the next request key, the
//! authorization code or the access token.

use serde::{Deserialize, Serialize};

use crate::application::ports::UpstreamCommand;
use crate::domain::streaming::Instrument;

// =============================================================================
// Data Socket Control Frames
// =============================================================================

/// Control action discriminator (`T` field).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ControlAction {
    /// Subscribe to symbols.
    #[serde(rename = "SUB_DATA")]
    Subscribe,
    /// Unsubscribe from symbols.
    #[serde(rename = "UNSUB_DATA")]
    Unsubscribe,
}

/// Text control frame sent to the data socket.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ControlFrame {
    /// Action.
    #[serde(rename = "T")]
    pub action: ControlAction,
    /// Symbols the action applies to.
    pub symbol: Vec<Instrument>,
}

impl ControlFrame {
    /// Subscribe frame for one instrument.
    #[must_use]
    pub fn subscribe(instrument: impl Into<Instrument>) -> Self {
        Self {
            action: ControlAction::Subscribe,
            symbol: vec![instrument.into()],
        }
    }

    /// Unsubscribe frame for one instrument.
    #[must_use]
    pub fn unsubscribe(instrument: impl Into<Instrument>) -> Self {
        Self {
            action: ControlAction::Unsubscribe,
            symbol: vec![instrument.into()],
        }
    }

    /// Serialize to the JSON text sent over the socket.
    ///
    /// # Errors
    ///
    /// Returns an error if serialization fails.
    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }
}

impl From<UpstreamCommand> for ControlFrame {
    fn from(command: UpstreamCommand) -> Self {
        match command {
            UpstreamCommand::Subscribe(instrument) => Self::subscribe(instrument),
            UpstreamCommand::Unsubscribe(instrument) => Self::unsubscribe(instrument),
        }
    }
}

// =============================================================================
// Login API Requests
// =============================================================================

/// Stage 1: request a login OTP for an account.
#[derive(Debug, Serialize)]
pub struct SendLoginOtpRequest<'a> {
    /// Fyers account id.
    pub fy_id: &'a str,
    /// Login channel; `"2"` selects the TOTP flow.
    pub app_id: &'a str,
}

/// Stage 2: submit the time-based code.
#[derive(Debug, Serialize)]
pub struct VerifyOtpRequest<'a> {
    /// Key returned by stage 1.
    pub request_key: &'a str,
    /// Six-digit TOTP code.
    pub otp: &'a str,
}

/// Stage 3: submit the account PIN.
#[derive(Serialize)]
pub struct VerifyPinRequest<'a> {
    /// Key returned by stage 2.
    pub request_key: &'a str,
    /// Always `"pin"`.
    pub identity_type: &'a str,
    /// The PIN itself.
    pub identifier: &'a str,
}

/// Stage 4: trade an authorization code for an access token.
#[derive(Serialize)]
pub struct ValidateAuthCodeRequest<'a> {
    /// Always `"authorization_code"`.
    pub grant_type: &'a str,
    /// Lowercase hex SHA-256 of `{appId}:{appSecret}`.
    #[serde(rename = "appIdHash")]
    pub app_id_hash: &'a str,
    /// Authorization code.
    pub code: &'a str,
}

// =============================================================================
// Login API Responses
// =============================================================================

/// Status flag shared by every login API response.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct ApiStatus {
    /// `"ok"` on success.
    #[serde(default)]
    pub s: String,
    /// Provider error code, if any.
    #[serde(default)]
    pub code: Option<i64>,
    /// Provider message, if any.
    #[serde(default)]
    pub message: Option<String>,
}

impl ApiStatus {
    /// Whether the provider reported success.
    #[must_use]
    pub fn is_ok(&self) -> bool {
        self.s.eq_ignore_ascii_case("ok")
    }

    /// Best description of a failure.
    #[must_use]
    pub fn describe(&self) -> String {
        match (&self.message, self.code) {
            (Some(message), Some(code)) => format!("{message} (code {code})"),
            (Some(message), None) => message.clone(),
            (None, Some(code)) => format!("provider returned code {code}"),
            (None, None) => format!("provider returned status {:?}", self.s),
        }
    }
}

/// Response to the OTP and TOTP stages.
#[derive(Debug, Clone, Deserialize)]
pub struct RequestKeyResponse {
    /// Status.
    #[serde(flatten)]
    pub status: ApiStatus,
    /// Key for the next stage.
    #[serde(default)]
    pub request_key: Option<String>,
}

/// Response to the PIN stage.
#[derive(Debug, Clone, Deserialize)]
pub struct VerifyPinResponse {
    /// Status.
    #[serde(flatten)]
    pub status: ApiStatus,
    /// Payload with the authorization code.
    #[serde(default)]
    pub data: Option<VerifyPinData>,
}

/// Payload of a successful PIN verification.
#[derive(Debug, Clone, Deserialize)]
pub struct VerifyPinData {
    /// Authorization code for stage 4.
    #[serde(default)]
    pub auth_code: Option<String>,
}

/// Response to the token stage.
#[derive(Debug, Clone, Deserialize)]
pub struct ValidateAuthCodeResponse {
    /// Status.
    #[serde(flatten)]
    pub status: ApiStatus,
    /// Bearer token.
    #[serde(default)]
    pub access_token: Option<String>,
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn subscribe_frame_json() {
        let json = ControlFrame::subscribe("NSE:SBIN-EQ").to_json().unwrap();
        assert_eq!(json, r#"{"T":"SUB_DATA","symbol":["NSE:SBIN-EQ"]}"#);
    }

    #[test]
    fn unsubscribe_frame_from_command() {
        let frame = ControlFrame::from(UpstreamCommand::Unsubscribe("NSE:SBIN-EQ".to_string()));
        assert_eq!(
            frame.to_json().unwrap(),
            r#"{"T":"UNSUB_DATA","symbol":["NSE:SBIN-EQ"]}"#
        );
    }

    #[test]
    fn validate_request_uses_camel_case_hash() {
        let body = serde_json::to_value(ValidateAuthCodeRequest {
            grant_type: "authorization_code",
            app_id_hash: "abc",
            code: "xyz",
        })
        .unwrap();
        assert_eq!(body["appIdHash"], "abc");
        assert_eq!(body["grant_type"], "authorization_code");
    }

    #[test]
    fn request_key_response_parses() {
        let resp: RequestKeyResponse =
            serde_json::from_str(r#"{"s":"ok","request_key":"rk1","message":""}"#).unwrap();
        assert!(resp.status.is_ok());
        assert_eq!(resp.request_key.as_deref(), Some("rk1"));
    }

    #[test]
    fn pin_response_parses_nested_code() {
        let resp: VerifyPinResponse =
            serde_json::from_str(r#"{"s":"ok","data":{"auth_code":"ac1"}}"#).unwrap();
        assert_eq!(
            resp.data.and_then(|d| d.auth_code).as_deref(),
            Some("ac1")
        );
    }

    #[test]
    fn error_status_describes_itself() {
        let resp: ValidateAuthCodeResponse =
            serde_json::from_str(r#"{"s":"error","code":-413,"message":"invalid code"}"#).unwrap();
        assert!(!resp.status.is_ok());
        assert_eq!(resp.status.describe(), "invalid code (code -413)");
        assert!(resp.access_token.is_none());
    }
}
