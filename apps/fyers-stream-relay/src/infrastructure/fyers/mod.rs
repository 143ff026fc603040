//! Fyers Adapters
//!
//! Everything that speaks the Fyers protocols:
//!
//! - `codec`: binary tick frame decoder
//! - `messages`: control frames and login API payloads
//! - `socket`: data socket connector
//! - `auth`: credential exchange
//! - `totp`: RFC 6238 second factor

pub mod auth;
pub mod codec;
pub mod messages;
pub mod socket;
pub mod totp;

pub use auth::{AuthError, AuthStage, CredentialExchange, ExchangeSetupError};
pub use codec::{DecodeError, DecodeFailure, TickCodec};
pub use messages::{ControlAction, ControlFrame};
pub use socket::FyersSocketConnector;
