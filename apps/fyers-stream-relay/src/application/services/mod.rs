//! Application Services
//!
//! Services that orchestrate domain logic and coordinate between ports.
//!
//! - [`UpstreamManager`]: owns the single provider connection
//! - [`FanOut`]: tracks consumers and delivers envelopes to them
//! - [`Relay`]: the event loop that serializes every mutation
//! - [`RelayStatus`]: lock-light snapshot read by the health routes

mod fanout;
mod relay;
mod status;
mod upstream;

pub use fanout::{ConsumerOutbox, Delivery, FanOut, UntaggedTickPolicy};
pub use relay::{Relay, RelayClosed, RelayCommand, RelayHandle, RelayOptions};
pub use status::{RelayStatus, RelayStatusSnapshot};
pub use upstream::{
    ForwardOutcome, UpstreamEndpoint, UpstreamEvent, UpstreamEventKind, UpstreamManager,
    UpstreamOutcome, UpstreamState,
};
