//! Live upload progress over a websocket push channel.
//!
//! The server pushes progress, completion and failure events for uploads the
//! client subscribed to. Events are applied to the shared
//! [`reelup_client::UploadStateStore`]; a lost channel never fails an upload.

pub mod channel;
pub mod connection;
pub mod error;
pub mod subscriptions;
pub mod wire;

pub use channel::ProgressChannel;
pub use connection::ChannelNotice;
pub use error::{ChannelError, ChannelResult};
pub use subscriptions::SubscriptionRegistry;
pub use wire::{ClientEvent, ServerEvent};
