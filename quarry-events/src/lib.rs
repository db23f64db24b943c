//! QUARRY Events - Cross-Tab Query Synchronization
//!
//! Lets independent query clients tell each other about invalidations,
//! refetches and new data. The engine works without a channel; when one is
//! configured, queries that opt into `broadcast` post their invalidations
//! and react to messages targeting their cache key.
//!
//! ```text
//!   client A                 channel                client B
//!   invalidate("todos::1") --> Invalidate ----------> invalidate("todos::1")
//!                          <-- (own origin, ignored)
//! ```
//!
//! # Key Types
//!
//! - `QueryBroadcastMessage`: the message variants, serialized tagged by `type`
//! - `ChannelMessage`: a message plus the posting client's origin id
//! - `QueryChannel`: transport trait (`post_message`, `subscribe`)
//! - `LocalChannel`: in-process transport on `tokio::sync::broadcast`

mod channel;
mod message;

pub use channel::{listen, ListenerHandle, LocalChannel, QueryChannel};
pub use message::{ChannelMessage, QueryBroadcastMessage};
