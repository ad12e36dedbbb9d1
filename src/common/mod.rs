//! Common utilities and types shared across the application.

pub mod error;
pub mod messages;
pub mod reconnect;

// Re-export message types from messages module
pub use messages::{
    AttachmentKind, AttachmentRef, AttachmentSource, ChannelAddress, NormalizedMessage, SenderInfo,
};
