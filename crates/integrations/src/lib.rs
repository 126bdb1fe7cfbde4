//! Integrations: outbound delivery of session lifecycle milestones to
//! external endpoints.

pub mod outbound;

pub use outbound::{
    Notification, NotificationKind, NotificationTransport, OutboundQueue, OutboundStats,
    RetryPolicy,
};
