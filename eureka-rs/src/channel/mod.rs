//! Channels: long-lived sessions against a resolved discovery endpoint.
//! Registration and interest channels share a resolver, never a session.

mod connect;
mod interest;
mod reconcile;
mod registration;

pub use interest::{InterestChannel, NotificationItem, NotificationStream};
pub use registration::{InstancePublisher, Registration, RegistrationChannel, RegistrationState};
