//! Completion notifications.

pub mod email;

pub use email::{EmailConfig, EmailNotifier};
