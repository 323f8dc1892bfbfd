//! Event bus adapter: the wire envelope, inbound delivery decoding, and the
//! outbound publisher.

pub mod envelope;
pub mod publisher;

pub use envelope::{EventEnvelope, EventKind, decode_delivery, encode_message_data};
pub use publisher::{EventPublisher, PubSubConfig, PubSubPublisher};
