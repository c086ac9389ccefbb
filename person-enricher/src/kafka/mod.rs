pub mod offsets;
pub mod transport;

pub use offsets::OffsetTracker;
pub use transport::{KafkaContext, KafkaTransport, TrackingContext};
