//! Line buffering and delivery to the remote sinks.

mod buffer;
mod delivery;

pub use buffer::{BufferedLine, DestinationKey, LineBuffer};
pub use delivery::{DeliveryConfig, DeliveryEngine};
