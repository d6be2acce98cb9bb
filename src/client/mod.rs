//! Client-side save pipeline: per-field state, the debounced queue, and the
//! HTTP transport it talks through.

pub mod queue;
pub mod state;
pub mod transport;

pub use queue::{SaveEvent, SaveQueue, SaveQueueConfig, SaveQueueError, UnloadReport};
pub use state::{FieldEvent, FieldKey, FieldState};
pub use transport::{BatchAck, HttpTransport, Transport, TransportError};
