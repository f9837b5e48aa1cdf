pub mod events;
pub mod ids;
pub mod protocol;
pub mod security;
pub mod status;
pub mod transcription;

pub use events::{InstanceEvent, MessageKind, NormalizedMessage};
pub use ids::{InstanceId, SubscriberId};
pub use status::ConnectionStatus;
