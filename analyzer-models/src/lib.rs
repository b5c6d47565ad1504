pub mod errors;
pub mod event;
pub mod message;

pub use event::{Event, EventType};
pub use message::Message;
