// QueueCast Models
// Data structures for the application

mod settings;
mod channel;
mod queue_item;

pub use settings::*;
pub use channel::*;
pub use queue_item::*;
