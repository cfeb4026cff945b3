// QueueCast Services
// Business logic layer

mod binary_locator;
mod channel_queue;
mod channel_store;
mod cleanup;
mod destination_resolver;
mod encoder_command;
mod encoder_process;
mod events;
mod log_manager;
mod media_resolver;
mod notifier;
mod path_validator;
mod playback_coordinator;
mod process_supervisor;
mod settings_manager;

#[cfg(test)]
pub(crate) mod testing;

pub use binary_locator::*;
pub use channel_queue::*;
pub use channel_store::*;
pub use cleanup::*;
pub use destination_resolver::*;
pub use encoder_command::*;
pub use encoder_process::*;
pub use events::*;
pub use log_manager::*;
pub use media_resolver::*;
pub use notifier::*;
pub use path_validator::*;
pub use playback_coordinator::*;
pub use process_supervisor::*;
pub use settings_manager::*;
