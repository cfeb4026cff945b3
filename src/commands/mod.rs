// QueueCast Commands
// Request handlers behind the invoke API

mod playback;

pub use playback::*;
