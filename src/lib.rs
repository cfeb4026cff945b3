// QueueCast Server Library
// Per-channel playback queue and encoder supervision

pub mod commands;
pub mod models;
pub mod services;
