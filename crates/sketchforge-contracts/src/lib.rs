pub mod config;
pub mod content;
pub mod conversation;
pub mod errors;
pub mod events;
pub mod sketch;
