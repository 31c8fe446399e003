pub mod api;
pub mod config;
pub mod error;
pub mod events;
pub mod node;
pub mod plugin;
pub mod scheduler;
pub mod shutdown;
pub mod worker;
