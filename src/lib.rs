pub mod config;
pub mod daemon;
pub mod error;
mod helpers;
pub mod hook;
pub mod inject;
pub mod logging;
pub mod notifier;
pub mod prompt;
pub mod registrar;
pub mod router;
pub mod store;
pub mod telegram;
pub mod transport;
pub mod types;
pub mod typing;
