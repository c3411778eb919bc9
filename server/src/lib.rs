pub mod address;
pub mod app;
pub mod columns;
pub mod config;
pub mod contacts;
pub mod conversations;
pub mod dispatch;
pub mod error;
pub mod identity;
pub mod logging;
pub mod registry;
pub mod store;
pub mod types;
pub mod webhook;
