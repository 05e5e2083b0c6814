pub mod config;
pub mod credentials;
pub mod data_url;
pub mod events;
pub mod models;
pub mod session;
