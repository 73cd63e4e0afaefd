pub mod auth;
pub mod client;
pub mod config;
pub mod instance_url;
pub mod instances;
pub mod registry;
pub mod sessions;
pub mod storage;
pub mod transport;
