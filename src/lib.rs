pub mod app;
pub mod config;
pub mod orchestration;
pub mod provider;
pub mod runtime;
pub mod shared;
pub mod store;
pub mod transport;
