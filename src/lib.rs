pub mod agent;
pub mod broker;
pub mod config;
pub mod errors;
pub mod pipeline;
pub mod registry;
pub mod repos;
pub mod sandbox;
pub mod server;
