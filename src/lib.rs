pub mod agents;
pub mod config;
pub mod dispatcher;
pub mod engine;
pub mod forwarder;
pub mod hub;
pub mod logger;
pub mod memory;
pub mod registry;
pub mod ui;
pub mod worker;
