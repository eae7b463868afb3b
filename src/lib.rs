pub mod compare;
pub mod config;
pub mod database;
pub mod error;
pub mod languages;
pub mod lock;
pub mod model;
pub mod pipeline;
pub mod poller;
pub mod provider;
pub mod queue;
pub mod sandbox;
pub mod worker;
