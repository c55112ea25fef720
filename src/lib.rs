pub mod aggregator;
pub mod broker;
pub mod config;
pub mod db;
pub mod error;
pub mod fanout;
pub mod gateway;
pub mod handlers;
pub mod models;
pub mod pipeline;
pub mod store;
pub mod tasks;
pub mod telemetry;
