pub mod api;
pub mod auth;
pub mod clients;
pub mod config;
pub mod consumer;
pub mod errors;
pub mod logging;
pub mod middleware;
pub mod models;
pub mod passcode;
pub mod producer;
pub mod rate_limit;
pub mod trace;
pub mod utils;
