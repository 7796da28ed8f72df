//! Usage, quota, billing and dunning enforcement for ISP subscribers.

pub mod coa;
pub mod config;
pub mod engine;
pub mod handlers;
pub mod models;
pub mod notify;
pub mod scheduler;
pub mod services;
pub mod startup;
