#![forbid(unsafe_code)]

pub mod auth;
pub mod cache;
pub mod config;
pub mod gateway;
pub mod security;

pub use config::Config;
