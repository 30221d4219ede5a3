// Library exports for Agora
// Integration tests drive the router through these modules

pub mod auth;
pub mod config;
pub mod db;
pub mod error;
pub mod extractors;
pub mod membership;
pub mod notify;
pub mod realtime;
pub mod routes;
pub mod state;
pub mod visibility;
