//! NGP Server - API backend for the NGP web app.
//!
//! This crate provides:
//! - A Server-Sent Events broker pushing live updates to browsers
//! - Per-client fixed-window rate limiting
//! - JWT and session authentication backed by the auth service
//! - Email webhooks, per-user stats and data exports run as background jobs
//! - Login notifications for sign-ins from new devices
//!
//! # Architecture
//!
//! Every shared component is constructed once in `main` and handed to the
//! handlers through [`routes::AppState`]. Nothing is persisted; all state
//! lives in memory for the lifetime of the process.

pub mod auth;
pub mod better_auth;
pub mod broker;
pub mod config;
pub mod devices;
pub mod email;
pub mod error;
pub mod export;
pub mod jobs;
pub mod middleware;
pub mod rate_limit;
pub mod routes;
pub mod stats;
pub mod webhooks;
