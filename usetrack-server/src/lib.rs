//! # Usetrack Server
//!
//! HTTP surface over a tracking pipeline: the aggregate report, the reporter
//! status, the optional clear action and an `/up` health route.

pub mod logging;
pub mod web;

pub use web::routes;
