//! kolharvest - authenticated browser scrape sessions.
//!
//! Drives a real browser through the logged-in area of a site, intercepts the
//! background calls its pages make, ties every payload to the entity being
//! visited, and stores the extracted records exactly once.

pub mod browser;
pub mod cli;
pub mod config;
pub mod error;
pub mod extract;
pub mod intercept;
pub mod orchestrator;
pub mod pagination;
pub mod rate_limit;
pub mod repository;
pub mod schema;
pub mod session;

pub use error::{Result, ScrapeError};
