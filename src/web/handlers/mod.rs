//! HTTP request handlers organized by resource

pub mod control;
pub mod crawl;
pub mod health;
pub mod status;
pub mod tasks;
pub mod triggers;
