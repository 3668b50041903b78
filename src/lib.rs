//! Turnstile - In-Process Admission Control
//!
//! This crate gates inbound requests with one of several interchangeable rate
//! limiting algorithms. Every algorithm implements the same
//! [`RateLimiter`](ratelimit::RateLimiter) decision, and a
//! [`LimiterRegistry`](ratelimit::LimiterRegistry) gives each admission key
//! its own lazily created, idle-evicted limiter instance.

pub mod config;
pub mod error;
pub mod identity;
pub mod ratelimit;
