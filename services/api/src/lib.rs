//! services/api/src/lib.rs
//!
//! The real-time chat service: adapters for Postgres and the filesystem, the
//! environment configuration, and the web layer with its session workers.

pub mod adapters;
pub mod config;
pub mod error;
pub mod web;
