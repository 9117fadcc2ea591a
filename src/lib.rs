//! Hosting Relay Library
//!
//! This crate exposes the upload pipeline for the server binary, the route
//! tests and the benchmarks. The server binary is in main.rs.
//!
//! # Modules
//!
//! - `upload`: chunk staging, hash verification, verification queue, finalize
//! - `handoff`: intake contract and the directory-backed implementation
//! - `routes`: the `/fichiers` HTTP surface
//! - `auth`: bearer token to tenant id

pub mod auth;
pub mod config;
pub mod handoff;
pub mod routes;
pub mod state;
pub mod upload;
