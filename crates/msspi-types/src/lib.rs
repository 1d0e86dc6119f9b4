//! Foundation types and traits for msspi.
//!
//! This crate contains the engine-agnostic types shared by the msspi crates:
//! the byte-stream trait sessions are built on, the TLS provider trait,
//! certificate and cipher metadata, configuration, and error types.

pub mod backend;
pub mod config;
pub mod error;
pub mod tls;
