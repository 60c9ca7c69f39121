//! Command implementations for the CLI
//!
//! - run: server, receiver and worker modes
//! - migrate: session database schema
//! - columns: warehouse table definition
//! - config: configuration display, validation and docs

pub mod columns;
pub mod config;
pub mod migrate;
pub mod run;
