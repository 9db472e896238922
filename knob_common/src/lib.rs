//! Knob Common Library
//!
//! This crate provides shared configuration types and loading utilities
//! for all knob workspace crates.
//!
//! # Module Structure
//!
//! - [`config`] - Engine configuration and TOML loading traits
//!
//! # Usage
//!
//! ```rust
//! use knob_common::config::EngineConfig;
//!
//! let config = EngineConfig::default();
//! assert!(config.validate().is_ok());
//! ```

pub mod config;

pub use config::{ConfigError, ConfigLoader, EngineConfig};
