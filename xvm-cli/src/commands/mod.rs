//! Command implementations for the xvm CLI

pub mod cache;
pub mod config;
pub mod directives;
pub mod fmt;
pub mod matcher;

pub use cache::CacheCommand;
pub use config::ConfigCommand;
pub use directives::DirectivesArgs;
pub use fmt::FmtArgs;
pub use matcher::MatchArgs;
