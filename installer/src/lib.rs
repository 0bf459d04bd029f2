//! Dynamic plugins installer library.
//!
//! This crate installs plugin tarballs declared in YAML plugin source files:
//! it packs each enabled plugin, verifies its integrity, extracts it safely
//! into the plugins root, and merges every plugin's configuration fragment
//! into one global configuration document. It is used by the
//! `dynamic-plugins-installer` CLI binary and can be driven programmatically
//! with custom fetch and extraction strategies.
//!
//! # Modules
//!
//! - [`cli`] - Command-line argument definitions
//! - [`config`] - Run settings from flags and the environment
//! - [`error`] - Error taxonomy and fatality classification
//! - [`extraction`] - Contained, size-capped tarball extraction
//! - [`fetcher`] - Package fetching through `npm pack`
//! - [`integrity`] - Subresource-integrity style archive verification
//! - [`logging`] - stderr logger bootstrap
//! - [`merge`] - Deep merge of configuration fragments
//! - [`output`] - Run summary formatting
//! - [`pipeline`] - Concurrent installation orchestration
//! - [`plugin`] - Plugin declarations
//! - [`sources`] - Plugin source aggregation across includes

pub mod cli;
pub mod config;
pub mod error;
pub mod extraction;
pub mod fetcher;
pub mod integrity;
pub mod logging;
pub mod merge;
pub mod output;
pub mod pipeline;
pub mod plugin;
pub mod sources;

#[cfg(any(test, feature = "test-support"))]
pub mod test_utils;
