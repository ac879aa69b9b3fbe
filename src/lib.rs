//! # file-kind
//!
//! Classifies files into typed file kinds by name and, when the name is
//! inconclusive, by sniffing content. Content results are cached per file
//! and persisted so repeated queries stay cheap across restarts.
//!
//! ## Architecture
//!
//! - **classification**: The `Classification` value and its capability flags
//! - **matcher**: Extension, exact name, wildcard and hash-bang matchers
//! - **table**: Matcher-to-value lookup table with precedence rules
//! - **resolver**: Provenance ranking and conflict resolution between providers
//! - **removed**: Tracking of matchers taken away from a classification
//! - **registry**: Registered and lazily declared classifications, snapshots
//! - **builtin**: Bundled classifications and the XML prolog detector
//! - **ignored**: Ignore masks with a per-file answer cache
//! - **fs**: File ids and the file system seam (local and in-memory)
//! - **store**: Versioned per-file attributes in LMDB (or in memory)
//! - **buffer**: Write buffering for batch attribute writes
//! - **cache**: Packed per-file detection state keyed by a global generation
//! - **sniff**: Text versus binary decoding of content prefixes
//! - **detector**: Content detector trait and the ordered detector chain
//! - **relay**: Single-flight sharing of concurrent prefix reads
//! - **pipeline**: Content detection with caching
//! - **redetect**: Background re-detection after content changes
//! - **service**: The facade tying everything together
//! - **scan**: Directory walking that honours ignore masks

pub mod buffer;
pub mod builtin;
pub mod cache;
pub mod cancel;
pub mod classification;
pub mod cli;
pub mod config;
pub mod detector;
pub mod fs;
pub mod ignored;
pub mod matcher;
pub mod pipeline;
pub mod redetect;
pub mod registry;
pub mod relay;
pub mod removed;
pub mod resolver;
pub mod scan;
pub mod service;
pub mod sniff;
pub mod store;
pub mod table;
