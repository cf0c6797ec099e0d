//! CGI gateway.
//!
//! - **`spawn`**: starting programs behind a swappable [`spawn::Spawn`]
//! - **`session`**: per-request pipe state machine
//! - **`parser`**: incremental parsing of script output
//! - **`builder`**: script output to queued response entries
//! - **`registry`**: session arena keyed by pipe descriptor
//! - **`zombie`**: children that outlive their session

pub mod builder;
pub mod parser;
pub mod registry;
pub mod session;
pub mod spawn;
pub mod zombie;

use std::path::Path;

/// Whether `path` ends in one of the configured CGI extensions.
///
/// Extensions are compared case-sensitively, with or without the leading
/// dot in the configuration.
pub fn is_cgi_path(path: &Path, extensions: &[String]) -> bool {
    let Some(ext) = path.extension().and_then(|e| e.to_str()) else {
        return false;
    };
    extensions
        .iter()
        .any(|configured| configured.trim_start_matches('.') == ext)
}
