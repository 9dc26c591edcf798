//! Public request path convention: `/<hex identity>/<backend path>`.
//!
//! Splitting the path is the only routing decision the bastion makes; the
//! identity segment is carried to the dispatcher as a typed request
//! extension ([`BackendTarget`]) instead of being stuffed into the `Host`.
use crate::core::identity::{IdentityError, IdentityHash};

/// An inbound path split into its routing identity and the backend-relative path.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RoutedPath<'a> {
    /// The raw identity segment, not yet validated as hex.
    pub identity: &'a str,
    /// The path forwarded to the backend, always starting with `/`.
    pub rest: &'a str,
}

/// Split `/<identity>/<rest>` into its parts.
///
/// Returns `None` when there is no second segment (`/`, `/bogus`), which the
/// HTTP front answers with 404.
pub fn split_path(path: &str) -> Option<RoutedPath<'_>> {
    let trimmed = path.strip_prefix('/')?;
    let slash = trimmed.find('/')?;
    let (identity, rest) = trimmed.split_at(slash);
    Some(RoutedPath { identity, rest })
}

/// Routing identity attached to a rewritten request as an extension.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BackendTarget(pub String);

impl BackendTarget {
    /// Decode the identity segment into a hash.
    pub fn identity(&self) -> Result<IdentityHash, IdentityError> {
        self.0.parse()
    }
}
