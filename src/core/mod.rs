pub mod identity;
pub mod registry;
pub mod routing;

pub use identity::{AllowedSet, IdentityError, IdentityHash};
pub use registry::ConnectionRegistry;
pub use routing::{BackendTarget, RoutedPath, split_path};
