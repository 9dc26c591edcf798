pub mod transport;

pub use transport::{DispatchError, DispatchResult, RoundTrip};
