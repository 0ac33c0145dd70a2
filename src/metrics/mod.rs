pub mod failrate;

pub use failrate::{is_network_error, FailPredicate, FailRateMeter};
