mod verifier;

pub use verifier::*;
