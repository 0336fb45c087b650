pub mod envelope;
pub mod gateway;
pub mod hub;

pub use hub::SignalingHub;
