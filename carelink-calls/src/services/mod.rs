pub mod call_service;
pub mod turn_credentials;
