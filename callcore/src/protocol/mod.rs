pub mod coordinator;
pub mod sfu;
