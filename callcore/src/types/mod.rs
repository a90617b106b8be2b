pub mod call;
pub mod state;
