pub mod docker;
pub mod restart;
pub mod runtime;
pub mod state;
pub mod types;
