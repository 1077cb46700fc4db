pub mod api;
pub mod manager;
pub mod types;
