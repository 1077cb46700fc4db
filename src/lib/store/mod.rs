pub mod store;
pub mod types;

pub use store::Store;
