pub mod manager_client;
pub mod types;
pub mod worker_client;

pub use manager_client::ManagerClient;
pub use worker_client::{HttpWorkerClient, WorkerClient};
