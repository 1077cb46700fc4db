pub mod delay;
pub mod fifo;

pub use delay::DelayQueue;
pub use fifo::WorkQueue;
