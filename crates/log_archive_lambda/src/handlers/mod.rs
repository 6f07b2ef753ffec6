pub mod discovery;
pub mod events;
pub mod fan_out;
pub mod pipeline;
pub mod scheduler;
pub mod upload;
