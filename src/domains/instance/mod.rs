pub mod coordinator;
pub mod entity;
pub mod storage;

pub use entity::{Instance, InstanceData, InstanceOptions, Status};
pub use storage::Storage;
