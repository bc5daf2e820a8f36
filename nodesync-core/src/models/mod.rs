pub mod event;
pub mod id;
pub mod instance;

pub use event::{NodeEvent, NodeEventKind};
pub use id::InstanceId;
pub use instance::{InstanceInfo, InstanceState};
