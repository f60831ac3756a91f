pub use crate::context::ServiceContext;
pub use crate::handle::Handle;
pub use crate::message::{Message, Payload, ProtocolId, Session, TAG_ALLOCSESSION, TAG_DONTCOPY};
pub use crate::module::{DispatchError, InitError, ModuleRegistry, Service};
pub use crate::net::SocketMessage;
pub use crate::node::{Config, Node, NodeShared};
