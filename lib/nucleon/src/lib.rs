#![allow(clippy::len_without_is_empty)]
#![allow(clippy::new_without_default)]

//! An in-process actor runtime. A single node hosts thousands of independent
//! services, each with its own mailbox, addressed by a 32 bit handle. The
//! runtime owns scheduling, message dispatch, timing and non-blocking socket
//! I/O; services only ever see their own messages, delivered one at a time.

pub mod command;
pub mod context;
pub mod env;
pub mod framer;
pub mod handle;
pub mod mailbox;
pub mod message;
pub mod module;
pub mod monitor;
pub mod net;
pub mod node;
pub mod seri;
pub mod timer;
pub mod worker;

pub mod prelude;

pub use crate::context::{SendError, SendErrorKind, ServiceContext};
pub use crate::handle::Handle;
pub use crate::message::{Message, Payload, ProtocolId, Session};
pub use crate::module::{DispatchError, InitError, ModuleRegistry, Service};
pub use crate::node::{BootError, Config, Harbor, Node, NodeShared, RemoteTarget};
