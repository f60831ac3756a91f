use crate::context::ServiceContext;
use crate::message::Message;
use indexmap::IndexMap;
use std::fmt;
use std::sync::{Arc, Mutex};

/// Error returned by a service `init`, carrying a short diagnostic. A failed
/// init aborts the launch: the fresh handle is retired and queued senders are
/// notified through the drop handler.
#[derive(Debug)]
pub struct InitError(pub Box<str>);

impl InitError {
    #[inline]
    pub fn new<S: Into<Box<str>>>(reason: S) -> InitError {
        InitError(reason.into())
    }
}

impl fmt::Display for InitError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl std::error::Error for InitError {}

impl From<&str> for InitError {
    fn from(reason: &str) -> InitError {
        InitError::new(reason)
    }
}

impl From<String> for InitError {
    fn from(reason: String) -> InitError {
        InitError::new(reason)
    }
}

/// Hard failure while handling one message. The runtime logs it together
/// with the message's source and session and moves on; the service stays
/// alive and keeps receiving.
#[derive(Debug)]
pub struct DispatchError(pub Box<str>);

impl DispatchError {
    #[inline]
    pub fn new<S: Into<Box<str>>>(reason: S) -> DispatchError {
        DispatchError(reason.into())
    }
}

impl fmt::Display for DispatchError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl std::error::Error for DispatchError {}

impl From<&str> for DispatchError {
    fn from(reason: &str) -> DispatchError {
        DispatchError::new(reason)
    }
}

impl From<String> for DispatchError {
    fn from(reason: String) -> DispatchError {
        DispatchError::new(reason)
    }
}

/// One service instance. The runtime guarantees that `init` and `message`
/// are never executed concurrently for the same instance; `signal` is an
/// out-of-band delivery and may race with a running callback from the
/// caller's point of view (it is serialized by the runtime).
pub trait Service: Send {
    /// Runs once, before the service becomes schedulable. May already send
    /// messages and register names through `ctx`.
    fn init(&mut self, ctx: &Arc<ServiceContext>, args: &str) -> Result<(), InitError>;

    /// Handles one message. Runs to completion; the runtime never preempts.
    /// An error is logged with the message's source and session, then
    /// forgotten; it does not unwind into the runtime or kill the service.
    fn message(&mut self, ctx: &Arc<ServiceContext>, msg: Message) -> Result<(), DispatchError>;

    /// Out-of-band integer signal (`SIGNAL` command).
    fn signal(&mut self, _signal: i32) {}
}

type Factory = Arc<dyn Fn() -> Box<dyn Service> + Send + Sync>;

/// Resolves a service-type name to the factory producing instances of it.
/// Writes happen during boot; afterwards the table is effectively read-only.
pub struct ModuleRegistry {
    modules: Mutex<IndexMap<Box<str>, Factory>>,
}

impl ModuleRegistry {
    pub fn new() -> ModuleRegistry {
        ModuleRegistry {
            modules: Mutex::new(IndexMap::new()),
        }
    }

    /// Register a service type. Re-registering a name replaces the factory.
    pub fn register<F>(&self, name: &str, factory: F)
    where
        F: Fn() -> Box<dyn Service> + Send + Sync + 'static,
    {
        let mut modules = self.modules.lock().unwrap();
        modules.insert(name.into(), Arc::new(factory));
    }

    /// Instantiate a service of the named type.
    pub fn create(&self, name: &str) -> Option<Box<dyn Service>> {
        let factory = {
            let modules = self.modules.lock().unwrap();
            modules.get(name).cloned()
        };
        factory.map(|f| f())
    }

    pub fn contains(&self, name: &str) -> bool {
        self.modules.lock().unwrap().contains_key(name)
    }
}

#[cfg(test)]
pub(crate) struct NullService;

#[cfg(test)]
impl Service for NullService {
    fn init(&mut self, _ctx: &Arc<ServiceContext>, _args: &str) -> Result<(), InitError> {
        Ok(())
    }

    fn message(&mut self, _ctx: &Arc<ServiceContext>, _msg: Message) -> Result<(), DispatchError> {
        Ok(())
    }
}
