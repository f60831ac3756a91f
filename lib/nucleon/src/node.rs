use crate::context::{SendError, SendErrorKind, ServiceContext};
use crate::env::Env;
use crate::handle::{self, Handle, HandleRegistry};
use crate::mailbox::GlobalQueue;
use crate::message::{Message, Payload, ProtocolId, Session};
use crate::module::ModuleRegistry;
use crate::monitor::WorkerMonitor;
use crate::net::reactor::{self, SocketApi};
use crate::net::SocketMessage;
use crate::timer::{Timer, TimerEvent, UPDATE_INTERVAL_MICROS};
use crate::worker;
use serde_derive::{Deserialize, Serialize};
use slog::{error, info, o, Logger};
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicI32, AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

/// Node configuration. Loaded from a TOML file by the runner; every field
/// has the stock default so an empty file boots a plain single-node setup.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Worker thread count.
    pub thread: usize,
    /// Node prefix stamped into every handle; 0 keeps remote detection off.
    pub harbor: u8,
    /// First service: "module args...".
    pub bootstrap: String,
    /// Search path for loadable service modules; kept for configs written
    /// against the dynamic loader, unused by the in-process registry.
    pub cpath: String,
    /// Argument string for the log service.
    pub logger: Option<String>,
    /// Module name of the log service.
    pub logservice: String,
    /// Pidfile path; recorded in the env for the supervisor to pick up.
    pub daemon: Option<String>,
    /// Account dispatch wall time per service.
    pub profile: bool,
    /// Directory for per-service message logs (`LOGON`).
    pub logpath: Option<String>,
    // Passed through verbatim to script-hosted services.
    pub preload: Option<String>,
    pub lua_path: Option<String>,
    pub lua_cpath: Option<String>,
    pub luaservice: Option<String>,
    pub lualoader: Option<String>,
}

impl Default for Config {
    fn default() -> Config {
        Config {
            thread: 8,
            harbor: 1,
            bootstrap: "bootstrap".to_string(),
            cpath: "./cservice/?.so".to_string(),
            logger: None,
            logservice: "logger".to_string(),
            daemon: None,
            profile: true,
            logpath: None,
            preload: None,
            lua_path: None,
            lua_cpath: None,
            luaservice: None,
            lualoader: None,
        }
    }
}

/// Pluggable forwarder for messages whose destination carries another
/// node's prefix. The core treats it as opaque.
pub trait Harbor: Send + Sync {
    fn forward(
        &self,
        source: Handle,
        destination: RemoteTarget,
        protocol: ProtocolId,
        session: Session,
        payload: Payload,
    );
}

#[derive(Debug)]
pub enum RemoteTarget {
    Handle(Handle),
    Name(Box<str>),
}

#[derive(Debug)]
pub enum BootError {
    /// The log service failed to launch.
    Logger(String),
    /// The bootstrap service failed to launch or init.
    Bootstrap(String),
    Io(std::io::Error),
}

impl fmt::Display for BootError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            BootError::Logger(name) => write!(f, "cannot launch log service {}", name),
            BootError::Bootstrap(spec) => write!(f, "cannot launch bootstrap {}", spec),
            BootError::Io(err) => write!(f, "{}", err),
        }
    }
}

impl std::error::Error for BootError {}

impl From<std::io::Error> for BootError {
    fn from(err: std::io::Error) -> BootError {
        BootError::Io(err)
    }
}

/// Everything the runtime shares between threads and contexts. One instance
/// per node; tests build isolated ones freely.
pub struct NodeShared {
    pub env: Env,
    pub registry: Arc<HandleRegistry>,
    pub global: GlobalQueue,
    pub timer: Timer,
    pub modules: ModuleRegistry,
    pub socket: SocketApi,
    pub log: Logger,
    pub profile: bool,
    logservice: Box<str>,
    logger_handle: AtomicU32,
    monitor_exit: AtomicU32,
    total: AtomicI32,
    quit: AtomicBool,
    harbor_hook: Mutex<Option<Box<dyn Harbor>>>,
}

impl NodeShared {
    fn new(
        config: &Config,
        socket: SocketApi,
        modules: ModuleRegistry,
        log: Logger,
    ) -> Arc<NodeShared> {
        let shared = Arc::new(NodeShared {
            env: Env::new(),
            registry: Arc::new(HandleRegistry::new(config.harbor)),
            global: GlobalQueue::new(),
            timer: Timer::new(log.new(o!("component" => "timer"))),
            modules,
            socket,
            log,
            profile: config.profile,
            logservice: config.logservice.as_str().into(),
            logger_handle: AtomicU32::new(0),
            monitor_exit: AtomicU32::new(0),
            total: AtomicI32::new(0),
            quit: AtomicBool::new(false),
            harbor_hook: Mutex::new(None),
        });
        shared.seed_env(config);
        shared
    }

    /// Record the config in the env store so services observe the same
    /// values the node booted with.
    fn seed_env(&self, config: &Config) {
        self.env.set("thread", &config.thread.to_string());
        self.env.set("harbor", &config.harbor.to_string());
        self.env.set("bootstrap", &config.bootstrap);
        self.env.set("cpath", &config.cpath);
        self.env.set("logservice", &config.logservice);
        let passthrough = [
            ("logger", &config.logger),
            ("daemon", &config.daemon),
            ("logpath", &config.logpath),
            ("preload", &config.preload),
            ("lua_path", &config.lua_path),
            ("lua_cpath", &config.lua_cpath),
            ("luaservice", &config.luaservice),
            ("lualoader", &config.lualoader),
        ];
        for (key, value) in &passthrough {
            if let Some(value) = value {
                self.env.set(key, value);
            }
        }
        self.env
            .set("profile", if config.profile { "true" } else { "false" });
    }

    /// Install the cross-node forwarder.
    pub fn install_harbor(&self, hook: Box<dyn Harbor>) {
        *self.harbor_hook.lock().unwrap() = Some(hook);
    }

    /// Live, non-reserved service count.
    #[inline]
    pub fn total(&self) -> i32 {
        self.total.load(Ordering::Acquire)
    }

    #[inline]
    pub(crate) fn quitting(&self) -> bool {
        self.quit.load(Ordering::Acquire)
    }

    /// Create, register and init a service of the named module type.
    /// Returns None (after notifying the log service) when the module is
    /// unknown or its init fails; queued senders get drop-handler errors.
    pub fn launch(self: &Arc<Self>, module: &str, args: &str) -> Option<Arc<ServiceContext>> {
        let instance = match self.modules.create(module) {
            Some(instance) => instance,
            None => {
                error!(self.log, "unknown module"; "module" => module.to_string());
                return None;
            }
        };

        let (handle, ctx) = self
            .registry
            .register_with(|handle| ServiceContext::new(self.clone(), module, instance, handle));
        self.total.fetch_add(1, Ordering::AcqRel);

        match ctx.run_init(args) {
            Ok(()) => {
                ctx.set_initialized();
                // The mailbox claimed global membership at creation; now
                // that init is done, make it actually schedulable.
                self.global.push(ctx.mailbox().clone());
                self.service_error(handle, &format!("LAUNCH {} {}", module, args));
                Some(ctx)
            }
            Err(err) => {
                self.service_error(handle, &format!("FAILED launch {}: {}", module, err));
                let mailbox = ctx.mailbox().clone();
                self.registry.retire(handle);
                drop(ctx);
                // If no grab is outstanding the drop above flagged the
                // mailbox; bounce whatever queued meanwhile.
                mailbox.release_or_requeue(&self.global, |msg| self.drop_message(handle, msg));
                None
            }
        }
    }

    /// Retire a handle: clear its registry slot (destruction follows once
    /// the last reference drops).
    pub fn retire(&self, handle: Handle) -> bool {
        self.registry.retire(handle)
    }

    /// Retire every service; the node shuts down once the mailboxes drain.
    pub fn abort(&self) {
        self.registry.retire_all();
    }

    pub(crate) fn service_retired(&self) {
        self.total.fetch_sub(1, Ordering::AcqRel);
    }

    /// Mark a context as a system service that does not keep the node
    /// alive.
    pub fn reserve(&self, ctx: &Arc<ServiceContext>) {
        if !ctx.is_reserved() {
            ctx.set_reserved();
            self.total.fetch_sub(1, Ordering::AcqRel);
        }
    }

    /// Push a message into a service's mailbox; hands the message back when
    /// the destination is gone.
    pub fn push_message(&self, destination: Handle, msg: Message) -> Result<(), Message> {
        match self.registry.grab(destination) {
            Some(ctx) => {
                ctx.mailbox().push(msg, &self.global);
                Ok(())
            }
            None => Err(msg),
        }
    }

    /// Drop-handler: a message queued at a retired handle bounces back to
    /// its sender as an `ERROR` carrying the original session.
    pub(crate) fn drop_message(&self, dead: Handle, msg: Message) {
        if msg.source != 0 {
            let bounce = Message::system(dead, msg.session, ProtocolId::ERROR);
            let _ = self.push_message(msg.source, bounce);
        }
    }

    /// Report a service-level event as a `TEXT` message to the log service,
    /// falling back to the structured log when none is up yet.
    pub fn service_error(&self, source: Handle, text: &str) {
        let logger = self.logger_handle();
        if logger != 0 {
            let msg = Message::new(source, 0, ProtocolId::TEXT, Payload::text(text));
            if self.push_message(logger, msg).is_ok() {
                return;
            }
            self.logger_handle.store(0, Ordering::Relaxed);
        }
        info!(self.log, "{}", text; "source" => handle::to_hex(source));
    }

    fn logger_handle(&self) -> Handle {
        let cached = self.logger_handle.load(Ordering::Relaxed);
        if cached != 0 {
            return cached;
        }
        match self.registry.find_name(&self.logservice) {
            Some(found) => {
                self.logger_handle.store(found, Ordering::Relaxed);
                found
            }
            None => 0,
        }
    }

    /// Register a timer expiry. Zero (or negative) ticks short-circuit into
    /// an immediate `RESPONSE` push.
    pub fn timeout(&self, handle: Handle, ticks: i32, session: Session) -> Session {
        if ticks <= 0 {
            let msg = Message::system(0, session, ProtocolId::RESPONSE);
            let _ = self.push_message(handle, msg);
        } else {
            self.timer.add(ticks as u32, TimerEvent { handle, session });
        }
        session
    }

    pub(crate) fn exit_monitor(&self) -> Handle {
        self.monitor_exit.load(Ordering::Relaxed)
    }

    pub(crate) fn set_exit_monitor(&self, handle: Handle) {
        self.monitor_exit.store(handle, Ordering::Relaxed);
    }

    pub(crate) fn harbor_forward(
        &self,
        source: Handle,
        destination: Handle,
        protocol: ProtocolId,
        session: Session,
        payload: Payload,
    ) -> Result<(), SendError> {
        let hook = self.harbor_hook.lock().unwrap();
        match hook.as_ref() {
            Some(hook) => {
                hook.forward(source, RemoteTarget::Handle(destination), protocol, session, payload);
                Ok(())
            }
            None => {
                self.service_error(
                    source,
                    &format!("Drop message to remote {}", handle::to_hex(destination)),
                );
                Err(SendError {
                    kind: SendErrorKind::NoHarbor,
                    payload,
                })
            }
        }
    }

    pub(crate) fn harbor_forward_name(
        &self,
        source: Handle,
        name: &str,
        protocol: ProtocolId,
        session: Session,
        payload: Payload,
    ) -> Result<(), SendError> {
        let hook = self.harbor_hook.lock().unwrap();
        match hook.as_ref() {
            Some(hook) => {
                hook.forward(source, RemoteTarget::Name(name.into()), protocol, session, payload);
                Ok(())
            }
            None => {
                self.service_error(source, &format!("Drop message to remote name {}", name));
                Err(SendError {
                    kind: SendErrorKind::NoHarbor,
                    payload,
                })
            }
        }
    }

    /// Forward a reactor event into the owning service's mailbox.
    pub(crate) fn forward_socket(&self, owner: Handle, event: SocketMessage) {
        let msg = Message::new(0, 0, ProtocolId::SOCKET, Payload::Socket(event));
        let _ = self.push_message(owner, msg);
    }

    #[cfg(test)]
    pub(crate) fn for_test(harbor: u8) -> Arc<NodeShared> {
        let log = Logger::root(slog::Discard, o!());
        let (socket, _server) = reactor::pair(log.clone()).expect("socket pair");
        let config = Config {
            harbor,
            ..Config::default()
        };
        NodeShared::new(&config, socket, ModuleRegistry::new(), log)
    }
}

/// A running node: the shared state plus its long-lived threads. Built by
/// [`Node::start`], torn down by [`Node::run`] once every (non-reserved)
/// service has retired.
pub struct Node {
    shared: Arc<NodeShared>,
    threads: Vec<thread::JoinHandle<()>>,
}

impl Node {
    /// Boot a node: wire the singletons, launch the log service and the
    /// bootstrap service, then start the worker, timer, monitor and socket
    /// threads.
    pub fn start(config: Config, modules: ModuleRegistry, log: Logger) -> Result<Node, BootError> {
        let (socket_api, socket_server) =
            reactor::pair(log.new(o!("component" => "socket")))?;
        let shared = NodeShared::new(&config, socket_api, modules, log);

        // Log service first so everything after it reports through it. It
        // is reserved: a node with only the logger left is an idle node.
        let logger_args = config.logger.clone().unwrap_or_default();
        let logger_ctx = shared
            .launch(&config.logservice, &logger_args)
            .ok_or_else(|| BootError::Logger(config.logservice.clone()))?;
        shared.registry.bind_name(logger_ctx.handle(), &config.logservice);
        shared.reserve(&logger_ctx);

        // Bootstrap: "module args...".
        let mut parts = config.bootstrap.splitn(2, char::is_whitespace);
        let boot_module = parts.next().unwrap_or_default();
        let boot_args = parts.next().unwrap_or("");
        shared
            .launch(boot_module, boot_args)
            .ok_or_else(|| BootError::Bootstrap(config.bootstrap.clone()))?;

        let mut threads = Vec::new();

        let sink_shared = shared.clone();
        threads.push(
            thread::Builder::new()
                .name("socket".to_string())
                .spawn(move || {
                    let forward = sink_shared.clone();
                    socket_server.run(Box::new(move |owner, event| {
                        forward.forward_socket(owner, event)
                    }));
                })?,
        );

        let mut monitors = Vec::new();
        for i in 0..config.thread.max(1) {
            let monitor = Arc::new(WorkerMonitor::new());
            monitors.push(monitor.clone());
            let worker_shared = shared.clone();
            threads.push(
                thread::Builder::new()
                    .name(format!("worker-{}", i))
                    .spawn(move || {
                        worker::worker_main(worker_shared, monitor, worker::weight(i))
                    })?,
            );
        }

        let timer_shared = shared.clone();
        threads.push(
            thread::Builder::new()
                .name("timer".to_string())
                .spawn(move || timer_main(timer_shared))?,
        );

        let monitor_shared = shared.clone();
        threads.push(
            thread::Builder::new()
                .name("monitor".to_string())
                .spawn(move || monitor_main(monitor_shared, monitors))?,
        );

        Ok(Node { shared, threads })
    }

    #[inline]
    pub fn shared(&self) -> &Arc<NodeShared> {
        &self.shared
    }

    /// Block until the node winds down (all non-reserved services retired),
    /// then join every runtime thread and release the reserved services.
    pub fn run(self) {
        for thread in self.threads {
            let _ = thread.join();
        }
        // Break the registry/context cycle so reserved services (the log
        // service) release too.
        self.shared.registry.retire_all();
        info!(self.shared.log, "node stopped");
    }
}

/// Timer thread: advance the wheel every quarter tick and watch for the
/// all-services-retired condition that shuts the node down.
fn timer_main(shared: Arc<NodeShared>) {
    loop {
        for event in shared.timer.update() {
            let msg = Message::system(0, event.session, ProtocolId::RESPONSE);
            // A retired target simply misses its timer.
            let _ = shared.push_message(event.handle, msg);
        }
        if shared.total() <= 0 {
            break;
        }
        thread::sleep(Duration::from_micros(UPDATE_INTERVAL_MICROS));
    }

    shared.quit.store(true, Ordering::Release);
    shared.global.quit();
    shared.socket.exit();
}

/// Monitor thread: every five seconds, flag workers that sat in one
/// callback the whole interval.
fn monitor_main(shared: Arc<NodeShared>, monitors: Vec<Arc<WorkerMonitor>>) {
    loop {
        for _ in 0..5 {
            if shared.total() <= 0 || shared.quitting() {
                return;
            }
            thread::sleep(Duration::from_secs(1));
        }
        for monitor in &monitors {
            if let Some((source, destination)) = monitor.check() {
                if let Some(ctx) = shared.registry.grab(destination) {
                    ctx.set_endless();
                }
                shared.service_error(
                    destination,
                    &format!(
                        "A message from [ {} ] to [ {} ] maybe in an endless loop",
                        handle::to_hex(source),
                        handle::to_hex(destination)
                    ),
                );
            }
        }
    }
}
