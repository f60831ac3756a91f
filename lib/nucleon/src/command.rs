use crate::context::ServiceContext;
use crate::handle::{self, Handle};
use crate::message::{Payload, ProtocolId};
use slog::error;
use std::sync::Arc;

/// The built-in control plane: a closed set of verbs every service can
/// invoke on its own context. Returns the textual result, or None for verbs
/// without one (and for failures, which is how callers detect name
/// collisions and bad lookups).
pub fn command(ctx: &Arc<ServiceContext>, verb: &str, arg: &str) -> Option<String> {
    match verb {
        "TIMEOUT" => cmd_timeout(ctx, arg),
        "REG" => cmd_reg(ctx, arg),
        "QUERY" => cmd_query(ctx, arg),
        "NAME" => cmd_name(ctx, arg),
        "EXIT" => cmd_exit(ctx),
        "KILL" => cmd_kill(ctx, arg),
        "LAUNCH" => cmd_launch(ctx, arg),
        "GETENV" => ctx.node().env.get(arg),
        "SETENV" => cmd_setenv(ctx, arg),
        "STARTTIME" => Some(ctx.node().timer.starttime().to_string()),
        "ENDLESS" => cmd_endless(ctx),
        "ABORT" => {
            ctx.node().abort();
            None
        }
        "MONITOR" => cmd_monitor(ctx, arg),
        "MQLEN" => Some(ctx.mailbox_len().to_string()),
        "LOGON" => cmd_logon(ctx, arg, true),
        "LOGOFF" => cmd_logon(ctx, arg, false),
        "SIGNAL" => cmd_signal(ctx, arg),
        _ => {
            error!(ctx.logger(), "unknown command"; "verb" => verb.to_string());
            None
        }
    }
}

/// Resolve `:hex` or `.name` to a handle.
fn to_handle(ctx: &ServiceContext, param: &str) -> Option<Handle> {
    if let Some(h) = handle::from_hex(param) {
        return Some(h);
    }
    if let Some(name) = param.strip_prefix('.') {
        return ctx.node().registry.find_name(name);
    }
    error!(ctx.logger(), "cannot convert to handle"; "param" => param.to_string());
    None
}

fn cmd_timeout(ctx: &ServiceContext, arg: &str) -> Option<String> {
    let ticks: i32 = arg.trim().parse().ok()?;
    let session = ctx.new_session();
    ctx.node().timeout(ctx.handle(), ticks, session);
    Some(session.to_string())
}

fn cmd_reg(ctx: &ServiceContext, arg: &str) -> Option<String> {
    if arg.is_empty() {
        return Some(handle::to_hex(ctx.handle()));
    }
    if let Some(name) = arg.strip_prefix('.') {
        if ctx.node().registry.bind_name(ctx.handle(), name) {
            return Some(name.to_string());
        }
        return None;
    }
    error!(ctx.logger(), "cannot register global name"; "name" => arg.to_string());
    None
}

fn cmd_query(ctx: &ServiceContext, arg: &str) -> Option<String> {
    let name = arg.strip_prefix('.')?;
    ctx.node().registry.find_name(name).map(handle::to_hex)
}

fn cmd_name(ctx: &ServiceContext, arg: &str) -> Option<String> {
    let mut parts = arg.split_whitespace();
    let name = parts.next()?;
    let target = parts.next()?;
    let target = handle::from_hex(target)?;
    if target == 0 {
        return None;
    }
    if let Some(name) = name.strip_prefix('.') {
        if ctx.node().registry.bind_name(target, name) {
            return Some(name.to_string());
        }
        return None;
    }
    error!(ctx.logger(), "cannot set global name"; "name" => name.to_string());
    None
}

fn handle_exit(ctx: &ServiceContext, target: Handle) {
    let node = ctx.node();
    let target = if target == 0 {
        node.service_error(ctx.handle(), "KILL self");
        ctx.handle()
    } else {
        node.service_error(ctx.handle(), &format!("KILL {}", handle::to_hex(target)));
        target
    };

    let monitor = node.exit_monitor();
    if monitor != 0 {
        // The retired handle is the source so the monitor learns who died.
        let _ = ctx.send(target, monitor, ProtocolId::CLIENT.bits(), 0, Payload::Empty);
    }
    node.retire(target);
}

fn cmd_exit(ctx: &ServiceContext) -> Option<String> {
    handle_exit(ctx, 0);
    None
}

fn cmd_kill(ctx: &ServiceContext, arg: &str) -> Option<String> {
    if let Some(target) = to_handle(ctx, arg) {
        handle_exit(ctx, target);
    }
    None
}

fn cmd_launch(ctx: &ServiceContext, arg: &str) -> Option<String> {
    let mut parts = arg.trim().splitn(2, char::is_whitespace);
    let module = parts.next().filter(|m| !m.is_empty())?;
    let args = parts.next().unwrap_or("").trim();
    ctx.node()
        .launch(module, args)
        .map(|launched| handle::to_hex(launched.handle()))
}

fn cmd_setenv(ctx: &ServiceContext, arg: &str) -> Option<String> {
    let mut parts = arg.splitn(2, ' ');
    let key = parts.next()?;
    let value = parts.next()?;
    if key.is_empty() {
        return None;
    }
    ctx.node().env.set(key, value);
    None
}

fn cmd_endless(ctx: &ServiceContext) -> Option<String> {
    if ctx.take_endless() {
        Some("1".to_string())
    } else {
        None
    }
}

fn cmd_monitor(ctx: &ServiceContext, arg: &str) -> Option<String> {
    if arg.is_empty() {
        let monitor = ctx.node().exit_monitor();
        if monitor != 0 {
            return Some(handle::to_hex(monitor));
        }
        return None;
    }
    let target = to_handle(ctx, arg)?;
    ctx.node().set_exit_monitor(target);
    None
}

fn cmd_logon(ctx: &ServiceContext, arg: &str, on: bool) -> Option<String> {
    let target = to_handle(ctx, arg)?;
    let target = ctx.node().registry.grab(target)?;
    if on {
        target.log_on();
    } else {
        target.log_off();
    }
    None
}

fn cmd_signal(ctx: &ServiceContext, arg: &str) -> Option<String> {
    let mut parts = arg.split_whitespace();
    let target = to_handle(ctx, parts.next()?)?;
    let signal: i32 = parts.next().and_then(|s| s.parse().ok()).unwrap_or(0);
    let target = ctx.node().registry.grab(target)?;
    target.deliver_signal(signal);
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::node::NodeShared;

    fn setup() -> (Arc<NodeShared>, Arc<ServiceContext>, Arc<ServiceContext>) {
        let node = NodeShared::for_test(0);
        let (_ha, a) = node
            .registry
            .register_with(|h| ServiceContext::stub(&node, h));
        let (_hb, b) = node
            .registry
            .register_with(|h| ServiceContext::stub(&node, h));
        (node, a, b)
    }

    #[test]
    fn test_reg_and_query() {
        let (_node, a, b) = setup();

        assert_eq!(a.command("REG", ""), Some(handle::to_hex(a.handle())));
        assert_eq!(a.command("REG", ".alpha"), Some("alpha".to_string()));
        // Second binding of the same name fails; that is the collision
        // signal.
        assert_eq!(b.command("REG", ".alpha"), None);
        assert_eq!(
            b.command("QUERY", ".alpha"),
            Some(handle::to_hex(a.handle()))
        );
        assert_eq!(b.command("QUERY", ".nobody"), None);
    }

    #[test]
    fn test_name_binds_other_handle() {
        let (_node, a, b) = setup();

        let arg = format!(".beta {}", handle::to_hex(b.handle()));
        assert_eq!(a.command("NAME", &arg), Some("beta".to_string()));
        assert_eq!(
            a.command("QUERY", ".beta"),
            Some(handle::to_hex(b.handle()))
        );
    }

    #[test]
    fn test_env_roundtrip() {
        let (_node, a, _b) = setup();

        assert_eq!(a.command("GETENV", "answer"), None);
        assert_eq!(a.command("SETENV", "answer 42"), None);
        assert_eq!(a.command("GETENV", "answer"), Some("42".to_string()));
        // SETENV never overwrites.
        a.command("SETENV", "answer 43");
        assert_eq!(a.command("GETENV", "answer"), Some("42".to_string()));
    }

    #[test]
    fn test_timeout_returns_fresh_sessions() {
        let (_node, a, _b) = setup();

        let s1: i32 = a.command("TIMEOUT", "0").unwrap().parse().unwrap();
        let s2: i32 = a.command("TIMEOUT", "100").unwrap().parse().unwrap();
        assert_ne!(s1, s2);
        // The zero-tick fast path already delivered a response.
        assert_eq!(a.mailbox_len(), 1);
    }

    #[test]
    fn test_mqlen() {
        let (_node, a, _b) = setup();
        assert_eq!(a.command("MQLEN", ""), Some("0".to_string()));
    }

    #[test]
    fn test_endless_reads_and_clears() {
        let (_node, a, _b) = setup();

        assert_eq!(a.command("ENDLESS", ""), None);
        a.set_endless();
        assert_eq!(a.command("ENDLESS", ""), Some("1".to_string()));
        assert_eq!(a.command("ENDLESS", ""), None);
    }

    #[test]
    fn test_monitor_roundtrip() {
        let (_node, a, b) = setup();

        assert_eq!(a.command("MONITOR", ""), None);
        let arg = handle::to_hex(b.handle());
        assert_eq!(a.command("MONITOR", &arg), None);
        assert_eq!(a.command("MONITOR", ""), Some(arg));
    }

    #[test]
    fn test_kill_retires() {
        let (node, a, b) = setup();

        let arg = handle::to_hex(b.handle());
        a.command("KILL", &arg);
        assert!(node.registry.grab(b.handle()).is_none());
        assert!(node.registry.grab(a.handle()).is_some());
    }

    #[test]
    fn test_starttime_is_numeric() {
        let (_node, a, _b) = setup();
        let s: u32 = a.command("STARTTIME", "").unwrap().parse().unwrap();
        assert!(s > 1_500_000_000);
    }
}
