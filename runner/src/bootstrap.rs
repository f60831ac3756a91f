use nucleon::prelude::*;
use std::sync::Arc;

/// Default first service. Launches every entry of the `start` env key
/// (semicolon separated "module args" specs), which is how a deployment
/// brings up its own service tree without touching the runner.
pub struct Bootstrap;

impl Service for Bootstrap {
    fn init(&mut self, ctx: &Arc<ServiceContext>, _args: &str) -> Result<(), InitError> {
        ctx.command("REG", ".bootstrap");

        let start = ctx.command("GETENV", "start").unwrap_or_default();
        for spec in start.split(';').map(str::trim).filter(|s| !s.is_empty()) {
            if ctx.command("LAUNCH", spec).is_none() {
                return Err(InitError::new(format!("cannot launch {}", spec)));
            }
        }
        Ok(())
    }

    fn message(&mut self, _ctx: &Arc<ServiceContext>, _msg: Message) -> Result<(), DispatchError> {
        Ok(())
    }
}
