use nucleon::prelude::*;
use std::fs::{File, OpenOptions};
use std::io::Write;
use std::sync::Arc;

enum Output {
    Stderr,
    File(File),
}

/// The log service: sink for the `TEXT` messages the runtime and other
/// services emit. With an argument it appends to that file, otherwise it
/// writes to stderr. A `SYSTEM` message reopens the file so external log
/// rotation works.
pub struct LogService {
    output: Output,
    path: Option<String>,
}

impl LogService {
    pub fn new() -> LogService {
        LogService {
            output: Output::Stderr,
            path: None,
        }
    }

    fn open(path: &str) -> Result<Output, InitError> {
        OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .map(Output::File)
            .map_err(|err| InitError::new(format!("cannot open {}: {}", path, err)))
    }

    fn write_line(&mut self, source: Handle, line: &str) {
        match &mut self.output {
            Output::Stderr => eprintln!("[:{:08x}] {}", source, line),
            Output::File(file) => {
                let _ = writeln!(file, "[:{:08x}] {}", source, line);
            }
        }
    }
}

impl Service for LogService {
    fn init(&mut self, _ctx: &Arc<ServiceContext>, args: &str) -> Result<(), InitError> {
        if !args.is_empty() {
            self.output = LogService::open(args)?;
            self.path = Some(args.to_string());
        }
        Ok(())
    }

    fn message(&mut self, _ctx: &Arc<ServiceContext>, msg: Message) -> Result<(), DispatchError> {
        match msg.protocol {
            ProtocolId::TEXT => {
                let line = String::from_utf8_lossy(msg.payload.as_bytes()).to_string();
                self.write_line(msg.source, &line);
            }
            ProtocolId::SYSTEM => {
                if let Some(path) = self.path.clone() {
                    if let Ok(output) = LogService::open(&path) {
                        self.output = output;
                    }
                }
            }
            _ => {}
        }
        Ok(())
    }
}
