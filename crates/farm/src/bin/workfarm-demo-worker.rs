//! workfarm-demo-worker: reference worker executable.
//!
//! Serves one module under every module path. Used by the integration
//! tests and handy for trying out the `workfarm` CLI:
//!
//! ```bash
//! workfarm call --worker target/debug/workfarm-demo-worker add 2 40
//! ```

use std::io::Write;
use std::path::Path;
use std::process::ExitCode;
use std::time::Duration;

use serde_json::{json, Value};
use workfarm_worker::{
    exit_code, run_process, CallContext, CallOutput, ModuleRegistry, RemoteError, WorkerModule,
};

/// Module state lives as long as the worker process.
#[derive(Default)]
struct DemoModule {
    setup_args: Vec<Value>,
    calls: u64,
}

impl WorkerModule for DemoModule {
    fn setup(&mut self, args: &[Value]) -> Result<(), RemoteError> {
        if args.first().and_then(Value::as_str) == Some("fail-setup") {
            return Err(RemoteError::new("SetupError", "setup refused by configuration")
                .with_stack("at DemoModule::setup"));
        }
        self.setup_args = args.to_vec();
        Ok(())
    }

    fn call(
        &mut self,
        method: &str,
        args: Vec<Value>,
        ctx: &mut CallContext<'_>,
    ) -> Result<CallOutput, RemoteError> {
        self.calls += 1;
        let arg = |i: usize| args.get(i).cloned().unwrap_or(Value::Null);

        let value = match method {
            "echo" => arg(0),
            "add" => {
                let a = number(&arg(0))?;
                let b = number(&arg(1))?;
                json!(a + b)
            }
            "fail" => {
                let message = arg(0).as_str().unwrap_or("demo failure").to_string();
                return Err(RemoteError::new("RangeError", message)
                    .with_stack("at fail (workfarm-demo-worker)")
                    .with_extra("code", 42));
            }
            "sleep" => {
                let ms = arg(0).as_u64().unwrap_or(0);
                std::thread::sleep(Duration::from_millis(ms));
                json!({ "slept": ms, "pid": std::process::id() })
            }
            "crash" => {
                let code = arg(0).as_i64().unwrap_or(1) as i32;
                std::process::exit(code);
            }
            "flaky" => {
                // Exits on the first `failures` attempts, counted in a marker file.
                let path = arg(0)
                    .as_str()
                    .map(str::to_string)
                    .ok_or_else(|| RemoteError::type_error("flaky needs a marker path"))?;
                let failures = arg(1).as_u64().unwrap_or(1);
                let attempt = record_attempt(Path::new(&path))?;
                if attempt <= failures {
                    std::process::exit(1);
                }
                json!(attempt)
            }
            "blob" => {
                let len = arg(0).as_u64().unwrap_or(0) as usize;
                json!("x".repeat(len))
            }
            "pid" => json!(std::process::id()),
            "worker_id" => json!(ctx.worker_id()),
            "calls" => json!(self.calls),
            "setup_args" => Value::Array(self.setup_args.clone()),
            "progress" => {
                let steps = arg(0).as_u64().unwrap_or(0);
                for step in 0..steps {
                    ctx.send_custom_message(&json!({ "step": step, "of": steps }));
                }
                json!(steps)
            }
            "count" => {
                let n = arg(0).as_u64().unwrap_or(0);
                return Ok(CallOutput::sequence((0..n).map(Value::from)));
            }
            "print" => {
                let text = arg(0).as_str().unwrap_or_default().to_string();
                let _ = writeln!(ctx.stdout(), "{text}");
                let _ = writeln!(ctx.stderr(), "warning: {text}");
                Value::Null
            }
            other => return Err(RemoteError::method_not_found(other)),
        };
        Ok(value.into())
    }
}

fn number(value: &Value) -> Result<f64, RemoteError> {
    value
        .as_f64()
        .ok_or_else(|| RemoteError::type_error(format!("expected a number, got {value}")))
}

fn record_attempt(path: &Path) -> Result<u64, RemoteError> {
    let io_err = |e: std::io::Error| RemoteError::error(format!("{}: {e}", path.display()));
    let previous = match std::fs::read_to_string(path) {
        Ok(content) => content.lines().count() as u64,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => 0,
        Err(e) => return Err(io_err(e)),
    };
    let mut file = std::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .map_err(io_err)?;
    writeln!(file, "attempt").map_err(io_err)?;
    Ok(previous + 1)
}

fn main() -> ExitCode {
    // stdout belongs to the module; logs go to stderr.
    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn")),
        )
        .init();

    let registry = ModuleRegistry::new().with_default(DemoModule::default);
    exit_code(run_process(registry))
}
