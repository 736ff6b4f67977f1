//! The command loop running inside a worker process.

use std::io::{Read, Write};
use std::panic::{AssertUnwindSafe, catch_unwind};

use tessera_core::ipc::{WorkerCommand, WorkerResponse, read_message, write_message};
use tessera_core::{CallArgs, Canonical, Catalog, FunctionDescriptor, Globals, Value};

/// Signature of a unit's implementation.
pub type UnitFn = dyn Fn(&Invocation<'_>) -> anyhow::Result<Value> + Send + Sync;

/// A unit: its descriptor and the code behind it.
pub struct UnitDef {
    pub descriptor: FunctionDescriptor,
    func: Box<UnitFn>,
}

/// Arguments and context of one unit call.
pub struct Invocation<'a> {
    pub call: CallArgs,
    pub descriptor: &'a FunctionDescriptor,
    pub globals: &'a Globals,
}

impl Invocation<'_> {
    pub fn arg(&self, index: usize) -> Option<&Value> {
        self.call.args.get(index)
    }

    /// Keyword argument, falling back to the declared default.
    pub fn kwarg(&self, name: &str) -> Option<&Value> {
        self.call
            .kwargs
            .get(name)
            .or_else(|| self.descriptor.default_for(name))
    }

    /// Parameter passed positionally at `index` or by `name`, or its default.
    pub fn param(&self, index: usize, name: &str) -> Option<&Value> {
        self.arg(index).or_else(|| self.kwarg(name))
    }

    pub fn global(&self, name: &str) -> Option<&Value> {
        self.globals.get(name)
    }

    pub fn int(&self, index: usize, name: &str) -> anyhow::Result<i64> {
        self.param(index, name)
            .and_then(Value::as_i64)
            .ok_or_else(|| anyhow::anyhow!("missing integer parameter {}", name))
    }
}

/// Everything a worker process serves: units plus the globals they read.
#[derive(Default)]
pub struct WorkerRuntime {
    units: Vec<UnitDef>,
    globals: Globals,
}

impl WorkerRuntime {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn global(&mut self, name: impl Into<String>, value: impl Canonical) -> &mut Self {
        self.globals.insert(name, value);
        self
    }

    /// Register a unit. Duplicate names are reported by the coordinator when
    /// it loads the catalog.
    pub fn unit<F>(&mut self, descriptor: FunctionDescriptor, func: F) -> &mut Self
    where
        F: Fn(&Invocation<'_>) -> anyhow::Result<Value> + Send + Sync + 'static,
    {
        self.units.push(UnitDef {
            descriptor,
            func: Box::new(func),
        });
        self
    }

    pub fn catalog(&self) -> Catalog {
        Catalog {
            units: self.units.iter().map(|u| u.descriptor.clone()).collect(),
            globals: self.globals.clone(),
        }
    }

    /// Serve commands until the coordinator sends `Shutdown` or closes the
    /// stream.
    pub fn serve<R: Read, W: Write>(&self, mut reader: R, mut writer: W) -> tessera_core::Result<()> {
        loop {
            let command: WorkerCommand = match read_message(&mut reader) {
                Ok(command) => command,
                Err(e) => {
                    tracing::debug!("Command stream closed: {}", e);
                    return Ok(());
                }
            };

            let response = match command {
                WorkerCommand::Ping => WorkerResponse::Pong,
                WorkerCommand::Describe => WorkerResponse::Catalog {
                    catalog_json: serde_json::to_vec(&self.catalog())?,
                },
                WorkerCommand::Execute { unit, args_json } => self.execute(&unit, &args_json),
                WorkerCommand::Shutdown => {
                    write_message(&mut writer, &WorkerResponse::ShuttingDown)?;
                    return Ok(());
                }
            };
            write_message(&mut writer, &response)?;
        }
    }

    /// Serve on stdin/stdout.
    pub fn serve_stdio(&self) -> tessera_core::Result<()> {
        let stdin = std::io::stdin().lock();
        let stdout = std::io::stdout().lock();
        self.serve(stdin, stdout)
    }

    fn execute(&self, name: &str, args_json: &[u8]) -> WorkerResponse {
        let Some(unit) = self.units.iter().find(|u| u.descriptor.name == name) else {
            return WorkerResponse::UnknownUnit {
                unit: name.to_string(),
            };
        };

        let call = match CallArgs::from_json(args_json) {
            Ok(call) => call,
            Err(e) => {
                return WorkerResponse::Error {
                    message: format!("invalid arguments for {}: {}", name, e),
                };
            }
        };

        let invocation = Invocation {
            call,
            descriptor: &unit.descriptor,
            globals: &self.globals,
        };

        match catch_unwind(AssertUnwindSafe(|| (unit.func)(&invocation))) {
            Ok(Ok(value)) => match serde_json::to_vec(&value) {
                Ok(value_json) => WorkerResponse::Output { value_json },
                Err(e) => WorkerResponse::Error {
                    message: format!("output of {} is not serializable: {}", name, e),
                },
            },
            Ok(Err(e)) => WorkerResponse::Error {
                message: format!("{:#}", e),
            },
            Err(payload) => WorkerResponse::Panic {
                message: panic_message(payload.as_ref()),
            },
        }
    }
}

fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "non-string panic payload".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    fn runtime() -> WorkerRuntime {
        let mut runtime = WorkerRuntime::new();
        runtime
            .global("OFFSET", 10)
            .unit(
                FunctionDescriptor::new("add", "add/v1")
                    .with_default("b", 1)
                    .reads_global("OFFSET"),
                |inv| {
                    let a = inv.int(0, "a")?;
                    let b = inv.int(1, "b")?;
                    let offset = inv.global("OFFSET").and_then(Value::as_i64).unwrap_or(0);
                    Ok(Value::Int(a + b + offset))
                },
            )
            .unit(FunctionDescriptor::new("boom", "boom/v1"), |_| {
                panic!("kaboom")
            });
        runtime
    }

    /// Feed `commands` to the runtime and collect its responses.
    fn exchange(runtime: &WorkerRuntime, commands: &[WorkerCommand]) -> Vec<WorkerResponse> {
        let mut input = Vec::new();
        for command in commands {
            write_message(&mut input, command).unwrap();
        }
        let mut output = Vec::new();
        runtime.serve(Cursor::new(input), &mut output).unwrap();

        let mut cursor = Cursor::new(output);
        let mut responses = Vec::new();
        while (cursor.position() as usize) < cursor.get_ref().len() {
            responses.push(read_message(&mut cursor).unwrap());
        }
        responses
    }

    fn execute(unit: &str, call: &CallArgs) -> WorkerCommand {
        WorkerCommand::Execute {
            unit: unit.to_string(),
            args_json: call.to_json().unwrap(),
        }
    }

    #[test]
    fn test_execute_with_defaults_and_globals() {
        let call = CallArgs {
            args: vec![Value::Int(5)],
            ..CallArgs::default()
        };
        let responses = exchange(&runtime(), &[WorkerCommand::Ping, execute("add", &call)]);

        assert!(matches!(responses[0], WorkerResponse::Pong));
        match &responses[1] {
            WorkerResponse::Output { value_json } => {
                let value: Value = serde_json::from_slice(value_json).unwrap();
                assert_eq!(value, Value::Int(16));
            }
            other => panic!("unexpected response: {:?}", other),
        }
    }

    #[test]
    fn test_unit_error_and_panic() {
        let responses = exchange(
            &runtime(),
            &[
                execute("add", &CallArgs::default()),
                execute("boom", &CallArgs::default()),
                execute("missing", &CallArgs::default()),
            ],
        );

        assert!(
            matches!(&responses[0], WorkerResponse::Error { message } if message.contains("parameter a"))
        );
        assert!(
            matches!(&responses[1], WorkerResponse::Panic { message } if message == "kaboom")
        );
        assert!(
            matches!(&responses[2], WorkerResponse::UnknownUnit { unit } if unit == "missing")
        );
    }

    #[test]
    fn test_describe_and_shutdown() {
        let responses = exchange(
            &runtime(),
            &[
                WorkerCommand::Describe,
                WorkerCommand::Shutdown,
                // Never read: the loop exits on Shutdown.
                WorkerCommand::Ping,
            ],
        );
        assert_eq!(responses.len(), 2);

        let WorkerResponse::Catalog { catalog_json } = &responses[0] else {
            panic!("expected a catalog");
        };
        let catalog: Catalog = serde_json::from_slice(catalog_json).unwrap();
        assert_eq!(catalog.units.len(), 2);
        assert_eq!(catalog.globals.get("OFFSET"), Some(&Value::Int(10)));
        assert!(matches!(responses[1], WorkerResponse::ShuttingDown));
    }
}
