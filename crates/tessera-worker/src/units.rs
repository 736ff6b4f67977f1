//! Built-in units served by the `tessera-worker` binary.
//!
//! They double as a template for user worker programs and as fixtures for
//! the pool, cache and reload tests.

use std::fs::OpenOptions;
use std::io::Write;
use std::thread;
use std::time::Duration;

use anyhow::{Context, bail};
use sha2::{Digest, Sha256};
use tessera_core::{FunctionDescriptor, Value};

use crate::runtime::{Invocation, WorkerRuntime};

/// Salt mixed into tile checksums; read by `tile_checksum`.
pub const TILE_SALT: &str = "tessera";

fn hold(inv: &Invocation<'_>) {
    let ms = inv.kwarg("hold_ms").and_then(Value::as_i64).unwrap_or(0);
    if ms > 0 {
        thread::sleep(Duration::from_millis(ms as u64));
    }
}

/// Register every built-in unit and global.
pub fn register_builtins(runtime: &mut WorkerRuntime) {
    runtime.global("TILE_SALT", TILE_SALT);

    runtime
        .unit(FunctionDescriptor::new("noop", "noop/v1"), |_| Ok(Value::Null))
        .unit(
            FunctionDescriptor::new("worker_id", "worker_id/v1").with_default("hold_ms", 0),
            |inv| {
                hold(inv);
                Ok(Value::Int(i64::from(std::process::id())))
            },
        )
        .unit(FunctionDescriptor::new("echo", "echo/v1"), |inv| {
            Ok(match inv.call.args.as_slice() {
                [single] => single.clone(),
                args => Value::Seq(args.to_vec()),
            })
        })
        .unit(FunctionDescriptor::new("sleep_ms", "sleep_ms/v1"), |inv| {
            let ms = inv.int(0, "ms")?;
            thread::sleep(Duration::from_millis(ms.max(0) as u64));
            Ok(Value::Int(ms))
        })
        .unit(FunctionDescriptor::new("fail", "fail/v1"), |inv| {
            let message = inv
                .param(0, "message")
                .and_then(Value::as_str)
                .unwrap_or("unit failed");
            bail!("{}", message)
        })
        .unit(FunctionDescriptor::new("panic", "panic/v1"), |_| {
            panic!("unit panicked on purpose")
        })
        .unit(FunctionDescriptor::new("abort", "abort/v1"), |_| {
            std::process::abort()
        })
        .unit(
            FunctionDescriptor::new("record_call", "record_call/v1").with_default("hold_ms", 0),
            |inv| {
                let path = inv
                    .param(0, "path")
                    .and_then(Value::as_str)
                    .context("record_call needs a path")?;
                let mut file = OpenOptions::new()
                    .create(true)
                    .append(true)
                    .open(path)
                    .with_context(|| format!("opening {}", path))?;
                writeln!(file, "{}", std::process::id())?;
                hold(inv);
                Ok(Value::from(path))
            },
        )
        .unit(
            FunctionDescriptor::new("tile_checksum", "tile_checksum/v1").reads_global("TILE_SALT"),
            |inv| {
                let z = inv.int(0, "z")?;
                let x = inv.int(1, "x")?;
                let y = inv.int(2, "y")?;
                if !(0..=30).contains(&z) {
                    bail!("zoom level {} out of range", z);
                }
                let salt = inv.global("TILE_SALT").and_then(Value::as_str).unwrap_or("");
                let digest = Sha256::digest(format!("{}:{}/{}/{}", salt, z, x, y));
                Ok(Value::from(hex::encode(digest)))
            },
        );
}
