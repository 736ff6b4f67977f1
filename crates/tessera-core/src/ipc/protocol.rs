//! IPC protocol messages for Tessera worker processes.
//!
//! Uses length-prefixed rkyv messages over stdin/stdout.
//! Format: 4-byte length (u32 LE) + rkyv-encoded message.
//!
//! Values, arguments and catalogs travel as JSON byte payloads inside the
//! rkyv frames.

use std::io::{Read, Write};

use rkyv::{Archive, Deserialize, Serialize};

use crate::error::{Error, Result};

/// Largest frame either side will accept.
const MAX_MESSAGE_LEN: usize = 256 * 1024 * 1024;

/// Command sent from the coordinator to a worker process.
#[derive(Debug, Clone, Archive, Serialize, Deserialize)]
pub enum WorkerCommand {
    /// Ping to check if the worker is alive.
    Ping,

    /// Ask for the worker's unit catalog.
    Describe,

    /// Run a registered unit.
    Execute {
        /// Unit name.
        unit: String,
        /// `CallArgs` as JSON. Empty means no arguments.
        args_json: Vec<u8>,
    },

    /// Shutdown the worker process gracefully.
    Shutdown,
}

/// Response sent from a worker to the coordinator.
#[derive(Debug, Clone, Archive, Serialize, Deserialize)]
pub enum WorkerResponse {
    /// Response to Ping.
    Pong,

    /// Response to Describe: a `Catalog` as JSON.
    Catalog { catalog_json: Vec<u8> },

    /// The unit returned a value (`Value` as JSON).
    Output { value_json: Vec<u8> },

    /// The unit returned an error.
    Error { message: String },

    /// The unit panicked.
    Panic { message: String },

    /// No unit with the requested name is registered.
    UnknownUnit { unit: String },

    /// Acknowledgement of shutdown request.
    ShuttingDown,
}

/// Write a message to a writer using length-prefixed rkyv encoding.
pub fn write_message<W: Write>(
    writer: &mut W,
    message: &impl for<'a> Serialize<
        rkyv::rancor::Strategy<
            rkyv::ser::Serializer<
                rkyv::util::AlignedVec,
                rkyv::ser::allocator::ArenaHandle<'a>,
                rkyv::ser::sharing::Share,
            >,
            rkyv::rancor::Error,
        >,
    >,
) -> Result<()> {
    let bytes = rkyv::to_bytes::<rkyv::rancor::Error>(message)
        .map_err(|e| Error::Serialization(format!("Failed to encode IPC message: {}", e)))?;

    let len = u32::try_from(bytes.len())
        .map_err(|_| Error::Ipc(format!("IPC message too large: {} bytes", bytes.len())))?;
    writer
        .write_all(&len.to_le_bytes())
        .map_err(|e| Error::Ipc(format!("Failed to write IPC message length: {}", e)))?;
    writer
        .write_all(&bytes)
        .map_err(|e| Error::Ipc(format!("Failed to write IPC message body: {}", e)))?;
    writer
        .flush()
        .map_err(|e| Error::Ipc(format!("Failed to flush IPC stream: {}", e)))?;

    Ok(())
}

/// Read a message from a reader using length-prefixed rkyv encoding.
///
/// # Safety
///
/// Uses unchecked deserialization. Only safe when reading from trusted
/// sources: our own worker processes or the coordinator that spawned us.
pub fn read_message<R: Read, T>(reader: &mut R) -> Result<T>
where
    T: Archive,
    T::Archived: Deserialize<T, rkyv::rancor::Strategy<rkyv::de::Pool, rkyv::rancor::Error>>,
{
    let mut len_bytes = [0u8; 4];
    reader
        .read_exact(&mut len_bytes)
        .map_err(|e| Error::Ipc(format!("Failed to read IPC message length: {}", e)))?;
    let len = u32::from_le_bytes(len_bytes) as usize;

    if len > MAX_MESSAGE_LEN {
        return Err(Error::Ipc(format!("IPC message too large: {} bytes", len)));
    }

    let mut bytes = rkyv::util::AlignedVec::<16>::with_capacity(len);
    bytes.resize(len, 0);
    reader
        .read_exact(&mut bytes)
        .map_err(|e| Error::Ipc(format!("Failed to read IPC message body: {}", e)))?;

    // SAFETY: frames come from a process we spawned (or that spawned us)
    // and were produced by `write_message` with the same types.
    let message = unsafe { rkyv::from_bytes_unchecked::<T, rkyv::rancor::Error>(&bytes) }
        .map_err(|e| Error::Deserialization(format!("Failed to decode IPC message: {}", e)))?;

    Ok(message)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    #[test]
    fn test_command_roundtrip() {
        let cmd = WorkerCommand::Execute {
            unit: "tile_checksum".to_string(),
            args_json: br#"{"args":[],"kwargs":{}}"#.to_vec(),
        };

        let mut buf = Vec::new();
        write_message(&mut buf, &cmd).unwrap();

        let mut cursor = Cursor::new(buf);
        let decoded: WorkerCommand = read_message(&mut cursor).unwrap();

        match decoded {
            WorkerCommand::Execute { unit, args_json } => {
                assert_eq!(unit, "tile_checksum");
                assert_eq!(args_json, br#"{"args":[],"kwargs":{}}"#);
            }
            _ => panic!("Wrong command type"),
        }
    }

    #[test]
    fn test_response_sequence() {
        let mut buf = Vec::new();
        write_message(&mut buf, &WorkerResponse::Pong).unwrap();
        write_message(
            &mut buf,
            &WorkerResponse::UnknownUnit {
                unit: "nope".to_string(),
            },
        )
        .unwrap();

        let mut cursor = Cursor::new(buf);
        let first: WorkerResponse = read_message(&mut cursor).unwrap();
        let second: WorkerResponse = read_message(&mut cursor).unwrap();
        assert!(matches!(first, WorkerResponse::Pong));
        assert!(matches!(second, WorkerResponse::UnknownUnit { unit } if unit == "nope"));

        // Stream exhausted.
        let third: Result<WorkerResponse> = read_message(&mut cursor);
        assert!(matches!(third, Err(Error::Ipc(_))));
    }

    #[test]
    fn test_rejects_oversized_length() {
        let mut buf = Vec::new();
        buf.extend_from_slice(&u32::MAX.to_le_bytes());
        let mut cursor = Cursor::new(buf);
        let result: Result<WorkerCommand> = read_message(&mut cursor);
        assert!(matches!(result, Err(Error::Ipc(msg)) if msg.contains("too large")));
    }
}
