//! IPC protocol messages for magma worker processes.
//!
//! Uses length-prefixed rkyv messages over stdin/stdout.
//! Format: 4-byte length (u32 LE) + rkyv-encoded message.

use std::io::{Read, Write};

use rkyv::util::AlignedVec;
use rkyv::{Archive, Deserialize, Serialize};

use crate::error::{Error, Result};

/// Largest message accepted from the other side (100MB).
pub const MAX_MESSAGE_LEN: usize = 100 * 1024 * 1024;

/// Command sent from parent to worker process.
#[derive(Debug, Clone, Archive, Serialize, Deserialize)]
pub enum WorkerCommand {
    /// Ping to check if worker is alive.
    Ping,

    /// Execute one cell, statement by statement.
    Run {
        /// Document the cell belongs to, for logging.
        document_id: String,
        /// Cell source, line 1 being the first line after the opening marker.
        source: String,
        /// Serialized namespace variables (see `namespace::encode_variables`).
        snapshot: Vec<u8>,
        /// Import statements to replay before running.
        imports: Vec<String>,
        /// Namespace file the worker checkpoints to after every statement.
        namespace_path: String,
    },

    /// Shutdown the worker process gracefully.
    Shutdown,
}

/// A top-level name bound to a serialized value.
#[derive(Debug, Clone, PartialEq, Archive, Serialize, Deserialize)]
pub struct VariableEntry {
    pub name: String,
    /// Value encoded with `namespace::encode_value`.
    pub bytes: Vec<u8>,
}

/// Response sent from worker to parent process.
#[derive(Debug, Clone, Archive, Serialize, Deserialize)]
pub enum WorkerResponse {
    /// Response to Ping command.
    Pong,

    /// One completed line of printed text, without its newline.
    Output { line: String },

    /// Namespace changes made by the statement that just finished.
    Delta {
        variables: Vec<VariableEntry>,
        removed: Vec<String>,
        imports: Vec<String>,
    },

    /// Formatted trace of an unhandled error.
    Failure { lines: Vec<String> },

    /// Always the last message of a run.
    Done { error: bool },
}

/// Write a message to a writer using length-prefixed rkyv encoding.
pub fn write_message<W: Write>(
    writer: &mut W,
    message: &impl for<'a> Serialize<
        rkyv::rancor::Strategy<
            rkyv::ser::Serializer<
                AlignedVec,
                rkyv::ser::allocator::ArenaHandle<'a>,
                rkyv::ser::sharing::Share,
            >,
            rkyv::rancor::Error,
        >,
    >,
) -> Result<()> {
    let bytes = rkyv::to_bytes::<rkyv::rancor::Error>(message)
        .map_err(|e| Error::Serialization(format!("Failed to encode IPC message: {}", e)))?;

    if bytes.len() > MAX_MESSAGE_LEN {
        return Err(Error::Ipc(format!("IPC message too large: {} bytes", bytes.len())));
    }

    let len = bytes.len() as u32;
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
/// sources (our own worker processes).
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

    let mut bytes = vec![0u8; len];
    reader
        .read_exact(&mut bytes)
        .map_err(|e| Error::Ipc(format!("Failed to read IPC message body: {}", e)))?;

    // Archived data must be aligned before it is accessed.
    let mut aligned = AlignedVec::<16>::with_capacity(len);
    aligned.extend_from_slice(&bytes);

    // SAFETY: the bytes come from our own worker or parent process.
    let message = unsafe { rkyv::from_bytes_unchecked::<T, rkyv::rancor::Error>(&aligned) }
        .map_err(|e| Error::Serialization(format!("Failed to decode IPC message: {}", e)))?;

    Ok(message)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    #[test]
    fn test_run_command_roundtrip() {
        let cmd = WorkerCommand::Run {
            document_id: "/notes/a.txt".to_string(),
            source: "x = 1\nprint(x)".to_string(),
            snapshot: vec![1, 2, 3],
            imports: vec!["import math".to_string()],
            namespace_path: "/tmp/a.ns".to_string(),
        };

        let mut buf = Vec::new();
        write_message(&mut buf, &cmd).unwrap();

        let mut cursor = Cursor::new(buf);
        let decoded: WorkerCommand = read_message(&mut cursor).unwrap();

        match decoded {
            WorkerCommand::Run {
                document_id,
                source,
                snapshot,
                imports,
                namespace_path,
            } => {
                assert_eq!(document_id, "/notes/a.txt");
                assert_eq!(source, "x = 1\nprint(x)");
                assert_eq!(snapshot, vec![1, 2, 3]);
                assert_eq!(imports, vec!["import math"]);
                assert_eq!(namespace_path, "/tmp/a.ns");
            }
            _ => panic!("Wrong command type"),
        }
    }

    #[test]
    fn test_stream_of_responses() {
        let mut buf = Vec::new();
        write_message(&mut buf, &WorkerResponse::Output { line: "1".to_string() }).unwrap();
        write_message(
            &mut buf,
            &WorkerResponse::Delta {
                variables: vec![VariableEntry {
                    name: "x".to_string(),
                    bytes: vec![2, 2],
                }],
                removed: vec![],
                imports: vec![],
            },
        )
        .unwrap();
        write_message(&mut buf, &WorkerResponse::Done { error: false }).unwrap();

        let mut cursor = Cursor::new(buf);
        let first: WorkerResponse = read_message(&mut cursor).unwrap();
        assert!(matches!(first, WorkerResponse::Output { ref line } if line == "1"));

        match read_message::<_, WorkerResponse>(&mut cursor).unwrap() {
            WorkerResponse::Delta { variables, .. } => {
                assert_eq!(variables[0].name, "x");
                assert_eq!(variables[0].bytes, vec![2, 2]);
            }
            other => panic!("Wrong response type: {:?}", other),
        }
        assert!(matches!(
            read_message::<_, WorkerResponse>(&mut cursor).unwrap(),
            WorkerResponse::Done { error: false }
        ));

        // Stream exhausted
        assert!(read_message::<_, WorkerResponse>(&mut cursor).is_err());
    }

    #[test]
    fn test_oversized_length_rejected() {
        let len = (MAX_MESSAGE_LEN as u32 + 1).to_le_bytes();
        let mut cursor = Cursor::new(len.to_vec());
        let result: Result<WorkerResponse> = read_message(&mut cursor);
        assert!(matches!(result, Err(Error::Ipc(msg)) if msg.contains("too large")));
    }

    #[test]
    fn test_truncated_body_is_ipc_error() {
        let mut buf = Vec::new();
        write_message(&mut buf, &WorkerCommand::Ping).unwrap();
        buf.truncate(buf.len() - 1);

        let mut cursor = Cursor::new(buf);
        let result: Result<WorkerCommand> = read_message(&mut cursor);
        assert!(matches!(result, Err(Error::Ipc(_))));
    }
}
