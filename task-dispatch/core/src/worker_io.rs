// Copyright 2025 Umberto Gotti <umberto.gotti@umbertogotti.dev>
// Licensed under the Apache License, Version 2.0
// http://www.apache.org/licenses/LICENSE-2.0

use crate::error::TransportError;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::io::{ErrorKind, Read, Write};

/// Largest frame accepted by default, matches the coordinator's codec limit
pub const DEFAULT_MAX_FRAME: usize = 64 * 1024 * 1024;

/// Trait for the worker's end of its input and output channels
pub trait WorkerTransport {
    /// Receive the next message
    /// Returns None if the coordinator closed the channel
    fn recv<M: DeserializeOwned>(&mut self) -> Result<Option<M>, TransportError>;

    /// Send a message; it is flushed before returning
    fn send<M: Serialize>(&mut self, message: &M) -> Result<(), TransportError>;
}

/// Length-prefixed bincode frames over a blocking reader/writer pair.
///
/// Each frame is a 4-byte big-endian length followed by the encoded body, the
/// layout the coordinator's `LengthDelimitedCodec` produces with default settings.
pub struct FramedIo<R, W> {
    reader: R,
    writer: W,
    max_frame: usize,
}

impl<R: Read, W: Write> FramedIo<R, W> {
    pub fn new(reader: R, writer: W) -> Self {
        Self {
            reader,
            writer,
            max_frame: DEFAULT_MAX_FRAME,
        }
    }

    pub fn with_max_frame(mut self, max_frame: usize) -> Self {
        self.max_frame = max_frame;
        self
    }

    fn read_frame(&mut self) -> Result<Option<Vec<u8>>, TransportError> {
        let mut len_bytes = [0u8; 4];
        match self.reader.read_exact(&mut len_bytes) {
            Ok(()) => {}
            Err(e) if e.kind() == ErrorKind::UnexpectedEof => return Ok(None),
            Err(e) => return Err(e.into()),
        }
        let len = u32::from_be_bytes(len_bytes) as usize;
        if len > self.max_frame {
            return Err(TransportError::FrameTooLarge {
                len,
                max: self.max_frame,
            });
        }
        let mut buffer = vec![0u8; len];
        self.reader.read_exact(&mut buffer)?;
        Ok(Some(buffer))
    }

    fn write_frame(&mut self, body: &[u8]) -> Result<(), TransportError> {
        if body.len() > self.max_frame {
            return Err(TransportError::FrameTooLarge {
                len: body.len(),
                max: self.max_frame,
            });
        }
        let len = body.len() as u32;
        self.writer.write_all(&len.to_be_bytes())?;
        self.writer.write_all(body)?;
        self.writer.flush()?;
        Ok(())
    }
}

impl<R: Read, W: Write> WorkerTransport for FramedIo<R, W> {
    fn recv<M: DeserializeOwned>(&mut self) -> Result<Option<M>, TransportError> {
        match self.read_frame()? {
            Some(body) => Ok(Some(bincode::deserialize(&body)?)),
            None => Ok(None),
        }
    }

    fn send<M: Serialize>(&mut self, message: &M) -> Result<(), TransportError> {
        let body = bincode::serialize(message)?;
        self.write_frame(&body)
    }
}

/// Encodes messages as frames; used to script a worker's input in tests and tools
pub fn encode_frames<M: Serialize>(messages: &[M]) -> Result<Vec<u8>, TransportError> {
    let mut out = Vec::new();
    {
        let mut framed = FramedIo::new(std::io::empty(), &mut out);
        for message in messages {
            framed.send(message)?;
        }
    }
    Ok(out)
}

/// Decodes every frame in `bytes` as `M`
pub fn decode_frames<M: DeserializeOwned>(bytes: &[u8]) -> Result<Vec<M>, TransportError> {
    let mut framed = FramedIo::new(bytes, std::io::sink());
    let mut messages = Vec::new();
    while let Some(message) = framed.recv()? {
        messages.push(message);
    }
    Ok(messages)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::worker_message::WorkerCommand;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_frames_use_big_endian_length_prefix() {
        let bytes = encode_frames(&[WorkerCommand::<u8>::Shutdown]).unwrap();
        let body = bincode::serialize(&WorkerCommand::<u8>::Shutdown).unwrap();
        assert_eq!(&bytes[..4], &(body.len() as u32).to_be_bytes());
        assert_eq!(&bytes[4..], &body[..]);
    }

    #[test]
    fn test_eof_between_frames_is_clean_close() {
        let bytes = encode_frames(&[
            WorkerCommand::Work {
                index: 0,
                payload: 7i64,
            },
            WorkerCommand::Shutdown,
        ])
        .unwrap();
        let decoded: Vec<WorkerCommand<i64>> = decode_frames(&bytes).unwrap();
        assert_eq!(
            decoded,
            vec![
                WorkerCommand::Work {
                    index: 0,
                    payload: 7
                },
                WorkerCommand::Shutdown
            ]
        );
    }

    #[test]
    fn test_truncated_body_is_an_error() {
        let mut bytes = encode_frames(&[WorkerCommand::<u8>::Shutdown]).unwrap();
        bytes.pop();
        let mut framed = FramedIo::new(&bytes[..], std::io::sink());
        assert!(matches!(
            framed.recv::<WorkerCommand<u8>>(),
            Err(TransportError::Io(_))
        ));
    }

    #[test]
    fn test_oversized_frame_is_rejected() {
        let bytes = encode_frames(&[WorkerCommand::Work {
            index: 1,
            payload: vec![0u8; 64],
        }])
        .unwrap();
        let mut framed = FramedIo::new(&bytes[..], std::io::sink()).with_max_frame(16);
        assert!(matches!(
            framed.recv::<WorkerCommand<Vec<u8>>>(),
            Err(TransportError::FrameTooLarge { max: 16, .. })
        ));
    }

    #[test]
    fn test_non_finite_floats_cross_the_transport() {
        let bytes = encode_frames(&[WorkerCommand::Work {
            index: 1,
            payload: (f64::NAN, f64::INFINITY),
        }])
        .unwrap();
        let decoded: Vec<WorkerCommand<(f64, f64)>> = decode_frames(&bytes).unwrap();
        let &[WorkerCommand::Work {
            index: 1,
            payload: (nan, inf),
        }] = &decoded[..]
        else {
            panic!("unexpected frames {decoded:?}");
        };
        assert!(nan.is_nan());
        assert_eq!(inf, f64::INFINITY);
    }
}
