//! Frame encoding and the first stage of the two-stage parse.

use borsh::BorshDeserialize;
use thiserror::Error;

/// Upper bound on a frame body, to keep a malformed or hostile length prefix
/// from ballooning the read buffer.
pub const MAX_FRAME_LEN: usize = 4 * 1024 * 1024;

/// Message opcodes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum Opcode {
    Propose = 0,
    Vote = 1,
    ReqBlock = 2,
    RespBlock = 3,
    Status = 4,
    NewView = 5,
    Blame = 6,
    BlameNotify = 7,
    Notify = 8,
}

impl Opcode {
    /// Parse an opcode byte.
    pub fn from_byte(byte: u8) -> Option<Self> {
        Some(match byte {
            0 => Opcode::Propose,
            1 => Opcode::Vote,
            2 => Opcode::ReqBlock,
            3 => Opcode::RespBlock,
            4 => Opcode::Status,
            5 => Opcode::NewView,
            6 => Opcode::Blame,
            7 => Opcode::BlameNotify,
            8 => Opcode::Notify,
            _ => return None,
        })
    }

    /// Name for logging and metrics.
    pub fn name(&self) -> &'static str {
        match self {
            Opcode::Propose => "Propose",
            Opcode::Vote => "Vote",
            Opcode::ReqBlock => "ReqBlock",
            Opcode::RespBlock => "RespBlock",
            Opcode::Status => "Status",
            Opcode::NewView => "NewView",
            Opcode::Blame => "Blame",
            Opcode::BlameNotify => "BlameNotify",
            Opcode::Notify => "Notify",
        }
    }
}

/// Errors from framing or body parsing.
#[derive(Debug, Error)]
pub enum CodecError {
    #[error("unknown opcode {0:#04x}")]
    UnknownOpcode(u8),

    #[error("frame body of {0} bytes exceeds limit of {MAX_FRAME_LEN}")]
    FrameTooLarge(usize),

    #[error("malformed body for {opcode}: {source}")]
    MalformedBody {
        opcode: &'static str,
        source: std::io::Error,
    },
}

/// A received frame with its header parsed and its body untouched.
///
/// The typed body parse, [`RawFrame::parse`], is deferred until the node
/// dispatcher runs with the consensus core available, so decoded blocks go
/// straight into the canonical store.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawFrame {
    /// The parsed opcode.
    pub opcode: Opcode,
    /// The unparsed body bytes.
    pub body: Vec<u8>,
}

impl RawFrame {
    /// Decode one frame from the front of `buf`.
    ///
    /// Returns `Ok(None)` when the buffer does not yet hold a complete
    /// frame, otherwise the frame and the number of bytes consumed.
    pub fn decode(buf: &[u8]) -> Result<Option<(RawFrame, usize)>, CodecError> {
        if buf.len() < 5 {
            return Ok(None);
        }
        let opcode = Opcode::from_byte(buf[0]).ok_or(CodecError::UnknownOpcode(buf[0]))?;
        let len = u32::from_le_bytes(buf[1..5].try_into().expect("4 bytes")) as usize;
        if len > MAX_FRAME_LEN {
            return Err(CodecError::FrameTooLarge(len));
        }
        if buf.len() < 5 + len {
            return Ok(None);
        }
        let frame = RawFrame {
            opcode,
            body: buf[5..5 + len].to_vec(),
        };
        Ok(Some((frame, 5 + len)))
    }

    /// Second-stage parse of the body into a typed message.
    pub fn parse<T: BorshDeserialize>(&self) -> Result<T, CodecError> {
        borsh::from_slice(&self.body).map_err(|source| CodecError::MalformedBody {
            opcode: self.opcode.name(),
            source,
        })
    }
}

/// Encode a frame: `opcode:1 | length:4_LE | body`.
pub fn encode_frame(opcode: Opcode, body: &[u8]) -> Vec<u8> {
    let mut bytes = Vec::with_capacity(5 + body.len());
    bytes.push(opcode as u8);
    bytes.extend_from_slice(&(body.len() as u32).to_le_bytes());
    bytes.extend_from_slice(body);
    bytes
}
