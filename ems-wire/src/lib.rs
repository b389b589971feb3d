//! Wire protocol shared by the EMS server and clients.
//!
//! Every message is an opcode byte followed by a fixed-order sequence of
//! binary fields. Integers travel in native byte order — the channel is a
//! local named pipe, both ends run the same build — but size fields are
//! pinned to u64 so a 32-bit client can still talk to a 64-bit server.
//! Variable-length fields (seat arrays, grid snapshots, id lists) are
//! preceded by their count.
//!
//! Opcodes are ASCII digits so a handshake is recognizable in a hex dump:
//! `'1'` SETUP through `'6'` LIST.

use std::path::{Path, PathBuf};

use bytes::{Buf, BufMut, Bytes, BytesMut};
use thiserror::Error;

/// Maximum length of a per-session pipe path inside a handshake.
pub const MAX_PIPE_PATH_BYTES: usize = 40;

/// Exact size of a handshake message on the rendezvous channel:
/// opcode + two padded paths + one reserved byte.
pub const HANDSHAKE_BYTES: usize = 1 + 2 * MAX_PIPE_PATH_BYTES + 1;

/// Default upper bound on seats per RESERVE call. Enforced at the framing
/// layer, before a request reaches the engine.
pub const DEFAULT_MAX_RESERVATION: usize = 256;

#[derive(Debug, Error)]
pub enum WireError {
    #[error("unknown opcode {0:#04x}")]
    UnknownOpcode(u8),
    #[error("frame truncated: expected at least {expected} bytes, got {got}")]
    Truncated { expected: usize, got: usize },
    #[error("reservation of {n} seats exceeds the limit of {max}")]
    ReservationTooLarge { n: u64, max: usize },
    #[error("reservation requests no seats")]
    EmptyReservation,
    #[error("pipe path longer than {MAX_PIPE_PATH_BYTES} bytes")]
    PathTooLong,
    #[error("handshake carries an empty pipe path")]
    EmptyPath,
    #[error("trailing garbage after frame: {0} bytes")]
    TrailingBytes(usize),
}

/// Request opcodes. The discriminants are the bytes on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Opcode {
    Setup = b'1',
    Quit = b'2',
    Create = b'3',
    Reserve = b'4',
    Show = b'5',
    List = b'6',
}

impl Opcode {
    pub fn from_byte(b: u8) -> Result<Self, WireError> {
        match b {
            b'1' => Ok(Opcode::Setup),
            b'2' => Ok(Opcode::Quit),
            b'3' => Ok(Opcode::Create),
            b'4' => Ok(Opcode::Reserve),
            b'5' => Ok(Opcode::Show),
            b'6' => Ok(Opcode::List),
            other => Err(WireError::UnknownOpcode(other)),
        }
    }

    /// Bytes of fixed payload that follow the opcode, before any
    /// count-prefixed tail. Lets a reader size its next read without
    /// decoding the frame.
    pub fn fixed_payload_len(self) -> usize {
        match self {
            Opcode::Setup => HANDSHAKE_BYTES - 1,
            Opcode::Quit | Opcode::List => 0,
            // u32 event_id + u64 rows + u64 cols
            Opcode::Create => 4 + 8 + 8,
            // u32 event_id + u64 n; xs/ys follow
            Opcode::Reserve => 4 + 8,
            // u32 event_id
            Opcode::Show => 4,
        }
    }
}

/// Seat count announced by a RESERVE fixed payload (the bytes after the
/// opcode). The xs/ys tail is `16 * n` bytes.
pub fn reserve_seat_count(fixed: &[u8]) -> Result<u64, WireError> {
    if fixed.len() < Opcode::Reserve.fixed_payload_len() {
        return Err(WireError::Truncated {
            expected: Opcode::Reserve.fixed_payload_len(),
            got: fixed.len(),
        });
    }
    Ok(u64::from_ne_bytes(fixed[4..12].try_into().unwrap()))
}

/// The initial message a client writes to the rendezvous channel: the two
/// pipe paths it has already created, each NUL-padded to a fixed field.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Handshake {
    pub req_path: PathBuf,
    pub resp_path: PathBuf,
}

impl Handshake {
    pub fn new(req_path: impl Into<PathBuf>, resp_path: impl Into<PathBuf>) -> Self {
        Self {
            req_path: req_path.into(),
            resp_path: resp_path.into(),
        }
    }

    pub fn encode(&self) -> Result<[u8; HANDSHAKE_BYTES], WireError> {
        let mut msg = [0u8; HANDSHAKE_BYTES];
        msg[0] = Opcode::Setup as u8;
        write_path_field(&self.req_path, &mut msg[1..1 + MAX_PIPE_PATH_BYTES])?;
        write_path_field(
            &self.resp_path,
            &mut msg[1 + MAX_PIPE_PATH_BYTES..1 + 2 * MAX_PIPE_PATH_BYTES],
        )?;
        Ok(msg)
    }

    pub fn decode(msg: &[u8]) -> Result<Self, WireError> {
        if msg.len() < HANDSHAKE_BYTES {
            return Err(WireError::Truncated {
                expected: HANDSHAKE_BYTES,
                got: msg.len(),
            });
        }
        let op = Opcode::from_byte(msg[0])?;
        if op != Opcode::Setup {
            return Err(WireError::UnknownOpcode(msg[0]));
        }
        let req_path = read_path_field(&msg[1..1 + MAX_PIPE_PATH_BYTES])?;
        let resp_path =
            read_path_field(&msg[1 + MAX_PIPE_PATH_BYTES..1 + 2 * MAX_PIPE_PATH_BYTES])?;
        Ok(Self {
            req_path,
            resp_path,
        })
    }
}

fn write_path_field(path: &Path, field: &mut [u8]) -> Result<(), WireError> {
    use std::os::unix::ffi::OsStrExt;
    let bytes = path.as_os_str().as_bytes();
    if bytes.is_empty() {
        return Err(WireError::EmptyPath);
    }
    if bytes.len() > field.len() {
        return Err(WireError::PathTooLong);
    }
    field[..bytes.len()].copy_from_slice(bytes);
    Ok(())
}

fn read_path_field(field: &[u8]) -> Result<PathBuf, WireError> {
    use std::ffi::OsStr;
    use std::os::unix::ffi::OsStrExt;
    let end = field.iter().position(|&b| b == 0).unwrap_or(field.len());
    let mut bytes = &field[..end];
    // Tolerate space padding as well as NUL padding.
    while let [rest @ .., b' '] = bytes {
        bytes = rest;
    }
    if bytes.is_empty() {
        return Err(WireError::EmptyPath);
    }
    Ok(PathBuf::from(OsStr::from_bytes(bytes)))
}

/// A framed request on a session's request channel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Request {
    Quit,
    Create {
        event_id: u32,
        rows: u64,
        cols: u64,
    },
    Reserve {
        event_id: u32,
        xs: Vec<u64>,
        ys: Vec<u64>,
    },
    Show {
        event_id: u32,
    },
    List,
}

impl Request {
    pub fn opcode(&self) -> Opcode {
        match self {
            Request::Quit => Opcode::Quit,
            Request::Create { .. } => Opcode::Create,
            Request::Reserve { .. } => Opcode::Reserve,
            Request::Show { .. } => Opcode::Show,
            Request::List => Opcode::List,
        }
    }

    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::new();
        buf.put_u8(self.opcode() as u8);
        match self {
            Request::Quit | Request::List => {}
            Request::Create {
                event_id,
                rows,
                cols,
            } => {
                buf.put_u32_ne(*event_id);
                buf.put_u64_ne(*rows);
                buf.put_u64_ne(*cols);
            }
            Request::Reserve { event_id, xs, ys } => {
                debug_assert_eq!(xs.len(), ys.len());
                buf.put_u32_ne(*event_id);
                buf.put_u64_ne(xs.len() as u64);
                for x in xs {
                    buf.put_u64_ne(*x);
                }
                for y in ys {
                    buf.put_u64_ne(*y);
                }
            }
            Request::Show { event_id } => {
                buf.put_u32_ne(*event_id);
            }
        }
        buf.freeze()
    }

    /// Decode one complete request frame. `max_reservation` bounds the seat
    /// count accepted for RESERVE; anything over it (or zero) never reaches
    /// the engine.
    pub fn decode(frame: &[u8], max_reservation: usize) -> Result<Self, WireError> {
        let mut buf = frame;
        if buf.is_empty() {
            return Err(WireError::Truncated {
                expected: 1,
                got: 0,
            });
        }
        let op = Opcode::from_byte(buf.get_u8())?;
        let req = match op {
            Opcode::Setup => return Err(WireError::UnknownOpcode(op as u8)),
            Opcode::Quit => Request::Quit,
            Opcode::List => Request::List,
            Opcode::Create => {
                need(buf, 4 + 8 + 8, frame.len())?;
                Request::Create {
                    event_id: buf.get_u32_ne(),
                    rows: buf.get_u64_ne(),
                    cols: buf.get_u64_ne(),
                }
            }
            Opcode::Show => {
                need(buf, 4, frame.len())?;
                Request::Show {
                    event_id: buf.get_u32_ne(),
                }
            }
            Opcode::Reserve => {
                need(buf, 4 + 8, frame.len())?;
                let event_id = buf.get_u32_ne();
                let n = buf.get_u64_ne();
                if n == 0 {
                    return Err(WireError::EmptyReservation);
                }
                if n > max_reservation as u64 {
                    return Err(WireError::ReservationTooLarge {
                        n,
                        max: max_reservation,
                    });
                }
                let n = n as usize;
                need(buf, 16 * n, frame.len())?;
                let xs = (0..n).map(|_| buf.get_u64_ne()).collect();
                let ys = (0..n).map(|_| buf.get_u64_ne()).collect();
                Request::Reserve { event_id, xs, ys }
            }
        };
        if buf.has_remaining() {
            return Err(WireError::TrailingBytes(buf.remaining()));
        }
        Ok(req)
    }
}

fn need(buf: &[u8], n: usize, frame_len: usize) -> Result<(), WireError> {
    if buf.remaining() < n {
        Err(WireError::Truncated {
            expected: frame_len + (n - buf.remaining()),
            got: frame_len,
        })
    } else {
        Ok(())
    }
}

/// A framed response on a session's response channel. Error responses carry
/// only the status; the data tail is present on success.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Response {
    Setup {
        session_id: i32,
    },
    /// CREATE and RESERVE replies.
    Status {
        status: i32,
    },
    Show {
        status: i32,
        rows: u64,
        cols: u64,
        seats: Vec<u64>,
    },
    List {
        status: i32,
        ids: Vec<u32>,
    },
}

impl Response {
    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::new();
        match self {
            Response::Setup { session_id } => buf.put_i32_ne(*session_id),
            Response::Status { status } => buf.put_i32_ne(*status),
            Response::Show {
                status,
                rows,
                cols,
                seats,
            } => {
                buf.put_i32_ne(*status);
                if *status == 0 {
                    buf.put_u64_ne(*rows);
                    buf.put_u64_ne(*cols);
                    for s in seats {
                        buf.put_u64_ne(*s);
                    }
                }
            }
            Response::List { status, ids } => {
                buf.put_i32_ne(*status);
                if *status == 0 {
                    buf.put_u64_ne(ids.len() as u64);
                    for id in ids {
                        buf.put_u32_ne(*id);
                    }
                }
            }
        }
        buf.freeze()
    }

    /// Decode a complete response frame for the request kind it answers.
    pub fn decode(answers: Opcode, frame: &[u8]) -> Result<Self, WireError> {
        let mut buf = frame;
        need(buf, 4, frame.len())?;
        let status = buf.get_i32_ne();
        let resp = match answers {
            Opcode::Setup => Response::Setup { session_id: status },
            Opcode::Quit | Opcode::Create | Opcode::Reserve => Response::Status { status },
            Opcode::Show => {
                if status != 0 {
                    Response::Show {
                        status,
                        rows: 0,
                        cols: 0,
                        seats: Vec::new(),
                    }
                } else {
                    need(buf, 16, frame.len())?;
                    let rows = buf.get_u64_ne();
                    let cols = buf.get_u64_ne();
                    let count = (rows * cols) as usize;
                    need(buf, 8 * count, frame.len())?;
                    let seats = (0..count).map(|_| buf.get_u64_ne()).collect();
                    Response::Show {
                        status,
                        rows,
                        cols,
                        seats,
                    }
                }
            }
            Opcode::List => {
                if status != 0 {
                    Response::List {
                        status,
                        ids: Vec::new(),
                    }
                } else {
                    need(buf, 8, frame.len())?;
                    let count = buf.get_u64_ne() as usize;
                    need(buf, 4 * count, frame.len())?;
                    let ids = (0..count).map(|_| buf.get_u32_ne()).collect();
                    Response::List { status, ids }
                }
            }
        };
        if buf.has_remaining() {
            return Err(WireError::TrailingBytes(buf.remaining()));
        }
        Ok(resp)
    }
}
