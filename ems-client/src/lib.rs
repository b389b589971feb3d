//! Client-side session API for the EMS server.
//!
//! A session owns two named pipes the client creates before the handshake.
//! Each request is one open/write/close of the request pipe followed by one
//! open/read/close of the response pipe; the blocking FIFO opens are the
//! rendezvous with the serving worker. Requests are strictly sequential
//! within a session.

use std::fs::{File, OpenOptions};
use std::io::Read;
use std::io::Write;
use std::path::{Path, PathBuf};

use log::debug;
use nix::sys::stat::Mode;
use thiserror::Error;

use ems_wire::{Handshake, Request, WireError};

#[derive(Debug, Error)]
pub enum ClientError {
    #[error("server rejected the request with status {0}")]
    Rejected(i32),
    #[error(transparent)]
    Wire(#[from] WireError),
    #[error("pipe error: {0}")]
    Io(#[from] std::io::Error),
    #[error("creating pipe {0}: {1}")]
    Mkfifo(PathBuf, nix::Error),
}

/// An event's seat grid as returned by SHOW.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Grid {
    pub rows: u64,
    pub cols: u64,
    pub seats: Vec<u64>,
}

impl Grid {
    /// Value of the 1-based (row, col) seat.
    pub fn seat(&self, row: u64, col: u64) -> u64 {
        self.seats[((row - 1) * self.cols + (col - 1)) as usize]
    }
}

/// One live session with the server, from handshake to QUIT.
pub struct Session {
    req_path: PathBuf,
    resp_path: PathBuf,
    session_id: i32,
}

impl Session {
    /// Create both per-session FIFOs, announce them on the server's
    /// rendezvous pipe, and wait for the session id.
    pub fn setup(
        server_path: &Path,
        req_path: impl Into<PathBuf>,
        resp_path: impl Into<PathBuf>,
    ) -> Result<Self, ClientError> {
        let req_path = req_path.into();
        let resp_path = resp_path.into();
        // Encoding first validates the path lengths before any FIFO exists.
        let message = Handshake::new(&req_path, &resp_path).encode()?;

        let mode = Mode::from_bits_truncate(0o640);
        nix::unistd::mkfifo(&req_path, mode)
            .map_err(|e| ClientError::Mkfifo(req_path.clone(), e))?;
        nix::unistd::mkfifo(&resp_path, mode)
            .map_err(|e| ClientError::Mkfifo(resp_path.clone(), e))?;

        {
            let mut server = OpenOptions::new().write(true).open(server_path)?;
            server.write_all(&message)?;
        }

        let mut resp = File::open(&resp_path)?;
        let session_id = read_i32(&mut resp)?;
        debug!("session {session_id} established");
        Ok(Self {
            req_path,
            resp_path,
            session_id,
        })
    }

    pub fn id(&self) -> i32 {
        self.session_id
    }

    pub fn create(&self, event_id: u32, rows: u64, cols: u64) -> Result<(), ClientError> {
        self.send(&Request::Create {
            event_id,
            rows,
            cols,
        })?;
        let mut resp = File::open(&self.resp_path)?;
        ok_status(read_i32(&mut resp)?)
    }

    pub fn reserve(&self, event_id: u32, seats: &[(u64, u64)]) -> Result<(), ClientError> {
        let (xs, ys): (Vec<u64>, Vec<u64>) = seats.iter().copied().unzip();
        self.send(&Request::Reserve { event_id, xs, ys })?;
        let mut resp = File::open(&self.resp_path)?;
        ok_status(read_i32(&mut resp)?)
    }

    pub fn show(&self, event_id: u32) -> Result<Grid, ClientError> {
        self.send(&Request::Show { event_id })?;
        let mut resp = File::open(&self.resp_path)?;
        ok_status(read_i32(&mut resp)?)?;
        let rows = read_u64(&mut resp)?;
        let cols = read_u64(&mut resp)?;
        let mut seats = Vec::with_capacity((rows * cols) as usize);
        for _ in 0..rows * cols {
            seats.push(read_u64(&mut resp)?);
        }
        Ok(Grid { rows, cols, seats })
    }

    pub fn list(&self) -> Result<Vec<u32>, ClientError> {
        self.send(&Request::List)?;
        let mut resp = File::open(&self.resp_path)?;
        ok_status(read_i32(&mut resp)?)?;
        let count = read_u64(&mut resp)?;
        let mut ids = Vec::with_capacity(count as usize);
        for _ in 0..count {
            ids.push(read_u32(&mut resp)?);
        }
        Ok(ids)
    }

    /// End the session. The server unlinks both FIFOs; QUIT has no reply.
    pub fn quit(self) -> Result<(), ClientError> {
        self.send(&Request::Quit)
    }

    fn send(&self, request: &Request) -> Result<(), ClientError> {
        let mut req = OpenOptions::new().write(true).open(&self.req_path)?;
        req.write_all(&request.encode())?;
        Ok(())
    }
}

fn ok_status(status: i32) -> Result<(), ClientError> {
    if status == 0 {
        Ok(())
    } else {
        Err(ClientError::Rejected(status))
    }
}

fn read_i32(r: &mut impl Read) -> Result<i32, ClientError> {
    let mut buf = [0u8; 4];
    r.read_exact(&mut buf)?;
    Ok(i32::from_ne_bytes(buf))
}

fn read_u32(r: &mut impl Read) -> Result<u32, ClientError> {
    let mut buf = [0u8; 4];
    r.read_exact(&mut buf)?;
    Ok(u32::from_ne_bytes(buf))
}

fn read_u64(r: &mut impl Read) -> Result<u64, ClientError> {
    let mut buf = [0u8; 8];
    r.read_exact(&mut buf)?;
    Ok(u64::from_ne_bytes(buf))
}
