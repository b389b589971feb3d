use std::io;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use log::{debug, warn};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::unix::pipe;
use tokio::task::JoinHandle;

use ems_wire::{reserve_seat_count, Opcode, Request, Response, WireError};

use crate::engine::{Ems, EmsError};
use crate::queue::SessionQueue;
use crate::stats::Stats;

const WIRE_OK: i32 = 0;
const WIRE_FAILED: i32 = 1;

/// Launch the fixed worker pool. Each worker serves one session at a time
/// and exits when the session queue closes.
pub fn spawn_pool(
    count: usize,
    queue: Arc<SessionQueue>,
    engine: Arc<Ems>,
    stats: Arc<Stats>,
    max_reservation: usize,
) -> Vec<JoinHandle<()>> {
    (0..count)
        .map(|worker_id| {
            let queue = Arc::clone(&queue);
            let engine = Arc::clone(&engine);
            let stats = Arc::clone(&stats);
            tokio::spawn(async move {
                run_worker(worker_id, queue, engine, stats, max_reservation).await;
            })
        })
        .collect()
}

async fn run_worker(
    worker_id: usize,
    queue: Arc<SessionQueue>,
    engine: Arc<Ems>,
    stats: Arc<Stats>,
    max_reservation: usize,
) {
    while let Some(handshake) = queue.pop().await {
        stats.inc_sessions_started();
        let session = Session {
            worker_id,
            req_path: handshake.req_path,
            resp_path: handshake.resp_path,
            engine: Arc::clone(&engine),
            stats: Arc::clone(&stats),
            max_reservation,
        };
        match session.serve().await {
            Ok(()) => stats.inc_sessions_finished(),
            // A channel error abandons this session only; the worker stays
            // in the pool and the engine never sees the failure.
            Err(e) => {
                warn!("worker {worker_id}: session abandoned: {e}");
                stats.inc_transport_errors();
                unlink_session_pipes(&session.req_path, &session.resp_path);
            }
        }
    }
    debug!("worker {worker_id}: queue closed, exiting");
}

struct Session {
    worker_id: usize,
    req_path: std::path::PathBuf,
    resp_path: std::path::PathBuf,
    engine: Arc<Ems>,
    stats: Arc<Stats>,
    max_reservation: usize,
}

impl Session {
    /// Serve one client from handshake reply to QUIT. Requests within a
    /// session are strictly sequential, so no per-session locking exists;
    /// cross-session ordering comes from the engine's locks alone.
    async fn serve(&self) -> io::Result<()> {
        self.reply(Response::Setup {
            session_id: self.worker_id as i32,
        })
        .await?;

        // Like the rendezvous channel, the request FIFO is held open
        // read+write for the whole session: the write end we keep is what
        // turns "no writer yet" into a pending read instead of an EOF.
        let mut req_rx = self.open_request_channel()?;
        loop {
            let request = match read_request(&mut req_rx, self.max_reservation).await {
                Ok(request) => request,
                Err(ReadError::Io(e)) => return Err(e),
                Err(ReadError::Protocol(e)) => {
                    warn!("worker {}: bad request frame: {e}", self.worker_id);
                    self.stats.inc_protocol_errors();
                    // Resynchronize by cycling the FIFO: closing the last
                    // descriptor discards whatever tail is still buffered.
                    // This must happen before the reply, or the client's
                    // next request could land in the old pipe and vanish.
                    drop(req_rx);
                    req_rx = self.open_request_channel()?;
                    self.reply(Response::Status {
                        status: WIRE_FAILED,
                    })
                    .await?;
                    continue;
                }
            };

            self.stats.inc_requests_total();
            let response = match request {
                Request::Quit => break,
                Request::Create {
                    event_id,
                    rows,
                    cols,
                } => self.status_of(self.engine.create(
                    event_id,
                    rows as usize,
                    cols as usize,
                )),
                Request::Reserve { event_id, xs, ys } => {
                    let coords: Vec<(usize, usize)> = xs
                        .iter()
                        .zip(&ys)
                        .map(|(&x, &y)| (x as usize, y as usize))
                        .collect();
                    self.status_of(self.engine.reserve(event_id, &coords).map(|_| ()))
                }
                Request::Show { event_id } => match self.engine.show(event_id) {
                    Ok(grid) => Response::Show {
                        status: WIRE_OK,
                        rows: grid.rows as u64,
                        cols: grid.cols as u64,
                        seats: grid.seats.iter().map(|&s| u64::from(s)).collect(),
                    },
                    Err(e) => {
                        self.log_rejection(&e);
                        Response::Show {
                            status: WIRE_FAILED,
                            rows: 0,
                            cols: 0,
                            seats: Vec::new(),
                        }
                    }
                },
                Request::List => Response::List {
                    status: WIRE_OK,
                    ids: self.engine.list(),
                },
            };
            self.reply(response).await?;
        }

        debug!("worker {}: session quit", self.worker_id);
        unlink_session_pipes(&self.req_path, &self.resp_path);
        Ok(())
    }

    fn status_of(&self, result: Result<(), EmsError>) -> Response {
        match result {
            Ok(()) => Response::Status { status: WIRE_OK },
            Err(e) => {
                self.log_rejection(&e);
                Response::Status {
                    status: WIRE_FAILED,
                }
            }
        }
    }

    fn log_rejection(&self, e: &EmsError) {
        debug!("worker {}: request rejected: {e}", self.worker_id);
        self.stats.inc_requests_rejected();
    }

    fn open_request_channel(&self) -> io::Result<pipe::Receiver> {
        pipe::OpenOptions::new()
            .read_write(true)
            .open_receiver(&self.req_path)
    }

    /// One reply = one open/write/close of the response FIFO, mirroring the
    /// client's open/read/close per request.
    async fn reply(&self, response: Response) -> io::Result<()> {
        let mut tx = open_sender(&self.resp_path).await?;
        tx.write_all(&response.encode()).await
    }
}

/// Open the write end of a FIFO, waiting for the client's reader to attach.
/// The nonblocking equivalent of a blocking O_WRONLY open.
async fn open_sender(path: &Path) -> io::Result<pipe::Sender> {
    loop {
        match pipe::OpenOptions::new().open_sender(path) {
            Ok(tx) => return Ok(tx),
            Err(e) if e.raw_os_error() == Some(nix::errno::Errno::ENXIO as i32) => {
                tokio::time::sleep(Duration::from_millis(2)).await;
            }
            Err(e) => return Err(e),
        }
    }
}

fn unlink_session_pipes(req_path: &Path, resp_path: &Path) {
    for path in [req_path, resp_path] {
        if let Err(e) = std::fs::remove_file(path) {
            if e.kind() != io::ErrorKind::NotFound {
                debug!("failed to unlink {}: {e}", path.display());
            }
        }
    }
}

enum ReadError {
    Io(io::Error),
    Protocol(WireError),
}

impl From<io::Error> for ReadError {
    fn from(e: io::Error) -> Self {
        ReadError::Io(e)
    }
}

/// Read one framed request: opcode byte, fixed payload, then the
/// count-prefixed tail for RESERVE. The seat-count limit is checked before
/// the tail is sized, so an oversized frame is refused without buffering it.
async fn read_request(
    rx: &mut pipe::Receiver,
    max_reservation: usize,
) -> Result<Request, ReadError> {
    let mut op = [0u8; 1];
    rx.read_exact(&mut op).await?;
    let opcode = Opcode::from_byte(op[0]).map_err(ReadError::Protocol)?;
    if opcode == Opcode::Setup {
        return Err(ReadError::Protocol(WireError::UnknownOpcode(op[0])));
    }

    let mut frame = vec![op[0]];
    let fixed_len = opcode.fixed_payload_len();
    if fixed_len > 0 {
        let mut fixed = vec![0u8; fixed_len];
        rx.read_exact(&mut fixed).await?;
        frame.extend_from_slice(&fixed);
    }

    if opcode == Opcode::Reserve {
        let n = reserve_seat_count(&frame[1..]).map_err(ReadError::Protocol)?;
        if n == 0 {
            return Err(ReadError::Protocol(WireError::EmptyReservation));
        }
        if n > max_reservation as u64 {
            return Err(ReadError::Protocol(WireError::ReservationTooLarge {
                n,
                max: max_reservation,
            }));
        }
        let mut tail = vec![0u8; 16 * n as usize];
        rx.read_exact(&mut tail).await?;
        frame.extend_from_slice(&tail);
    }

    Request::decode(&frame, max_reservation).map_err(ReadError::Protocol)
}
