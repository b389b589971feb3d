use std::io;
use std::path::Path;
use std::sync::Arc;

use log::{info, warn};
use tokio::io::AsyncReadExt;
use tokio::net::unix::pipe;
use tokio::signal::unix::{signal, SignalKind};

use ems_wire::{Handshake, HANDSHAKE_BYTES};

use crate::engine::Ems;
use crate::queue::SessionQueue;
use crate::stats::Stats;

/// The single agent reading the rendezvous channel. Validates handshakes,
/// feeds the session queue, and owns the SIGUSR1 diagnostic dump.
pub struct Listener {
    rx: pipe::Receiver,
    engine: Arc<Ems>,
    queue: Arc<SessionQueue>,
    stats: Arc<Stats>,
}

impl Listener {
    /// Open the rendezvous FIFO. Read+write keeps a writer end alive so the
    /// channel never reports EOF between clients.
    pub fn open(
        path: &Path,
        engine: Arc<Ems>,
        queue: Arc<SessionQueue>,
        stats: Arc<Stats>,
    ) -> io::Result<Self> {
        let rx = pipe::OpenOptions::new()
            .read_write(true)
            .open_receiver(path)?;
        Ok(Self {
            rx,
            engine,
            queue,
            stats,
        })
    }

    /// Serve the rendezvous channel until a fatal channel error or queue
    /// shutdown. SIGUSR1 is handled here, between reads; the signal stream
    /// stays armed across deliveries and workers never subscribe to it.
    pub async fn run(mut self) -> anyhow::Result<()> {
        let mut sigusr1 = signal(SignalKind::user_defined1())?;
        // Handshake writes are at most PIPE_BUF bytes and therefore atomic,
        // so one read yields one whole message.
        let mut buf = [0u8; HANDSHAKE_BYTES];
        loop {
            tokio::select! {
                _ = sigusr1.recv() => self.dump(),
                read = self.rx.read(&mut buf) => match read {
                    Ok(0) => continue,
                    Ok(n) if n != HANDSHAKE_BYTES => {
                        warn!("listener: dropped short handshake of {n} bytes");
                        self.stats.inc_protocol_errors();
                    }
                    Ok(_) => self.accept(&buf).await?,
                    Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                    Err(e) => return Err(e.into()),
                },
            }
        }
    }

    async fn accept(&self, msg: &[u8]) -> anyhow::Result<()> {
        match Handshake::decode(msg) {
            Ok(handshake) => {
                info!(
                    "listener: handshake for {} / {}",
                    handshake.req_path.display(),
                    handshake.resp_path.display()
                );
                // Blocks while the wait list is full. A push error means the
                // queue was closed underneath us: propagate and stop.
                self.queue.push(handshake).await?;
            }
            Err(e) => {
                warn!("listener: dropped malformed handshake: {e}");
                self.stats.inc_protocol_errors();
            }
        }
        Ok(())
    }

    fn dump(&self) {
        let stats = &self.stats;
        print!(
            "{}Sessions: started={} finished={}\nRequests: total={} rejected={} protocol_errors={} transport_errors={}\n",
            self.engine.dump_state(),
            stats.sessions_started(),
            stats.sessions_finished(),
            stats.requests_total(),
            stats.requests_rejected(),
            stats.protocol_errors(),
            stats.transport_errors(),
        );
    }
}
