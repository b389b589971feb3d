//! End-to-end exercises of the server over real named pipes: an in-process
//! listener + worker pool on a scratch directory, driven through the
//! blocking client API from dedicated threads.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use nix::sys::stat::Mode;
use tempfile::TempDir;

use ems_client::{ClientError, Session};
use emsd::engine::Ems;
use emsd::listener::Listener;
use emsd::queue::SessionQueue;
use emsd::stats::Stats;
use emsd::worker;

const MAX_RESERVATION: usize = 8;

fn start_server(dir: &TempDir, workers: usize) -> PathBuf {
    let pipe_path = dir.path().join("ems.pipe");
    nix::unistd::mkfifo(&pipe_path, Mode::from_bits_truncate(0o640)).unwrap();

    let engine = Arc::new(Ems::new(0));
    let queue = Arc::new(SessionQueue::new(4));
    let stats = Arc::new(Stats::new());
    worker::spawn_pool(
        workers,
        Arc::clone(&queue),
        Arc::clone(&engine),
        Arc::clone(&stats),
        MAX_RESERVATION,
    );
    let listener = Listener::open(&pipe_path, engine, queue, stats).unwrap();
    tokio::spawn(listener.run());

    pipe_path
}

fn session_pipes(dir: &TempDir, tag: &str) -> (PathBuf, PathBuf) {
    (
        dir.path().join(format!("{tag}-req.pipe")),
        dir.path().join(format!("{tag}-resp.pipe")),
    )
}

async fn wait_until_gone(path: PathBuf) {
    tokio::time::timeout(Duration::from_secs(5), async {
        while path.exists() {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .unwrap_or_else(|_| panic!("{} was not unlinked", path.display()));
}

fn client<T: Send + 'static>(
    f: impl FnOnce() -> T + Send + 'static,
) -> tokio::task::JoinHandle<T> {
    tokio::task::spawn_blocking(f)
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn create_show_list_round_trip() {
    let dir = tempfile::tempdir().unwrap();
    let server_pipe = start_server(&dir, 2);
    let (req, resp) = session_pipes(&dir, "c1");

    client(move || {
        let session = Session::setup(&server_pipe, &req, &resp).unwrap();

        session.create(1, 2, 2).unwrap();
        let grid = session.show(1).unwrap();
        assert_eq!((grid.rows, grid.cols), (2, 2));
        assert_eq!(grid.seats, vec![0, 0, 0, 0]);

        // Duplicate create is rejected without touching the existing event.
        let dup = session.create(1, 3, 3);
        assert!(matches!(dup, Err(ClientError::Rejected(_))));
        assert_eq!(session.show(1).unwrap().rows, 2);

        session.create(3, 1, 1).unwrap();
        assert_eq!(session.list().unwrap(), vec![1, 3]);

        session.quit().unwrap();
    })
    .await
    .unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn reserve_is_visible_through_show() {
    let dir = tempfile::tempdir().unwrap();
    let server_pipe = start_server(&dir, 1);
    let (req, resp) = session_pipes(&dir, "c1");

    client(move || {
        let session = Session::setup(&server_pipe, &req, &resp).unwrap();
        session.create(7, 2, 3).unwrap();
        session.reserve(7, &[(1, 1), (1, 2), (2, 3)]).unwrap();
        let grid = session.show(7).unwrap();
        assert_eq!(grid.seats, vec![1, 1, 0, 0, 0, 1]);

        // A second claim on a taken seat fails and changes nothing.
        assert!(matches!(
            session.reserve(7, &[(1, 1)]),
            Err(ClientError::Rejected(_))
        ));
        assert_eq!(session.show(7).unwrap().seats, vec![1, 1, 0, 0, 0, 1]);

        session.quit().unwrap();
    })
    .await
    .unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn oversized_reserve_is_refused_and_the_session_survives() {
    let dir = tempfile::tempdir().unwrap();
    let server_pipe = start_server(&dir, 1);
    let (req, resp) = session_pipes(&dir, "c1");

    client(move || {
        let session = Session::setup(&server_pipe, &req, &resp).unwrap();
        session.create(1, 40, 40).unwrap();

        // One seat over the framing limit: rejected before the engine, and
        // the worker resynchronizes the request channel afterwards.
        let seats: Vec<(u64, u64)> = (1..=(MAX_RESERVATION as u64 + 1)).map(|r| (r, 1)).collect();
        assert!(matches!(
            session.reserve(1, &seats),
            Err(ClientError::Rejected(_))
        ));
        assert_eq!(session.show(1).unwrap().seats[0], 0);

        // At the limit it goes through.
        let seats: Vec<(u64, u64)> = (1..=MAX_RESERVATION as u64).map(|r| (r, 1)).collect();
        session.reserve(1, &seats).unwrap();

        session.quit().unwrap();
    })
    .await
    .unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn quit_unlinks_the_session_pipes() {
    let dir = tempfile::tempdir().unwrap();
    let server_pipe = start_server(&dir, 1);
    let (req, resp) = session_pipes(&dir, "c1");

    let (req2, resp2) = (req.clone(), resp.clone());
    client(move || {
        let session = Session::setup(&server_pipe, &req2, &resp2).unwrap();
        session.create(1, 1, 1).unwrap();
        session.quit().unwrap();
    })
    .await
    .unwrap();

    wait_until_gone(req).await;
    wait_until_gone(resp).await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 6)]
async fn concurrent_sessions_get_distinct_workers() {
    let dir = tempfile::tempdir().unwrap();
    let server_pipe = start_server(&dir, 2);

    let (req_a, resp_a) = session_pipes(&dir, "a");
    let (req_b, resp_b) = session_pipes(&dir, "b");
    let server_a = server_pipe.clone();
    let server_b = server_pipe.clone();

    let (ready_tx_a, ready_rx_a) = std::sync::mpsc::channel();
    let (ready_tx_b, ready_rx_b) = std::sync::mpsc::channel();
    let (done_tx_a, done_rx_a) = std::sync::mpsc::channel::<()>();
    let (done_tx_b, done_rx_b) = std::sync::mpsc::channel::<()>();

    // Both sessions stay open at once, so each must be held by its own
    // worker and the two session ids must differ.
    let a = client(move || {
        let session = Session::setup(&server_a, &req_a, &resp_a).unwrap();
        session.create(10, 1, 1).unwrap();
        ready_tx_a.send(session.id()).unwrap();
        done_rx_a.recv().unwrap();
        session.quit().unwrap();
    });
    let b = client(move || {
        let session = Session::setup(&server_b, &req_b, &resp_b).unwrap();
        session.create(20, 1, 1).unwrap();
        ready_tx_b.send(session.id()).unwrap();
        done_rx_b.recv().unwrap();
        session.quit().unwrap();
    });

    let id_a = tokio::task::spawn_blocking(move || ready_rx_a.recv().unwrap())
        .await
        .unwrap();
    let id_b = tokio::task::spawn_blocking(move || ready_rx_b.recv().unwrap())
        .await
        .unwrap();
    assert_ne!(id_a, id_b);
    assert!((0..2).contains(&id_a));
    assert!((0..2).contains(&id_b));

    done_tx_a.send(()).unwrap();
    done_tx_b.send(()).unwrap();
    a.await.unwrap();
    b.await.unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn a_worker_serves_sessions_back_to_back() {
    let dir = tempfile::tempdir().unwrap();
    let server_pipe = start_server(&dir, 1);

    for tag in ["first", "second"] {
        let (req, resp) = session_pipes(&dir, tag);
        let server = server_pipe.clone();
        client(move || {
            let session = Session::setup(&server, &req, &resp).unwrap();
            assert_eq!(session.id(), 0);
            session.create(tag.len() as u32, 1, 1).unwrap();
            session.quit().unwrap();
        })
        .await
        .unwrap();
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn listing_an_empty_catalog_returns_no_ids() {
    let dir = tempfile::tempdir().unwrap();
    let server_pipe = start_server(&dir, 1);
    let (req, resp) = session_pipes(&dir, "c1");

    client(move || {
        let session = Session::setup(&server_pipe, &req, &resp).unwrap();
        assert!(session.list().unwrap().is_empty());
        assert!(matches!(
            session.show(99),
            Err(ClientError::Rejected(_))
        ));
        session.quit().unwrap();
    })
    .await
    .unwrap();
}
