use std::path::PathBuf;

use anyhow::{bail, Context};
use clap::{Parser, Subcommand};

use ems_client::Session;

#[derive(Parser, Debug)]
#[command(name = "ems")]
#[command(about = "Command-line client for the EMS reservation server")]
struct Cli {
    /// Rendezvous pipe the server listens on
    #[arg(long, default_value = "/tmp/ems.pipe")]
    server: PathBuf,
    /// Directory for this client's per-session pipes
    #[arg(long, default_value = "/tmp")]
    pipe_dir: PathBuf,
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Create an event with the given grid dimensions
    Create {
        event_id: u32,
        rows: u64,
        cols: u64,
    },
    /// Reserve seats, given as row,col pairs (e.g. 1,1 1,2 2,3)
    Reserve {
        event_id: u32,
        #[arg(required = true)]
        seats: Vec<String>,
    },
    /// Print an event's seat grid
    Show { event_id: u32 },
    /// List all event ids
    List,
}

fn main() -> anyhow::Result<()> {
    env_logger::init();
    let cli = Cli::parse();

    let pid = std::process::id();
    let req_path = cli.pipe_dir.join(format!("ems-{pid}-req.pipe"));
    let resp_path = cli.pipe_dir.join(format!("ems-{pid}-resp.pipe"));

    let session = Session::setup(&cli.server, &req_path, &resp_path)
        .context("failed to establish a session")?;

    let outcome = run_command(&session, &cli.command);
    // Always detach cleanly so the server unlinks the session pipes.
    session.quit().context("failed to quit the session")?;
    outcome
}

fn run_command(session: &Session, command: &Command) -> anyhow::Result<()> {
    match command {
        Command::Create {
            event_id,
            rows,
            cols,
        } => {
            session.create(*event_id, *rows, *cols)?;
        }
        Command::Reserve { event_id, seats } => {
            let seats = seats
                .iter()
                .map(|s| parse_seat(s))
                .collect::<anyhow::Result<Vec<_>>>()?;
            session.reserve(*event_id, &seats)?;
        }
        Command::Show { event_id } => {
            let grid = session.show(*event_id)?;
            for row in 1..=grid.rows {
                let line: Vec<String> = (1..=grid.cols)
                    .map(|col| grid.seat(row, col).to_string())
                    .collect();
                println!("{}", line.join(" "));
            }
        }
        Command::List => {
            let ids = session.list()?;
            if ids.is_empty() {
                println!("No events");
            } else {
                for id in ids {
                    println!("Event {id}");
                }
            }
        }
    }
    Ok(())
}

fn parse_seat(s: &str) -> anyhow::Result<(u64, u64)> {
    let Some((row, col)) = s.split_once(',') else {
        bail!("seat {s:?} is not a row,col pair");
    };
    Ok((
        row.trim().parse().with_context(|| format!("bad row in {s:?}"))?,
        col.trim().parse().with_context(|| format!("bad column in {s:?}"))?,
    ))
}
