use clap::Parser;
use helper::{logging, ClockHolder, ClockTime, Inbound, Participant, SyncError, DEFAULT_PORT};
use std::io::{self, BufRead, Write};
use std::sync::Arc;
use std::thread;
use tokio::sync::mpsc;
use tracing::debug;

#[derive(Parser, Debug)]
#[command(name = "client", about = "Berkeley clock sync participant")]
struct Cli {
    #[arg(default_value = "127.0.0.1")]
    host: String,

    #[arg(default_value_t = DEFAULT_PORT)]
    port: u16,

    /// Identity to register with; prompted for when absent
    #[arg(long)]
    name: Option<String>,

    /// Initial clock as HH:mm; random when absent
    #[arg(long)]
    time: Option<ClockTime>,

    /// Default log filter when RUST_LOG is unset
    #[arg(long, default_value = "warn")]
    log_level: String,
}

#[derive(Debug)]
enum Event {
    StdinLine(String),
    StdinEof,
}

#[tokio::main]
async fn main() {
    if let Err(err) = run().await {
        eprintln!("client: {err}");
        std::process::exit(1);
    }
}

async fn run() -> Result<(), SyncError> {
    let cli = Cli::parse();
    logging::init(&cli.log_level);

    let name = match cli.name {
        Some(name) => name,
        None => prompt_name()?,
    };
    let time = cli.time.unwrap_or_else(ClockTime::random);

    println!("New user connecting to server.");
    let participant = Arc::new(Participant::new(name, time));
    let mut link = participant.clone().connect((cli.host.as_str(), cli.port)).await?;
    println!("Connected as '{}' with clock {}.", participant.identity(), participant.time());

    let (tx, mut rx) = mpsc::unbounded_channel::<Event>();
    spawn_stdin(tx.clone());

    // Ctrl+C behaves like EOF: close the connection and exit
    let tx_sig = tx.clone();
    ctrlc::set_handler(move || {
        let _ = tx_sig.send(Event::StdinEof);
    })
    .ok();

    loop {
        tokio::select! {
            Some(ev) = rx.recv() => match ev {
                Event::StdinLine(s) if s.eq_ignore_ascii_case("q") || s.eq_ignore_ascii_case("quit") => break,
                Event::StdinLine(s) => {
                    if let Some(line) = participant.outbound(&s) {
                        match link.send(line) {
                            Err(SyncError::QueueFull(_)) => println!("Server is not keeping up; message dropped."),
                            other => other?,
                        }
                    }
                }
                Event::StdinEof => break,
            },
            ev = link.next_event() => match ev {
                Some(Inbound::Display(line)) => println!("{line}"),
                Some(Inbound::Replied { coordinator_time, offset }) => {
                    debug!(%coordinator_time, offset, "offset sent")
                }
                Some(Inbound::Adjusted { delta, time }) => {
                    println!("Clock adjusted by {delta} min, now {time}.")
                }
                Some(Inbound::Closed) | None => {
                    println!("Server closed the connection.");
                    break;
                }
            },
        }
    }

    link.close();
    Ok(())
}

fn prompt_name() -> io::Result<String> {
    print!("Enter your username: ");
    io::stdout().flush()?;
    let mut name = String::new();
    io::stdin().lock().read_line(&mut name)?;
    let name = name.trim();
    Ok(if name.is_empty() { "User".to_string() } else { name.to_string() })
}

// Blocking reader on its own thread; it dies with the process.
fn spawn_stdin(tx: mpsc::UnboundedSender<Event>) {
    thread::spawn(move || {
        let stdin = io::stdin();
        for line in stdin.lock().lines() {
            match line {
                Ok(s) => {
                    if tx.send(Event::StdinLine(s.trim().to_string())).is_err() {
                        return;
                    }
                }
                Err(_) => break,
            }
        }
        let _ = tx.send(Event::StdinEof);
    });
}
