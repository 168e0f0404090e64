use clap::Parser;
use helper::{logging, ClockHolder, Control, Coordinator, CoordinatorConfig, DEFAULT_PORT};
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{self, AsyncBufReadExt, BufReader};
use tokio::sync::mpsc;
use tracing::{info, warn};

const SHUTDOWN_GRACE: Duration = Duration::from_millis(200);

#[derive(Parser, Debug)]
#[command(name = "server", about = "Berkeley clock sync coordinator")]
struct Cli {
    /// Address to listen on
    #[arg(long, default_value_t = IpAddr::V4(Ipv4Addr::UNSPECIFIED))]
    bind: IpAddr,

    #[arg(long, short, default_value_t = DEFAULT_PORT)]
    port: u16,

    /// How long a sync round waits for offsets, in milliseconds
    #[arg(long, default_value_t = 5000)]
    sync_window_ms: u64,

    /// Default log filter when RUST_LOG is unset
    #[arg(long, default_value = "info")]
    log_level: String,
}

#[tokio::main]
async fn main() -> io::Result<()> {
    let cli = Cli::parse();
    logging::init(&cli.log_level);

    let config = CoordinatorConfig {
        listen: SocketAddr::new(cli.bind, cli.port),
        round_window: Duration::from_millis(cli.sync_window_ms),
    };
    let coordinator = Arc::new(Coordinator::new(config));
    let listener = coordinator.bind().await?;
    info!(time = %coordinator.time(), "server clock");

    let (ctrl_tx, ctrl_rx) = mpsc::channel::<Control>(32);
    spawn_operator(ctrl_tx);

    let res = coordinator.serve(listener, ctrl_rx).await;
    // give writer tasks a moment to flush the shutdown notice
    tokio::time::sleep(SHUTDOWN_GRACE).await;
    res
}

// Operator console: `time`, `sync`, `q`/`quit`. EOF only stops reading commands.
fn spawn_operator(ctrl_tx: mpsc::Sender<Control>) {
    tokio::spawn(async move {
        let mut lines = BufReader::new(io::stdin()).lines();
        while let Ok(Some(line)) = lines.next_line().await {
            let cmd = line.trim().to_lowercase();
            let ctrl = match cmd.as_str() {
                "" => continue,
                "time" => Control::Time,
                "sync" => Control::Sync,
                "q" | "quit" => Control::Quit,
                other => {
                    warn!(command = other, "unknown command (expected time, sync or quit)");
                    continue;
                }
            };
            if ctrl_tx.send(ctrl).await.is_err() || ctrl == Control::Quit {
                return;
            }
        }
        info!("operator input closed");
    });
}
