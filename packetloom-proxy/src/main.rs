use clap::Parser;
use packetloom_core::{Mux, Session, Stream};
use tokio::runtime::Builder;
use tracing::{debug, error, info, warn};

mod config;
mod signal;

use config::ConfigFile;

#[derive(Debug, Parser)]
#[command(author, version, about, long_about = None)]
pub struct Args {
    #[clap(short, long, value_name = "FILE", default_value = "config.toml")]
    config: String,
}

fn main() {
    signal::init();
    pretty_env_logger::init();

    let args = Args::parse();

    let config = match ConfigFile::from_file(&args.config) {
        Ok(config) => config,
        Err(err) => {
            tracing::error!("failed to load config file: {}", err);
            return;
        }
    };

    let rt = Builder::new_multi_thread().enable_all().build().unwrap();
    rt.block_on(async_main(config));
}

async fn async_main(config: ConfigFile) {
    let config = match config.into_core_config() {
        Ok(config) => config,
        Err(err) => {
            error!("invalid config: {}", err);
            return;
        }
    };

    let mux = match Mux::bind(config) {
        Ok(mux) => mux,
        Err(err) => {
            error!("failed to bind mux: {}", err);
            return;
        }
    };

    tokio::task::spawn(accept_loop(mux));

    // Wait for a shutdown signal (SIGINT|SIGTERM), then gracefully shut down.
    // See the `signal` module for more details.
    signal::SHUTDOWN.wait().await;
    info!("bye");
}

/// Accepts inbound sessions for the lifetime of the mux, spawning one task
/// per session to relay its streams.
async fn accept_loop(mux: Mux) {
    let shutdown = signal::ShutdownListener::new();
    tokio::pin!(shutdown);

    loop {
        tokio::select! {
            biased;
            _ = &mut shutdown => {
                debug!("accept loop shutting down");
                let _ = mux.close().await;
                break;
            }
            result = mux.accept() => {
                match result {
                    Ok(session) => {
                        info!(connection_id = session.connection_id(), remote = %session.remote_addr(), "accepted session");
                        tokio::task::spawn(relay_session(session));
                    }
                    Err(err) => {
                        warn!(%err, "mux accept failed, stopping accept loop");
                        break;
                    }
                }
            }
        }
    }
}

/// Accepts every stream opened on `session` and relays each with
/// [`relay_stream`], for the session's lifetime.
async fn relay_session(session: Session) {
    loop {
        match session.accept_stream().await {
            Ok(stream) => {
                debug!(connection_id = session.connection_id(), stream_id = stream.id(), "accepted stream");
                tokio::task::spawn(relay_stream(stream));
            }
            Err(err) => {
                debug!(connection_id = session.connection_id(), %err, "session closed");
                break;
            }
        }
    }
}

/// Echoes every message received on `stream` back to its sender until the
/// stream closes. A minimal reference relay: real deployments would plug in
/// their own per-stream application protocol here.
async fn relay_stream(stream: Stream) {
    let mut buf = vec![0u8; 1 << 16];
    loop {
        let n = match stream.read(&mut buf).await {
            Ok(0) => break,
            Ok(n) => n,
            Err(err) => {
                debug!(stream_id = stream.id(), %err, "stream read failed");
                break;
            }
        };

        if let Err(err) = stream.write(&buf[..n]).await {
            debug!(stream_id = stream.id(), %err, "stream write failed");
            break;
        }
    }
}
