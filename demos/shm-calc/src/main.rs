//! shm-calc: a two-operand calculator served over a shared-memory channel.
//!
//! # Usage
//!
//! ```bash
//! shm-calc serve --section Calc
//! shm-calc call shm://Calc add 40 2
//! ```

use std::sync::Arc;

use clap::{Parser, Subcommand};
use shmchannel::{
    ChannelConfig, Dispatch, Processing, Reply, Request, RequestBody, Responder, ShmChannel,
};
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "shm-calc")]
#[command(about = "Calculator over a shared-memory channel")]
struct Args {
    /// Prefix of the shared-memory objects
    #[arg(long, default_value = "shmchannel")]
    namespace: String,

    #[command(subcommand)]
    command: Cmd,
}

#[derive(Subcommand, Debug)]
enum Cmd {
    /// Listen until interrupted
    Serve {
        #[arg(long, default_value = "Calc")]
        section: String,
    },
    /// Send one operation and print the result
    Call {
        /// e.g. shm://Calc
        url: String,
        /// add, sub or mul
        op: String,
        a: i32,
        b: i32,
    },
}

type BoxError = Box<dyn std::error::Error>;

fn main() -> std::process::ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let args = Args::parse();
    let config = ChannelConfig {
        namespace: args.namespace,
        ..Default::default()
    };

    let result = match args.command {
        Cmd::Serve { section } => serve(config, &section),
        Cmd::Call { url, op, a, b } => call(config, &url, &op, a, b),
    };
    match result {
        Ok(()) => std::process::ExitCode::SUCCESS,
        Err(e) => {
            tracing::error!(error = %e, "shm-calc failed");
            std::process::ExitCode::FAILURE
        }
    }
}

fn calculator() -> Arc<dyn Dispatch> {
    Arc::new(|request: Request, _: Responder| {
        let Some((a, b)) = operands(&request.body) else {
            tracing::warn!(len = request.body.len(), "expected two i32 operands");
            return Processing::Complete(Reply::new(Vec::new()));
        };
        let op = request.headers.get("op").unwrap_or("add");
        let result = match op {
            "sub" => a.wrapping_sub(b),
            "mul" => a.wrapping_mul(b),
            _ => a.wrapping_add(b),
        };
        tracing::info!(uri = ?request.request_uri(), op, a, b, result, "calculated");
        Processing::Complete(Reply::new(result.to_le_bytes().to_vec()))
    })
}

fn operands(body: &[u8]) -> Option<(i32, i32)> {
    let a = body.get(0..4)?.try_into().ok()?;
    let b = body.get(4..8)?.try_into().ok()?;
    Some((i32::from_le_bytes(a), i32::from_le_bytes(b)))
}

fn serve(config: ChannelConfig, section: &str) -> Result<(), BoxError> {
    let channel = ShmChannel::new(config)?;
    channel.register(Some(section), calculator())?;
    channel.start_listening()?;
    tracing::info!(uri = ?channel.channel_uri(), "serving, press Ctrl-C to stop");

    let rt = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()?;
    rt.block_on(tokio::signal::ctrl_c())?;

    channel.stop_listening()?;
    Ok(())
}

fn call(config: ChannelConfig, url: &str, op: &str, a: i32, b: i32) -> Result<(), BoxError> {
    let channel = ShmChannel::new(config)?;
    let sink = channel.connect(url)?;

    let mut body = a.to_le_bytes().to_vec();
    body.extend_from_slice(&b.to_le_bytes());
    let mut request = sink
        .new_request(RequestBody::from_bytes(body))
        .with_header("op", op);

    let rt = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()?;
    let response = rt.block_on(sink.call_deferred(&mut request)?)?;

    let result: [u8; 4] = response.body[..]
        .try_into()
        .map_err(|_| format!("expected a 4-byte reply, got {}", response.body.len()))?;
    println!("{}", i32::from_le_bytes(result));
    Ok(())
}
