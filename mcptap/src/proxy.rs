//! The bidirectional streaming proxy.
//!
//! Spawns the downstream MCP server as a child process and runs two pump
//! tasks: host stdin → child stdin and child stdout → host stdout. Every
//! complete line goes through the interceptor chain; surviving bytes are
//! written to the far endpoint with a trailing newline, blocked messages
//! are answered with a synthesized JSON-RPC error on the sender's side.
//!
//! Both pumps can write to both endpoints (forwarded traffic to one side,
//! block errors to the other), so each writer sits behind a mutex to keep
//! NDJSON lines from interleaving.

use std::process::{ExitStatus, Stdio};
use std::sync::Arc;

use chrono::Utc;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::process::Command;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;

use mcptap_core::Direction;
use mcptap_core::bus::EventBus;
use mcptap_core::intercept::logging::entry_from_message;
use mcptap_core::intercept::{InterceptError, InterceptedMessage, InterceptorChain};
use mcptap_core::jsonrpc;
use mcptap_core::store::{MessageStore, Session};

use crate::framing::{DEFAULT_MAX_MESSAGE_BYTES, FramingError, read_line_bounded};

/// Configuration for one proxy instance.
#[derive(Debug, Clone)]
pub struct ProxyConfig {
    /// Downstream server command.
    pub command: String,
    /// Downstream server arguments.
    pub args: Vec<String>,
    /// Session identifier; a fresh 4-byte hex id when absent.
    pub session_id: Option<String>,
    /// Maximum NDJSON line size; zero selects the 10 MiB default.
    pub max_message_bytes: usize,
}

/// Errors that end a proxy run.
#[derive(Debug, thiserror::Error)]
pub enum ProxyError {
    #[error("start downstream {command:?}: {source}")]
    Spawn {
        command: String,
        #[source]
        source: std::io::Error,
    },

    #[error("downstream {0} pipe unavailable")]
    Pipes(&'static str),

    #[error("{direction} pump failed: {source}")]
    Pump {
        direction: Direction,
        #[source]
        source: FramingError,
    },

    #[error("wait on downstream: {0}")]
    Wait(#[source] std::io::Error),
}

/// The core bidirectional MCP proxy.
pub struct Proxy {
    command: String,
    args: Vec<String>,
    session_id: String,
    max_message_bytes: usize,
    chain: Arc<InterceptorChain>,
    store: Arc<dyn MessageStore>,
    bus: EventBus,
}

impl Proxy {
    pub fn new(
        config: ProxyConfig,
        chain: Arc<InterceptorChain>,
        store: Arc<dyn MessageStore>,
        bus: EventBus,
    ) -> Self {
        let session_id = config.session_id.unwrap_or_else(short_id);
        let max_message_bytes = if config.max_message_bytes == 0 {
            DEFAULT_MAX_MESSAGE_BYTES
        } else {
            config.max_message_bytes
        };
        Self {
            command: config.command,
            args: config.args,
            session_id,
            max_message_bytes,
            chain,
            store,
            bus,
        }
    }

    /// The session identifier for this proxy instance.
    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    /// Run against the process's real stdin/stdout. Blocks until the
    /// downstream exits, the token is cancelled, or a pump fails.
    pub async fn run(&self, cancel: CancellationToken) -> Result<ExitStatus, ProxyError> {
        self.run_with_host_io(tokio::io::stdin(), tokio::io::stdout(), cancel)
            .await
    }

    /// Run with explicit host-side streams (tests drive this with in-memory
    /// duplex pipes).
    pub async fn run_with_host_io<R, W>(
        &self,
        host_in: R,
        host_out: W,
        cancel: CancellationToken,
    ) -> Result<ExitStatus, ProxyError>
    where
        R: AsyncRead + Unpin + Send + 'static,
        W: AsyncWrite + Unpin + Send + 'static,
    {
        let mut cmd = Command::new(&self.command);
        cmd.args(&self.args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit())
            .kill_on_drop(true);

        let mut child = cmd.spawn().map_err(|source| ProxyError::Spawn {
            command: self.command.clone(),
            source,
        })?;
        tracing::info!(
            command = %self.command,
            args = ?self.args,
            session = %self.session_id,
            "downstream started"
        );

        let child_stdin = Arc::new(Mutex::new(
            child.stdin.take().ok_or(ProxyError::Pipes("stdin"))?,
        ));
        let child_stdout = child.stdout.take().ok_or(ProxyError::Pipes("stdout"))?;
        let host_out = Arc::new(Mutex::new(host_out));

        if let Err(e) = self.store.create_session(&Session {
            id: self.session_id.clone(),
            started_at: Utc::now(),
            ended_at: None,
            command: self.command.clone(),
            args: self.args.clone(),
        }) {
            tracing::error!(error = %e, "failed to record session start");
        }

        let pump_cancel = cancel.child_token();

        let mut h2s = tokio::spawn(pump(
            host_in,
            Arc::clone(&child_stdin),
            Arc::clone(&host_out),
            self.pump_ctx(Direction::HostToServer, &pump_cancel),
        ));
        let mut s2h = tokio::spawn(pump(
            child_stdout,
            Arc::clone(&host_out),
            Arc::clone(&child_stdin),
            self.pump_ctx(Direction::ServerToHost, &pump_cancel),
        ));

        let mut h2s_res: Option<Result<(), FramingError>> = None;
        let mut s2h_res: Option<Result<(), FramingError>> = None;
        let mut wait_res: Option<std::io::Result<ExitStatus>> = None;

        // Run until the downstream exits, cancellation fires, or a pump
        // hits a fatal error. A pump finishing cleanly (EOF) is not an
        // exit condition on its own — the downstream gets to wind down.
        loop {
            tokio::select! {
                status = child.wait() => {
                    wait_res = Some(status);
                    break;
                }
                _ = cancel.cancelled() => {
                    tracing::info!(session = %self.session_id, "cancelled, stopping downstream");
                    if let Err(e) = child.start_kill() {
                        tracing::debug!(error = %e, "kill downstream");
                    }
                    break;
                }
                res = &mut h2s, if h2s_res.is_none() => {
                    let res = flatten_join(res);
                    let failed = res.is_err();
                    h2s_res = Some(res);
                    // Host closed its side; close the child's stdin so a
                    // well-behaved server exits.
                    child_stdin.lock().await.shutdown().await.ok();
                    if failed {
                        break;
                    }
                }
                res = &mut s2h, if s2h_res.is_none() => {
                    let res = flatten_join(res);
                    let failed = res.is_err();
                    s2h_res = Some(res);
                    if failed {
                        break;
                    }
                }
            }
        }

        pump_cancel.cancel();

        let wait_res = match wait_res {
            Some(res) => res,
            None => {
                if let Err(e) = child.start_kill() {
                    tracing::debug!(error = %e, "kill downstream");
                }
                child.wait().await
            }
        };

        if h2s_res.is_none() {
            h2s_res = Some(flatten_join((&mut h2s).await));
        }
        if s2h_res.is_none() {
            s2h_res = Some(flatten_join((&mut s2h).await));
        }

        if let Err(e) = self.store.end_session(&self.session_id) {
            tracing::error!(error = %e, "failed to record session end");
        }

        // The downstream's wait status takes precedence over pump errors.
        let status = wait_res.map_err(ProxyError::Wait)?;

        for (direction, res) in [
            (Direction::HostToServer, h2s_res),
            (Direction::ServerToHost, s2h_res),
        ] {
            if let Some(Err(source)) = res {
                return Err(ProxyError::Pump { direction, source });
            }
        }

        tracing::info!(session = %self.session_id, status = ?status, "downstream exited");
        Ok(status)
    }

    fn pump_ctx(&self, direction: Direction, cancel: &CancellationToken) -> PumpCtx {
        PumpCtx {
            direction,
            session_id: self.session_id.clone(),
            max_bytes: self.max_message_bytes,
            chain: Arc::clone(&self.chain),
            store: Arc::clone(&self.store),
            bus: self.bus.clone(),
            cancel: cancel.clone(),
        }
    }
}

/// Everything one pump task needs besides its streams.
struct PumpCtx {
    direction: Direction,
    session_id: String,
    max_bytes: usize,
    chain: Arc<InterceptorChain>,
    store: Arc<dyn MessageStore>,
    bus: EventBus,
    cancel: CancellationToken,
}

/// Shuttle newline-delimited messages from `reader` through the chain to
/// `forward`. Block errors go to `reply` — the endpoint the message came
/// from.
async fn pump<R, W, E>(
    reader: R,
    forward: Arc<Mutex<W>>,
    reply: Arc<Mutex<E>>,
    ctx: PumpCtx,
) -> Result<(), FramingError>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
    E: AsyncWrite + Unpin,
{
    let mut reader = BufReader::new(reader);
    let mut line: Vec<u8> = Vec::new();

    loop {
        line.clear();
        let n = tokio::select! {
            biased;
            _ = ctx.cancel.cancelled() => {
                tracing::debug!(direction = %ctx.direction, "pump cancelled");
                return Ok(());
            }
            res = read_line_bounded(&mut reader, &mut line, ctx.max_bytes) => res?,
        };
        if n == 0 {
            tracing::debug!(direction = %ctx.direction, "stream closed");
            return Ok(());
        }

        while line.last().is_some_and(|&b| b == b'\n' || b == b'\r') {
            line.pop();
        }
        if line.is_empty() {
            continue;
        }

        let mut msg =
            InterceptedMessage::new(ctx.session_id.clone(), ctx.direction, line.clone());

        // Unparseable lines are forwarded verbatim: the proxy must never
        // silently eat bytes it fails to classify.
        if let Some(reason) = &msg.parse_error {
            tracing::warn!(
                direction = %ctx.direction,
                error = %reason,
                "unparseable message, forwarding raw"
            );
            write_line(&forward, &msg.raw_bytes).await?;
            continue;
        }

        match ctx.chain.process(&ctx.cancel, &mut msg).await {
            Ok(Some(bytes)) => write_line(&forward, &bytes).await?,
            Ok(None) => {
                tracing::debug!(
                    direction = %ctx.direction,
                    method = msg.parsed.method_str(),
                    "message dropped"
                );
            }
            Err(block) => send_block_error(&reply, &msg, &block, &ctx).await,
        }
    }
}

/// Answer a blocked message with a JSON-RPC error on the sender's side and
/// persist the blocked record. Messages without an id cannot be answered
/// and are dropped silently.
async fn send_block_error<E: AsyncWrite + Unpin>(
    reply: &Mutex<E>,
    msg: &InterceptedMessage,
    block: &InterceptError,
    ctx: &PumpCtx,
) {
    let mut entry = entry_from_message(msg);
    entry.blocked = true;
    ctx.store.log_message(entry.clone());
    ctx.bus.publish(Arc::new(entry));

    tracing::warn!(
        method = msg.parsed.method_str(),
        direction = %ctx.direction,
        reason = %block,
        "message blocked"
    );

    let Some(id) = msg.parsed.id.as_deref() else {
        return; // cannot respond to notifications
    };
    let body = jsonrpc::error_response(Some(id), -32600, &block.to_string());
    if let Err(e) = write_line(reply, &body).await {
        tracing::error!(error = %e, "failed to send block error");
    }
}

/// Write one NDJSON line (payload plus newline) atomically and flush.
async fn write_line<W: AsyncWrite + Unpin>(
    writer: &Mutex<W>,
    bytes: &[u8],
) -> Result<(), FramingError> {
    let mut guard = writer.lock().await;
    guard.write_all(bytes).await?;
    guard.write_all(b"\n").await?;
    guard.flush().await?;
    Ok(())
}

fn flatten_join(
    res: Result<Result<(), FramingError>, tokio::task::JoinError>,
) -> Result<(), FramingError> {
    match res {
        Ok(inner) => inner,
        Err(e) => Err(FramingError::Io(std::io::Error::other(format!(
            "pump task failed: {e}"
        )))),
    }
}

fn short_id() -> String {
    format!("{:08x}", rand::random::<u32>())
}
