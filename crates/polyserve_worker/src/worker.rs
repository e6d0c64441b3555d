//! Worker event loop: handshake, request serving, lifecycle.

use crate::handler::{self, AppHandler};
use crate::html;
use crate::install;
use anyhow::{Context, Result};
use polyserve_protocol::codec::{read_message, write_message};
use polyserve_protocol::defaults;
use polyserve_protocol::{
    ErrorKind, ErrorPayload, Message, OpCode, ReadyPayload, WireRequest, WireResponse, WorkerConfig,
};
use std::path::PathBuf;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// One isolated execution of one app version.
pub struct Worker {
    app_dir: PathBuf,
    handler: Box<dyn AppHandler>,
}

impl Worker {
    /// Run the worker over the given transport: install hook, handler
    /// construction, READY handshake, then the serve loop. A failure
    /// before READY is reported to the dispatcher as an ERROR frame and
    /// returned to the caller.
    pub async fn serve<R, W>(
        app_dir: PathBuf,
        config: WorkerConfig,
        mut reader: R,
        mut writer: W,
    ) -> Result<()>
    where
        R: AsyncRead + Unpin,
        W: AsyncWrite + Unpin,
    {
        let mut worker = match Self::start(app_dir, &config).await {
            Ok(worker) => worker,
            Err(err) => {
                let payload =
                    ErrorPayload::new(ErrorKind::WorkerSpawnFailed, format!("{err:#}"));
                let msg = Message::with_payload(OpCode::Err, Uuid::nil(), &payload)?;
                write_message(&mut writer, &msg).await?;
                return Err(err);
            }
        };

        let ready = ReadyPayload {
            pid: Some(std::process::id()),
            app_dir: worker.app_dir.display().to_string(),
        };
        let msg = Message::with_payload(OpCode::Ready, Uuid::nil(), &ready)?;
        write_message(&mut writer, &msg).await?;
        info!(app_dir = %worker.app_dir.display(), "worker ready");

        worker.run(&mut reader, &mut writer).await
    }

    async fn start(app_dir: PathBuf, config: &WorkerConfig) -> Result<Self> {
        if config.auto_install {
            install::run_install_hook(&app_dir)
                .await
                .context("install hook failed")?;
        }

        let handler = handler::build(&app_dir, config)
            .await
            .context("failed to build app handler")?;

        Ok(Self { app_dir, handler })
    }

    async fn run<R, W>(&mut self, reader: &mut R, writer: &mut W) -> Result<()>
    where
        R: AsyncRead + Unpin,
        W: AsyncWrite + Unpin,
    {
        loop {
            let msg = match read_message(reader).await? {
                Some(msg) => msg,
                None => {
                    debug!("dispatcher closed the channel");
                    return Ok(());
                }
            };

            match msg.header.opcode {
                OpCode::Request => {
                    let reply = self.handle_request(&msg).await;
                    write_message(writer, &reply).await?;
                }
                OpCode::Idle => {
                    debug!("idle advisory");
                    self.handler.on_idle().await;
                }
                OpCode::Terminate => {
                    info!("terminate received");
                    let grace = Duration::from_millis(defaults::TERMINATE_GRACE_MS);
                    if tokio::time::timeout(grace, self.handler.on_terminate())
                        .await
                        .is_err()
                    {
                        warn!("terminate hook exceeded grace period");
                    }
                    return Ok(());
                }
                other => {
                    warn!(opcode = ?other, "unexpected opcode");
                }
            }
        }
    }

    /// Serve one request; the reply frame carries the same req_id.
    async fn handle_request(&self, msg: &Message) -> Message {
        let req_id = msg.header.req_id;
        let req: WireRequest = match msg.parse_payload() {
            Ok(req) => req,
            Err(err) => {
                error!(%req_id, %err, "unreadable request payload");
                return error_message(req_id, ErrorKind::AppError, format!("bad request: {err}"));
            }
        };

        let path = req.uri.split('?').next().unwrap_or("/");

        // Liveness probe: never reaches the app.
        if path == "/health" {
            let res = WireResponse::new(200).with_body("text/plain", "ok");
            return response_message(req_id, &res);
        }

        match self.handler.fetch(&req).await {
            Ok(mut res) => {
                self.rewrite_html(&req, &mut res);
                response_message(req_id, &res)
            }
            Err(err) => {
                error!(%req_id, err = %format!("{err:#}"), "handler error");
                return error_message(req_id, ErrorKind::AppError, format!("{err:#}"));
            }
        }
    }

    /// Make root-relative asset URLs resolve under `/{app}/`.
    fn rewrite_html(&self, req: &WireRequest, res: &mut WireResponse) {
        let Some(app_name) = req.header(defaults::APP_NAME_HEADER) else {
            return;
        };
        let is_html = res
            .header("content-type")
            .map(|ct| ct.starts_with("text/html"))
            .unwrap_or(false);
        if !is_html {
            return;
        }
        if let Some(body) = html::insert_base_tag(&res.body, app_name) {
            res.body = body;
        }
    }
}

fn response_message(req_id: Uuid, res: &WireResponse) -> Message {
    Message::with_payload(OpCode::Response, req_id, res)
        .unwrap_or_else(|err| oversize_fallback(req_id, err))
}

fn error_message(req_id: Uuid, kind: ErrorKind, message: String) -> Message {
    let payload = ErrorPayload::new(kind, message);
    Message::with_payload(OpCode::Err, req_id, &payload)
        .unwrap_or_else(|err| oversize_fallback(req_id, err))
}

/// A reply must always go out so the dispatcher's in-flight entry
/// resolves; a response too large to frame degrades to a small error.
fn oversize_fallback(req_id: Uuid, err: polyserve_protocol::ProtocolError) -> Message {
    let payload = ErrorPayload::new(ErrorKind::AppError, format!("unsendable response: {err}"));
    Message::with_payload(OpCode::Err, req_id, &payload).unwrap_or_else(|_| Message {
        header: polyserve_protocol::Header::new(OpCode::Err, req_id, 0),
        payload: Vec::new(),
    })
}
