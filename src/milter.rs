use crate::config::{Config, ListenAddr};
use crate::session::{ChunkStatus, Gateway, QuarantineSink, Session};
use async_trait::async_trait;
use indymilter::{Actions, Callbacks, Config as IndyConfig, ContextActions, Status};
use std::future::Future;
use std::sync::Arc;
use tokio::net::{TcpListener, UnixListener};

pub struct Milter {
    gateway: Arc<Gateway>,
    listen: ListenAddr,
}

/// Quarantine through the milter end-of-message actions.
struct MilterQuarantine<'a, A>(&'a A);

#[async_trait]
impl<'a, A> QuarantineSink for MilterQuarantine<'a, A>
where
    A: ContextActions + Send + Sync,
{
    async fn quarantine(&self, reason: &str) -> anyhow::Result<()> {
        self.0
            .quarantine(reason.to_string())
            .await
            .map_err(|e| anyhow::anyhow!("{e}"))
    }
}

/// First argument of a MAIL/RCPT command without angle brackets.
fn envelope_address(args: &[std::ffi::CString]) -> String {
    args.first()
        .map(|s| s.to_string_lossy().trim().trim_matches(['<', '>']).to_string())
        .unwrap_or_default()
}

/// Once the size guard trips the rest of the message is not needed.
fn chunk_reply(status: ChunkStatus) -> Status {
    match status {
        ChunkStatus::Continue => Status::Continue,
        ChunkStatus::SizeExceeded => Status::Accept,
    }
}

/// Runs the decision for a finished message. Delivery always continues;
/// quarantine is requested through `sink`.
async fn end_of_message(
    gateway: &Gateway,
    session: Option<Session>,
    sink: &dyn QuarantineSink,
) -> Status {
    let Some(session) = session else {
        log::debug!("End of message without an open session");
        return Status::Accept;
    };
    session.finish(gateway, sink).await;
    Status::Accept
}

impl Milter {
    pub fn new(config: &Config) -> anyhow::Result<Self> {
        let gateway = Arc::new(Gateway::from_config(config)?);
        Ok(Milter {
            gateway,
            listen: config.listen_addr()?,
        })
    }

    pub fn with_gateway(gateway: Arc<Gateway>, listen: ListenAddr) -> Self {
        Milter { gateway, listen }
    }

    pub async fn run<S>(&self, shutdown: S) -> anyhow::Result<()>
    where
        S: Future<Output = ()> + Send + 'static,
    {
        let config = IndyConfig {
            actions: Actions::QUARANTINE,
            ..Default::default()
        };

        match &self.listen {
            ListenAddr::Inet(addr) => {
                let listener = TcpListener::bind(addr).await?;
                log::info!("Starting milter on inet:{}", addr);
                indymilter::run(listener, self.callbacks(), config, shutdown).await?;
            }
            ListenAddr::Unix(path) => {
                if std::path::Path::new(path).exists() {
                    std::fs::remove_file(path)?;
                }
                let listener = UnixListener::bind(path)?;
                log::info!("Starting milter on unix:{}", path);
                indymilter::run(listener, self.callbacks(), config, shutdown).await?;
            }
        }

        log::info!("Milter finished");
        Ok(())
    }

    fn callbacks(&self) -> Callbacks<Session> {
        let gateway = self.gateway.clone();

        Callbacks {
            connect: Some(Box::new(
                move |_ctx: &mut indymilter::Context<Session>, hostname, _socket_info| {
                    Box::pin(async move {
                        log::debug!("Connection from: {}", hostname.to_string_lossy());
                        Status::Continue
                    })
                },
            )),

            helo: Some(Box::new(move |_ctx: &mut indymilter::Context<Session>, name| {
                Box::pin(async move {
                    log::debug!("Helo: {}", name.to_string_lossy());
                    Status::Continue
                })
            })),

            mail: Some(Box::new(move |ctx: &mut indymilter::Context<Session>, args| {
                Box::pin(async move {
                    let session = Session::new();
                    session.set_from(&envelope_address(&args)).await;
                    ctx.data = Some(session);
                    Status::Continue
                })
            })),

            rcpt: Some(Box::new(move |ctx: &mut indymilter::Context<Session>, args| {
                Box::pin(async move {
                    if let Some(session) = &ctx.data {
                        session.add_recipient(&envelope_address(&args)).await;
                    }
                    Status::Continue
                })
            })),

            header: Some(Box::new(
                move |ctx: &mut indymilter::Context<Session>, name, value| {
                    Box::pin(async move {
                        if let Some(session) = &ctx.data {
                            session
                                .add_header(&name.to_string_lossy(), &value.to_string_lossy())
                                .await;
                        }
                        Status::Continue
                    })
                },
            )),

            body: Some(Box::new({
                let gateway = gateway.clone();
                move |ctx: &mut indymilter::Context<Session>, chunk| {
                    let gateway = gateway.clone();
                    Box::pin(async move {
                        let Some(session) = &ctx.data else {
                            return Status::Continue;
                        };
                        chunk_reply(
                            session
                                .append_body(&chunk, gateway.max_message_size())
                                .await,
                        )
                    })
                }
            })),

            eom: Some(Box::new({
                let gateway = gateway.clone();
                move |ctx: &mut indymilter::EomContext<Session>| {
                    let gateway = gateway.clone();
                    Box::pin(async move {
                        let session = ctx.data.take();
                        let sink = MilterQuarantine(&ctx.actions);
                        end_of_message(&gateway, session, &sink).await
                    })
                }
            })),

            abort: Some(Box::new(move |ctx: &mut indymilter::Context<Session>| {
                Box::pin(async move {
                    if let Some(session) = ctx.data.take() {
                        log::debug!("[{}] Message aborted", session.trace_id());
                    }
                    Status::Continue
                })
            })),

            ..Default::default()
        }
    }
}
