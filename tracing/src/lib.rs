//! Process-wide tracing setup for the mount daemon, used from `main()` only
//! (library code never installs a subscriber itself). Adapted from the
//! teacher's `TracingBuilder`/`TracingHandle` pair, with the otlp/tracy/tonic
//! exporter surface dropped: daemon lifecycle and the RPC management surface
//! are out of scope here, so there is nothing downstream of this process to
//! export spans to.

use indicatif::ProgressStyle;
use lazy_static::lazy_static;
use tokio::sync::{mpsc, oneshot};
use tracing::Level;
use tracing_indicatif::{filter::IndicatifFilter, IndicatifLayer};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Layer};

lazy_static! {
    pub static ref PB_PROGRESS_STYLE: ProgressStyle = ProgressStyle::with_template(
        "{span_child_prefix}{bar:30} {wide_msg} [{elapsed_precise}]  {pos:>7}/{len:7}"
    )
    .expect("invalid progress template");
    pub static ref PB_SPINNER_STYLE: ProgressStyle = ProgressStyle::with_template(
        "{span_child_prefix}{spinner} {wide_msg} [{elapsed_precise}]  {pos:>7}/{len:7}"
    )
    .expect("invalid progress template");
}

#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error(transparent)]
    Init(#[from] tracing_subscriber::util::TryInitError),

    #[error(transparent)]
    MpscSend(#[from] mpsc::error::SendError<Option<oneshot::Sender<()>>>),

    #[error(transparent)]
    OneshotRecv(#[from] oneshot::error::RecvError),
}

/// Handle to the installed subscriber, kept alive by the daemon's `main()`
/// for the duration of the process.
#[derive(Clone)]
pub struct TracingHandle {
    _private: (),
}

impl TracingHandle {
    /// No-op placeholder for a flush barrier; kept so call sites read the
    /// same way they would if an exporter were later added back.
    pub async fn flush(&self) -> Result<(), Error> {
        Ok(())
    }
}

pub struct TracingBuilder {
    level: Level,
}

impl Default for TracingBuilder {
    fn default() -> Self {
        TracingBuilder { level: Level::INFO }
    }
}

impl TracingBuilder {
    /// Sets the log level for the stderr layer. `RUST_LOG` still takes
    /// priority over this value.
    pub fn level(mut self, level: Level) -> TracingBuilder {
        self.level = level;
        self
    }

    /// Installs a stderr fmt layer plus an `EnvFilter` built from `level`
    /// (overridable via `RUST_LOG`), with an indicatif-aware writer so
    /// progress bars (checkout fast-path, prefetch) don't get torn by
    /// interleaved log lines.
    pub fn build(self) -> Result<TracingHandle, Error> {
        let indicatif_layer = IndicatifLayer::new().with_progress_style(PB_SPINNER_STYLE.clone());
        let subscriber = tracing_subscriber::registry()
            .with(
                EnvFilter::builder()
                    .with_default_directive(self.level.into())
                    .from_env()
                    .expect("invalid RUST_LOG"),
            )
            .with(
                tracing_subscriber::fmt::Layer::new()
                    .with_writer(indicatif_layer.get_stderr_writer())
                    .compact(),
            )
            .with(indicatif_layer.with_filter(IndicatifFilter::new(false)));

        subscriber.try_init()?;
        Ok(TracingHandle { _private: () })
    }
}
