use thiserror::Error;

#[derive(Debug, Error)]
pub enum BridgeError {
    #[error("Config error: {0}")]
    Config(String),
    #[error("Snapshot source unavailable: {0}")]
    SourceUnavailable(#[source] anyhow::Error),
    #[error("Malformed snapshot: `{window}` window has {len} entries")]
    MalformedSnapshot { window: &'static str, len: usize },
    #[error("Sink `{sink}` failed to apply {effect}: {source}")]
    SinkDelivery {
        sink: String,
        effect: &'static str,
        #[source]
        source: anyhow::Error,
    },
}
