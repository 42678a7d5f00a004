use std::sync::Arc;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use channel_relay::config::RelayConfig;
use channel_relay::relay::{self, Collaborators};
use channel_relay::transport::{IdentityTransform, Transport, TransportError};
use channel_relay::types::{ChannelId, MediaItem, MessageId, OutgoingPost};

#[tokio::main]
async fn main() {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "channel_relay=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let config_path = RelayConfig::path_from_env();
    let config = match RelayConfig::load(&config_path) {
        Ok(config) => config,
        Err(e) => {
            tracing::error!(path = %config_path.display(), error = %e, "cannot load configuration");
            std::process::exit(1);
        }
    };

    let shutdown = CancellationToken::new();
    {
        let shutdown = shutdown.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                tracing::info!("interrupt received");
                shutdown.cancel();
            }
        });
    }

    let collaborators = Collaborators {
        transport: Arc::new(DisconnectedTransport),
        transform: Arc::new(IdentityTransform),
        dump: None,
    };
    relay::run(config, config_path, collaborators, shutdown).await;
}

/// Placeholder platform client: sees no traffic and accepts no sends.
/// Deployments replace this with a binding to the real messaging platform.
struct DisconnectedTransport;

#[async_trait]
impl Transport for DisconnectedTransport {
    async fn fetch_new(
        &self,
        _channel: ChannelId,
        _since: MessageId,
        _limit: usize,
    ) -> Result<Vec<MediaItem>, TransportError> {
        Ok(Vec::new())
    }

    async fn head_id(&self, _channel: ChannelId) -> Result<MessageId, TransportError> {
        Ok(MessageId::ZERO)
    }

    async fn download(
        &self,
        _item: &MediaItem,
        _max_bytes: u64,
    ) -> Result<Vec<u8>, TransportError> {
        Err(TransportError::Transient("no platform client bound".into()))
    }

    async fn send(
        &self,
        _destination: ChannelId,
        _post: &OutgoingPost,
    ) -> Result<Vec<MessageId>, TransportError> {
        Err(TransportError::Transient("no platform client bound".into()))
    }
}
