pub mod api;
pub mod config;
pub mod connectivity;
pub mod error;
pub mod events;
pub mod media;
pub mod models;
pub mod rendezvous;
pub mod session;
pub mod signaling;
pub mod state;

use std::sync::Arc;

use tracing::info;
use tracing_subscriber::EnvFilter;

use crate::config::CallConfig;
use crate::connectivity::loopback::LoopbackFactory;
use crate::connectivity::peer::WebRtcFactory;
use crate::connectivity::ConnectivityFactory;
use crate::error::CallError;
use crate::events::create_event_bus;
use crate::media::MediaCapture;
use crate::session::{CallHandle, ControllerDeps, SessionController};
use crate::signaling::hub::SignalingHub;
use crate::signaling::websocket::WsSignalingTransport;
use crate::signaling::SignalingTransport;
use crate::state::ServiceContext;

pub use crate::rendezvous::run_rendezvous;

/// Install the fmt subscriber. `RUST_LOG` overrides the default filter.
pub fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("chatr_call=info"));
    let _ = tracing_subscriber::fmt().with_env_filter(filter).try_init();
}

/// How an endpoint reaches the outside world.
#[derive(Debug, Clone)]
pub struct EndpointOptions {
    pub api_port: u16,
    /// Rendezvous root (`ws://host:port`). Without one the endpoint uses an
    /// in-process hub, which is only useful for demos.
    pub rendezvous_url: Option<String>,
    /// Use the network-free connectivity engine instead of WebRTC.
    pub loopback: bool,
    /// Negotiate tracks without opening capture devices.
    pub headless_media: bool,
}

/// Wire the controller to a transport, a connectivity factory and headless
/// media capture, and start it.
pub async fn start_endpoint(
    config: CallConfig,
    transport: Arc<dyn SignalingTransport>,
    connectivity: Arc<dyn ConnectivityFactory>,
) -> Result<ServiceContext, CallError> {
    start_endpoint_with_media(config, transport, connectivity, MediaCapture::headless()).await
}

pub async fn start_endpoint_with_media(
    config: CallConfig,
    transport: Arc<dyn SignalingTransport>,
    connectivity: Arc<dyn ConnectivityFactory>,
    media: MediaCapture,
) -> Result<ServiceContext, CallError> {
    let (event_tx, _event_rx) = create_event_bus();
    let calls: CallHandle = SessionController::start(ControllerDeps {
        config,
        transport,
        media,
        connectivity,
        events: event_tx.clone(),
    })
    .await?;
    Ok(ServiceContext::new(calls, event_tx))
}

/// Run an endpoint with its local API server. Blocks until the server exits.
pub async fn run_endpoint(config: CallConfig, opts: EndpointOptions) -> Result<(), CallError> {
    let transport: Arc<dyn SignalingTransport> = match &opts.rendezvous_url {
        Some(url) => Arc::new(WsSignalingTransport::new(url.clone())),
        None => Arc::new(SignalingHub::new()),
    };
    let connectivity: Arc<dyn ConnectivityFactory> = if opts.loopback {
        Arc::new(LoopbackFactory::new())
    } else {
        Arc::new(WebRtcFactory::new(config.ice_servers.clone()))
    };

    let party = config.party_id.clone();
    let media = media_capture(opts.headless_media);
    let ctx = start_endpoint_with_media(config, transport, connectivity, media).await?;
    info!("Endpoint {} ready", party);

    api::server::start_api_server(ctx, opts.api_port).await
}

#[cfg(feature = "native-audio")]
fn media_capture(headless: bool) -> MediaCapture {
    if headless {
        return MediaCapture::headless();
    }
    info!("Capturing audio from the default input device");
    MediaCapture::new(Arc::new(media::native::NativeAudioBackend::new()))
}

#[cfg(not(feature = "native-audio"))]
fn media_capture(headless: bool) -> MediaCapture {
    if !headless {
        tracing::warn!("Built without the native-audio feature, capture is headless");
    }
    MediaCapture::headless()
}
