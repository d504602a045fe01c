use std::path::PathBuf;
use std::process::ExitCode;

use clap::Parser;
use tracing::error;

use chatr_call::config::CallConfig;
use chatr_call::EndpointOptions;

#[derive(Parser)]
#[command(name = "chatr-call", about = "Chatr call signaling endpoint")]
struct Cli {
    /// Run the rendezvous relay instead of an endpoint
    #[arg(long)]
    serve_rendezvous: bool,

    /// API server port (rendezvous port with --serve-rendezvous)
    #[arg(long, default_value = "9848")]
    port: u16,

    /// Local party id
    #[arg(long)]
    party_id: Option<String>,

    /// Rendezvous root, e.g. ws://127.0.0.1:9850
    #[arg(long)]
    rendezvous: Option<String>,

    /// JSON config file (defaults to the platform config directory)
    #[arg(long)]
    config: Option<PathBuf>,

    /// Use the network-free connectivity engine
    #[arg(long)]
    loopback: bool,

    /// Negotiate tracks without opening the microphone
    #[arg(long)]
    headless_media: bool,

    /// Seconds an incoming call rings before timing out
    #[arg(long)]
    ring_timeout: Option<u64>,

    /// Seconds to wait for an answer after placing a call
    #[arg(long)]
    negotiate_timeout: Option<u64>,

    /// STUN server URL; repeat for several
    #[arg(long)]
    stun: Vec<String>,
}

impl Cli {
    fn call_config(&self) -> Result<CallConfig, chatr_call::error::CallError> {
        let mut config = CallConfig::load(self.config.as_deref())?;
        if let Some(party) = &self.party_id {
            config.party_id = party.clone();
        }
        if let Some(secs) = self.ring_timeout {
            config.ringing_timeout_secs = secs;
        }
        if let Some(secs) = self.negotiate_timeout {
            config.negotiating_timeout_secs = secs;
        }
        if !self.stun.is_empty() {
            config.ice_servers = self.stun.clone();
        }
        Ok(config)
    }
}

fn main() -> ExitCode {
    let cli = Cli::parse();
    chatr_call::init_tracing();

    let rt = match tokio::runtime::Runtime::new() {
        Ok(rt) => rt,
        Err(e) => {
            error!("Failed to create Tokio runtime: {}", e);
            return ExitCode::FAILURE;
        }
    };

    let result = if cli.serve_rendezvous {
        rt.block_on(chatr_call::run_rendezvous(cli.port))
    } else {
        cli.call_config().and_then(|config| {
            rt.block_on(chatr_call::run_endpoint(
                config,
                EndpointOptions {
                    api_port: cli.port,
                    rendezvous_url: cli.rendezvous.clone(),
                    loopback: cli.loopback,
                    headless_media: cli.headless_media,
                },
            ))
        })
    };

    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!("{}", e);
            ExitCode::FAILURE
        }
    }
}
