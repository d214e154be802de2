use duodrop::utils::sos::SignalOfStop;
use duodrop::workers::args::{Args, Command};
use duodrop::workers::{broker, peer};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::load()?;

    // webrtc_ice logs every late STUN response as a warning.
    let filter = match args.verbose {
        0 => "warn,duodrop=info,webrtc_ice=error",
        1 => "info,webrtc_ice=error",
        2 => "debug,webrtc_ice=error",
        _ => "trace",
    };
    let filter_layer = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(filter));

    tracing_subscriber::registry()
        .with(filter_layer)
        .with(tracing_subscriber::fmt::layer().with_target(false).with_writer(std::io::stderr))
        .init();

    let sos = SignalOfStop::new();

    // Ctrl+C handler
    let sos_clone = sos.clone();
    tokio::spawn(async move {
        tokio::signal::ctrl_c().await.ok();
        sos_clone.cancel();
    });

    match args.command {
        Command::Broker(broker_args) => broker::run(broker_args, sos).await,
        Command::Send(send_args) => peer::run_send(send_args, sos).await,
        Command::Receive(receive_args) => peer::run_receive(receive_args, sos).await,
    }
}
