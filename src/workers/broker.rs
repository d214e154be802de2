//! `duodrop broker`

use super::args::BrokerArgs;
use crate::core::broker::server::BrokerServer;
use crate::utils::sos::SignalOfStop;
use anyhow::Result;
use tracing::info;

pub async fn run(args: BrokerArgs, sos: SignalOfStop) -> Result<()> {
    let config = args.to_config();
    info!(
        event = "broker_config",
        bind = %config.bind,
        origins = ?config.allowed_origins,
        "Starting signaling broker"
    );
    BrokerServer::bind(config, sos).await?.serve().await
}
