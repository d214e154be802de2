//! Console presentation of transfer events.

use crate::core::transfer::{TransferEvent, TransferStatus};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{info, warn};

/// Converts bytes to human-readable file size format
pub fn format_file_size(bytes: u64) -> String {
    const KB: u64 = 1024;
    const MB: u64 = KB * 1024;
    const GB: u64 = MB * 1024;

    if bytes >= GB {
        format!("{:.2} GB", bytes as f64 / GB as f64)
    } else if bytes >= MB {
        format!("{:.2} MB", bytes as f64 / MB as f64)
    } else if bytes >= KB {
        format!("{:.2} KB", bytes as f64 / KB as f64)
    } else {
        format!("{} B", bytes)
    }
}

pub fn format_eta(seconds: Option<f64>) -> String {
    match seconds {
        Some(s) if s.is_finite() => {
            let s = s.round() as u64;
            if s >= 3600 {
                format!("{}h{:02}m", s / 3600, (s % 3600) / 60)
            } else if s >= 60 {
                format!("{}m{:02}s", s / 60, s % 60)
            } else {
                format!("{s}s")
            }
        }
        _ => "--".to_string(),
    }
}

/// Drain transfer events into the log until every sender is dropped.
pub fn spawn_reporter(mut rx: mpsc::UnboundedReceiver<TransferEvent>) -> JoinHandle<()> {
    tokio::spawn(async move {
        while let Some(event) = rx.recv().await {
            match event {
                TransferEvent::Progress(p) => info!(
                    "{:5.1}%  {}/s  eta {}",
                    p.percent,
                    format_file_size(p.speed_bps as u64),
                    format_eta(p.eta_seconds)
                ),
                TransferEvent::Status(status) => report_status(status),
                TransferEvent::TextReceived(text) => info!(event = "text", "Message: {text}"),
                TransferEvent::ArchiveReady { files, path } => match path {
                    Some(path) => info!("Archive of {files} files saved to {}", path.display()),
                    None => info!("Archive of {files} files ready"),
                },
            }
        }
    })
}

fn report_status(status: TransferStatus) {
    match status {
        TransferStatus::ChannelOpen => info!("Data channel open"),
        TransferStatus::Hashing { name } => info!("Hashing {name}"),
        TransferStatus::Sending { index, total, name } => {
            info!("Sending {name} ({}/{total})", index + 1)
        }
        TransferStatus::AwaitingAck { file_id } => info!(%file_id, "Waiting for acknowledgement"),
        TransferStatus::AllFilesSent => info!("All files sent"),
        TransferStatus::Receiving { name, size } => {
            info!("Receiving {name} ({})", format_file_size(size))
        }
        TransferStatus::Received { name, integrity_verified: true } => info!("Received {name}"),
        TransferStatus::Received { name, integrity_verified: false } => {
            warn!("Received {name}, but its content hash did not match")
        }
        TransferStatus::ChannelClosed => info!("Data channel closed"),
        TransferStatus::ChannelError(reason) => warn!("Data channel error: {reason}"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_format_file_size() {
        assert_eq!(format_file_size(0), "0 B");
        assert_eq!(format_file_size(512), "512 B");
        assert_eq!(format_file_size(1536), "1.50 KB");
        assert_eq!(format_file_size(1048576), "1.00 MB");
        assert_eq!(format_file_size(1073741824), "1.00 GB");
    }

    #[test]
    fn test_format_eta() {
        assert_eq!(format_eta(None), "--");
        assert_eq!(format_eta(Some(f64::INFINITY)), "--");
        assert_eq!(format_eta(Some(42.4)), "42s");
        assert_eq!(format_eta(Some(125.0)), "2m05s");
        assert_eq!(format_eta(Some(3700.0)), "1h01m");
    }
}
