use std::fmt::Write;
use std::sync::Arc;

use anyhow::{Context, Result};
use indicatif::{ProgressBar, ProgressState, ProgressStyle};
use piecewise::{Config, Downloader, PeerAddress, TcpConnector, TorrentMetadata};
use tokio_util::sync::CancellationToken;
use tracing::warn;

fn progress_bar(total_size: u64) -> Result<ProgressBar> {
    let pb = ProgressBar::new(total_size);
    pb.set_style(
        ProgressStyle::with_template(
            "{spinner:.green} [{elapsed_precise}][{msg}] [{wide_bar:.cyan/blue}] {bytes}/{total_bytes} ({bytes_per_sec},{eta})",
        )?
        .with_key("eta", |state: &ProgressState, w: &mut dyn Write| {
            let _ = write!(w, "{:.1}s", state.eta().as_secs_f64());
        })
        .progress_chars("#>-"),
    );
    Ok(pb)
}

/// Runs the download with a progress bar. Ctrl-C cancels it.
pub async fn download_file(
    torrent: TorrentMetadata,
    peers: Vec<PeerAddress>,
    config: Config,
) -> Result<Vec<u8>> {
    let pb = progress_bar(torrent.length)?;
    let connector = Arc::new(TcpConnector::new(&config));
    let mut downloader = Downloader::new(torrent, config);

    let progress = downloader.progress();
    let bar = pb.clone();
    let reporter = tokio::spawn(async move {
        let mut downloaded = 0u64;
        while let Ok(p) = progress.recv_async().await {
            downloaded += p.length as u64;
            bar.set_position(downloaded);
            bar.set_message(format!("{}/{} pieces", p.completed, p.total));
        }
    });

    let cancel = CancellationToken::new();
    let on_signal = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("interrupted, stopping download");
            on_signal.cancel();
        }
    });

    let result = downloader.run(connector, peers, cancel).await;
    if let Err(e) = result {
        pb.abandon_with_message("failed");
        return Err(e).context("download failed");
    }

    let buf = downloader.into_output();
    let _ = reporter.await;
    pb.finish_with_message("done");
    Ok(buf)
}
