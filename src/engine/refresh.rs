//! Background refresh: the cooperative download → merge → rotate cycle.

use log::{info, warn};
use tokio_util::sync::CancellationToken;

use crate::engine::PromoEngine;
use crate::error::PromoResult;
use crate::feed::decode_feed;

pub(crate) async fn refresh_loop(engine: PromoEngine, cancel: CancellationToken) {
    // Warm start: slots loaded from the persisted snapshot rotate right
    // away while the first download runs
    if engine.is_warm() {
        engine.rotate_all().await;
    }

    // Cancellation only interrupts the connectivity gate and the
    // inter-cycle sleep. A cycle that is past the gate runs to
    // completion, so every in-flight download either finishes or errors
    // and resets its candidate's texture state.
    loop {
        let delay = match run_cycle(&engine, &cancel).await {
            Ok(()) => engine.config().refresh_interval,
            Err(err) => {
                warn!("Ad refresh cycle failed: {err}");
                engine.event_sink().error("refresh", &err.to_string());
                engine.config().retry_backoff
            }
        };

        if cancel.is_cancelled() {
            break;
        }

        tokio::select! {
            _ = tokio::time::sleep(delay) => {}
            _ = cancel.cancelled() => break,
        }
    }

    info!("Ad refresh loop shutting down");
}

/// One full pass over every configured feed. A failure on any feed aborts
/// the remaining ones for this cycle; the snapshot is only persisted after
/// a clean pass. Cancellation before connectivity is a clean no-op pass.
pub(crate) async fn run_cycle(engine: &PromoEngine, cancel: &CancellationToken) -> PromoResult<()> {
    if !wait_for_connectivity(engine, cancel).await {
        return Ok(());
    }

    for (feed, url) in engine.config().feed_urls.iter().enumerate() {
        let body = engine.fetcher().fetch_text(url).await?;
        let entries = decode_feed(&body, &engine.config().package_rule)?;
        let outcome = engine.merge_feed(feed, &entries).await;

        if outcome.new_candidates {
            engine.randomize_feed(feed).await;
        }
        // A cold start rotates even when nothing changed, so every slot
        // ends up with an active ad selected
        if outcome.changed || !engine.is_warm() {
            engine.rotate_feed(feed).await;
        }
    }

    engine.persist_now().await?;
    engine.mark_warm();
    info!(
        "Ad refresh cycle complete ({} feeds)",
        engine.config().feed_urls.len()
    );
    Ok(())
}

/// Poll until the network is reachable. Returns false if cancelled first.
async fn wait_for_connectivity(engine: &PromoEngine, cancel: &CancellationToken) -> bool {
    let mut announced = false;
    while !engine.fetcher().reachable().await {
        if !announced {
            info!("Waiting for network before refreshing ads");
            announced = true;
        }
        tokio::select! {
            _ = tokio::time::sleep(engine.config().connectivity_poll) => {}
            _ = cancel.cancelled() => return false,
        }
    }
    true
}
