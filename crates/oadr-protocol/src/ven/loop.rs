/// The VEN event loop.
///
/// One task owns the [`VenClient`] and multiplexes scheduled jobs,
/// cancellations coming back from the report worker, and commands from
/// the [`VenHandle`](super::VenHandle). Report delivery runs in a second
/// task so a slow VTN never delays polling.
use tokio::sync::{mpsc, watch};

use super::client::{deliver_report, Link, Outgoing, VenClient};
use super::{VenCommand, VenJob};
use crate::message::CancelReport;
use crate::transport::Transport;

pub(super) async fn ven_loop<T: Transport>(
    mut client: VenClient<T>,
    mut cmd_rx: mpsc::Receiver<VenCommand>,
) {
    if let Err(e) = client.register_party().await {
        tracing::error!("not starting automatic operation: {e}");
        client.stop();
        return;
    }

    let Some(mut fired_rx) = client.take_fired() else {
        tracing::error!("VEN loop started twice");
        client.stop();
        return;
    };

    // ── Report worker ───────────────────────────────────────────────
    let (cancel_tx, mut cancel_rx) = mpsc::unbounded_channel::<CancelReport>();
    let (stop_tx, stop_rx) = watch::channel(false);
    let worker = client
        .take_outbox()
        .map(|outbox| tokio::spawn(report_worker(client.link(), outbox, cancel_tx, stop_rx)));

    client.start();
    if let Err(e) = client.register_reports().await {
        tracing::warn!("report registration failed: {e}");
    }
    poll(&mut client).await;

    loop {
        tokio::select! {
            Some(job) = fired_rx.recv() => match job {
                VenJob::Poll => poll(&mut client).await,
                VenJob::EventCleanup => {
                    client.cleanup_events();
                }
                VenJob::Report(report_request_id) => {
                    client.collect_report(&report_request_id).await;
                }
            },

            Some(cancel) = cancel_rx.recv() => {
                client.handle_piggybacked_cancel(cancel).await;
            }

            cmd = cmd_rx.recv() => match cmd {
                Some(VenCommand::Snapshot { reply }) => {
                    let _ = reply.send(client.snapshot());
                }
                Some(VenCommand::Shutdown) | None => break,
            },
        }
    }

    client.stop();
    let _ = stop_tx.send(true);
    if let Some(worker) = worker {
        if let Err(e) = worker.await {
            tracing::warn!("report worker ended abnormally: {e}");
        }
    }
    tracing::info!("VEN stopped");
}

async fn poll<T: Transport>(client: &mut VenClient<T>) {
    match client.poll().await {
        Ok(0) => {}
        Ok(handled) => tracing::debug!("handled {handled} message(s) from the VTN"),
        Err(e) => tracing::warn!("poll skipped: {e}"),
    }
}

/// Sends completed reports one at a time, in the order they were queued.
async fn report_worker<T: Transport>(
    link: Link<T>,
    mut outbox: mpsc::UnboundedReceiver<Outgoing>,
    cancel_tx: mpsc::UnboundedSender<CancelReport>,
    mut stop_rx: watch::Receiver<bool>,
) {
    loop {
        let outgoing = tokio::select! {
            biased;
            _ = stop_rx.changed() => break,
            outgoing = outbox.recv() => match outgoing {
                Some(outgoing) => outgoing,
                None => break,
            },
        };
        if let Some(cancel) = deliver_report(&link, outgoing).await {
            if cancel_tx.send(cancel).is_err() {
                break;
            }
        }
    }
}
