use std::collections::HashSet;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::{Duration, Instant};

use oadr_protocol::{
    MsgPackCodec, Reply, ReportSelector, SelectionElement, SignalInterval, VtnConfig,
    VtnHandlers, VtnServer,
};
use oadr_transport::{HttpConfig, VtnListener};

use crate::common::{elapsed_s, load_optional_keypair, setup_ctrlc};
use crate::events::{emit, EventOpt, EventRegistered, EventReport, EventStarted, EventStopped};

pub struct VtnOptions {
    pub vtn_id: String,
    pub listen: SocketAddr,
    pub prefix: String,
    pub key: Option<PathBuf>,
    pub poll_freq: Duration,
    pub demo_event: bool,
    pub report_interval: Duration,
}

/// Handlers that log every VEN interaction as JSONL.
fn handlers(report_interval: Duration) -> VtnHandlers {
    let selector = ReportSelector::compact(move |_offer| {
        Reply::ready(Some(vec![
            SelectionElement::callback(|values| {
                emit(&EventReport {
                    event: "report",
                    ven_id: values.ven_id.clone(),
                    report_request_id: values.report_request_id.clone(),
                    r_id: values.r_id.clone(),
                    samples: values.samples.len(),
                    last_value: values.samples.last().map(|(_, value)| *value),
                });
                Reply::ready(())
            }),
            SelectionElement::Duration(report_interval),
        ]))
    });

    VtnHandlers::new()
        .on_created_event(|ven_id, event_id, opt| {
            emit(&EventOpt::new(ven_id, event_id, opt));
            Reply::ready(())
        })
        .on_register_report(selector)
}

/// One five-minute event starting a minute from now.
fn demo_intervals() -> Vec<SignalInterval> {
    let start = chrono::Utc::now() + chrono::Duration::minutes(1);
    vec![
        SignalInterval::new(0, Duration::from_secs(120), 1.0).starting_at(start),
        SignalInterval::new(1, Duration::from_secs(180), 2.0),
    ]
}

pub async fn run(options: VtnOptions) -> anyhow::Result<()> {
    let start = Instant::now();
    let config = VtnConfig {
        keypair: load_optional_keypair(options.key.as_deref())?,
        requested_poll_freq: options.poll_freq,
        ..VtnConfig::new(options.vtn_id.clone())
    };
    let server = VtnServer::new(
        config,
        Arc::new(MsgPackCodec),
        handlers(options.report_interval),
    );
    server.start();

    let http = HttpConfig::new()
        .listen_addr(options.listen)
        .path_prefix(options.prefix.clone());
    let listener = VtnListener::bind(&http, Arc::new(server.clone())).await?;
    let endpoint = format!("http://{}{}", listener.local_addr(), http.get_path_prefix());

    emit(&EventStarted::new(
        &options.vtn_id,
        "vtn",
        &endpoint,
        server.fingerprint(),
    ));
    eprintln!("VTN {} serving {endpoint}", options.vtn_id);
    eprintln!("Press Ctrl+C to stop.\n");

    let running = setup_ctrlc();
    let mut known: HashSet<String> = HashSet::new();
    while running.load(Ordering::Relaxed) {
        tokio::time::sleep(Duration::from_millis(500)).await;

        for ven_id in server.registered_vens() {
            if known.contains(&ven_id) {
                continue;
            }
            emit(&EventRegistered::new(&ven_id, server.ven_name(&ven_id)));
            if options.demo_event {
                match server.add_simple_event(&ven_id, "SIMPLE", "level", demo_intervals(), None) {
                    Ok(event_id) => eprintln!("  demo event {event_id} queued for {ven_id}"),
                    Err(e) => eprintln!("  demo event for {ven_id} failed: {e}"),
                }
            }
            known.insert(ven_id);
        }
        known.retain(|ven_id| server.is_registered(ven_id));
    }

    listener.shutdown().await;
    server.stop().await;
    emit(&EventStopped::new(elapsed_s(start), &*server.stats()));
    Ok(())
}
