use std::path::PathBuf;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::{Duration, Instant};

use oadr_protocol::{
    Measurement, MsgPackCodec, OptType, Reply, ReportDefinition, VenClient, VenConfig,
};
use oadr_transport::{HttpClient, HttpConfig};

use crate::common::{elapsed_s, load_optional_keypair, setup_ctrlc};
use crate::events::{emit, EventOpt, EventRegistered, EventStarted, EventStopped};

pub struct VenOptions {
    pub vtn_url: String,
    pub ven_name: String,
    pub ven_id: Option<String>,
    pub key: Option<PathBuf>,
    pub vtn_fingerprint: Option<String>,
    pub opt_out: bool,
}

/// Synthetic power reading around 1 kW.
fn sample_power() -> f64 {
    let jitter = chrono::Utc::now().timestamp_subsec_millis() as f64 / 10.0;
    1000.0 + jitter
}

pub async fn run(options: VenOptions) -> anyhow::Result<()> {
    let start = Instant::now();
    let config = VenConfig {
        ven_id: options.ven_id.clone(),
        keypair: load_optional_keypair(options.key.as_deref())?,
        vtn_fingerprint: options.vtn_fingerprint.clone(),
        ..VenConfig::new(options.ven_name.clone())
    };
    let fingerprint = config.keypair.as_ref().map(|k| k.fingerprint());
    let transport = HttpClient::new(&HttpConfig::new().vtn_url(options.vtn_url.clone()))?;

    let decision = if options.opt_out {
        OptType::OptOut
    } else {
        OptType::OptIn
    };
    let (new_name, update_name) = (options.ven_name.clone(), options.ven_name.clone());
    let mut ven = VenClient::new(config, transport, Arc::new(MsgPackCodec))
        .on_event(move |event| {
            emit(&EventOpt::new(&new_name, &event.event_id, decision));
            Reply::ready(Ok(decision))
        })
        .on_update_event(move |event| {
            emit(&EventOpt::new(&update_name, &event.event_id, decision));
            Reply::ready(Ok(decision))
        });
    ven.add_report(
        ReportDefinition::new(|_| Reply::ready(vec![(chrono::Utc::now(), sample_power())]))
            .r_id("power")
            .measurement(Measurement::new("realPower", "RealPower", "W")),
    )?;

    emit(&EventStarted::new(
        &options.ven_name,
        "ven",
        &options.vtn_url,
        fingerprint,
    ));
    let handle = ven.run();

    let running = setup_ctrlc();
    let mut announced = false;
    while running.load(Ordering::Relaxed) && !handle.is_finished() {
        tokio::time::sleep(Duration::from_millis(500)).await;
        if announced {
            continue;
        }
        if let Ok(snapshot) = handle.snapshot().await {
            if let Some(registration) = snapshot.registration {
                emit(&EventRegistered::new(
                    &registration.ven_id,
                    Some(options.ven_name.clone()),
                ));
                announced = true;
            }
        }
    }

    let stats = handle.stats();
    let failed = handle.is_finished();
    handle.shutdown().await;
    emit(&EventStopped::new(elapsed_s(start), &*stats));
    if failed {
        anyhow::bail!("VEN stopped on its own, see the log for the cause");
    }
    Ok(())
}
