/// End-to-end VEN ↔ VTN scenarios over the in-process loopback transport.
///
/// Each test drives the VEN step by step (register, poll, report) and
/// checks what the VTN operator observes.
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::Utc;
use oadr_protocol::message::{AvailabilityWindow, DistributeEvent, Message};
use oadr_protocol::{
    Event, EventSignal, Keypair, Loopback, Measurement, MsgPackCodec, OadrError, OptCallback,
    OptReason, OptType, Reply, ReportDefinition, ReportSelector, ReportValues, ResponseCode,
    SelectionElement, SignalInterval, Target, VenClient, VenConfig, VtnConfig, VtnHandlers,
    VtnServer,
};

type Ven = VenClient<Loopback<VtnServer>>;

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter("warn")
        .try_init();
}

fn vtn(handlers: VtnHandlers) -> VtnServer {
    VtnServer::new(VtnConfig::new("vtn-1"), Arc::new(MsgPackCodec), handlers)
}

fn ven_with(server: &VtnServer, config: VenConfig) -> Ven {
    VenClient::new(
        config,
        Loopback::new(Arc::new(server.clone())),
        Arc::new(MsgPackCodec),
    )
}

fn ven(server: &VtnServer, name: &str) -> Ven {
    ven_with(server, VenConfig::new(name))
}

/// Two one-minute intervals starting `starts_in` from now.
fn intervals(starts_in: Duration) -> Vec<SignalInterval> {
    let start = Utc::now() + chrono::Duration::from_std(starts_in).unwrap();
    vec![
        SignalInterval::new(0, Duration::from_secs(60), 1.0).starting_at(start),
        SignalInterval::new(1, Duration::from_secs(60), 2.0),
    ]
}

#[tokio::test]
async fn event_is_distributed_answered_and_acknowledged() {
    init_tracing();
    let server = vtn(VtnHandlers::new());
    let mut ven = ven(&server, "ven-a").on_event(|_| Reply::ready(Ok(OptType::OptIn)));

    let registration = ven.register_party().await.unwrap();
    assert!(server.is_registered(&registration.ven_id));
    assert_eq!(registration.vtn_id, "vtn-1");
    assert_eq!(registration.poll_frequency, Duration::from_secs(10));

    let (callback, answer) = OptCallback::promise();
    let event_id = server
        .add_simple_event(
            &registration.ven_id,
            "SIMPLE",
            "level",
            intervals(Duration::from_secs(3600)),
            Some(callback),
        )
        .unwrap();

    assert_eq!(ven.poll().await.unwrap(), 1);
    assert_eq!(answer.await.unwrap(), OptType::OptIn);
    assert_eq!(ven.decision(&event_id), Some(OptType::OptIn));

    // Queue is drained: the next poll gets an empty response.
    assert_eq!(ven.poll().await.unwrap(), 0);

    let stats = server.stats();
    assert_eq!(stats.events_distributed.get(), 1);
    assert_eq!(stats.opt_responses.get(), 1);
    assert_eq!(ven.stats().event_responses_sent.get(), 1);
}

#[tokio::test]
async fn modification_and_cancellation_are_redistributed() {
    init_tracing();
    let answers = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&answers);
    let server = vtn(VtnHandlers::new().on_created_event(move |_, event_id, opt| {
        sink.lock().unwrap().push((event_id.to_string(), opt));
        Reply::ready(())
    }));

    let new_calls = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&new_calls);
    let mut ven = ven(&server, "ven-b")
        .on_event(move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
            Reply::ready(Ok(OptType::OptIn))
        })
        .on_update_event(|_| Reply::ready(Ok(OptType::OptOut)));
    let ven_id = ven.register_party().await.unwrap().ven_id;

    let event_id = server
        .add_simple_event(&ven_id, "SIMPLE", "level", intervals(Duration::from_secs(3600)), None)
        .unwrap();
    assert_eq!(ven.poll().await.unwrap(), 1);
    assert_eq!(ven.decision(&event_id), Some(OptType::OptIn));

    server
        .modify_event(&ven_id, &event_id, |event| event.priority = 1)
        .unwrap();
    assert_eq!(ven.poll().await.unwrap(), 1);
    assert_eq!(ven.decision(&event_id), Some(OptType::OptOut));
    assert_eq!(new_calls.load(Ordering::SeqCst), 1);

    server.cancel_event(&ven_id, &event_id).unwrap();
    assert_eq!(ven.poll().await.unwrap(), 1);
    let held = ven.events().iter().find(|e| e.event_id == event_id).unwrap();
    assert!(held.is_cancelled());
    assert_eq!(held.modification_number, 2);

    // Delivered once more, then forgotten by the VTN.
    assert!(server.events_for(&ven_id).is_empty());
    assert_eq!(ven.poll().await.unwrap(), 0);

    let answers = answers.lock().unwrap().clone();
    assert_eq!(
        answers,
        vec![
            (event_id.clone(), OptType::OptIn),
            (event_id.clone(), OptType::OptOut),
            (event_id, OptType::OptOut),
        ]
    );
}

#[tokio::test]
async fn request_event_returns_every_pending_event_in_order() {
    init_tracing();
    let server = vtn(VtnHandlers::new());
    let mut ven = ven(&server, "ven-c").on_event(|_| Reply::ready(Ok(OptType::OptIn)));
    let ven_id = ven.register_party().await.unwrap().ven_id;

    let later = server
        .add_simple_event(&ven_id, "SIMPLE", "level", intervals(Duration::from_secs(7200)), None)
        .unwrap();
    let sooner = server
        .add_simple_event(&ven_id, "SIMPLE", "level", intervals(Duration::from_secs(3600)), None)
        .unwrap();

    let decided = ven.request_event(None).await.unwrap();
    let ids: Vec<&str> = decided.iter().map(|(id, _)| id.as_str()).collect();
    assert_eq!(ids, [sooner.as_str(), later.as_str()]);

    // Already handed out, nothing new for the next poll.
    assert_eq!(ven.poll().await.unwrap(), 0);
}

#[tokio::test]
async fn events_held_back_by_reply_limit_arrive_on_the_next_poll() {
    init_tracing();
    let server = vtn(VtnHandlers::new());
    let mut ven = ven(&server, "ven-c2").on_event(|_| Reply::ready(Ok(OptType::OptIn)));
    let ven_id = ven.register_party().await.unwrap().ven_id;

    let sooner = server
        .add_simple_event(&ven_id, "SIMPLE", "level", intervals(Duration::from_secs(3600)), None)
        .unwrap();
    let later = server
        .add_simple_event(&ven_id, "SIMPLE", "level", intervals(Duration::from_secs(7200)), None)
        .unwrap();

    let decided = ven.request_event(Some(1)).await.unwrap();
    assert_eq!(decided, vec![(sooner.clone(), OptType::OptIn)]);
    assert_eq!(ven.decision(&later), None);

    assert_eq!(ven.poll().await.unwrap(), 1);
    assert_eq!(ven.decision(&sooner), Some(OptType::OptIn));
    assert_eq!(ven.decision(&later), Some(OptType::OptIn));
    assert_eq!(ven.poll().await.unwrap(), 0);
}

#[tokio::test]
async fn operator_callback_follows_a_changed_decision() {
    init_tracing();
    let server = vtn(VtnHandlers::new());
    let mut ven = ven(&server, "ven-f")
        .on_event(|_| Reply::ready(Ok(OptType::OptIn)))
        .on_update_event(|_| Reply::ready(Ok(OptType::OptOut)));
    let ven_id = ven.register_party().await.unwrap().ven_id;

    let heard = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&heard);
    let callback = OptCallback::function(move |_, _, opt| {
        sink.lock().unwrap().push(opt);
        Reply::ready(())
    });
    let event_id = server
        .add_simple_event(
            &ven_id,
            "SIMPLE",
            "level",
            intervals(Duration::from_secs(3600)),
            Some(callback),
        )
        .unwrap();
    assert_eq!(ven.poll().await.unwrap(), 1);

    server
        .modify_event(&ven_id, &event_id, |event| event.priority = 1)
        .unwrap();
    assert_eq!(ven.poll().await.unwrap(), 1);

    assert_eq!(ven.decision(&event_id), Some(OptType::OptOut));
    assert_eq!(*heard.lock().unwrap(), vec![OptType::OptIn, OptType::OptOut]);
}

#[tokio::test]
async fn reports_flow_to_the_selected_callback_until_cancelled() {
    init_tracing();
    let received: Arc<Mutex<Vec<ReportValues>>> = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&received);
    let selector = ReportSelector::compact(move |offer| {
        assert_eq!(offer.description.r_id, "power");
        let sink = Arc::clone(&sink);
        Reply::ready(Some(vec![
            SelectionElement::callback(move |values| {
                sink.lock().unwrap().push(values);
                Reply::ready(())
            }),
            SelectionElement::Duration(Duration::from_secs(10)),
        ]))
    });
    let server = vtn(VtnHandlers::new().on_register_report(selector));

    let mut ven = ven(&server, "ven-d");
    ven.add_report(
        ReportDefinition::new(|_| Reply::ready(vec![(Utc::now(), 42.0)]))
            .r_id("power")
            .resource_id("meter-1")
            .measurement(Measurement::new("realPower", "RealPower", "W")),
    )
    .unwrap();
    let ven_id = ven.register_party().await.unwrap().ven_id;

    let accepted = ven.register_reports().await.unwrap();
    assert_eq!(accepted.len(), 1);
    let request_id = accepted[0].clone();

    assert!(ven.collect_report(&request_id).await);
    assert_eq!(ven.flush_reports().await, 1);
    {
        let received = received.lock().unwrap();
        assert_eq!(received.len(), 1);
        assert_eq!(received[0].ven_id, ven_id);
        assert_eq!(received[0].r_id, "power");
        assert_eq!(received[0].report_request_id, request_id);
        assert_eq!(received[0].samples.len(), 1);
        assert_eq!(received[0].samples[0].1, 42.0);
    }

    server.cancel_report(&ven_id, &request_id).unwrap();
    assert_eq!(server.queued_messages(&ven_id), 1);

    // The next delivery carries the cancellation back.
    assert!(ven.collect_report(&request_id).await);
    assert_eq!(ven.flush_reports().await, 1);
    assert!(ven.active_report_ids().is_empty());
    assert_eq!(received.lock().unwrap().len(), 1);
    assert_eq!(server.queued_messages(&ven_id), 0);
}

#[tokio::test]
async fn reregistration_keeps_the_identity() {
    init_tracing();
    let server = vtn(VtnHandlers::new());
    let mut ven = ven(&server, "ven-e");
    let first = ven.register_party().await.unwrap();

    server.request_reregistration(&first.ven_id);
    assert_eq!(ven.poll().await.unwrap(), 1);

    let again = ven.registration().unwrap();
    assert_eq!(again.ven_id, first.ven_id);
    assert_eq!(again.registration_id, first.registration_id);
    assert_eq!(server.stats().registrations.get(), 2);
}

#[tokio::test]
async fn rejected_registration_leaves_the_ven_unregistered() {
    init_tracing();
    let server = vtn(VtnHandlers::new().on_create_party_registration(|_| Reply::ready(None)));
    let mut ven = ven(&server, "ven-f");

    assert!(matches!(ven.register_party().await, Err(OadrError::NotRegistered)));
    assert!(ven.registration().is_none());
    assert!(matches!(ven.poll().await, Err(OadrError::NotRegistered)));
    assert!(server.registered_vens().is_empty());
}

#[tokio::test]
async fn cancelled_registration_is_forgotten_by_both_sides() {
    init_tracing();
    let cancelled = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&cancelled);
    let server = vtn(VtnHandlers::new().on_cancel_party_registration(move |ven_id, _| {
        sink.lock().unwrap().push(ven_id.to_string());
        Reply::ready(())
    }));
    let mut ven = ven(&server, "ven-g");
    let ven_id = ven.register_party().await.unwrap().ven_id;
    assert_eq!(server.stats().registered_vens.get(), 1);

    ven.cancel_party_registration().await.unwrap();
    assert_eq!(server.stats().registered_vens.get(), 0);
    assert!(ven.registration().is_none());
    assert!(!server.is_registered(&ven_id));
    assert_eq!(*cancelled.lock().unwrap(), vec![ven_id]);
}

#[tokio::test]
async fn opt_schedules_reach_the_operator() {
    init_tracing();
    let server = vtn(
        VtnHandlers::new()
            .on_create_opt(|opt| {
                let accepted = opt.opt_reason == OptReason::Economic;
                Reply::ready(if accepted {
                    ResponseCode::Ok
                } else {
                    ResponseCode::NotAllowed
                })
            })
            .on_cancel_opt(|_, _| Reply::ready(ResponseCode::InvalidId)),
    );
    let mut ven = ven(&server, "ven-h");
    ven.register_party().await.unwrap();

    let window = AvailabilityWindow {
        dtstart: Utc::now(),
        duration: Duration::from_secs(3600),
    };
    let opt_id = ven
        .create_opt(OptType::OptOut, OptReason::Economic, None, vec![window])
        .await
        .unwrap();

    let refused = ven
        .create_opt(OptType::OptOut, OptReason::Emergency, None, Vec::new())
        .await
        .unwrap_err();
    assert_eq!(refused.response_code(), ResponseCode::NotAllowed);

    let err = ven.cancel_opt(&opt_id).await.unwrap_err();
    assert_eq!(err.response_code(), ResponseCode::InvalidId);
}

#[tokio::test]
async fn signed_exchange_pins_both_fingerprints() {
    init_tracing();
    let vtn_key = Keypair::generate();
    let vtn_fingerprint = vtn_key.fingerprint();
    let server = VtnServer::new(
        VtnConfig {
            keypair: Some(vtn_key),
            require_signatures: true,
            ..VtnConfig::new("vtn-signed")
        },
        Arc::new(MsgPackCodec),
        VtnHandlers::new(),
    );

    let mut trusted = ven_with(
        &server,
        VenConfig {
            keypair: Some(Keypair::generate()),
            vtn_fingerprint: Some(vtn_fingerprint),
            ..VenConfig::new("signed-ven")
        },
    );
    let registration = trusted.register_party().await.unwrap();
    assert_eq!(trusted.poll().await.unwrap(), 0);

    // Unsigned VEN: the VTN drops it without an answer.
    let mut unsigned = ven(&server, "unsigned-ven");
    assert!(unsigned.register_party().await.is_err());
    assert_eq!(unsigned.stats().transport_failures.get(), 1);

    // VEN expecting another VTN key: the answer is discarded.
    let mut suspicious = ven_with(
        &server,
        VenConfig {
            keypair: Some(Keypair::generate()),
            vtn_fingerprint: Some(Keypair::generate().fingerprint()),
            ..VenConfig::new("suspicious-ven")
        },
    );
    assert!(suspicious.register_party().await.is_err());
    assert_eq!(suspicious.stats().messages_rejected.get(), 1);

    assert_eq!(server.registered_vens().len(), 2);
    assert!(server.is_registered(&registration.ven_id));
}

#[tokio::test]
async fn answers_for_events_the_vtn_never_stored_are_refused() {
    init_tracing();
    let ghost = Event::builder()
        .signal(EventSignal::parse("SIMPLE", "level", intervals(Duration::from_secs(600))).unwrap())
        .target(Target::ven_id("ven-k"))
        .build()
        .unwrap();
    let ghost_id = ghost.event_id.clone();

    // The override hands out the event once, without storing it.
    let handed_out = Arc::new(AtomicBool::new(false));
    let server = vtn(VtnHandlers::new().on_poll(move |_| {
        let first = !handed_out.swap(true, Ordering::SeqCst);
        Reply::ready(first.then(|| {
            Message::DistributeEvent(DistributeEvent::new("vtn-1", vec![ghost.clone()]))
        }))
    }));
    assert!(matches!(
        server.add_event("ven-k", server_event(), None),
        Err(OadrError::Config(_))
    ));

    let mut ven = ven_with(
        &server,
        VenConfig {
            ven_id: Some("ven-k".into()),
            ..VenConfig::new("ven-k")
        },
    )
    .on_event(|_| Reply::ready(Ok(OptType::OptIn)));
    ven.register_party().await.unwrap();

    assert_eq!(ven.poll().await.unwrap(), 1);
    assert_eq!(ven.decision(&ghost_id), Some(OptType::OptIn));
    // Counted on arrival, then refused as an unknown id.
    assert_eq!(server.stats().opt_responses.get(), 1);
    assert_eq!(ven.poll().await.unwrap(), 0);
}

fn server_event() -> Event {
    Event::builder()
        .signal(EventSignal::parse("SIMPLE", "level", intervals(Duration::from_secs(60))).unwrap())
        .target(Target::ven_id("ven-k"))
        .build()
        .unwrap()
}
