use std::{sync::Mutex, time::Duration};

use ahash::AHashMap;
use anyhow::Result;
use codec::{
    command::CommandStatus,
    message::{Header, MessageType, ReturnCode},
};
use someip_router_service::{
    Route, Service, ServiceHandler, ServiceOptions,
    eventgroups::Subscriber,
    pending::PendingKey,
    policy::{Access, Credentials, IdRange, Policy, PolicyMode, PolicySet, Rule},
    routing::{ServiceKey, Version},
};

#[derive(Default)]
struct Recorder {
    availability: Mutex<Vec<(ServiceKey, bool)>>,
    expired_requests: Mutex<Vec<PendingKey>>,
}

#[derive(Clone)]
struct Handler(std::sync::Arc<Recorder>);

impl ServiceHandler for Handler {
    fn on_availability(&self, key: ServiceKey, _version: Version, available: bool) {
        self.0.availability.lock().unwrap().push((key, available));
    }

    fn on_request_expired(&self, key: PendingKey, _method: u16) {
        self.0.expired_requests.lock().unwrap().push(key);
    }
}

fn service(
    mode: PolicyMode,
    policies: PolicySet,
) -> (std::sync::Arc<Service<Handler>>, std::sync::Arc<Recorder>) {
    let recorder = std::sync::Arc::new(Recorder::default());

    let service = Service::new(ServiceOptions {
        host_name: "routing-host".to_string(),
        static_clients: AHashMap::new(),
        policy_mode: mode,
        policies,
        request_timeout: Duration::from_secs(2),
        quarantine: Duration::from_secs(1),
        forwarding: false,
        handler: Handler(recorder.clone()),
    });

    (service, recorder)
}

fn credentials() -> Credentials {
    Credentials { uid: 1000, gid: 1000 }
}

fn request_header(service: u16, method: u16, client: u16) -> Header {
    let mut header = Header::new(service, method, MessageType::Request);
    header.client = client;
    header
}

const KEY: ServiceKey = (0x1234, 0x0001);

#[test]
fn disconnect_cleanup_revokes_offers_and_blocks_sends() -> Result<()> {
    let (service, recorder) = service(PolicyMode::Off, PolicySet::default());

    let offerer = service.assign_client("offerer", 100, credentials()).unwrap();
    let consumer = service.assign_client("consumer", 101, credentials()).unwrap();

    assert_eq!(service.offer(offerer, KEY, (1, 0)), CommandStatus::Ok);
    assert!(service.request(consumer, KEY, (1, 0)).unwrap());

    // The consumer can reach the offerer.
    let (route, session) = service
        .route_from_guest(consumer, KEY.1, &request_header(KEY.0, 0x0042, consumer))
        .unwrap();
    assert_eq!(route, Route::Local { client: offerer });
    assert_eq!(session, Some(1));

    // The offerer dies: its offer is withdrawn, availability flips, and
    // further sends bounce with E_NOT_REACHABLE.
    let stopped = service.release_client(offerer);
    assert_eq!(stopped, vec![(KEY, (1, 0))]);
    assert_eq!(
        recorder.availability.lock().unwrap().as_slice(),
        &[(KEY, true), (KEY, false)]
    );

    let error = service
        .route_from_guest(consumer, KEY.1, &request_header(KEY.0, 0x0042, consumer))
        .unwrap_err();
    assert_eq!(error, ReturnCode::NotReachable);

    // The released id is quarantined for a discovery round.
    let replacement = service.assign_client("offerer", 102, credentials()).unwrap();
    assert_ne!(replacement, offerer);

    Ok(())
}

#[test]
fn denying_a_uid_blocks_its_sends() -> Result<()> {
    let allow_all = PolicySet {
        policies: vec![Policy {
            uid: Some(1000),
            gid: None,
            requests: vec![Rule {
                service: KEY.0,
                instances: vec![IdRange::any()],
                methods: vec![IdRange::any()],
            }],
            offers: vec![Rule {
                service: KEY.0,
                instances: vec![IdRange::any()],
                methods: vec![IdRange::any()],
            }],
            ..Default::default()
        }],
    };

    let (service, _) = service(PolicyMode::Enforced, allow_all);

    let offerer = service.assign_client("offerer", 100, credentials()).unwrap();
    let consumer = service.assign_client("consumer", 101, credentials()).unwrap();

    assert_eq!(service.offer(offerer, KEY, (1, 0)), CommandStatus::Ok);

    let header = request_header(KEY.0, 0x0042, consumer);
    assert!(service.route_from_guest(consumer, KEY.1, &header).is_ok());

    // Revoke the allowance: the very next send is refused and nothing
    // reaches the offerer.
    service.policy().update(PolicySet::default());
    assert_eq!(
        service.route_from_guest(consumer, KEY.1, &header).unwrap_err(),
        ReturnCode::NotOk
    );

    Ok(())
}

#[test]
fn unanswered_requests_expire_with_a_timeout() -> Result<()> {
    let (service, recorder) = service(PolicyMode::Off, PolicySet::default());

    let offerer = service.assign_client("offerer", 100, credentials()).unwrap();
    let consumer = service.assign_client("consumer", 101, credentials()).unwrap();

    service.offer(offerer, KEY, (1, 0));

    let (_, session) = service
        .route_from_guest(consumer, KEY.1, &request_header(KEY.0, 0x0042, consumer))
        .unwrap();
    let session = session.unwrap();

    // Two ticks pass without a response.
    service.timer().add();
    service.sweep(service.timer().get());
    assert!(recorder.expired_requests.lock().unwrap().is_empty());

    service.timer().add();
    service.sweep(service.timer().get());
    assert_eq!(
        recorder.expired_requests.lock().unwrap().as_slice(),
        &[(KEY.0, KEY.1, consumer, session)]
    );

    Ok(())
}

#[test]
fn responses_pair_with_their_request() -> Result<()> {
    let (service, _) = service(PolicyMode::Off, PolicySet::default());

    let offerer = service.assign_client("offerer", 100, credentials()).unwrap();
    let consumer = service.assign_client("consumer", 101, credentials()).unwrap();

    service.offer(offerer, KEY, (1, 0));

    let (_, session) = service
        .route_from_guest(consumer, KEY.1, &request_header(KEY.0, 0x0042, consumer))
        .unwrap();

    // The offerer answers with the matching identifier tuple.
    let mut response = request_header(KEY.0, 0x0042, consumer);
    response.session = session.unwrap();
    response.message_type = MessageType::Response;

    let (route, patched) = service.route_from_guest(offerer, KEY.1, &response).unwrap();
    assert_eq!(route, Route::Local { client: consumer });
    assert_eq!(patched, None);

    Ok(())
}

#[test]
fn remote_requests_are_answered_back_to_their_endpoint() -> Result<()> {
    let (service, _) = service(PolicyMode::Off, PolicySet::default());

    let offerer = service.assign_client("offerer", 100, credentials()).unwrap();
    service.offer(offerer, KEY, (1, 0));

    let remote_client = 0x4001;
    let from = "192.168.1.20:40000".parse()?;

    let mut inbound = request_header(KEY.0, 0x0042, remote_client);
    inbound.session = 7;

    assert_eq!(
        service.route_inbound(KEY.1, &inbound, from, false),
        Some(Route::Local { client: offerer })
    );

    let mut response = inbound;
    response.message_type = MessageType::Response;

    let (route, _) = service.route_from_guest(offerer, KEY.1, &response).unwrap();
    assert_eq!(route, Route::Remote { endpoint: from, reliable: false });

    Ok(())
}

#[test]
fn remote_offers_expire_with_their_ttl() -> Result<()> {
    let (service, recorder) = service(PolicyMode::Off, PolicySet::default());

    let consumer = service.assign_client("consumer", 100, credentials()).unwrap();
    service.request(consumer, KEY, (1, 0)).unwrap();

    service.apply_remote_offer(KEY, (1, 0), None, Some("192.168.1.20:40000".parse()?), 3);
    assert!(service.routing().is_available(KEY));

    for _ in 0..2 {
        service.sweep(service.timer().add());
    }
    assert!(service.routing().is_available(KEY));

    service.sweep(service.timer().add());
    assert!(!service.routing().is_available(KEY));
    assert_eq!(
        recorder.availability.lock().unwrap().last(),
        Some(&(KEY, false))
    );

    Ok(())
}

#[test]
fn local_subscriptions_obey_the_eventgroup_policy() -> Result<()> {
    let policies = PolicySet {
        policies: vec![Policy {
            uid: Some(1000),
            gid: None,
            eventgroups: vec![Rule {
                service: KEY.0,
                instances: vec![IdRange::any()],
                methods: vec![IdRange::single(0x0005)],
            }],
            ..Default::default()
        }],
    };

    let (service, _) = service(PolicyMode::Enforced, policies);
    let consumer = service.assign_client("consumer", 100, credentials()).unwrap();

    assert_eq!(
        service.subscribe_local(consumer, (KEY.0, KEY.1, 0x0005), 3),
        CommandStatus::Ok
    );
    assert_eq!(
        service.subscribe_local(consumer, (KEY.0, KEY.1, 0x0006), 3),
        CommandStatus::Denied
    );

    assert_eq!(
        service.notification_targets(KEY, &[0x0005, 0x0006]),
        vec![Subscriber::Local(consumer)]
    );

    // Offers and requests of uid 1000 are not covered by the policy.
    assert!(!service.policy().authorize_service(&credentials(), Access::Offer, KEY.0, KEY.1));

    Ok(())
}
