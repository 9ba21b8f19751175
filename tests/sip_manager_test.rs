//! End-to-end behaviour of the registration state machine

mod common;

use common::*;
use sipwatch::config::TransportKind;
use sipwatch::domain::registration::{REASON_MISSING_CREDENTIALS, REASON_STOPPED};
use sipwatch::ConnectionState;
use std::time::Duration;

#[tokio::test(start_paused = true)]
async fn test_successful_registration_refreshes_at_half_expiry() {
    let transport = ScriptedTransport::new(vec![Reply::ok(3600), Reply::ok(3600)]);
    let manager = manager(alice(), transport.clone(), Lookup::Resolve);
    let mut events = manager.subscribe_status();

    manager.start().await;
    assert_eq!(next_event(&mut events).await.state, ConnectionState::Registering);
    assert_eq!(next_event(&mut events).await.state, ConnectionState::Registered);

    let sent = transport.sent();
    assert_eq!(sent.len(), 1);
    let wire = sent[0].inner.to_string();
    assert!(wire.starts_with("REGISTER sip:sip.example.com:5060 SIP/2.0"));
    assert!(wire.contains("Expires: 3600"));
    assert!(wire.contains("<sip:alice@sip.example.com>"));

    let health = manager.check_health();
    assert!(health.healthy);
    assert!(health.re_registration_timer_active);
    assert!(!health.reconnect_scheduled);

    tokio::time::sleep(Duration::from_secs(1799)).await;
    assert_eq!(transport.sent().len(), 1);

    tokio::time::sleep(Duration::from_secs(2)).await;
    assert_eq!(transport.sent().len(), 2);
    assert_eq!(manager.state(), ConnectionState::Registered);
}

#[tokio::test(start_paused = true)]
async fn test_challenge_is_answered_with_incremented_cseq() {
    let transport = ScriptedTransport::new(vec![Reply::challenge("example.com"), Reply::ok(3600)]);
    let manager = manager(alice(), transport.clone(), Lookup::Resolve);
    let mut events = manager.subscribe_status();

    manager.start().await;
    wait_for_state(&mut events, ConnectionState::Registered).await;

    let sent = transport.sent();
    assert_eq!(sent.len(), 2);
    assert!(!has_authorization(&sent[0]));
    assert!(has_authorization(&sent[1]));
    assert_eq!(sent[1].cseq().unwrap(), sent[0].cseq().unwrap() + 1);
    assert!(sent[1].inner.to_string().contains(r#"realm="example.com""#));
}

#[tokio::test(start_paused = true)]
async fn test_incoming_call_is_rung_then_rejected() {
    let transport = ScriptedTransport::new(vec![Reply::ok(3600)]);
    let manager = manager(alice(), transport.clone(), Lookup::Resolve);
    let mut events = manager.subscribe_status();
    let mut calls = manager.subscribe_calls();

    manager.start().await;
    wait_for_state(&mut events, ConnectionState::Registered).await;

    transport
        .deliver(invite_from(
            r#""Jane Doe" <sip:+15551234567@sip.example.com>;tag=9fxced76sl"#,
        ))
        .await;

    assert_eq!(transport.responses(), vec![100, 180]);
    let call = calls.try_recv().unwrap();
    assert_eq!(call.display_name, "Jane Doe");
    assert_eq!(call.number, "+15551234567");
    assert_eq!(call.normalized_number, "15551234567");

    tokio::time::sleep(Duration::from_millis(1100)).await;
    assert_eq!(transport.responses(), vec![100, 180, 486]);
    assert!(calls.try_recv().is_err());
}

#[tokio::test(start_paused = true)]
async fn test_invite_before_registration_gets_503() {
    let transport = ScriptedTransport::new(vec![Reply::Hang]);
    let manager = manager(alice(), transport.clone(), Lookup::Resolve);
    let mut calls = manager.subscribe_calls();

    manager.start().await;
    transport
        .deliver(invite_from("<sip:+15551234567@sip.example.com>"))
        .await;

    assert_eq!(transport.responses(), vec![503]);
    assert!(calls.try_recv().is_err());
}

#[tokio::test(start_paused = true)]
async fn test_unreachable_server_does_not_reconnect() {
    let transport = ScriptedTransport::new(vec![Reply::ok(3600)]);
    let manager = manager(alice(), transport.clone(), Lookup::Hang);
    let mut events = manager.subscribe_status();

    let started = tokio::time::Instant::now();
    manager.start().await;
    assert!(started.elapsed() >= Duration::from_secs(3));

    let event = next_event(&mut events).await;
    assert_eq!(event.state, ConnectionState::Error);
    assert!(event.cause().unwrap().contains("not reachable"));
    assert!(!manager.check_health().reconnect_scheduled);

    tokio::time::sleep(Duration::from_secs(120)).await;
    assert_eq!(transport.starts(), 0);
    assert!(transport.sent().is_empty());
    assert_eq!(manager.state(), ConnectionState::Error);
}

#[tokio::test(start_paused = true)]
async fn test_dns_failure_is_reported() {
    let transport = ScriptedTransport::new(vec![]);
    let manager = manager(alice(), transport.clone(), Lookup::Fail);

    manager.start().await;

    assert_eq!(manager.state(), ConnectionState::Error);
    assert!(!manager.check_health().reconnect_scheduled);
}

#[tokio::test(start_paused = true)]
async fn test_reconnect_gives_up_after_three_failures() {
    let transport = ScriptedTransport::new(vec![
        Reply::status(503),
        Reply::status(503),
        Reply::status(503),
        Reply::ok(3600),
    ]);
    let manager = manager(alice(), transport.clone(), Lookup::Resolve);
    let mut events = manager.subscribe_status();

    manager.start().await;
    let event = wait_for_cause(&mut events, "Reconnection failed after multiple attempts").await;
    assert_eq!(event.state, ConnectionState::Error);
    assert_eq!(transport.sent().len(), 3);

    tokio::time::sleep(Duration::from_secs(300)).await;
    assert_eq!(transport.sent().len(), 3);
    assert_eq!(manager.state(), ConnectionState::Error);
    assert!(!manager.check_health().reconnect_scheduled);
}

#[tokio::test(start_paused = true)]
async fn test_reconnect_backs_off() {
    let transport = ScriptedTransport::new(vec![Reply::status(500), Reply::status(500)]);
    let manager = manager(alice(), transport.clone(), Lookup::Resolve);
    let mut events = manager.subscribe_status();

    manager.start().await;
    wait_for_state(&mut events, ConnectionState::Error).await;
    let first_failure = tokio::time::Instant::now();

    wait_for_state(&mut events, ConnectionState::Error).await;
    // 5s backoff plus settle delay
    assert!(first_failure.elapsed() >= Duration::from_secs(5));
    assert!(manager.check_health().reconnect_scheduled);

    tokio::time::sleep(Duration::from_secs(9)).await;
    assert_eq!(transport.sent().len(), 2);
    tokio::time::sleep(Duration::from_secs(2)).await;
    assert_eq!(transport.sent().len(), 3);
}

#[tokio::test(start_paused = true)]
async fn test_fatal_responses_schedule_one_reconnect() {
    let cases = [
        (403, "Authentication failed"),
        (404, "User not found"),
        (408, "Server error"),
        (500, "Server error"),
        (502, "Server error"),
        (503, "Server error"),
    ];

    for (code, cause) in cases {
        let transport = ScriptedTransport::new(vec![Reply::status(code)]);
        let manager = manager(alice(), transport.clone(), Lookup::Resolve);
        let mut events = manager.subscribe_status();

        manager.start().await;
        let event = wait_for_state(&mut events, ConnectionState::Error).await;

        assert_eq!(event.cause(), Some(cause), "status {}", code);
        assert_eq!(event.status_code(), Some(code));
        let health = manager.check_health();
        assert!(health.reconnect_scheduled, "status {}", code);
        assert!(!health.re_registration_timer_active);

        manager.stop().await;
    }
}

#[tokio::test(start_paused = true)]
async fn test_connection_timeout() {
    let transport = ScriptedTransport::new(vec![Reply::Hang]);
    let manager = manager(alice(), transport.clone(), Lookup::Resolve);
    let mut events = manager.subscribe_status();

    manager.start().await;
    let registering = tokio::time::Instant::now();
    let event = wait_for_state(&mut events, ConnectionState::Error).await;

    assert_eq!(event.cause(), Some("Connection timeout"));
    assert!(registering.elapsed() >= Duration::from_secs(15));
    assert!(manager.check_health().reconnect_scheduled);
}

#[tokio::test(start_paused = true)]
async fn test_unanswered_refresh_times_out() {
    let transport = ScriptedTransport::new(vec![Reply::ok(60), Reply::Hang]);
    let manager = manager(alice(), transport.clone(), Lookup::Resolve);
    let mut events = manager.subscribe_status();

    manager.start().await;
    wait_for_state(&mut events, ConnectionState::Registered).await;
    let registered = tokio::time::Instant::now();

    let event = wait_for_state(&mut events, ConnectionState::Error).await;
    assert_eq!(event.cause(), Some("Connection timeout"));
    assert!(registered.elapsed() >= Duration::from_secs(30 + 15));
    assert_eq!(transport.sent().len(), 2);

    let health = manager.check_health();
    assert_eq!(health.state, ConnectionState::Error);
    assert!(!health.re_registration_timer_active);
    assert!(health.reconnect_scheduled);

    manager.stop().await;
}

#[tokio::test(start_paused = true)]
async fn test_missing_credentials_stay_idle() {
    for account in [
        sipwatch::config::SipAccountConfig::new("sip.example.com", "", "secret"),
        sipwatch::config::SipAccountConfig::new("sip.example.com", "alice", ""),
        sipwatch::config::SipAccountConfig::new("", "alice", "secret"),
    ] {
        let transport = ScriptedTransport::new(vec![Reply::ok(3600)]);
        let manager = manager(account, transport.clone(), Lookup::Resolve);
        let mut events = manager.subscribe_status();

        manager.start().await;

        let event = next_event(&mut events).await;
        assert_eq!(event.state, ConnectionState::Idle);
        assert_eq!(event.cause(), Some(REASON_MISSING_CREDENTIALS));
        assert!(events.try_recv().is_err());
        assert_eq!(transport.starts(), 0);
        assert!(!manager.check_health().has_credentials);
    }
}

#[tokio::test(start_paused = true)]
async fn test_stop_twice() {
    let transport = ScriptedTransport::new(vec![Reply::ok(3600)]);
    let manager = manager(alice(), transport.clone(), Lookup::Resolve);
    let mut events = manager.subscribe_status();

    manager.start().await;
    wait_for_state(&mut events, ConnectionState::Registered).await;

    manager.stop().await;
    assert_eq!(manager.state(), ConnectionState::Idle);
    manager.stop().await;
    assert_eq!(manager.state(), ConnectionState::Idle);

    for _ in 0..2 {
        let event = next_event(&mut events).await;
        assert_eq!(event.state, ConnectionState::Idle);
        assert_eq!(event.cause(), Some(REASON_STOPPED));
    }

    let health = manager.check_health();
    assert!(!health.transport_active);
    assert!(!health.dispatcher_registered);
    assert!(!health.re_registration_timer_active);

    // The refresh timer died with the session
    tokio::time::sleep(Duration::from_secs(3600)).await;
    assert_eq!(transport.sent().len(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_stop_during_registration_ignores_late_response() {
    let transport = ScriptedTransport::new(vec![Reply::Hang, Reply::ok(3600)]);
    let manager = manager(alice(), transport.clone(), Lookup::Resolve);

    manager.start().await;
    manager.stop().await;

    tokio::time::sleep(Duration::from_secs(60)).await;
    assert_eq!(manager.state(), ConnectionState::Idle);
    assert!(!manager.check_health().reconnect_scheduled);
    assert_eq!(transport.sent().len(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_update_config_restarts() {
    let transport = ScriptedTransport::new(vec![Reply::ok(3600), Reply::ok(3600)]);
    let manager = manager(alice(), transport.clone(), Lookup::Resolve);
    let mut events = manager.subscribe_status();

    manager.start().await;
    wait_for_state(&mut events, ConnectionState::Registered).await;

    let next = alice()
        .with_transport(TransportKind::Tcp)
        .with_domain("example.com");
    manager.update_config(next).await;
    wait_for_state(&mut events, ConnectionState::Registered).await;

    assert_eq!(transport.starts(), 2);
    let sent = transport.sent();
    assert_eq!(sent.len(), 2);
    assert!(sent[1].inner.to_string().contains("<sip:alice@example.com>"));
}

#[tokio::test(start_paused = true)]
async fn test_health_check_restarts_lost_binding() {
    let transport = ScriptedTransport::new(vec![Reply::ok(3600), Reply::ok(3600)]);
    let manager = manager(alice(), transport.clone(), Lookup::Resolve);
    let mut events = manager.subscribe_status();

    manager.start().await;
    wait_for_state(&mut events, ConnectionState::Registered).await;

    transport.drop_link();
    let health = manager.check_health();
    assert_eq!(health.state, ConnectionState::Registered);
    assert!(!health.healthy);

    assert!(manager.spawn_health_check(Duration::from_secs(30)).is_some());
    assert!(manager.spawn_health_check(Duration::from_secs(30)).is_none());

    wait_for_state(&mut events, ConnectionState::Registering).await;
    wait_for_state(&mut events, ConnectionState::Registered).await;
    assert_eq!(transport.starts(), 2);
    assert!(manager.check_health().healthy);
}

#[tokio::test(start_paused = true)]
async fn test_refresh_with_lost_transport_restarts() {
    let transport = ScriptedTransport::new(vec![Reply::ok(60), Reply::ok(3600)]);
    let manager = manager(alice(), transport.clone(), Lookup::Resolve);
    let mut events = manager.subscribe_status();

    manager.start().await;
    wait_for_state(&mut events, ConnectionState::Registered).await;
    transport.drop_link();

    wait_for_state(&mut events, ConnectionState::Registering).await;
    wait_for_state(&mut events, ConnectionState::Registered).await;
    assert_eq!(transport.starts(), 2);
    assert_eq!(transport.sent().len(), 2);
}

#[tokio::test(start_paused = true)]
async fn test_invalid_server_address() {
    let transport = ScriptedTransport::new(vec![]);
    let account = sipwatch::config::SipAccountConfig::new("sip:pbx.example.com:notaport", "alice", "secret");
    let manager = manager(account, transport.clone(), Lookup::Resolve);
    let mut events = manager.subscribe_status();

    manager.start().await;

    let event = next_event(&mut events).await;
    assert_eq!(event.state, ConnectionState::Error);
    assert!(event.cause().unwrap().contains("Invalid server address"));
    assert!(!manager.check_health().reconnect_scheduled);
    assert_eq!(transport.starts(), 0);
}
