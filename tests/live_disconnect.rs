//! Live API disconnect mid-response: terminate vs keep policies.

mod support;

use std::sync::atomic::Ordering;
use std::time::Duration;

use futures_util::SinkExt;
use tokio_tungstenite::tungstenite::Message;

use ari_voice_bridge::bridge::VoiceBridge;
use ari_voice_bridge::config::LiveErrorPolicy;
use ari_voice_bridge::session::{EndReason, SessionState};

use support::*;

async fn drive_to_response(
    bridge: &std::sync::Arc<VoiceBridge>,
    live: &MockLiveApi,
) -> tokio_tungstenite::WebSocketStream<
    tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>,
> {
    bridge
        .handle_ari_event(stasis_start("ch-1", "+15551234"))
        .await;
    let url = format!("ws://{}/external_media/ch-1", bridge.media_addr());
    let (mut pbx, _) = tokio_tungstenite::connect_async(url).await.unwrap();
    wait_until(
        || bridge.sessions().state_of("ch-1") == Some(SessionState::WaitingForInput),
        Duration::from_secs(2),
    )
    .await;

    for _ in 0..10 {
        pbx.send(Message::Binary(loud_frame().into())).await.unwrap();
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    for _ in 0..15 {
        pbx.send(Message::Binary(quiet_frame().into())).await.unwrap();
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert!(
        wait_until(
            || live.state.count_of("response.create") == 1,
            Duration::from_secs(2)
        )
        .await,
        "response never requested"
    );
    pbx
}

#[tokio::test(flavor = "multi_thread")]
async fn disconnect_with_terminate_policy_ends_session() {
    let ari = MockAriServer::start().await;
    let live = MockLiveApi::start(60, Duration::from_millis(30)).await;
    live.state.drop_after_create.store(true, Ordering::SeqCst);

    let mut config = test_config(&ari, &live);
    config.policy.live_error_policy = LiveErrorPolicy::Terminate;
    config.policy.ended_retention_s = 30;
    let bridge = VoiceBridge::start(config).await.unwrap();

    let mut errors = bridge.subscribe_errors();
    let _pbx = drive_to_response(&bridge, &live).await;

    // The mock dropped the transport after response.create
    assert!(
        wait_until(
            || bridge.sessions().state_of("ch-1") == Some(SessionState::Ended),
            Duration::from_secs(3)
        )
        .await,
        "session not terminated after disconnect"
    );
    let summary = bridge
        .sessions()
        .summary("ch-1", std::time::Instant::now())
        .unwrap();
    assert_eq!(summary.end_reason, Some(EndReason::Error));

    // Channel hung up via REST
    assert!(
        wait_until(
            || ari.calls.hangups.load(Ordering::SeqCst) >= 1,
            Duration::from_secs(2)
        )
        .await,
        "no hangup after terminate"
    );

    // Error listener recorded the outage
    let mut saw_network = false;
    while let Ok(event) = errors.try_recv() {
        if event.kind == "network_unavailable" {
            saw_network = true;
        }
    }
    assert!(saw_network, "no network_unavailable error event");

    bridge.stop().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn disconnect_with_keep_policy_retains_session() {
    let ari = MockAriServer::start().await;
    let live = MockLiveApi::start(60, Duration::from_millis(30)).await;
    live.state.drop_after_create.store(true, Ordering::SeqCst);

    let mut config = test_config(&ari, &live);
    config.policy.live_error_policy = LiveErrorPolicy::Keep;
    let bridge = VoiceBridge::start(config).await.unwrap();

    let mut errors = bridge.subscribe_errors();
    let _pbx = drive_to_response(&bridge, &live).await;

    // The disconnect surfaces to observers...
    assert!(
        wait_until(
            || matches!(errors.try_recv(), Ok(event) if event.kind == "network_unavailable"),
            Duration::from_secs(3)
        )
        .await,
        "no network_unavailable error event"
    );
    // ...but the session stays up, waiting for an external reconnect
    tokio::time::sleep(Duration::from_millis(300)).await;
    assert_eq!(bridge.sessions().stats().active_sessions, 1);
    assert_ne!(bridge.sessions().state_of("ch-1"), Some(SessionState::Ended));
    assert_eq!(ari.calls.hangups.load(Ordering::SeqCst), 0);

    bridge.stop().await;
}
