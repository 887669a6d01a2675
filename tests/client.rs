mod common;

use std::sync::Arc;
use futures::StreamExt;

use ble_link::device::{AlwaysGranted, ConnectionState, LinkClient, PeerAddress};
use ble_link::error::LinkError;
use common::{Harness, MockRadio, RadioCall};

#[tokio::test(start_paused = true)]
async fn clean_all_releases_every_session() {
    let harness = Harness::new().await;
    harness.ready("AA:11").await;
    let _pending = harness.client.connect("BB:22".into());
    harness.settle().await;

    harness.client.clean_all().await.unwrap();

    for address in ["AA:11", "BB:22"] {
        assert!(harness.client.snapshot(address.into()).await.is_none());
        assert_eq!(harness.client.state(address.into()).await, ConnectionState::Disconnected);
    }
    let mut closed = harness.radio.closed_sessions();
    closed.sort_by_key(|session| session.0);
    assert_eq!(closed, vec![harness.radio.session("AA:11"), harness.radio.session("BB:22")]);
}

#[tokio::test(start_paused = true)]
async fn clean_forgets_one_peer() {
    let harness = Harness::new().await;
    harness.ready("AA:11").await;
    harness.ready("BB:22").await;
    let mut data = harness.client.data_events("AA:11".into());

    harness.client.clean("AA:11".into()).await.unwrap();
    harness.client.clean("CC:33".into()).await.unwrap();

    // listeners are detached, so the data stream ends
    assert_eq!(data.next().await, None);
    assert!(harness.client.snapshot("AA:11".into()).await.is_none());
    assert_eq!(harness.client.state("BB:22".into()).await, ConnectionState::Ready);
    assert_eq!(harness.radio.closed_sessions(), vec![harness.radio.session("AA:11")]);

    // the address can be connected again from scratch
    harness.ready("AA:11").await;
}

#[tokio::test(start_paused = true)]
async fn unknown_peer_is_disconnected() {
    let harness = Harness::new().await;
    assert_eq!(harness.client.state("AA:11".into()).await, ConnectionState::Disconnected);
    assert!(harness.client.snapshot("AA:11".into()).await.is_none());
}

#[tokio::test(start_paused = true)]
async fn refused_adapter_leaves_radio_closed() {
    let radio = MockRadio::default();
    radio.with_state(|state| state.accept_open = false);
    let client = LinkClient::new(Box::new(radio.clone()), Arc::new(AlwaysGranted));

    assert!(!client.open_radio().await);
    let result: Vec<_> = client.connect("AA:11".into()).collect().await;
    assert_eq!(result, vec![Err(LinkError::AdapterUnavailable)]);
    assert_eq!(radio.count(|call| matches!(call, RadioCall::EstablishLink(_))), 0);
}

#[tokio::test(start_paused = true)]
async fn refused_link_is_reported() {
    let harness = Harness::new().await;
    harness.radio.with_state(|state| state.accept_link = false);

    let result: Vec<_> = harness.client.connect("AA:11".into()).collect().await;
    assert_eq!(result, vec![Err(LinkError::AdapterUnavailable)]);
    assert_eq!(harness.client.state("AA:11".into()).await, ConnectionState::Disconnected);
}

#[tokio::test(start_paused = true)]
async fn close_radio_disconnects_and_reopens() {
    let harness = Harness::new().await;
    harness.ready("AA:11").await;

    harness.client.close_radio().await.unwrap();
    assert_eq!(harness.client.state("AA:11".into()).await, ConnectionState::Disconnected);
    assert_eq!(harness.radio.closed_sessions().len(), 1);
    assert!(harness.radio.calls().contains(&RadioCall::CloseAdapter));

    let result: Vec<_> = harness.client.connect("AA:11".into()).collect().await;
    assert_eq!(result, vec![Err(LinkError::AdapterUnavailable)]);

    assert!(harness.client.open_radio().await);
    harness.ready("AA:11").await;
}

#[tokio::test(start_paused = true)]
async fn shutdown_releases_everything() {
    let Harness { client, radio, .. } = Harness::new().await;
    let mut connect = client.connect("AA:11".into());
    client.state(PeerAddress::from("")).await;

    client.shutdown().await;

    assert_eq!(connect.next().await, Some(Err(LinkError::PrematureDisconnect)));
    assert_eq!(radio.closed_sessions().len(), 1);
    assert_eq!(radio.calls().last(), Some(&RadioCall::CloseAdapter));
}
