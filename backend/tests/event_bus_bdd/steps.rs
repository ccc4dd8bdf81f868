//! Step definitions and scenario bindings for event bus BDD tests.

use super::*;
use bookworm_events::domain::ConnectionState;
use rstest_bdd_macros::{given, scenario, then, when};

#[given("a connected event bus")]
fn a_connected_event_bus(world: &EventBusWorld) {
    world.setup_bus();
}

#[given("a connected event bus with a book.deleted subscriber")]
fn a_connected_event_bus_with_a_book_deleted_subscriber(world: &EventBusWorld) {
    world.setup_bus();
    world.subscribe(RecordingHandler::default());
}

#[given("a connected event bus with a book.deleted subscriber that fails once")]
fn a_connected_event_bus_with_a_book_deleted_subscriber_that_fails_once(world: &EventBusWorld) {
    world.setup_bus();
    world.subscribe(RecordingHandler::failing(1));
}

#[when("a book.deleted event is published")]
fn a_book_deleted_event_is_published(world: &EventBusWorld) {
    world.publish_book_deleted().expect("publish succeeds");
}

#[when("the broker connection drops")]
fn the_broker_connection_drops(world: &EventBusWorld) {
    world.broker().drop_connections();
}

#[when("the event bus has reconnected")]
fn the_event_bus_has_reconnected(world: &EventBusWorld) {
    let bus = world.bus();
    let broker = world.broker();
    world.wait_until("the bus to reconnect", || {
        bus.state() == ConnectionState::Connected
            && broker.connect_attempts() == 2
            && broker.queue_names().len() == 1
            && broker.open_sessions() == 1
    });
}

#[when("the event bus shuts down")]
fn the_event_bus_shuts_down(world: &EventBusWorld) {
    let bus = world.bus();
    world
        .block_on(async move { bus.shutdown().await })
        .expect("shutdown succeeds");
}

#[then("the broker records one persistent book.deleted message")]
fn the_broker_records_one_persistent_book_deleted_message(world: &EventBusWorld) {
    let published = world.broker().published();
    assert_eq!(published.len(), 1);
    let message = published.first().expect("one message");
    assert_eq!(message.routing_key, BOOK_DELETED);
    assert!(message.persistent);
    assert_eq!(message.json(), json!({ "bookId": "b1", "imageId": "img1" }));
}

#[then("the subscriber receives the book.deleted event")]
fn the_subscriber_receives_the_book_deleted_event(world: &EventBusWorld) {
    let handler = world.handler();
    world.wait_until("the event to arrive", || !handler.seen().is_empty());
    let seen = handler.seen();
    let event = seen.first().expect("one event");
    assert_eq!(event.routing_key, BOOK_DELETED);
    assert_eq!(event.payload, json!({ "bookId": "b1", "imageId": "img1" }));
}

#[then("the exchange was declared on both connections")]
fn the_exchange_was_declared_on_both_connections(world: &EventBusWorld) {
    assert_eq!(world.broker().exchange_declarations(), 2);
}

#[then("the bus went through reconnecting and connecting before it was connected again")]
fn the_bus_went_through_reconnecting_and_connecting_before_it_was_connected_again(
    world: &EventBusWorld,
) {
    assert_eq!(
        world.states().states(),
        vec![
            ConnectionState::Connecting,
            ConnectionState::Reconnecting,
            ConnectionState::Connecting,
        ]
    );
    assert_eq!(world.bus().state(), ConnectionState::Connected);
}

#[then("the subscriber sees the event twice, the second time redelivered")]
fn the_subscriber_sees_the_event_twice_the_second_time_redelivered(world: &EventBusWorld) {
    let handler = world.handler();
    world.wait_until("the redelivery", || handler.seen().len() == 2);
    let flags: Vec<bool> = handler
        .seen()
        .iter()
        .map(|event| event.redelivered)
        .collect();
    assert_eq!(flags, vec![false, true]);
}

#[then("the message is acknowledged once")]
fn the_message_is_acknowledged_once(world: &EventBusWorld) {
    let broker = world.broker();
    world.wait_until("the acknowledgement", || broker.acks().len() == 1);
    assert_eq!(broker.nacks().len(), 1);
}

#[then("publishing a book.deleted event fails because the bus is shutting down")]
fn publishing_a_book_deleted_event_fails_because_the_bus_is_shutting_down(
    world: &EventBusWorld,
) {
    let error = world
        .publish_book_deleted()
        .expect_err("publish after shutdown");
    assert_eq!(error, EventBusError::ShuttingDown);
}

#[then("the broker connection was closed gracefully")]
fn the_broker_connection_was_closed_gracefully(world: &EventBusWorld) {
    let broker = world.broker();
    assert_eq!(broker.graceful_closes(), 1);
    assert_eq!(broker.open_sessions(), 0);
    assert_eq!(world.bus().state(), ConnectionState::ShuttingDown);
}

#[scenario(
    path = "tests/features/event_bus.feature",
    name = "Published events reach the transport as persistent messages"
)]
fn published_events_reach_the_transport_as_persistent_messages(world: EventBusWorld) {
    drop(world);
}

#[scenario(
    path = "tests/features/event_bus.feature",
    name = "Consumers recover after the broker connection drops"
)]
fn consumers_recover_after_the_broker_connection_drops(world: EventBusWorld) {
    drop(world);
}

#[scenario(
    path = "tests/features/event_bus.feature",
    name = "A failing handler sees the message again"
)]
fn a_failing_handler_sees_the_message_again(world: EventBusWorld) {
    drop(world);
}

#[scenario(
    path = "tests/features/event_bus.feature",
    name = "Publishing after shutdown is rejected"
)]
fn publishing_after_shutdown_is_rejected(world: EventBusWorld) {
    drop(world);
}
