//! MQTT Session
//!
//! Wraps a `rumqttc` client and the task driving its event loop. Publish and
//! subscribe calls wait for completion tokens resolved by the event loop:
//!
//! - publish completes once the client has written the PUBLISH
//! - subscribe completes on the matching SUBACK
//!
//! Requests are handed to the client in the same critical section that
//! queues their token, so outgoing events resolve tokens in FIFO order.
//! A lost connection fails every queued token, but the requests themselves
//! stay in the client's queue and are still sent after the reconnect. Their
//! outgoing events are counted off as stale rather than resolving tokens
//! queued later.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use parking_lot::{Mutex, RwLock};
use rumqttc::{
    AsyncClient, ConnAck, ConnectionError, Event, EventLoop, MqttOptions, Outgoing, Packet, QoS,
    SubAck, SubscribeReasonCode,
};
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::{timeout, timeout_at, Instant};
use tracing::{debug, error, info, warn};

use super::reconnect::{ConnectionState, ReconnectMachine};
use super::{AdapterError, MessageHandler};
use crate::config::BrokerConfig;
use crate::metrics::Metrics;

type Completion = oneshot::Sender<Result<(), AdapterError>>;

/// A publish received from the broker, queued for the handler
#[derive(Debug)]
struct Inbound {
    topic: String,
    payload: Bytes,
}

/// Subscribe request waiting for its SUBACK.
/// `done` is `None` for subscriptions re-issued after a reconnect.
struct PendingSubscribe {
    filter: String,
    done: Option<Completion>,
}

#[derive(Default)]
struct Pending {
    publishes: VecDeque<Completion>,
    subscribes: VecDeque<PendingSubscribe>,
    awaiting_suback: HashMap<u16, PendingSubscribe>,
    /// Requests failed on a lost connection but still queued in the client
    stale_publishes: usize,
    stale_subscribes: usize,
}

impl Pending {
    fn connection_lost(&mut self, error: &AdapterError) {
        self.stale_publishes += self.publishes.len();
        self.stale_subscribes += self.subscribes.len();
        self.fail_all(error);
    }

    /// Token of the PUBLISH the client just wrote
    fn publish_sent(&mut self) -> Option<Completion> {
        if self.stale_publishes > 0 {
            self.stale_publishes -= 1;
            return None;
        }
        self.publishes.pop_front()
    }

    /// Move the SUBSCRIBE the client just wrote under its packet id
    fn subscribe_sent(&mut self, pkid: u16) {
        if self.stale_subscribes > 0 {
            self.stale_subscribes -= 1;
            return;
        }
        if let Some(subscribe) = self.subscribes.pop_front() {
            self.awaiting_suback.insert(pkid, subscribe);
        }
    }

    fn fail_all(&mut self, error: &AdapterError) {
        for done in self.publishes.drain(..) {
            let _ = done.send(Err(error.clone()));
        }
        let subscribes = self
            .subscribes
            .drain(..)
            .chain(self.awaiting_suback.drain().map(|(_, pending)| pending));
        for pending in subscribes {
            if let Some(done) = pending.done {
                let _ = done.send(Err(AdapterError::Subscribe(format!(
                    "'{}': {}",
                    pending.filter, error
                ))));
            }
        }
    }
}

/// State shared between the session handle and its event loop task
struct Shared {
    role: &'static str,
    machine: RwLock<ReconnectMachine>,
    pending: Mutex<Pending>,
    /// Filters acknowledged by the broker, re-issued after a clean reconnect
    subscriptions: Mutex<Vec<String>>,
    terminated: watch::Sender<Option<AdapterError>>,
    metrics: Arc<Metrics>,
}

impl Shared {
    fn state(&self) -> ConnectionState {
        self.machine.read().state()
    }

    /// Connection-event callback: CONNACK received
    fn on_connected(&self, ack: &ConnAck) -> bool {
        let reconnected = {
            let mut machine = self.machine.write();
            if machine.state().is_terminal() {
                return false;
            }
            machine.on_connected()
        };

        if reconnected {
            info!(
                "Broker '{}': Reconnected (session_present={})",
                self.role, ack.session_present
            );
        } else {
            info!("Broker '{}': Connected to MQTT broker", self.role);
        }
        self.metrics.broker_up(self.role, reconnected);
        reconnected
    }

    /// Connection-event callback: connection dropped or attempt failed.
    /// Does not reconnect by itself; returns the delay before the next attempt.
    fn on_connection_lost(&self, reason: &ConnectionError) -> Result<Duration, AdapterError> {
        let was_connected = self.state() == ConnectionState::Connected;
        error!("Broker '{}': MQTT connection error: {}", self.role, reason);
        if was_connected {
            self.metrics.broker_down(self.role);
        }

        self.pending
            .lock()
            .connection_lost(&AdapterError::ConnectionLost(reason.to_string()));

        self.machine.write().on_connection_lost()
    }

    fn on_retry(&self) {
        self.machine.write().on_retry();
        debug!("Broker '{}': Reconnecting", self.role);
    }

    /// Record the terminal outcome; the first one wins
    fn terminate(&self, error: AdapterError) {
        self.terminated.send_if_modified(|slot| {
            if slot.is_none() {
                *slot = Some(error);
                true
            } else {
                false
            }
        });
    }

    fn complete_publish(&self) {
        let done = self.pending.lock().publish_sent();
        match done {
            Some(done) => {
                let _ = done.send(Ok(()));
            }
            None => debug!("Broker '{}': Stale PUBLISH sent", self.role),
        }
    }

    fn subscribe_sent(&self, pkid: u16) {
        self.pending.lock().subscribe_sent(pkid);
    }

    fn complete_subscribe(&self, ack: &SubAck) {
        let Some(pending) = self.pending.lock().awaiting_suback.remove(&ack.pkid) else {
            debug!("Broker '{}': Unexpected SUBACK {}", self.role, ack.pkid);
            return;
        };

        let refused = ack
            .return_codes
            .iter()
            .any(|code| matches!(code, SubscribeReasonCode::Failure));

        let result = if refused {
            Err(AdapterError::Rejected(format!(
                "broker refused subscription to '{}'",
                pending.filter
            )))
        } else {
            let mut subscriptions = self.subscriptions.lock();
            if !subscriptions.contains(&pending.filter) {
                subscriptions.push(pending.filter.clone());
            }
            Ok(())
        };

        match pending.done {
            Some(done) => {
                let _ = done.send(result);
            }
            None => match result {
                Ok(()) => info!("Broker '{}': Resubscribed to {}", self.role, pending.filter),
                Err(e) => {
                    error!("Broker '{}': Resubscribe failed: {}", self.role, e);
                    self.terminate(e);
                }
            },
        }
    }

    /// Re-issue acknowledged subscriptions after the broker dropped our session
    fn resubscribe(&self, client: &AsyncClient) {
        let filters = self.subscriptions.lock().clone();
        let mut pending = self.pending.lock();
        for filter in filters {
            if let Err(e) = client.try_subscribe(filter.clone(), QoS::AtMostOnce) {
                let error = AdapterError::Subscribe(format!("'{}': {}", filter, e));
                error!("Broker '{}': Resubscribe failed: {}", self.role, error);
                self.terminate(error);
                return;
            }
            pending.subscribes.push_back(PendingSubscribe { filter, done: None });
        }
    }
}

/// One MQTT broker session
pub struct MqttSession {
    role: &'static str,
    client: AsyncClient,
    shared: Arc<Shared>,
    grace: Duration,
    driver: Mutex<Option<JoinHandle<()>>>,
    dispatcher: Mutex<Option<JoinHandle<()>>>,
}

impl MqttSession {
    /// Connect to the broker, waiting for the CONNACK.
    ///
    /// When `handler` is set, every received publish is passed to it from a
    /// dedicated task, in arrival order, through a queue of
    /// `dispatch_capacity` messages.
    pub async fn connect(
        role: &'static str,
        config: &BrokerConfig,
        handler: Option<Arc<dyn MessageHandler>>,
        dispatch_capacity: usize,
        metrics: Arc<Metrics>,
    ) -> Result<Self, AdapterError> {
        let address = config.address()?;

        let mut options = MqttOptions::new(
            config.effective_client_id(role),
            address.connect_host(),
            address.port,
        );
        options.set_keep_alive(config.keep_alive_duration());
        options.set_clean_session(config.clean_session);
        if let Some((username, password)) = config.credentials()? {
            options.set_credentials(username, password);
        }

        let (client, mut eventloop) = AsyncClient::new(options, config.request_capacity);

        info!("Broker '{}': Connecting to {}", role, address);
        let ack = timeout(
            config.connect_timeout_duration(),
            wait_for_connack(&mut eventloop),
        )
        .await
        .map_err(|_| AdapterError::Timeout)??;

        let (terminated, _) = watch::channel(None);
        let shared = Arc::new(Shared {
            role,
            machine: RwLock::new(ReconnectMachine::new(
                config.reconnect_interval_duration(),
                config.max_reconnect_interval_duration(),
                config.max_reconnect_attempts,
            )),
            pending: Mutex::new(Pending::default()),
            subscriptions: Mutex::new(Vec::new()),
            terminated,
            metrics,
        });
        shared.on_connected(&ack);

        let (inbound_tx, dispatcher) = match handler {
            Some(handler) => {
                let (tx, rx) = mpsc::channel(dispatch_capacity);
                (Some(tx), Some(tokio::spawn(dispatch(rx, handler))))
            }
            None => (None, None),
        };

        let driver = tokio::spawn(drive(eventloop, client.clone(), shared.clone(), inbound_tx));

        Ok(Self {
            role,
            client,
            shared,
            grace: config.disconnect_grace,
            driver: Mutex::new(Some(driver)),
            dispatcher: Mutex::new(dispatcher),
        })
    }

    pub fn status(&self) -> ConnectionState {
        self.shared.state()
    }

    /// Filters currently acknowledged by the broker
    pub fn subscriptions(&self) -> Vec<String> {
        self.shared.subscriptions.lock().clone()
    }

    fn ensure_connected(&self) -> Result<(), AdapterError> {
        match self.shared.state() {
            ConnectionState::Connected => Ok(()),
            ConnectionState::Closed => Err(AdapterError::Closed),
            ConnectionState::Failed => Err(AdapterError::ReconnectExhausted(
                self.shared.machine.read().attempts(),
            )),
            _ => Err(AdapterError::NotConnected),
        }
    }

    /// Publish at most once, not retained
    pub async fn publish(&self, topic: &str, payload: Bytes) -> Result<(), AdapterError> {
        self.ensure_connected()?;

        let (tx, rx) = oneshot::channel();
        {
            let mut pending = self.shared.pending.lock();
            self.client
                .try_publish(topic, QoS::AtMostOnce, false, payload.to_vec())?;
            pending.publishes.push_back(tx);
        }

        rx.await.unwrap_or(Err(AdapterError::Closed))
    }

    /// Subscribe at most once and wait for the SUBACK
    pub async fn subscribe(&self, filter: &str) -> Result<(), AdapterError> {
        self.ensure_connected()
            .map_err(|e| AdapterError::Subscribe(format!("'{}': {}", filter, e)))?;

        let (tx, rx) = oneshot::channel();
        {
            let mut pending = self.shared.pending.lock();
            self.client
                .try_subscribe(filter, QoS::AtMostOnce)
                .map_err(|e| AdapterError::Subscribe(format!("'{}': {}", filter, e)))?;
            pending.subscribes.push_back(PendingSubscribe {
                filter: filter.to_string(),
                done: Some(tx),
            });
        }

        rx.await.unwrap_or(Err(AdapterError::Closed))
    }

    /// Resolves with the error that ended the session
    pub async fn terminated(&self) -> AdapterError {
        let mut rx = self.shared.terminated.subscribe();
        loop {
            let current = rx.borrow_and_update().clone();
            if let Some(error) = current {
                return error;
            }
            if rx.changed().await.is_err() {
                return AdapterError::Closed;
            }
        }
    }

    /// Send DISCONNECT and wait up to the grace period for the event loop
    /// and handler to finish before aborting them. Both share one deadline.
    pub async fn close(&self) {
        {
            let mut machine = self.shared.machine.write();
            if machine.state() == ConnectionState::Closed {
                return;
            }
            machine.on_closed();
        }

        info!("Broker '{}': Disconnecting", self.role);
        if let Err(e) = self.client.try_disconnect() {
            debug!("Broker '{}': DISCONNECT not queued: {}", self.role, e);
        }

        let deadline = Instant::now() + self.grace;
        let tasks = [self.driver.lock().take(), self.dispatcher.lock().take()];
        for mut task in tasks.into_iter().flatten() {
            if timeout_at(deadline, &mut task).await.is_err() {
                warn!(
                    "Broker '{}': In-flight work did not drain within {:?}",
                    self.role, self.grace
                );
                task.abort();
            }
        }

        self.shared.pending.lock().fail_all(&AdapterError::Closed);
        self.shared.terminate(AdapterError::Closed);
        self.shared.metrics.broker_closed(self.role);
    }
}

async fn wait_for_connack(eventloop: &mut EventLoop) -> Result<ConnAck, AdapterError> {
    loop {
        match eventloop.poll().await {
            Ok(Event::Incoming(Packet::ConnAck(ack))) => return Ok(ack),
            Ok(_) => continue,
            Err(e) => return Err(AdapterError::Connect(e.to_string())),
        }
    }
}

/// Drive the event loop until the session is closed or gives up
async fn drive(
    mut eventloop: EventLoop,
    client: AsyncClient,
    shared: Arc<Shared>,
    inbound: Option<mpsc::Sender<Inbound>>,
) {
    loop {
        match eventloop.poll().await {
            Ok(Event::Incoming(Packet::ConnAck(ack))) => {
                shared.on_connected(&ack);
                if !ack.session_present {
                    shared.resubscribe(&client);
                }
            }
            Ok(Event::Incoming(Packet::Publish(publish))) => {
                let Some(ref tx) = inbound else {
                    debug!(
                        "Broker '{}': Ignoring publish on {}",
                        shared.role, publish.topic
                    );
                    continue;
                };

                let message = Inbound {
                    topic: publish.topic,
                    payload: publish.payload,
                };
                match tx.try_send(message) {
                    Ok(()) => {}
                    Err(mpsc::error::TrySendError::Full(message)) => {
                        warn!(
                            "Broker '{}': Handler queue full, dropping message on {}",
                            shared.role, message.topic
                        );
                        shared.metrics.uplink_dropped("overflow");
                    }
                    Err(mpsc::error::TrySendError::Closed(_)) => {}
                }
            }
            Ok(Event::Incoming(Packet::SubAck(ack))) => shared.complete_subscribe(&ack),
            Ok(Event::Outgoing(Outgoing::Publish(_))) => shared.complete_publish(),
            Ok(Event::Outgoing(Outgoing::Subscribe(pkid))) => shared.subscribe_sent(pkid),
            Ok(Event::Outgoing(Outgoing::Disconnect)) => {
                debug!("Broker '{}': DISCONNECT sent", shared.role);
                break;
            }
            Ok(_) => {}
            Err(e) => {
                if shared.state() == ConnectionState::Closed {
                    break;
                }

                match shared.on_connection_lost(&e) {
                    Ok(delay) => {
                        debug!(
                            "Broker '{}': Reconnecting in {:?}",
                            shared.role, delay
                        );
                        tokio::time::sleep(delay).await;
                        shared.on_retry();
                    }
                    Err(e) => {
                        error!("Broker '{}': {}", shared.role, e);
                        shared.terminate(e);
                        break;
                    }
                }
            }
        }
    }
}

/// Feed received publishes to the handler one at a time
async fn dispatch(mut rx: mpsc::Receiver<Inbound>, handler: Arc<dyn MessageHandler>) {
    while let Some(message) = rx.recv().await {
        handler.handle(&message.topic, message.payload).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::sync::oneshot::error::TryRecvError;

    fn lost() -> AdapterError {
        AdapterError::ConnectionLost("reset by peer".to_string())
    }

    #[test]
    fn test_publish_tokens_resolve_in_order() {
        let mut pending = Pending::default();
        let (first_tx, mut first_rx) = oneshot::channel();
        let (second_tx, mut second_rx) = oneshot::channel();
        pending.publishes.push_back(first_tx);
        pending.publishes.push_back(second_tx);

        let _ = pending.publish_sent().unwrap().send(Ok(()));
        assert_eq!(first_rx.try_recv(), Ok(Ok(())));
        assert_eq!(second_rx.try_recv(), Err(TryRecvError::Empty));
    }

    #[test]
    fn test_stale_publish_does_not_resolve_newer_token() {
        let mut pending = Pending::default();
        let (old_tx, mut old_rx) = oneshot::channel();
        pending.publishes.push_back(old_tx);

        pending.connection_lost(&lost());
        assert_eq!(old_rx.try_recv(), Ok(Err(lost())));

        let (new_tx, mut new_rx) = oneshot::channel();
        pending.publishes.push_back(new_tx);

        // The old request is written first once the client reconnects
        assert!(pending.publish_sent().is_none());
        assert_eq!(new_rx.try_recv(), Err(TryRecvError::Empty));

        let _ = pending.publish_sent().unwrap().send(Ok(()));
        assert_eq!(new_rx.try_recv(), Ok(Ok(())));
        assert_eq!(pending.stale_publishes, 0);
    }

    #[test]
    fn test_stale_subscribe_does_not_claim_newer_packet_id() {
        let mut pending = Pending::default();
        let (old_tx, mut old_rx) = oneshot::channel();
        pending.subscribes.push_back(PendingSubscribe {
            filter: "old/#".to_string(),
            done: Some(old_tx),
        });

        pending.connection_lost(&lost());
        assert!(matches!(old_rx.try_recv(), Ok(Err(AdapterError::Subscribe(_)))));

        pending.subscribes.push_back(PendingSubscribe {
            filter: "new/#".to_string(),
            done: None,
        });

        pending.subscribe_sent(1);
        assert!(pending.awaiting_suback.is_empty());

        pending.subscribe_sent(2);
        assert_eq!(pending.awaiting_suback[&2].filter, "new/#");
        assert!(pending.subscribes.is_empty());
    }

    #[test]
    fn test_requests_already_sent_are_not_stale() {
        let mut pending = Pending::default();
        pending.subscribes.push_back(PendingSubscribe {
            filter: "sent/#".to_string(),
            done: None,
        });
        pending.subscribe_sent(7);

        pending.connection_lost(&lost());
        assert_eq!(pending.stale_subscribes, 0);
        assert_eq!(pending.stale_publishes, 0);
        assert!(pending.awaiting_suback.is_empty());
    }
}
