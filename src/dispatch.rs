//! Fan-out of device events to registered receivers.
//!
//! Each subscription owns an unbounded channel and a delivery worker thread,
//! so posting an event never blocks the backend's receive loop and a slow
//! receiver only delays its own queue.

use crate::event::{ActionKind, DeviceEvent};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::mpsc::{channel, Sender};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;

/// Implemented by consumers that want to be told about device events.
///
/// Calls arrive on a delivery thread owned by the watcher, in the order the
/// events were produced.
pub trait DeviceEventReceiver: Send + Sync {
    fn on_device_event(&self, event: &DeviceEvent);
}

struct Subscription {
    receiver: Arc<dyn DeviceEventReceiver>,
    // Cleared before the channel is disconnected so that events still queued
    // at unsubscribe time are dropped rather than delivered
    active: Arc<AtomicBool>,
    tx: Sender<DeviceEvent>,
    worker: Option<JoinHandle<()>>,
}

pub struct Dispatcher {
    subscriptions: Mutex<Vec<Subscription>>,
    seq: AtomicU64,
}

impl Default for Dispatcher {
    fn default() -> Self {
        Self::new()
    }
}

impl Dispatcher {
    pub fn new() -> Self {
        Dispatcher {
            subscriptions: Mutex::new(Vec::new()),
            seq: AtomicU64::new(0),
        }
    }

    /// Register a receiver, returns false if it is already registered
    pub fn subscribe(&self, receiver: Arc<dyn DeviceEventReceiver>) -> bool {
        let mut subscriptions = self.subscriptions.lock().unwrap();
        if subscriptions
            .iter()
            .any(|s| Arc::ptr_eq(&s.receiver, &receiver))
        {
            log::debug!("receiver is already subscribed");
            return false;
        }
        let (tx, rx) = channel::<DeviceEvent>();
        let active = Arc::new(AtomicBool::new(true));
        let worker_receiver = receiver.clone();
        let worker_active = active.clone();
        let worker = std::thread::spawn(move || {
            while let Ok(event) = rx.recv() {
                if !worker_active.load(Ordering::Acquire) {
                    break;
                }
                worker_receiver.on_device_event(&event);
            }
            log::debug!("delivery worker exiting");
        });
        subscriptions.push(Subscription {
            receiver,
            active,
            tx,
            worker: Some(worker),
        });
        true
    }

    /// Remove a receiver; it is guaranteed to see no events delivered after
    /// this call returns. Returns false if it was not registered.
    pub fn unsubscribe(&self, receiver: &Arc<dyn DeviceEventReceiver>) -> bool {
        let mut subscriptions = self.subscriptions.lock().unwrap();
        match subscriptions
            .iter()
            .position(|s| Arc::ptr_eq(&s.receiver, receiver))
        {
            Some(index) => {
                let subscription = subscriptions.remove(index);
                subscription.active.store(false, Ordering::Release);
                // Dropping the sender disconnects the channel; the worker
                // drains and exits on its own
                true
            }
            None => false,
        }
    }

    /// Build an event from a backend notification and deliver it
    pub fn emit(&self, action: ActionKind, device: String) {
        if action == ActionKind::Ignore {
            return;
        }
        if action == ActionKind::Unknown {
            log::warn!("unknown device action for {}", device);
        }
        let event = DeviceEvent {
            action,
            device,
            seq: self.seq.fetch_add(1, Ordering::Relaxed),
        };
        self.deliver(event);
    }

    /// Post an event to every registered receiver; discarded when none are
    /// registered. Never blocks on receiver processing.
    pub fn deliver(&self, event: DeviceEvent) {
        let subscriptions = self.subscriptions.lock().unwrap();
        if subscriptions.is_empty() {
            log::debug!("no receivers registered, discarding {} event", event.action);
            return;
        }
        for subscription in subscriptions.iter() {
            subscription.tx.send(event.clone()).ok();
        }
    }

    /// Disconnect every subscription and join the delivery workers
    pub fn shutdown(&self) {
        let mut subscriptions = self.subscriptions.lock().unwrap();
        for mut subscription in subscriptions.drain(..) {
            subscription.active.store(false, Ordering::Release);
            let worker = subscription.worker.take();
            drop(subscription);
            if let Some(worker) = worker {
                worker.join().ok();
            }
        }
    }
}

impl Drop for Dispatcher {
    fn drop(&mut self) {
        self.shutdown();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::mpsc;
    use std::time::Duration;

    // Forwards deliveries into a test channel so the asynchronous workers can
    // be observed deterministically
    struct Forward(Mutex<mpsc::Sender<DeviceEvent>>);

    impl DeviceEventReceiver for Forward {
        fn on_device_event(&self, event: &DeviceEvent) {
            self.0.lock().unwrap().send(event.clone()).ok();
        }
    }

    fn forwarding_receiver() -> (Arc<dyn DeviceEventReceiver>, mpsc::Receiver<DeviceEvent>) {
        let (tx, rx) = mpsc::channel();
        (Arc::new(Forward(Mutex::new(tx))), rx)
    }

    fn recv(rx: &mpsc::Receiver<DeviceEvent>) -> DeviceEvent {
        rx.recv_timeout(Duration::from_secs(5)).unwrap()
    }

    fn assert_nothing_delivered(rx: &mpsc::Receiver<DeviceEvent>) {
        assert!(rx.recv_timeout(Duration::from_millis(200)).is_err());
    }

    #[test]
    fn events_are_delivered_in_production_order() {
        let dispatcher = Dispatcher::new();
        let (receiver, rx) = forwarding_receiver();
        dispatcher.subscribe(receiver);
        for i in 0..5_u64 {
            dispatcher.emit(ActionKind::Add, format!("/dev/sd{}", i));
        }
        for i in 0..5_u64 {
            let event = recv(&rx);
            assert_eq!(event.device, format!("/dev/sd{}", i));
            assert_eq!(event.seq, i);
        }
    }

    #[test]
    fn every_receiver_sees_the_event() {
        let dispatcher = Dispatcher::new();
        let (first, first_rx) = forwarding_receiver();
        let (second, second_rx) = forwarding_receiver();
        dispatcher.subscribe(first);
        dispatcher.subscribe(second);
        dispatcher.emit(ActionKind::Remove, "/dev/sdb".into());
        assert_eq!(recv(&first_rx).action, ActionKind::Remove);
        assert_eq!(recv(&second_rx).action, ActionKind::Remove);
    }

    #[test]
    fn subscribe_is_idempotent() {
        let dispatcher = Dispatcher::new();
        let (receiver, rx) = forwarding_receiver();
        assert!(dispatcher.subscribe(receiver.clone()));
        assert!(!dispatcher.subscribe(receiver));
        dispatcher.emit(ActionKind::Add, "/dev/sdb".into());
        recv(&rx);
        assert_nothing_delivered(&rx);
    }

    #[test]
    fn unsubscribed_receiver_sees_no_further_events() {
        let dispatcher = Dispatcher::new();
        let (receiver, rx) = forwarding_receiver();
        dispatcher.subscribe(receiver.clone());
        dispatcher.emit(ActionKind::Add, "/dev/sdb".into());
        recv(&rx);
        assert!(dispatcher.unsubscribe(&receiver));
        dispatcher.emit(ActionKind::Remove, "/dev/sdb".into());
        assert_nothing_delivered(&rx);
        assert!(!dispatcher.unsubscribe(&receiver));
    }

    #[test]
    fn late_subscriber_misses_earlier_events() {
        let dispatcher = Dispatcher::new();
        dispatcher.emit(ActionKind::Add, "/dev/sda".into());
        let (receiver, rx) = forwarding_receiver();
        dispatcher.subscribe(receiver);
        dispatcher.emit(ActionKind::Add, "/dev/sdb".into());
        assert_eq!(recv(&rx).device, "/dev/sdb");
        assert_nothing_delivered(&rx);
    }

    #[test]
    fn ignore_actions_are_never_delivered() {
        let dispatcher = Dispatcher::new();
        let (receiver, rx) = forwarding_receiver();
        dispatcher.subscribe(receiver);
        dispatcher.emit(ActionKind::Ignore, "/dev/sdb".into());
        assert_nothing_delivered(&rx);
    }

    #[test]
    fn unknown_actions_are_still_delivered() {
        let dispatcher = Dispatcher::new();
        let (receiver, rx) = forwarding_receiver();
        dispatcher.subscribe(receiver);
        dispatcher.emit(ActionKind::Unknown, "/dev/sdb".into());
        assert_eq!(recv(&rx).action, ActionKind::Unknown);
    }

    #[test]
    fn emit_without_receivers_is_discarded() {
        let dispatcher = Dispatcher::new();
        dispatcher.emit(ActionKind::Add, "/dev/sdb".into());
        let (receiver, rx) = forwarding_receiver();
        dispatcher.subscribe(receiver);
        assert_nothing_delivered(&rx);
    }
}
