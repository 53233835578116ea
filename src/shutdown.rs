//! Process-wide shutdown signal.
//!
//! Every long-lived worker holds a [`Receiver`]. [`Sender::send`] wakes all of
//! them and hands back a waiter that resolves once every receiver was dropped.
//! The signal is a level: a receiver cloned after `send` returns at once.
//! Dropping the [`Sender`] without sending counts as a shutdown too.

use tokio::sync::{mpsc, watch};

pub fn channel() -> (Sender, Receiver) {
    let (signal_tx, signal_rx) = watch::channel(false);

    let (tx, rx) = mpsc::channel(1);
    let waiter = AliveTaskWaiter(rx);

    let s = Sender::new(signal_tx, waiter);
    let r = Receiver::new(signal_rx, tx);

    (s, r)
}

pub type HolderStillAlive = mpsc::Sender<()>;
pub struct AliveTaskWaiter(mpsc::Receiver<()>);

impl AliveTaskWaiter {
    pub async fn wait(mut self) {
        let _ = self.0.recv().await;
    }
}

pub struct Sender {
    signal: watch::Sender<bool>,
    waiter: AliveTaskWaiter,
}

impl Sender {
    fn new(signal: watch::Sender<bool>, waiter: AliveTaskWaiter) -> Self {
        Self { signal, waiter }
    }

    pub fn send(self) -> AliveTaskWaiter {
        self.signal.send_replace(true);
        self.waiter
    }
}

#[derive(Debug, Clone)]
pub struct Receiver {
    signal: watch::Receiver<bool>,
    alive_marker: HolderStillAlive,
}

impl Receiver {
    fn new(signal: watch::Receiver<bool>, alive_marker: HolderStillAlive) -> Self {
        Self {
            signal,
            alive_marker,
        }
    }

    pub fn is_shutdown(&self) -> bool {
        *self.signal.borrow()
    }

    pub async fn recv(&mut self) {
        while !*self.signal.borrow_and_update() {
            if self.signal.changed().await.is_err() {
                return;
            }
        }
    }
}
