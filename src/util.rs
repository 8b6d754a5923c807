use anyhow::{anyhow, Result};
use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc, Mutex, MutexGuard,
};
use tokio::sync::Notify;

/// Single slot channel where a new value replaces any value not yet taken.
pub fn latest_value_channel<T>() -> (LatestSender<T>, LatestReceiver<T>) {
    let value = Arc::new(Mutex::new(None));
    let notify = Arc::new(Notify::new());
    let senders = Arc::new(AtomicBool::new(true));
    let receiver_alive = Arc::new(AtomicBool::new(true));

    let sender = LatestSender {
        value: Arc::clone(&value),
        notify: Arc::clone(&notify),
        receiver_alive: Arc::clone(&receiver_alive),
        handles: Arc::new(()),
        senders_alive: Arc::clone(&senders),
    };
    let receiver = LatestReceiver {
        value,
        notify,
        senders_alive: senders,
        receiver_alive,
    };
    (sender, receiver)
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Cloneable producer half. The channel closes when the last clone is dropped.
pub struct LatestSender<T> {
    value: Arc<Mutex<Option<T>>>,
    notify: Arc<Notify>,
    receiver_alive: Arc<AtomicBool>,
    handles: Arc<()>,
    senders_alive: Arc<AtomicBool>,
}

impl<T> Clone for LatestSender<T> {
    fn clone(&self) -> Self {
        Self {
            value: Arc::clone(&self.value),
            notify: Arc::clone(&self.notify),
            receiver_alive: Arc::clone(&self.receiver_alive),
            handles: Arc::clone(&self.handles),
            senders_alive: Arc::clone(&self.senders_alive),
        }
    }
}

impl<T> LatestSender<T> {
    pub fn send(&self, value: T) -> Result<()> {
        if !self.receiver_alive.load(Ordering::SeqCst) {
            Err(anyhow!("Other end died"))
        } else {
            *lock(&self.value) = Some(value);
            self.notify.notify_one();
            Ok(())
        }
    }
}

impl<T> Drop for LatestSender<T> {
    fn drop(&mut self) {
        if Arc::strong_count(&self.handles) == 1 {
            self.senders_alive.store(false, Ordering::SeqCst);
            self.notify.notify_one();
        }
    }
}

pub struct LatestReceiver<T> {
    value: Arc<Mutex<Option<T>>>,
    notify: Arc<Notify>,
    senders_alive: Arc<AtomicBool>,
    receiver_alive: Arc<AtomicBool>,
}

impl<T> LatestReceiver<T> {
    /// Wait for the next value.
    pub async fn recv(&self) -> Result<T> {
        loop {
            if let Some(value) = self.try_recv() {
                return Ok(value);
            }
            if !self.senders_alive.load(Ordering::SeqCst) {
                return Err(anyhow!("Sender died"));
            }
            self.notify.notified().await;
        }
    }

    /// Take the pending value without waiting.
    pub fn try_recv(&self) -> Option<T> {
        lock(&self.value).take()
    }

    /// Drop any pending value.
    pub fn clear(&self) {
        lock(&self.value).take();
    }

    pub fn is_closed(&self) -> bool {
        !self.senders_alive.load(Ordering::SeqCst)
    }
}

impl<T> Drop for LatestReceiver<T> {
    fn drop(&mut self) {
        self.receiver_alive.store(false, Ordering::SeqCst);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn last_writer_wins() {
        let (sender, receiver) = latest_value_channel();
        sender.send(1).unwrap();
        sender.send(2).unwrap();
        assert_eq!(receiver.try_recv(), Some(2));
        assert_eq!(receiver.try_recv(), None);
    }

    #[test]
    fn send_fails_after_receiver_dropped() {
        let (sender, receiver) = latest_value_channel();
        drop(receiver);
        assert!(sender.send(1).is_err());
    }

    #[test]
    fn channel_closes_with_last_sender() {
        let (sender, receiver) = latest_value_channel::<u8>();
        let clone = sender.clone();
        drop(sender);
        assert!(!receiver.is_closed());
        drop(clone);
        assert!(receiver.is_closed());
    }

    #[tokio::test]
    async fn recv_waits_for_value() {
        let (sender, receiver) = latest_value_channel();
        let task = tokio::spawn(async move { receiver.recv().await });
        tokio::task::yield_now().await;
        sender.send(7).unwrap();
        assert_eq!(task.await.unwrap().unwrap(), 7);
    }

    #[tokio::test]
    async fn recv_errors_once_senders_are_gone() {
        let (sender, receiver) = latest_value_channel::<u8>();
        drop(sender);
        assert!(receiver.recv().await.is_err());
    }
}
