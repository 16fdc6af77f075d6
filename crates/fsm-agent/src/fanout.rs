//! Bounded, drop-on-full subscriber lists shared by the log and progress broadcasters.

use std::future::Future;

use tokio::sync::mpsc::{self, error::TrySendError};

pub type SubscriberId = u64;

/// Receive side handed to a consumer.
///
/// Dropping it is enough to stop delivery; the owning list prunes closed
/// senders on the next publish.
#[derive(Debug)]
pub struct Subscription<T> {
    id: SubscriberId,
    rx: mpsc::Receiver<T>,
}

impl<T> Subscription<T> {
    pub fn id(&self) -> SubscriberId {
        self.id
    }

    pub async fn recv(&mut self) -> Option<T> {
        self.rx.recv().await
    }

    #[cfg(test)]
    pub fn try_recv(&mut self) -> Result<T, mpsc::error::TryRecvError> {
        self.rx.try_recv()
    }
}

#[derive(Debug)]
pub(crate) struct SubscriberList<T> {
    subscribers: Vec<(SubscriberId, mpsc::Sender<T>)>,
}

impl<T> Default for SubscriberList<T> {
    fn default() -> Self {
        Self {
            subscribers: Vec::new(),
        }
    }
}

impl<T: Clone> SubscriberList<T> {
    pub(crate) fn add(&mut self, id: SubscriberId, capacity: usize) -> Subscription<T> {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        self.subscribers.push((id, tx));
        Subscription { id, rx }
    }

    pub(crate) fn remove(&mut self, id: SubscriberId) -> bool {
        let before = self.subscribers.len();
        self.subscribers.retain(|(sid, _)| *sid != id);
        self.subscribers.len() != before
    }

    pub(crate) fn len(&self) -> usize {
        self.subscribers.len()
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.subscribers.is_empty()
    }

    /// Non-blocking send to every subscriber. Returns how many accepted the item.
    ///
    /// A full buffer drops the item for that subscriber only. A closed
    /// receiver is removed from the list.
    pub(crate) fn send_all(&mut self, item: &T) -> usize {
        let mut delivered = 0;
        self.subscribers.retain(|(_, tx)| match tx.try_send(item.clone()) {
            Ok(()) => {
                delivered += 1;
                true
            }
            Err(TrySendError::Full(_)) => true,
            Err(TrySendError::Closed(_)) => false,
        });
        delivered
    }
}

/// Pumps a subscription into an outward sink until either side gives up.
///
/// Ends when the source closes or `write` fails; the failure is not reported.
pub async fn forward<T, F, Fut, E>(mut sub: Subscription<T>, mut write: F)
where
    F: FnMut(T) -> Fut,
    Fut: Future<Output = Result<(), E>>,
{
    while let Some(item) = sub.recv().await {
        if write(item).await.is_err() {
            break;
        }
    }
}
