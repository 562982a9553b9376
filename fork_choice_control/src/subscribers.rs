//! Multicast subscriber sets for processed attestations.
//!
//! Two sets exist: every attestation that survives validation and apply, and
//! the subset of locally produced attestations that still need to be sent out.
//! Registration is one-way; a subscriber is removed by its identity token or
//! implicitly when its receiver is dropped. Notifications never block the
//! mutator; a subscriber that falls behind only affects its own channel.

use std::sync::Arc;

use futures::channel::mpsc::{self, UnboundedReceiver, UnboundedSender};
use log::debug;
use parking_lot::Mutex;
use types::{phase0::containers::Attestation, preset::Preset};

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct SubscriptionId(u64);

struct SubscriberSet<P: Preset> {
    next_id: u64,
    senders: Vec<(SubscriptionId, UnboundedSender<Arc<Attestation<P>>>)>,
}

impl<P: Preset> Default for SubscriberSet<P> {
    fn default() -> Self {
        Self {
            next_id: 0,
            senders: vec![],
        }
    }
}

impl<P: Preset> SubscriberSet<P> {
    fn subscribe(&mut self) -> (SubscriptionId, UnboundedReceiver<Arc<Attestation<P>>>) {
        let id = SubscriptionId(self.next_id);
        self.next_id += 1;

        let (sender, receiver) = mpsc::unbounded();
        self.senders.push((id, sender));

        (id, receiver)
    }

    fn unsubscribe(&mut self, id: SubscriptionId) {
        self.senders.retain(|(existing, _)| *existing != id);
    }

    fn notify(&mut self, attestation: &Arc<Attestation<P>>) {
        self.senders.retain(|(id, sender)| {
            let delivered = sender.unbounded_send(Arc::clone(attestation)).is_ok();

            if !delivered {
                debug!("attestation subscriber {id:?} dropped its receiver");
            }

            delivered
        });
    }
}

pub struct Subscribers<P: Preset> {
    all_valid_attestations: Mutex<SubscriberSet<P>>,
    attestations_to_send: Mutex<SubscriberSet<P>>,
}

impl<P: Preset> Default for Subscribers<P> {
    fn default() -> Self {
        Self {
            all_valid_attestations: Mutex::new(SubscriberSet::default()),
            attestations_to_send: Mutex::new(SubscriberSet::default()),
        }
    }
}

impl<P: Preset> Subscribers<P> {
    pub fn subscribe_to_all_valid_attestations(
        &self,
    ) -> (SubscriptionId, UnboundedReceiver<Arc<Attestation<P>>>) {
        self.all_valid_attestations.lock().subscribe()
    }

    pub fn subscribe_to_attestations_to_send(
        &self,
    ) -> (SubscriptionId, UnboundedReceiver<Arc<Attestation<P>>>) {
        self.attestations_to_send.lock().subscribe()
    }

    pub fn unsubscribe_from_all_valid_attestations(&self, id: SubscriptionId) {
        self.all_valid_attestations.lock().unsubscribe(id);
    }

    pub fn unsubscribe_from_attestations_to_send(&self, id: SubscriptionId) {
        self.attestations_to_send.lock().unsubscribe(id);
    }

    pub(crate) fn notify_all_valid_attestations(&self, attestation: &Arc<Attestation<P>>) {
        self.all_valid_attestations.lock().notify(attestation);
    }

    pub(crate) fn notify_attestations_to_send(&self, attestation: &Arc<Attestation<P>>) {
        self.attestations_to_send.lock().notify(attestation);
    }
}

#[cfg(test)]
mod tests {
    use ssz_types::BitList;
    use types::{
        phase0::containers::AttestationData, phase0::primitives::SignatureBytes, preset::Minimal,
    };

    use super::*;

    fn attestation() -> Arc<Attestation<Minimal>> {
        Arc::new(Attestation {
            aggregation_bits: BitList::with_capacity(1).expect("length is under the limit"),
            data: AttestationData::default(),
            signature: SignatureBytes::ZERO,
        })
    }

    #[test]
    fn notifications_reach_every_subscriber() {
        let subscribers = Subscribers::<Minimal>::default();

        let (_first_id, mut first) = subscribers.subscribe_to_all_valid_attestations();
        let (_second_id, mut second) = subscribers.subscribe_to_all_valid_attestations();

        subscribers.notify_all_valid_attestations(&attestation());

        assert!(first.try_next().expect("a notification was sent").is_some());
        assert!(second.try_next().expect("a notification was sent").is_some());
    }

    #[test]
    fn unsubscribed_token_receives_nothing() {
        let subscribers = Subscribers::<Minimal>::default();

        let (id, mut receiver) = subscribers.subscribe_to_attestations_to_send();
        subscribers.unsubscribe_from_attestations_to_send(id);

        subscribers.notify_attestations_to_send(&attestation());

        // The sender side is gone, so the stream reports termination.
        assert!(receiver.try_next().expect("channel was closed").is_none());
    }

    #[test]
    fn dropped_receiver_is_removed_on_next_notification() {
        let subscribers = Subscribers::<Minimal>::default();

        let (_id, receiver) = subscribers.subscribe_to_all_valid_attestations();
        drop(receiver);

        subscribers.notify_all_valid_attestations(&attestation());
        subscribers.notify_all_valid_attestations(&attestation());
    }
}
