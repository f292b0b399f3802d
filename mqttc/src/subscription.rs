//! Subscription bookkeeping and message routing.

use std::collections::{BTreeMap, HashMap};

use tracing::{trace, warn};

use crate::client::callbacks::{MessageCallback, SubscribeAckCallback, UnsubscribeAckCallback, guard};
use crate::error::Result;
use crate::protocol::{SubscribeReasonCode, UnsubAckReason};
use crate::topic;
use crate::types::ApplicationMessage;

/// Largest subscription identifier MQTT 5.0 can carry.
const MAX_SUBSCRIPTION_ID: usize = 268_435_455;

struct TopicEntry {
    filter: String,
    on_message: Option<MessageCallback>,
}

/// Filters added by one SUBSCRIBE request.
struct Subscription {
    topics: Vec<TopicEntry>,
}

struct PendingSubscribe {
    acks: Vec<(String, Option<SubscribeAckCallback>)>,
}

struct PendingUnsubscribe {
    acks: Vec<(String, Option<UnsubscribeAckCallback>)>,
}

/// The filter part of a shared subscription filter.
fn routing_filter(filter: &str) -> &str {
    filter
        .strip_prefix("$share/")
        .and_then(|rest| rest.split_once('/'))
        .map_or(filter, |(_, filter)| filter)
}

/// Live subscriptions and the SUBSCRIBE/UNSUBSCRIBE requests awaiting
/// acknowledgement.
pub(crate) struct Subscriptions {
    next_id: usize,
    subscriptions: BTreeMap<usize, Subscription>,
    pending_subscribes: HashMap<u16, PendingSubscribe>,
    pending_unsubscribes: HashMap<u16, PendingUnsubscribe>,
}

impl Default for Subscriptions {
    fn default() -> Self {
        Self {
            next_id: 1,
            subscriptions: BTreeMap::new(),
            pending_subscribes: HashMap::new(),
            pending_unsubscribes: HashMap::new(),
        }
    }
}

impl Subscriptions {
    /// Allocate a subscription identifier.
    pub fn next_subscription_id(&mut self) -> usize {
        let id = self.next_id;
        self.next_id = if id >= MAX_SUBSCRIPTION_ID { 1 } else { id + 1 };
        id
    }

    /// Register the filters of a SUBSCRIBE sent with `packet_id`.
    pub fn add(
        &mut self,
        subscription_id: usize,
        packet_id: u16,
        topics: Vec<(String, Option<SubscribeAckCallback>, Option<MessageCallback>)>,
    ) {
        let mut entries = Vec::with_capacity(topics.len());
        let mut acks = Vec::with_capacity(topics.len());
        for (filter, ack, on_message) in topics {
            entries.push(TopicEntry {
                filter: filter.clone(),
                on_message,
            });
            acks.push((filter, ack));
        }
        self.subscriptions
            .insert(subscription_id, Subscription { topics: entries });
        self.pending_subscribes
            .insert(packet_id, PendingSubscribe { acks });
    }

    /// Register the filters of an UNSUBSCRIBE sent with `packet_id`.
    pub fn add_unsubscribe(&mut self, packet_id: u16, acks: Vec<(String, Option<UnsubscribeAckCallback>)>) {
        self.pending_unsubscribes
            .insert(packet_id, PendingUnsubscribe { acks });
    }

    /// True if a SUBSCRIBE or UNSUBSCRIBE with `packet_id` is unanswered.
    pub fn is_packet_id_pending(&self, packet_id: u16) -> bool {
        self.pending_subscribes.contains_key(&packet_id)
            || self.pending_unsubscribes.contains_key(&packet_id)
    }

    pub fn len(&self) -> usize {
        self.subscriptions.values().map(|s| s.topics.len()).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.subscriptions.is_empty()
    }

    /// Hand SUBACK reason codes to the per-filter callbacks, in order.
    pub fn acknowledge_subscribe(&mut self, packet_id: u16, codes: &[SubscribeReasonCode]) -> Result<()> {
        let Some(mut pending) = self.pending_subscribes.remove(&packet_id) else {
            warn!("SUBACK for unknown packet id {}", packet_id);
            return Ok(());
        };
        if pending.acks.len() != codes.len() {
            warn!(
                "SUBACK {} carries {} reason codes for {} filters",
                packet_id,
                codes.len(),
                pending.acks.len()
            );
        }
        for ((filter, ack), code) in pending.acks.iter_mut().zip(codes) {
            trace!("SUBACK {}: {:?}", filter, code);
            if let Some(ack) = ack {
                guard("subscribe ack", || ack(filter, *code))?;
            }
        }
        Ok(())
    }

    /// Hand UNSUBACK reason codes to the per-filter callbacks and drop the
    /// filters. MQTT 3.1.1 acknowledgements carry no codes; every filter
    /// then counts as removed.
    pub fn acknowledge_unsubscribe(&mut self, packet_id: u16, codes: &[UnsubAckReason]) -> Result<()> {
        let Some(mut pending) = self.pending_unsubscribes.remove(&packet_id) else {
            warn!("UNSUBACK for unknown packet id {}", packet_id);
            return Ok(());
        };
        if !codes.is_empty() && pending.acks.len() != codes.len() {
            warn!(
                "UNSUBACK {} carries {} reason codes for {} filters",
                packet_id,
                codes.len(),
                pending.acks.len()
            );
        }

        for (i, (filter, ack)) in pending.acks.iter_mut().enumerate() {
            let code = codes.get(i).copied().unwrap_or(UnsubAckReason::Success);
            if matches!(code, UnsubAckReason::Success | UnsubAckReason::NoSubscriptionExisted) {
                self.remove_filter(filter);
            }
            if let Some(ack) = ack {
                guard("unsubscribe ack", || ack(filter, code))?;
            }
        }
        Ok(())
    }

    fn remove_filter(&mut self, filter: &str) {
        for subscription in self.subscriptions.values_mut() {
            subscription.topics.retain(|t| t.filter != filter);
        }
        self.subscriptions.retain(|_, s| !s.topics.is_empty());
    }

    /// Deliver `message` to the per-filter callbacks it matches.
    ///
    /// With subscription identifiers only the identified subscriptions are
    /// considered; without them every filter is tested. Returns the number
    /// of callbacks invoked.
    pub fn route(&mut self, message: &ApplicationMessage) -> Result<usize> {
        let mut delivered = 0;
        let ids = &message.subscription_ids;
        for (id, subscription) in self.subscriptions.iter_mut() {
            if !ids.is_empty() && !ids.contains(id) {
                continue;
            }
            for entry in subscription.topics.iter_mut() {
                if !topic::matches(routing_filter(&entry.filter), &message.topic) {
                    continue;
                }
                if let Some(on_message) = entry.on_message.as_mut() {
                    guard("message", || on_message(message))?;
                    delivered += 1;
                }
            }
        }
        Ok(delivered)
    }

    /// Forget requests that can no longer be acknowledged.
    pub fn clear_pending(&mut self) {
        self.pending_subscribes.clear();
        self.pending_unsubscribes.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use parking_lot::Mutex;

    use crate::types::QoS;

    fn message(topic: &str, ids: Vec<usize>) -> ApplicationMessage {
        ApplicationMessage {
            topic: topic.to_string(),
            qos: QoS::AtMostOnce,
            subscription_ids: ids,
            ..Default::default()
        }
    }

    fn counter() -> (Arc<AtomicUsize>, MessageCallback) {
        let count = Arc::new(AtomicUsize::new(0));
        let c = count.clone();
        (
            count,
            Box::new(move |_| {
                c.fetch_add(1, Ordering::SeqCst);
                Ok(())
            }),
        )
    }

    #[test]
    fn test_route_by_filter() {
        let mut subs = Subscriptions::default();
        let (sport, sport_cb) = counter();
        let (tennis, tennis_cb) = counter();
        let id = subs.next_subscription_id();
        subs.add(
            id,
            1,
            vec![
                ("sport/#".into(), None, Some(sport_cb)),
                ("sport/tennis/+".into(), None, Some(tennis_cb)),
            ],
        );

        assert_eq!(subs.route(&message("sport/tennis/player1", vec![])).unwrap(), 2);
        assert_eq!(subs.route(&message("sport", vec![])).unwrap(), 1);
        assert_eq!(subs.route(&message("news", vec![])).unwrap(), 0);
        assert_eq!(sport.load(Ordering::SeqCst), 2);
        assert_eq!(tennis.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_route_by_subscription_id() {
        let mut subs = Subscriptions::default();
        let (a, a_cb) = counter();
        let (b, b_cb) = counter();
        let first = subs.next_subscription_id();
        subs.add(first, 1, vec![("x/#".into(), None, Some(a_cb))]);
        let second = subs.next_subscription_id();
        subs.add(second, 2, vec![("x/+".into(), None, Some(b_cb))]);
        assert_eq!((first, second), (1, 2));

        assert_eq!(subs.route(&message("x/y", vec![second])).unwrap(), 1);
        assert_eq!(a.load(Ordering::SeqCst), 0);
        assert_eq!(b.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_shared_subscription_routing() {
        let mut subs = Subscriptions::default();
        let (count, cb) = counter();
        let id = subs.next_subscription_id();
        subs.add(id, 1, vec![("$share/group/jobs/+".into(), None, Some(cb))]);
        assert_eq!(subs.route(&message("jobs/42", vec![])).unwrap(), 1);
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_acks_fan_out_in_order() {
        let mut subs = Subscriptions::default();
        let seen = Arc::new(Mutex::new(Vec::new()));
        let ack = |seen: Arc<Mutex<Vec<(String, SubscribeReasonCode)>>>| -> SubscribeAckCallback {
            Box::new(move |filter, code| {
                seen.lock().push((filter.to_string(), code));
                Ok(())
            })
        };
        let id = subs.next_subscription_id();
        subs.add(
            id,
            7,
            vec![
                ("a".into(), Some(ack(seen.clone())), None),
                ("b".into(), Some(ack(seen.clone())), None),
            ],
        );
        assert!(subs.is_packet_id_pending(7));

        subs.acknowledge_subscribe(
            7,
            &[SubscribeReasonCode::Success(QoS::AtLeastOnce), SubscribeReasonCode::NotAuthorized],
        )
        .unwrap();
        assert!(!subs.is_packet_id_pending(7));
        assert_eq!(
            *seen.lock(),
            vec![
                ("a".to_string(), SubscribeReasonCode::Success(QoS::AtLeastOnce)),
                ("b".to_string(), SubscribeReasonCode::NotAuthorized),
            ]
        );
    }

    #[test]
    fn test_unsubscribe_removes_filters() {
        let mut subs = Subscriptions::default();
        let id = subs.next_subscription_id();
        subs.add(id, 1, vec![("a".into(), None, None), ("b".into(), None, None)]);
        assert_eq!(subs.len(), 2);

        subs.add_unsubscribe(2, vec![("a".into(), None)]);
        subs.acknowledge_unsubscribe(2, &[UnsubAckReason::Success]).unwrap();
        assert_eq!(subs.len(), 1);

        // MQTT 3.1.1: no reason codes.
        subs.add_unsubscribe(3, vec![("b".into(), None)]);
        subs.acknowledge_unsubscribe(3, &[]).unwrap();
        assert!(subs.is_empty());
    }
}
