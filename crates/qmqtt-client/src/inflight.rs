//! In-flight message tracking.
//!
//! Holds the client side of the session state:
//! - QoS 1 and QoS 2 publishes sent but not yet fully acknowledged
//! - QoS 2 publishes received but not yet released by the broker
//! - SUBSCRIBE / UNSUBSCRIBE requests awaiting their ack
//! - subscriptions granted by the broker, for resubscribing after a reconnect
//!
//! Everything is keyed by packet identifier. The tracker owns the
//! [`PacketIdAllocator`] so an identifier is released in exactly one place:
//! when its exchange completes or is cancelled.

use std::time::Instant;

use ahash::AHashMap;
use log::{debug, warn};
use qmqtt_core::topic::topic_matches_filter;
use qmqtt_core::{Packet, ProtocolError, Publish, QoS, SubackCode};

use crate::packet_id::PacketIdAllocator;

/// Handshake stage of an outbound publish.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    /// QoS 1: PUBLISH sent, waiting for PUBACK.
    AwaitingPubAck,
    /// QoS 2: PUBLISH sent, waiting for PUBREC.
    AwaitingPubRec,
    /// QoS 2: PUBREL sent, waiting for PUBCOMP.
    AwaitingPubComp,
}

/// An outbound QoS 1 or QoS 2 publish awaiting acknowledgment.
#[derive(Debug, Clone)]
pub struct PendingMessage {
    pub packet_id: u16,
    /// The PUBLISH as sent, kept for retransmission.
    pub publish: Publish,
    pub qos: QoS,
    pub stage: Stage,
    /// When the PUBLISH (or PUBREL) was last written.
    pub sent_at: Instant,
    seq: u64,
}

/// What to do with an inbound PUBLISH.
#[derive(Debug, PartialEq, Eq)]
pub enum Inbound {
    /// QoS 0 or 1: hand to the application now.
    Deliver(Publish),
    /// First receipt of a QoS 2 message: answer PUBREC and hold it until PUBREL.
    Held,
    /// Repeat of a QoS 2 message still held: answer PUBREC, do not deliver.
    Duplicate,
}

/// Session state for one client, keyed by packet identifier.
#[derive(Debug, Default)]
pub struct InflightTracker {
    ids: PacketIdAllocator,
    outbound: AHashMap<u16, PendingMessage>,
    inbound_qos2: AHashMap<u16, Publish>,
    subscribes: AHashMap<u16, Vec<(String, QoS)>>,
    unsubscribes: AHashMap<u16, Vec<String>>,
    active: AHashMap<String, QoS>,
    next_seq: u64,
}

impl InflightTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Reserve a packet identifier for a new request.
    pub fn allocate_id(&mut self) -> Option<u16> {
        self.ids.allocate()
    }

    /// Give back an identifier whose request was never sent.
    pub fn release_id(&mut self, packet_id: u16) {
        self.ids.release(packet_id);
    }

    pub fn ids_in_use(&self) -> usize {
        self.ids.in_use_count()
    }

    /// Start tracking an outbound QoS 1/2 publish.
    ///
    /// The identifier must come from [`allocate_id`](Self::allocate_id).
    /// QoS 0 publishes are not tracked.
    pub fn track_publish(&mut self, publish: Publish, now: Instant) {
        let (Some(packet_id), Some(stage)) = (publish.packet_id, initial_stage(publish.qos)) else {
            return;
        };
        self.ids.reserve(packet_id);
        let seq = self.next_seq;
        self.next_seq += 1;
        self.outbound.insert(
            packet_id,
            PendingMessage {
                packet_id,
                qos: publish.qos,
                publish,
                stage,
                sent_at: now,
                seq,
            },
        );
    }

    /// PUBACK received. Returns the completed message, or `None` for an
    /// unknown or late ack.
    pub fn on_puback(&mut self, packet_id: u16) -> Option<PendingMessage> {
        self.complete(packet_id, Stage::AwaitingPubAck, "PUBACK")
    }

    /// PUBREC received. Returns `true` when a PUBREL must be sent.
    ///
    /// A repeated PUBREC for a message already waiting on PUBCOMP is answered
    /// again, since the first PUBREL may have been lost.
    pub fn on_pubrec(&mut self, packet_id: u16, now: Instant) -> bool {
        match self.outbound.get_mut(&packet_id) {
            Some(pending) if pending.stage == Stage::AwaitingPubRec => {
                pending.stage = Stage::AwaitingPubComp;
                pending.sent_at = now;
                true
            }
            Some(pending) if pending.stage == Stage::AwaitingPubComp => true,
            _ => {
                warn!("Ignoring PUBREC for unknown packet id {}", packet_id);
                false
            }
        }
    }

    /// PUBCOMP received. Returns the completed message.
    pub fn on_pubcomp(&mut self, packet_id: u16) -> Option<PendingMessage> {
        self.complete(packet_id, Stage::AwaitingPubComp, "PUBCOMP")
    }

    fn complete(&mut self, packet_id: u16, stage: Stage, ack: &str) -> Option<PendingMessage> {
        if self.outbound.get(&packet_id).map(|p| p.stage) != Some(stage) {
            warn!("Ignoring {} for unknown packet id {}", ack, packet_id);
            return None;
        }
        self.ids.release(packet_id);
        self.outbound.remove(&packet_id)
    }

    /// Classify an inbound PUBLISH.
    pub fn on_inbound_publish(&mut self, publish: Publish) -> Inbound {
        match (publish.qos, publish.packet_id) {
            (QoS::ExactlyOnce, Some(packet_id)) => {
                if self.inbound_qos2.contains_key(&packet_id) {
                    debug!("Duplicate QoS 2 PUBLISH {}", packet_id);
                    Inbound::Duplicate
                } else {
                    self.inbound_qos2.insert(packet_id, publish);
                    Inbound::Held
                }
            }
            _ => Inbound::Deliver(publish),
        }
    }

    /// PUBREL received. Returns the held message the first time only; the
    /// caller answers PUBCOMP either way.
    pub fn on_pubrel(&mut self, packet_id: u16) -> Option<Publish> {
        self.inbound_qos2.remove(&packet_id)
    }

    pub fn track_subscribe(&mut self, packet_id: u16, filters: Vec<(String, QoS)>) {
        self.ids.reserve(packet_id);
        self.subscribes.insert(packet_id, filters);
    }

    /// SUBACK received. Pairs each requested filter with its granted QoS
    /// (`None` on failure) and records granted filters as active.
    ///
    /// Returns `Ok(None)` for an unknown identifier and an error when the
    /// number of return codes does not match the request.
    pub fn on_suback(
        &mut self,
        packet_id: u16,
        return_codes: &[SubackCode],
    ) -> Result<Option<Vec<(String, Option<QoS>)>>, ProtocolError> {
        let Some(filters) = self.subscribes.remove(&packet_id) else {
            warn!("Ignoring SUBACK for unknown packet id {}", packet_id);
            return Ok(None);
        };
        self.ids.release(packet_id);
        if filters.len() != return_codes.len() {
            return Err(ProtocolError::MalformedPacket(format!(
                "SUBACK carries {} return codes for {} filters",
                return_codes.len(),
                filters.len()
            )));
        }

        let mut results = Vec::with_capacity(filters.len());
        for ((filter, _requested), code) in filters.into_iter().zip(return_codes) {
            let granted = match *code {
                SubackCode::Granted(qos) => {
                    self.active.insert(filter.clone(), qos);
                    Some(qos)
                }
                SubackCode::Failure => {
                    self.active.remove(&filter);
                    None
                }
            };
            results.push((filter, granted));
        }
        Ok(Some(results))
    }

    pub fn track_unsubscribe(&mut self, packet_id: u16, filters: Vec<String>) {
        self.ids.reserve(packet_id);
        self.unsubscribes.insert(packet_id, filters);
    }

    /// UNSUBACK received. Returns the filters that were removed.
    pub fn on_unsuback(&mut self, packet_id: u16) -> Option<Vec<String>> {
        let Some(filters) = self.unsubscribes.remove(&packet_id) else {
            warn!("Ignoring UNSUBACK for unknown packet id {}", packet_id);
            return None;
        };
        self.ids.release(packet_id);
        for filter in &filters {
            self.active.remove(filter);
        }
        Some(filters)
    }

    /// Whether any granted subscription matches `topic`.
    pub fn is_subscribed(&self, topic: &str) -> bool {
        self.active
            .keys()
            .any(|filter| topic_matches_filter(topic, filter))
    }

    /// Granted subscriptions, sorted by filter.
    pub fn active_subscriptions(&self) -> Vec<(String, QoS)> {
        let mut subs: Vec<_> = self
            .active
            .iter()
            .map(|(filter, qos)| (filter.clone(), *qos))
            .collect();
        subs.sort();
        subs
    }

    pub fn pending_count(&self) -> usize {
        self.outbound.len()
    }

    pub fn get(&self, packet_id: u16) -> Option<&PendingMessage> {
        self.outbound.get(&packet_id)
    }

    /// Remove every outbound message, in the order they were first sent,
    /// releasing their identifiers.
    pub fn drain_pending(&mut self) -> Vec<PendingMessage> {
        let mut pending: Vec<_> = self.outbound.drain().map(|(_, p)| p).collect();
        pending.sort_by_key(|p| p.seq);
        for p in &pending {
            self.ids.release(p.packet_id);
        }
        pending
    }

    /// Drop SUBSCRIBE / UNSUBSCRIBE requests whose ack can no longer arrive.
    /// Returns how many were dropped.
    pub fn drop_requests(&mut self) -> usize {
        let dropped = self.subscribes.len() + self.unsubscribes.len();
        for id in self.subscribes.keys().chain(self.unsubscribes.keys()) {
            self.ids.release(*id);
        }
        self.subscribes.clear();
        self.unsubscribes.clear();
        dropped
    }

    /// Forget held inbound QoS 2 messages. The broker will not release them
    /// once its session is gone.
    pub fn clear_inbound(&mut self) {
        self.inbound_qos2.clear();
    }

    /// Packets to retransmit on a resumed session, in original send order:
    /// PUBLISH with DUP set for messages still waiting on PUBACK or PUBREC,
    /// PUBREL for those waiting on PUBCOMP.
    pub fn resend_packets(&mut self, now: Instant) -> Vec<Packet> {
        let mut pending: Vec<_> = self.outbound.values_mut().collect();
        pending.sort_by_key(|p| p.seq);
        pending
            .into_iter()
            .map(|p| {
                p.sent_at = now;
                match p.stage {
                    Stage::AwaitingPubAck | Stage::AwaitingPubRec => {
                        p.publish.dup = true;
                        Packet::Publish(p.publish.clone())
                    }
                    Stage::AwaitingPubComp => Packet::Pubrel {
                        packet_id: p.packet_id,
                    },
                }
            })
            .collect()
    }

    /// Reset all session state, including active subscriptions.
    pub fn clear(&mut self) {
        self.outbound.clear();
        self.inbound_qos2.clear();
        self.subscribes.clear();
        self.unsubscribes.clear();
        self.active.clear();
        self.ids.clear();
    }
}

fn initial_stage(qos: QoS) -> Option<Stage> {
    match qos {
        QoS::AtMostOnce => None,
        QoS::AtLeastOnce => Some(Stage::AwaitingPubAck),
        QoS::ExactlyOnce => Some(Stage::AwaitingPubRec),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;

    fn publish(tracker: &mut InflightTracker, topic: &str, qos: QoS) -> u16 {
        let packet_id = tracker.allocate_id().unwrap();
        tracker.track_publish(
            Publish {
                dup: false,
                qos,
                retain: false,
                topic: topic.to_string(),
                packet_id: Some(packet_id),
                payload: Bytes::from_static(b"hello"),
            },
            Instant::now(),
        );
        packet_id
    }

    fn inbound(packet_id: u16, qos: QoS) -> Publish {
        Publish {
            dup: false,
            qos,
            retain: false,
            topic: "in/topic".to_string(),
            packet_id: (qos != QoS::AtMostOnce).then_some(packet_id),
            payload: Bytes::from_static(b"payload"),
        }
    }

    #[test]
    fn test_qos1_single_completion() {
        let mut tracker = InflightTracker::new();
        let id = publish(&mut tracker, "topic/a", QoS::AtLeastOnce);
        assert_eq!(tracker.get(id).unwrap().stage, Stage::AwaitingPubAck);

        let done = tracker.on_puback(id).unwrap();
        assert_eq!(done.packet_id, id);
        assert_eq!(tracker.pending_count(), 0);
        assert_eq!(tracker.ids_in_use(), 0);

        // Duplicate ack is a no-op
        assert!(tracker.on_puback(id).is_none());
        assert!(tracker.on_puback(999).is_none());
    }

    #[test]
    fn test_qos2_outbound_flow() {
        let mut tracker = InflightTracker::new();
        let id = publish(&mut tracker, "topic/b", QoS::ExactlyOnce);

        // Wrong ack for the stage is ignored
        assert!(tracker.on_puback(id).is_none());
        assert!(tracker.on_pubcomp(id).is_none());

        assert!(tracker.on_pubrec(id, Instant::now()));
        assert_eq!(tracker.get(id).unwrap().stage, Stage::AwaitingPubComp);
        // Repeated PUBREC answers PUBREL again
        assert!(tracker.on_pubrec(id, Instant::now()));

        assert!(tracker.on_pubcomp(id).is_some());
        assert!(tracker.on_pubcomp(id).is_none());
        assert!(!tracker.on_pubrec(id, Instant::now()));
        assert_eq!(tracker.ids_in_use(), 0);
    }

    #[test]
    fn test_qos2_inbound_exactly_once() {
        let mut tracker = InflightTracker::new();
        assert_eq!(
            tracker.on_inbound_publish(inbound(7, QoS::ExactlyOnce)),
            Inbound::Held
        );
        assert_eq!(
            tracker.on_inbound_publish(inbound(7, QoS::ExactlyOnce)),
            Inbound::Duplicate
        );

        let released = tracker.on_pubrel(7).unwrap();
        assert_eq!(released.topic, "in/topic");
        assert!(tracker.on_pubrel(7).is_none());
    }

    #[test]
    fn test_inbound_lower_qos_delivered_immediately() {
        let mut tracker = InflightTracker::new();
        assert!(matches!(
            tracker.on_inbound_publish(inbound(0, QoS::AtMostOnce)),
            Inbound::Deliver(_)
        ));
        assert!(matches!(
            tracker.on_inbound_publish(inbound(3, QoS::AtLeastOnce)),
            Inbound::Deliver(_)
        ));
    }

    #[test]
    fn test_resend_order_and_dup() {
        let mut tracker = InflightTracker::new();
        let a = publish(&mut tracker, "a", QoS::AtLeastOnce);
        let b = publish(&mut tracker, "b", QoS::ExactlyOnce);
        let c = publish(&mut tracker, "c", QoS::ExactlyOnce);
        tracker.on_pubrec(b, Instant::now());

        let packets = tracker.resend_packets(Instant::now());
        assert_eq!(packets.len(), 3);
        match &packets[0] {
            Packet::Publish(p) => {
                assert_eq!(p.packet_id, Some(a));
                assert!(p.dup);
            }
            other => panic!("unexpected {:?}", other),
        }
        assert_eq!(packets[1], Packet::Pubrel { packet_id: b });
        match &packets[2] {
            Packet::Publish(p) => {
                assert_eq!(p.packet_id, Some(c));
                assert_eq!(p.topic, "c");
                assert!(p.dup);
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_drain_releases_ids() {
        let mut tracker = InflightTracker::new();
        let a = publish(&mut tracker, "a", QoS::AtLeastOnce);
        let b = publish(&mut tracker, "b", QoS::ExactlyOnce);
        let drained = tracker.drain_pending();
        let ids: Vec<_> = drained.iter().map(|p| p.packet_id).collect();
        assert_eq!(ids, vec![a, b]);
        assert_eq!(tracker.ids_in_use(), 0);
        assert_eq!(tracker.pending_count(), 0);
    }

    #[test]
    fn test_subscription_tracking() {
        let mut tracker = InflightTracker::new();
        let id = tracker.allocate_id().unwrap();
        tracker.track_subscribe(
            id,
            vec![
                ("a/#".to_string(), QoS::ExactlyOnce),
                ("b/+".to_string(), QoS::AtLeastOnce),
            ],
        );
        let results = tracker
            .on_suback(
                id,
                &[SubackCode::Granted(QoS::AtLeastOnce), SubackCode::Failure],
            )
            .unwrap()
            .unwrap();
        assert_eq!(
            results,
            vec![
                ("a/#".to_string(), Some(QoS::AtLeastOnce)),
                ("b/+".to_string(), None)
            ]
        );
        assert_eq!(
            tracker.active_subscriptions(),
            vec![("a/#".to_string(), QoS::AtLeastOnce)]
        );
        assert!(tracker.is_subscribed("a/x/y"));
        assert!(!tracker.is_subscribed("b/x"));
        assert!(tracker.on_suback(id, &[]).unwrap().is_none());

        let id = tracker.allocate_id().unwrap();
        tracker.track_unsubscribe(id, vec!["a/#".to_string()]);
        assert_eq!(tracker.on_unsuback(id), Some(vec!["a/#".to_string()]));
        assert!(tracker.active_subscriptions().is_empty());
        assert!(!tracker.is_subscribed("a/x"));
        assert_eq!(tracker.ids_in_use(), 0);
    }

    #[test]
    fn test_suback_code_count_mismatch() {
        let mut tracker = InflightTracker::new();
        let id = tracker.allocate_id().unwrap();
        tracker.track_subscribe(id, vec![("a".to_string(), QoS::AtMostOnce)]);
        let codes = [SubackCode::Failure, SubackCode::Failure];
        assert!(tracker.on_suback(id, &codes).is_err());
    }
}
