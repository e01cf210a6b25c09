//! Registry of resource offers waiting to be used

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use api_types::{Offer, OfferId};
use dashmap::DashMap;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::time::Instant;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum OfferError {
    #[error("offer {offer_id} not found")]
    NotFound { offer_id: OfferId },
}

#[derive(Debug, Clone)]
struct StoredOffer {
    offer: Offer,
    arrived: Instant,
    sequence: u64,
}

/// An offer taken out of the registry for exclusive use.
#[derive(Debug, Clone)]
pub struct ClaimedOffer {
    pub offer: Offer,
    arrived: Instant,
    sequence: u64,
}

/// Offers that arrived from the resource manager and have not been used yet.
///
/// Offers older than the TTL are evicted lazily on read or by [`evict_expired`];
/// every evicted offer ID is sent on the decline channel handed out by [`new`].
///
/// [`new`]: OfferRegistry::new
/// [`evict_expired`]: OfferRegistry::evict_expired
pub struct OfferRegistry {
    offers: DashMap<OfferId, StoredOffer>,
    ttl: Duration,
    sequence: AtomicU64,
    declines: mpsc::UnboundedSender<OfferId>,
}

impl OfferRegistry {
    pub fn new(ttl: Duration) -> (Self, mpsc::UnboundedReceiver<OfferId>) {
        let (declines, receiver) = mpsc::unbounded_channel();
        let registry = Self {
            offers: DashMap::new(),
            ttl,
            sequence: AtomicU64::new(0),
            declines,
        };
        (registry, receiver)
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    /// Stores an offer. Re-adding a known offer keeps its original arrival.
    pub fn add(&self, offer: Offer) {
        let sequence = self.sequence.fetch_add(1, Ordering::Relaxed);
        tracing::debug!(offer_id = %offer.id, hostname = %offer.hostname, "offer added");
        self.offers
            .entry(offer.id.clone())
            .or_insert_with(|| StoredOffer {
                offer,
                arrived: Instant::now(),
                sequence,
            });
    }

    /// Usable offers in arrival order.
    pub fn snapshot(&self) -> Vec<Offer> {
        self.evict_expired();

        let mut live: Vec<_> = self
            .offers
            .iter()
            .map(|entry| (entry.sequence, entry.offer.clone()))
            .collect();
        live.sort_by_key(|(sequence, _)| *sequence);
        live.into_iter().map(|(_, offer)| offer).collect()
    }

    /// Takes an offer for exclusive use. Fails when another caller got there first
    /// or the offer has expired.
    pub fn claim(&self, offer_id: &OfferId) -> Result<ClaimedOffer, OfferError> {
        let not_found = || OfferError::NotFound {
            offer_id: offer_id.clone(),
        };
        let (_, stored) = self.offers.remove(offer_id).ok_or_else(not_found)?;

        if self.is_expired(&stored, Instant::now()) {
            self.decline(stored.offer.id);
            return Err(not_found());
        }

        tracing::debug!(%offer_id, "offer claimed");
        Ok(ClaimedOffer {
            offer: stored.offer,
            arrived: stored.arrived,
            sequence: stored.sequence,
        })
    }

    /// Returns an unused claimed offer with its original arrival time.
    pub fn release(&self, claimed: ClaimedOffer) {
        let stored = StoredOffer {
            offer: claimed.offer,
            arrived: claimed.arrived,
            sequence: claimed.sequence,
        };
        if self.is_expired(&stored, Instant::now()) {
            self.decline(stored.offer.id);
            return;
        }
        self.offers.insert(stored.offer.id.clone(), stored);
    }

    /// Drops an offer the resource manager withdrew. Nothing is declined.
    pub fn rescind(&self, offer_id: &OfferId) -> bool {
        let removed = self.offers.remove(offer_id).is_some();
        if removed {
            tracing::info!(%offer_id, "offer rescinded");
        }
        removed
    }

    /// Removes every expired offer and returns how many were evicted.
    pub fn evict_expired(&self) -> usize {
        let now = Instant::now();
        let expired: Vec<OfferId> = self
            .offers
            .iter()
            .filter(|entry| self.is_expired(entry.value(), now))
            .map(|entry| entry.key().clone())
            .collect();

        let mut evicted = 0;
        for offer_id in expired {
            if self
                .offers
                .remove_if(&offer_id, |_, stored| self.is_expired(stored, now))
                .is_some()
            {
                evicted += 1;
                self.decline(offer_id);
            }
        }
        evicted
    }

    pub fn len(&self) -> usize {
        self.offers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.offers.is_empty()
    }

    fn is_expired(&self, stored: &StoredOffer, now: Instant) -> bool {
        now.saturating_duration_since(stored.arrived) >= self.ttl
    }

    fn decline(&self, offer_id: OfferId) {
        tracing::debug!(%offer_id, "offer expired");
        if self.declines.send(offer_id).is_err() {
            tracing::warn!("offer decline channel closed");
        }
    }
}
