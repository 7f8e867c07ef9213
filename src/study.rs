//! Study session queue engine.
//!
//! A session is a filtered, optionally shuffled queue of card ids built once at
//! start. The client pulls it in batches through a server-side cursor
//! (`fetch_index`) and reports an [`Outcome`] per card; missed cards are
//! appended to the end of the queue so they come around again.
//!
//! Each user owns one session slot. All operations on a slot hold its lock for
//! the whole read-modify-write, catalog I/O included, so two requests from the
//! same user are applied in order and never overwrite each other.

use std::collections::{BTreeMap, HashMap};
use std::future::Future;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use rand::seq::SliceRandom;
use serde::Serialize;
use tokio::sync::{Mutex, OwnedMutexGuard};

use crate::error::{AppError, Result};
use crate::models::{Card, DifficultyRange, Outcome};

/// Read access to the card catalog plus the one bookkeeping write a finished session makes.
pub trait Catalog: Send + Sync {
    /// Deck id behind an activation, or `None` if it does not exist or is not the user's.
    fn resolve_active_deck(
        &self,
        user_id: i64,
        active_deck_id: i64,
    ) -> impl Future<Output = Result<Option<i64>>> + Send;

    /// Card ids of a deck within the difficulty bounds. With tags, only cards
    /// carrying at least one of them.
    fn list_card_ids(
        &self,
        deck_id: i64,
        difficulty: DifficultyRange,
        tag_ids: Option<&[i64]>,
    ) -> impl Future<Output = Result<Vec<i64>>> + Send;

    /// Bulk lookup; result order is unspecified and unknown ids are absent.
    fn fetch_cards(&self, card_ids: &[i64]) -> impl Future<Output = Result<Vec<Card>>> + Send;

    fn record_session(&self, active_deck_id: i64) -> impl Future<Output = Result<()>> + Send;
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct SessionStats {
    pub correct: u32,
    pub wrong: u32,
    pub combo: u32,
    /// Miss count per card id.
    pub mistakes: BTreeMap<i64, u32>,
}

#[derive(Debug, Clone, Serialize)]
pub struct SessionState {
    /// The activation (not the deck) this session was started from.
    pub deck_id: i64,
    pub queue: Vec<i64>,
    /// How many queue slots have been handed to the client. Not how many were answered.
    pub fetch_index: usize,
    pub initial_count: usize,
    pub stats: SessionStats,
    pub start_time: DateTime<Utc>,
}

impl SessionState {
    pub fn new(deck_id: i64, queue: Vec<i64>) -> Self {
        Self {
            deck_id,
            initial_count: queue.len(),
            queue,
            fetch_index: 0,
            stats: SessionStats::default(),
            start_time: Utc::now(),
        }
    }

    /// The next undispensed slots, at most `batch_size` of them.
    pub fn pending(&self, batch_size: usize) -> &[i64] {
        let start = self.fetch_index.min(self.queue.len());
        let end = start.saturating_add(batch_size).min(self.queue.len());
        &self.queue[start..end]
    }

    pub fn is_exhausted(&self) -> bool {
        self.fetch_index >= self.queue.len()
    }

    /// Marks `count` slots as dispensed.
    pub fn advance(&mut self, count: usize) {
        self.fetch_index = (self.fetch_index + count).min(self.queue.len());
    }

    pub fn apply(&mut self, card_id: i64, outcome: Outcome) {
        match outcome {
            Outcome::Know => {
                self.stats.correct += 1;
                self.stats.combo += 1;
            }
            Outcome::Miss => {
                self.stats.wrong += 1;
                self.stats.combo = 0;
                *self.stats.mistakes.entry(card_id).or_insert(0) += 1;
                // Requeue at the back: it comes around again once everything
                // already queued has been served. Uncapped.
                self.queue.push(card_id);
            }
            Outcome::Discard => {}
        }
    }
}

/// Filters chosen on the study setup screen.
#[derive(Debug, Clone, Default)]
pub struct SessionFilter {
    pub difficulty: DifficultyRange,
    /// `None` or empty means no tag restriction.
    pub tag_ids: Option<Vec<i64>>,
    pub shuffle: bool,
}

type Slot = Arc<Mutex<Option<SessionState>>>;
type SlotGuard = OwnedMutexGuard<Option<SessionState>>;

/// Per-user session slots. Only starting a session creates one; finalize and
/// logout detach it again, so reads for users without a session store nothing.
#[derive(Clone, Default)]
pub struct SessionStore {
    slots: Arc<Mutex<HashMap<i64, Slot>>>,
}

impl SessionStore {
    pub fn new() -> Self {
        Self::default()
    }

    async fn existing(&self, user_id: i64) -> Option<Slot> {
        self.slots.lock().await.get(&user_id).cloned()
    }

    async fn is_current(&self, user_id: i64, slot: &Slot) -> bool {
        self.slots
            .lock()
            .await
            .get(&user_id)
            .is_some_and(|current| Arc::ptr_eq(current, slot))
    }

    /// Locks the user's slot if one exists.
    async fn lock_existing(&self, user_id: i64) -> Option<SlotGuard> {
        let slot = self.existing(user_id).await?;
        Some(slot.lock_owned().await)
    }

    /// Locks the user's slot, creating it first if needed. A slot detached
    /// between lookup and lock is discarded and the lookup retried, so a
    /// write never lands in a slot the map no longer holds.
    async fn lock_or_insert(&self, user_id: i64) -> (Slot, SlotGuard) {
        loop {
            let slot = self.slots.lock().await.entry(user_id).or_default().clone();
            let guard = Arc::clone(&slot).lock_owned().await;
            if self.is_current(user_id, &slot).await {
                return (slot, guard);
            }
        }
    }

    /// Removes the map entry if it still points at `slot`.
    async fn detach(&self, user_id: i64, slot: &Slot) {
        let mut slots = self.slots.lock().await;
        if slots.get(&user_id).is_some_and(|current| Arc::ptr_eq(current, slot)) {
            slots.remove(&user_id);
        }
    }

    pub async fn get(&self, user_id: i64) -> Option<SessionState> {
        let state = self.lock_existing(user_id).await?;
        state.clone()
    }

    #[cfg(test)]
    pub async fn put(&self, user_id: i64, state: SessionState) {
        let (_, mut current) = self.lock_or_insert(user_id).await;
        *current = Some(state);
    }

    #[cfg(test)]
    pub async fn has_slot(&self, user_id: i64) -> bool {
        self.existing(user_id).await.is_some()
    }

    /// Clears and detaches the user's slot, returning whatever session it held.
    pub async fn remove(&self, user_id: i64) -> Option<SessionState> {
        let slot = self.existing(user_id).await?;
        let mut current = Arc::clone(&slot).lock_owned().await;
        let state = current.take();
        self.detach(user_id, &slot).await;
        state
    }
}

pub struct StudyService<C> {
    catalog: C,
    store: SessionStore,
}

impl<C: Catalog> StudyService<C> {
    pub fn new(catalog: C, store: SessionStore) -> Self {
        Self { catalog, store }
    }

    #[cfg(test)]
    pub fn catalog(&self) -> &C {
        &self.catalog
    }

    pub fn store(&self) -> &SessionStore {
        &self.store
    }

    /// Builds the card queue and replaces any session the user already had.
    /// Returns the queue length.
    pub async fn initialize_session(
        &self,
        user_id: i64,
        active_deck_id: i64,
        filter: SessionFilter,
    ) -> Result<usize> {
        let (slot, mut current) = self.store.lock_or_insert(user_id).await;

        match self.build_queue(user_id, active_deck_id, &filter).await {
            Ok(queue) => {
                let total = queue.len();
                *current = Some(SessionState::new(active_deck_id, queue));
                Ok(total)
            }
            Err(e) => {
                // A failed start keeps the previous session, or leaves no slot behind.
                if current.is_none() {
                    self.store.detach(user_id, &slot).await;
                }
                Err(e)
            }
        }
    }

    async fn build_queue(
        &self,
        user_id: i64,
        active_deck_id: i64,
        filter: &SessionFilter,
    ) -> Result<Vec<i64>> {
        let deck_id = self
            .catalog
            .resolve_active_deck(user_id, active_deck_id)
            .await?
            .ok_or_else(|| AppError::NotFound(format!("active deck {}", active_deck_id)))?;

        let mut queue = self
            .catalog
            .list_card_ids(deck_id, filter.difficulty, filter.tag_ids.as_deref())
            .await?;
        queue.sort_unstable();
        queue.dedup();

        if queue.is_empty() {
            return Err(AppError::EmptyResult);
        }

        if filter.shuffle {
            queue.shuffle(&mut rand::thread_rng());
        }

        log::info!(
            "Initialized session with {} cards for active deck {} (difficulty {}-{}, tags {:?}, shuffle {})",
            queue.len(),
            active_deck_id,
            filter.difficulty.min,
            filter.difficulty.max,
            filter.tag_ids,
            filter.shuffle
        );

        Ok(queue)
    }

    /// Next slice of the queue as full cards, in queue order.
    ///
    /// No session, an exhausted cursor, and a failed catalog read all yield an
    /// empty batch. Only a successful read moves the cursor; ids the catalog no
    /// longer knows are skipped and count as dispensed.
    pub async fn get_next_batch(&self, user_id: i64, batch_size: usize) -> Vec<Card> {
        let mut current = self.store.lock_existing(user_id).await;
        let Some(state) = current.as_mut().and_then(|guard| guard.as_mut()) else {
            log::warn!("No active study session for user {} when fetching next batch", user_id);
            return Vec::new();
        };

        if state.is_exhausted() {
            log::debug!("Fetch index at end of queue for user {}; nothing to dispense", user_id);
            return Vec::new();
        }

        let start = state.fetch_index;
        let batch_ids = state.pending(batch_size).to_vec();
        if batch_ids.is_empty() {
            return Vec::new();
        }

        let fetched = match self.catalog.fetch_cards(&batch_ids).await {
            Ok(cards) => cards,
            Err(e) => {
                log::error!("Batch fetch failed for user {}: {}", user_id, e);
                return Vec::new();
            }
        };

        let by_id: HashMap<i64, Card> = fetched.into_iter().map(|c| (c.id, c)).collect();
        let mut ordered = Vec::with_capacity(batch_ids.len());
        for id in &batch_ids {
            match by_id.get(id) {
                Some(card) => ordered.push(card.clone()),
                None => log::warn!("Card {} vanished from the catalog; skipping it", id),
            }
        }

        state.advance(batch_ids.len());

        log::info!(
            "Fetched batch of {} cards; fetch_index {} -> {} (queue length {})",
            ordered.len(),
            start,
            state.fetch_index,
            state.queue.len()
        );

        ordered
    }

    /// Applies the user's answer. Returns the updated stats, or `None` when
    /// there is no session.
    pub async fn update_session_state(
        &self,
        user_id: i64,
        card_id: i64,
        outcome: Outcome,
    ) -> Option<SessionStats> {
        let mut current = self.store.lock_existing(user_id).await?;
        let state = current.as_mut()?;

        state.apply(card_id, outcome);
        log::debug!(
            "Card {} -> {:?}; queue length {}, combo {}",
            card_id,
            outcome,
            state.queue.len(),
            state.stats.combo
        );

        Some(state.stats.clone())
    }

    pub async fn session_snapshot(&self, user_id: i64) -> Option<SessionState> {
        self.store.get(user_id).await
    }

    /// Tears the session down. Always succeeds; bumping the activation's play
    /// count is best effort.
    pub async fn finalize_session(&self, user_id: i64) -> bool {
        if let Some(state) = self.store.remove(user_id).await {
            log::info!(
                "Finalized session for active deck {}: {} correct, {} wrong, {} of {} slots dispensed",
                state.deck_id,
                state.stats.correct,
                state.stats.wrong,
                state.fetch_index,
                state.queue.len()
            );
            if let Err(e) = self.catalog.record_session(state.deck_id).await {
                log::warn!("Could not record play for active deck {}: {}", state.deck_id, e);
            }
        }

        true
    }
}
