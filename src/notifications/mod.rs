use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Condvar, Mutex, MutexGuard};

use crate::store::ProductId;

/// Unordered pair of products; `(a, b)` and `(b, a)` share one waiter entry.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct ProductPair {
    low: ProductId,
    high: ProductId,
}

impl ProductPair {
    pub fn new(first: ProductId, second: ProductId) -> Self {
        Self {
            low: first.min(second),
            high: first.max(second),
        }
    }

    fn is_within(&self, sold: &HashSet<ProductId>) -> bool {
        sold.contains(&self.low) && sold.contains(&self.high)
    }
}

struct WaitEntry {
    condition: Arc<Condvar>,
    waiting: usize,
}

impl WaitEntry {
    fn new() -> Self {
        Self {
            condition: Arc::new(Condvar::new()),
            waiting: 0,
        }
    }
}

/// Current streak: the most recent product sold server-wide and how many
/// sales of it happened back to back.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Streak {
    pub product: Option<ProductId>,
    pub length: u32,
}

struct NotificationState {
    epoch: i32,
    sold_today: HashSet<ProductId>,
    last_sold: Option<ProductId>,
    streak: u32,
    closed: bool,
    simultaneous: HashMap<ProductPair, WaitEntry>,
    consecutive: HashMap<u32, WaitEntry>,
}

impl NotificationState {
    fn streak_reaches(&self, threshold: u32) -> Option<ProductId> {
        if self.streak >= threshold {
            self.last_sold
        } else {
            None
        }
    }
}

/// Tracks what sold in the current day and lets threads block until a pair
/// of products has both sold, or until some product sold `n` times in a row.
///
/// Each pair and each threshold has its own condition variable so a sale
/// only wakes waiters it can satisfy. [`NotificationManager::advance_day`]
/// bumps the epoch and releases every waiter with "not met".
pub struct NotificationManager {
    state: Mutex<NotificationState>,
}

impl NotificationManager {
    pub fn new(initial_day: i32) -> Self {
        Self {
            state: Mutex::new(NotificationState {
                epoch: initial_day,
                sold_today: HashSet::new(),
                last_sold: None,
                streak: 0,
                closed: false,
                simultaneous: HashMap::new(),
                consecutive: HashMap::new(),
            }),
        }
    }

    pub fn epoch(&self) -> i32 {
        self.lock().epoch
    }

    pub fn streak(&self) -> Streak {
        let state = self.lock();
        Streak {
            product: state.last_sold,
            length: state.streak,
        }
    }

    pub fn register_sale(&self, product: ProductId) {
        let mut state = self.lock();
        if state.closed {
            return;
        }

        state.sold_today.insert(product);
        if state.last_sold == Some(product) {
            state.streak += 1;
        } else {
            state.last_sold = Some(product);
            state.streak = 1;
        }

        for (pair, entry) in &state.simultaneous {
            if pair.is_within(&state.sold_today) {
                entry.condition.notify_all();
            }
        }
        for (threshold, entry) in &state.consecutive {
            if *threshold <= state.streak {
                entry.condition.notify_all();
            }
        }
    }

    pub fn check_simultaneous(&self, first: ProductId, second: ProductId) -> bool {
        ProductPair::new(first, second).is_within(&self.lock().sold_today)
    }

    pub fn check_consecutive(&self, threshold: u32) -> Option<ProductId> {
        self.lock().streak_reaches(threshold)
    }

    /// `true` once both products have sold today; `false` if the day ends
    /// (or the manager shuts down) first.
    pub fn wait_simultaneous(&self, first: ProductId, second: ProductId) -> bool {
        let pair = ProductPair::new(first, second);
        let mut state = self.lock();
        if pair.is_within(&state.sold_today) {
            return true;
        }
        if state.closed {
            return false;
        }

        let start_epoch = state.epoch;
        let entry = state.simultaneous.entry(pair).or_insert_with(WaitEntry::new);
        entry.waiting += 1;
        let condition = Arc::clone(&entry.condition);

        while !pair.is_within(&state.sold_today) && state.epoch == start_epoch && !state.closed {
            state = condition
                .wait(state)
                .expect("notification state lock poisoned");
        }

        let met = state.epoch == start_epoch && pair.is_within(&state.sold_today);
        if state.epoch == start_epoch {
            leave(&mut state.simultaneous, &pair);
        }
        met
    }

    /// The product that reached a streak of `threshold`, or `None` if the
    /// day ends (or the manager shuts down) first.
    pub fn wait_consecutive(&self, threshold: u32) -> Option<ProductId> {
        let mut state = self.lock();
        if let Some(product) = state.streak_reaches(threshold) {
            return Some(product);
        }
        if state.closed {
            return None;
        }

        let start_epoch = state.epoch;
        let entry = state
            .consecutive
            .entry(threshold)
            .or_insert_with(WaitEntry::new);
        entry.waiting += 1;
        let condition = Arc::clone(&entry.condition);

        while state.streak_reaches(threshold).is_none()
            && state.epoch == start_epoch
            && !state.closed
        {
            state = condition
                .wait(state)
                .expect("notification state lock poisoned");
        }

        if state.epoch != start_epoch {
            return None;
        }
        leave(&mut state.consecutive, &threshold);
        state.streak_reaches(threshold)
    }

    /// Closes the current day: resets today's state, moves to the next
    /// epoch and releases every waiter of the old one in one step.
    pub fn advance_day(&self) {
        let mut state = self.lock();
        state.epoch += 1;
        state.sold_today.clear();
        state.last_sold = None;
        state.streak = 0;
        release_all(&mut state);
    }

    /// Releases every waiter for good; later waits return "not met" at once
    /// unless already satisfied.
    pub fn shutdown(&self) {
        let mut state = self.lock();
        state.closed = true;
        release_all(&mut state);
    }

    pub fn waiting_count(&self) -> usize {
        let state = self.lock();
        state
            .simultaneous
            .values()
            .chain(state.consecutive.values())
            .map(|entry| entry.waiting)
            .sum()
    }

    fn lock(&self) -> MutexGuard<'_, NotificationState> {
        self.state.lock().expect("notification state lock poisoned")
    }
}

fn release_all(state: &mut NotificationState) {
    for entry in state.simultaneous.values() {
        entry.condition.notify_all();
    }
    for entry in state.consecutive.values() {
        entry.condition.notify_all();
    }
    state.simultaneous.clear();
    state.consecutive.clear();
}

fn leave<K: std::hash::Hash + Eq>(entries: &mut HashMap<K, WaitEntry>, key: &K) {
    if let Some(entry) = entries.get_mut(key) {
        entry.waiting = entry.waiting.saturating_sub(1);
        if entry.waiting == 0 {
            entries.remove(key);
        }
    }
}
