use std::collections::HashMap;
use std::sync::Mutex;

#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct CacheKey {
    pub day: i32,
    pub product: String,
}

impl CacheKey {
    pub fn new(day: i32, product: impl Into<String>) -> Self {
        Self {
            day,
            product: product.into(),
        }
    }
}

/// Per-(day, product) aggregates. Each field is filled independently.
#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub struct AggregateEntry {
    pub quantity: Option<i64>,
    pub volume: Option<f64>,
    pub max_unit_price: Option<f64>,
}

impl AggregateEntry {
    pub fn is_complete(&self) -> bool {
        self.quantity.is_some() && self.volume.is_some() && self.max_unit_price.is_some()
    }
}

const HEAD: usize = 0;
const TAIL: usize = 1;

struct Node {
    key: Option<CacheKey>,
    entry: AggregateEntry,
    prev: usize,
    next: usize,
}

impl Node {
    fn sentinel() -> Self {
        Self {
            key: None,
            entry: AggregateEntry::default(),
            prev: HEAD,
            next: TAIL,
        }
    }
}

/// Arena-backed doubly linked list. Slots 0 and 1 are the head and tail
/// sentinels; most recently used sits right after the head.
struct LruState {
    capacity: usize,
    nodes: Vec<Node>,
    index: HashMap<CacheKey, usize>,
    free: Vec<usize>,
}

impl LruState {
    fn new(capacity: usize) -> Self {
        Self {
            capacity,
            nodes: vec![Node::sentinel(), Node::sentinel()],
            index: HashMap::new(),
            free: Vec::new(),
        }
    }

    fn unlink(&mut self, slot: usize) {
        let (prev, next) = (self.nodes[slot].prev, self.nodes[slot].next);
        self.nodes[prev].next = next;
        self.nodes[next].prev = prev;
    }

    fn push_front(&mut self, slot: usize) {
        let first = self.nodes[HEAD].next;
        self.nodes[slot].prev = HEAD;
        self.nodes[slot].next = first;
        self.nodes[first].prev = slot;
        self.nodes[HEAD].next = slot;
    }

    fn touch(&mut self, key: &CacheKey) -> Option<usize> {
        let slot = *self.index.get(key)?;
        self.unlink(slot);
        self.push_front(slot);
        Some(slot)
    }

    fn get(&mut self, key: &CacheKey) -> Option<AggregateEntry> {
        let slot = self.touch(key)?;
        Some(self.nodes[slot].entry)
    }

    fn update(&mut self, key: CacheKey, apply: impl FnOnce(&mut AggregateEntry)) {
        if let Some(slot) = self.touch(&key) {
            apply(&mut self.nodes[slot].entry);
            return;
        }

        if self.index.len() >= self.capacity {
            self.evict_lru();
        }

        let mut entry = AggregateEntry::default();
        apply(&mut entry);
        let node = Node {
            key: Some(key.clone()),
            entry,
            prev: HEAD,
            next: TAIL,
        };
        let slot = match self.free.pop() {
            Some(slot) => {
                self.nodes[slot] = node;
                slot
            }
            None => {
                self.nodes.push(node);
                self.nodes.len() - 1
            }
        };
        self.push_front(slot);
        self.index.insert(key, slot);
    }

    fn evict_lru(&mut self) {
        let victim = self.nodes[TAIL].prev;
        if victim == HEAD {
            return;
        }
        self.unlink(victim);
        if let Some(key) = self.nodes[victim].key.take() {
            self.index.remove(&key);
        }
        self.free.push(victim);
    }
}

/// Bounded LRU of closed-day aggregates keyed by `(day, product name)`.
/// Closed days never change, so entries are only ever evicted, never
/// invalidated.
pub struct AggregateCache {
    state: Mutex<LruState>,
}

impl AggregateCache {
    /// `capacity` is clamped to at least one entry.
    pub fn new(capacity: usize) -> Self {
        Self {
            state: Mutex::new(LruState::new(capacity.max(1))),
        }
    }

    pub fn capacity(&self) -> usize {
        self.state.lock().expect("aggregate cache lock poisoned").capacity
    }

    pub fn len(&self) -> usize {
        self.state
            .lock()
            .expect("aggregate cache lock poisoned")
            .index
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn contains(&self, day: i32, product: &str) -> bool {
        self.state
            .lock()
            .expect("aggregate cache lock poisoned")
            .index
            .contains_key(&CacheKey::new(day, product))
    }

    pub fn get_entry(&self, day: i32, product: &str) -> Option<AggregateEntry> {
        self.state
            .lock()
            .expect("aggregate cache lock poisoned")
            .get(&CacheKey::new(day, product))
    }

    pub fn get_quantity(&self, day: i32, product: &str) -> Option<i64> {
        self.get_entry(day, product).and_then(|entry| entry.quantity)
    }

    pub fn get_volume(&self, day: i32, product: &str) -> Option<f64> {
        self.get_entry(day, product).and_then(|entry| entry.volume)
    }

    pub fn get_max_price(&self, day: i32, product: &str) -> Option<f64> {
        self.get_entry(day, product)
            .and_then(|entry| entry.max_unit_price)
    }

    pub fn set_quantity(&self, day: i32, product: &str, quantity: i64) {
        self.update(day, product, |entry| entry.quantity = Some(quantity));
    }

    pub fn set_volume(&self, day: i32, product: &str, volume: f64) {
        self.update(day, product, |entry| entry.volume = Some(volume));
    }

    pub fn set_max_price(&self, day: i32, product: &str, max_unit_price: f64) {
        self.update(day, product, |entry| {
            entry.max_unit_price = Some(max_unit_price)
        });
    }

    /// Stores every field at once, keeping one recency bump per computation.
    pub fn set_entry(&self, day: i32, product: &str, aggregate: AggregateEntry) {
        self.update(day, product, |entry| {
            if aggregate.quantity.is_some() {
                entry.quantity = aggregate.quantity;
            }
            if aggregate.volume.is_some() {
                entry.volume = aggregate.volume;
            }
            if aggregate.max_unit_price.is_some() {
                entry.max_unit_price = aggregate.max_unit_price;
            }
        });
    }

    fn update(&self, day: i32, product: &str, apply: impl FnOnce(&mut AggregateEntry)) {
        self.state
            .lock()
            .expect("aggregate cache lock poisoned")
            .update(CacheKey::new(day, product), apply);
    }
}
