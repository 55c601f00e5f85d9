use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use serde_json::json;

use crate::cache::{AggregateCache, AggregateEntry};
use crate::config::StoreConfig;
use crate::logging::{LogLevel, Logger};
use crate::notifications::NotificationManager;
use crate::storage::{Persistence, StorageError};
use crate::utils::timing::measure_execution;

use super::{DayBucket, ProductDictionary, ProductId, Sale};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct StoreSettings {
    /// Closed days kept in memory (M). At least one.
    pub days_in_memory: usize,
    pub cache_capacity: usize,
}

impl From<&StoreConfig> for StoreSettings {
    fn from(value: &StoreConfig) -> Self {
        Self {
            days_in_memory: value.days_in_memory,
            cache_capacity: value.cache_capacity,
        }
    }
}

/// Summary of one product on one closed day.
#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub struct Aggregate {
    pub quantity: i64,
    pub volume: f64,
    pub max_unit_price: f64,
}

impl Aggregate {
    fn of(sales: &[Sale]) -> Self {
        sales.iter().fold(Self::default(), |mut total, sale| {
            total.quantity += i64::from(sale.quantity);
            total.volume += sale.price;
            if sale.quantity != 0 && sale.unit_price() > total.max_unit_price {
                total.max_unit_price = sale.unit_price();
            }
            total
        })
    }

    fn from_cached(entry: AggregateEntry) -> Option<Self> {
        Some(Self {
            quantity: entry.quantity?,
            volume: entry.volume?,
            max_unit_price: entry.max_unit_price?,
        })
    }

    fn to_entry(self) -> AggregateEntry {
        AggregateEntry {
            quantity: Some(self.quantity),
            volume: Some(self.volume),
            max_unit_price: Some(self.max_unit_price),
        }
    }
}

struct Orders {
    current_day: i32,
    current: DayBucket,
    window: BTreeMap<i32, Arc<DayBucket>>,
}

/// The open day, a window of recently closed days, users and the product
/// dictionary. Older days are read back through [`Persistence`].
///
/// Locks: `orders` guards the open day and the window, `users` the
/// credential table. Only [`SalesStore::shutdown`] holds both, always
/// orders first.
pub struct SalesStore {
    orders: Mutex<Orders>,
    /// Rotated days whose write has not finished (or failed).
    flushing: Mutex<HashMap<i32, Arc<DayBucket>>>,
    users: Mutex<HashMap<String, String>>,
    /// Serializes end-of-day writes; holds the highest day counter written.
    persisted_day: Mutex<i32>,
    dictionary: ProductDictionary,
    notifications: Arc<NotificationManager>,
    cache: AggregateCache,
    persistence: Box<dyn Persistence>,
    days_in_memory: usize,
    shut_down: AtomicBool,
    logger: Arc<Logger>,
}

impl SalesStore {
    /// Loads users, dictionary, day counter and the open day's sales saved
    /// by a previous shutdown.
    pub fn open(
        settings: StoreSettings,
        persistence: Box<dyn Persistence>,
        logger: Arc<Logger>,
    ) -> Result<Self, StorageError> {
        let current_day = persistence.load_current_day()?;
        let users = persistence.load_users()?;
        let dictionary = ProductDictionary::from_snapshot(persistence.load_dictionary()?);
        let current = persistence.load_day(current_day)?;

        logger.log(
            LogLevel::Info,
            Some("store::open"),
            "Sales store loaded",
            Some(json!({
                "current_day": current_day,
                "users": users.len(),
                "products": dictionary.len(),
                "recovered_sales": current.sale_count(),
                "days_in_memory": settings.days_in_memory,
                "cache_capacity": settings.cache_capacity,
            })),
        );

        Ok(Self {
            orders: Mutex::new(Orders {
                current_day,
                current,
                window: BTreeMap::new(),
            }),
            flushing: Mutex::new(HashMap::new()),
            users: Mutex::new(users),
            persisted_day: Mutex::new(current_day),
            dictionary,
            notifications: Arc::new(NotificationManager::new(current_day)),
            cache: AggregateCache::new(settings.cache_capacity),
            persistence,
            days_in_memory: settings.days_in_memory.max(1),
            shut_down: AtomicBool::new(false),
            logger,
        })
    }

    pub fn current_day(&self) -> i32 {
        self.lock_orders().current_day
    }

    pub fn dictionary(&self) -> &ProductDictionary {
        &self.dictionary
    }

    pub fn notifications(&self) -> &Arc<NotificationManager> {
        &self.notifications
    }

    pub fn cache(&self) -> &AggregateCache {
        &self.cache
    }

    /// Closed days currently held in memory, oldest first.
    pub fn window_days(&self) -> Vec<i32> {
        self.lock_orders().window.keys().copied().collect()
    }

    pub fn authenticate(&self, username: &str, password: &str) -> bool {
        self.lock_users()
            .get(username)
            .is_some_and(|stored| stored == password)
    }

    /// `false` if the username is taken.
    pub fn register(&self, username: &str, password: &str) -> bool {
        let mut users = self.lock_users();
        if users.contains_key(username) {
            return false;
        }
        users.insert(username.to_owned(), password.to_owned());
        true
    }

    /// Records a sale in the open day. Unknown product names get a new id.
    pub fn add_sale(&self, product: &str, quantity: i32, price: f64) -> ProductId {
        let product_id = self.dictionary.get_or_create(product);
        let mut orders = self.lock_orders();
        orders.current.record(Sale::new(product_id, quantity, price));
        // Under the orders lock so the sale and its notification land in
        // the same day.
        self.notifications.register_sale(product_id);
        product_id
    }

    /// Sales of `day`: the open day, the window, a rotation still being
    /// written, or else persistence. Days outside `0..=current` are empty.
    pub fn get_day_data(&self, day: i32) -> Result<Arc<DayBucket>, StorageError> {
        self.read_day(day).map(|(bucket, _)| bucket)
    }

    /// Like [`SalesStore::get_day_data`], also telling whether the day was
    /// already closed when it was read.
    fn read_day(&self, day: i32) -> Result<(Arc<DayBucket>, bool), StorageError> {
        {
            let orders = self.lock_orders();
            if day < 0 || day > orders.current_day {
                return Ok((Arc::new(DayBucket::new()), false));
            }
            if day == orders.current_day {
                return Ok((Arc::new(orders.current.clone()), false));
            }
            if let Some(bucket) = orders.window.get(&day) {
                return Ok((Arc::clone(bucket), true));
            }
        }

        if let Some(bucket) = self.lock_flushing().get(&day) {
            return Ok((Arc::clone(bucket), true));
        }
        Ok((Arc::new(self.persistence.load_day(day)?), true))
    }

    /// Aggregate of `product` on `day`, served from the cache when possible.
    /// Only closed days are cached.
    pub fn get_aggregate(&self, day: i32, product: &str) -> Result<Aggregate, StorageError> {
        if let Some(aggregate) = self
            .cache
            .get_entry(day, product)
            .and_then(Aggregate::from_cached)
        {
            return Ok(aggregate);
        }

        let product_id = self.dictionary.get_or_create(product);
        let (bucket, closed) = self.read_day(day)?;
        let aggregate = Aggregate::of(bucket.sales_of(product_id));
        if closed {
            self.cache.set_entry(day, product, aggregate.to_entry());
        }
        Ok(aggregate)
    }

    pub fn quantity_sold(&self, product: &str, days: i32) -> Result<i64, StorageError> {
        self.closed_days(days)
            .into_iter()
            .map(|day| self.get_aggregate(day, product).map(|agg| agg.quantity))
            .sum()
    }

    pub fn total_volume(&self, product: &str, days: i32) -> Result<f64, StorageError> {
        self.closed_days(days)
            .into_iter()
            .map(|day| self.get_aggregate(day, product).map(|agg| agg.volume))
            .sum()
    }

    /// Volume over quantity across the window; 0 when nothing sold.
    pub fn average_price(&self, product: &str, days: i32) -> Result<f64, StorageError> {
        let mut quantity = 0_i64;
        let mut volume = 0.0;
        for day in self.closed_days(days) {
            let aggregate = self.get_aggregate(day, product)?;
            quantity += aggregate.quantity;
            volume += aggregate.volume;
        }
        if quantity == 0 {
            return Ok(0.0);
        }
        Ok(volume / quantity as f64)
    }

    pub fn max_price(&self, product: &str, days: i32) -> Result<f64, StorageError> {
        let mut max = 0.0_f64;
        for day in self.closed_days(days) {
            max = max.max(self.get_aggregate(day, product)?.max_unit_price);
        }
        Ok(max)
    }

    /// Sales of each product on the closed day `days` ago. Empty when
    /// `days < 1` or that day would be before day 0.
    pub fn filter_events(
        &self,
        products: &[String],
        days: i32,
    ) -> Result<Vec<(ProductId, Vec<Sale>)>, StorageError> {
        if days < 1 {
            return Ok(Vec::new());
        }
        let day = self.current_day() - days;
        if day < 0 {
            return Ok(Vec::new());
        }

        let bucket = self.get_day_data(day)?;
        let mut events = Vec::with_capacity(products.len());
        for product in products {
            let product_id = self.dictionary.get_or_create(product);
            if events.iter().any(|(seen, _)| *seen == product_id) {
                continue;
            }
            let sales = bucket.sales_of(product_id);
            if !sales.is_empty() {
                events.push((product_id, sales.to_vec()));
            }
        }
        Ok(events)
    }

    /// Closes the open day. The swap, window update and notification epoch
    /// bump happen under the orders lock; the write happens after it is
    /// released. A failed write is returned but the rotation stands.
    pub fn end_day(&self) -> Result<i32, StorageError> {
        let (closed_day, closed, new_day) = {
            let mut orders = self.lock_orders();
            let closed_day = orders.current_day;
            let closed = Arc::new(std::mem::take(&mut orders.current));
            orders.current_day += 1;
            let new_day = orders.current_day;

            orders.window.insert(closed_day, Arc::clone(&closed));
            while orders.window.len() > self.days_in_memory {
                if let Some((&oldest, _)) = orders.window.iter().next() {
                    orders.window.remove(&oldest);
                }
            }
            self.lock_flushing().insert(closed_day, Arc::clone(&closed));
            self.notifications.advance_day();
            (closed_day, closed, new_day)
        };

        self.logger.log(
            LogLevel::Info,
            Some("store::end_day"),
            "Day closed",
            Some(json!({
                "closed_day": closed_day,
                "current_day": new_day,
                "products": closed.product_count(),
                "sales": closed.sale_count(),
            })),
        );

        let written = measure_execution(
            "closed day write",
            Some("store::end_day"),
            &self.logger,
            || self.persist_rotation(closed_day, &closed, new_day),
        );
        match written {
            Ok(()) => {
                self.lock_flushing().remove(&closed_day);
                Ok(new_day)
            }
            Err(error) => {
                self.logger.log(
                    LogLevel::Error,
                    Some("store::end_day"),
                    "Failed to persist closed day; kept in memory",
                    Some(json!({"day": closed_day, "error": error.to_string()})),
                );
                Err(error)
            }
        }
    }

    /// Writes the open day under its own number, any rotation still
    /// unwritten, the dictionary, the day counter and users, then releases
    /// every notification waiter. Returns the day number persisted. Later
    /// calls only report the day.
    pub fn shutdown(&self) -> Result<i32, StorageError> {
        let orders = self.lock_orders();
        let users = self.lock_users();
        let current_day = orders.current_day;
        if self.shut_down.swap(true, Ordering::SeqCst) {
            return Ok(current_day);
        }
        // Keeps a lagging end-of-day write from landing after ours.
        let mut persisted_day = self
            .persisted_day
            .lock()
            .expect("persisted day lock poisoned");
        *persisted_day = (*persisted_day).max(current_day);

        let mut first_error = None;
        let mut attempt = |record: &str, result: Result<(), StorageError>| {
            if let Err(error) = result {
                self.logger.log(
                    LogLevel::Error,
                    Some("store::shutdown"),
                    "Failed to persist record during shutdown",
                    Some(json!({"record": record, "error": error.to_string()})),
                );
                first_error.get_or_insert(error);
            }
        };

        let pending: Vec<(i32, Arc<DayBucket>)> = self
            .lock_flushing()
            .iter()
            .map(|(day, bucket)| (*day, Arc::clone(bucket)))
            .collect();
        for (day, bucket) in pending {
            let result = self.persistence.save_day(day, &bucket);
            if result.is_ok() {
                self.lock_flushing().remove(&day);
            }
            attempt("pending day", result);
        }
        attempt(
            "current day sales",
            self.persistence.save_day(current_day, &orders.current),
        );
        attempt(
            "dictionary",
            self.persistence.save_dictionary(&self.dictionary.snapshot()),
        );
        attempt("day counter", self.persistence.save_current_day(current_day));
        attempt("users", self.persistence.save_users(&users));
        attempt("flush", self.persistence.flush());

        self.notifications.shutdown();
        drop(persisted_day);
        drop(users);
        drop(orders);

        self.logger.log(
            LogLevel::Info,
            Some("store::shutdown"),
            "Sales store shut down",
            Some(json!({"last_day": current_day, "clean": first_error.is_none()})),
        );
        match first_error {
            Some(error) => Err(error),
            None => Ok(current_day),
        }
    }

    fn persist_rotation(
        &self,
        closed_day: i32,
        closed: &DayBucket,
        new_day: i32,
    ) -> Result<(), StorageError> {
        let mut persisted_day = self
            .persisted_day
            .lock()
            .expect("persisted day lock poisoned");
        self.persistence.save_day(closed_day, closed)?;
        if new_day > *persisted_day {
            self.persistence.save_current_day(new_day)?;
            *persisted_day = new_day;
        }
        self.persistence
            .save_dictionary(&self.dictionary.snapshot())?;
        self.persistence.flush()
    }

    /// `currentDay-1 ..= currentDay-days`, stopping before day 0.
    fn closed_days(&self, days: i32) -> Vec<i32> {
        let current_day = self.current_day();
        (1..=days.max(0))
            .map(|back| current_day - back)
            .take_while(|day| *day >= 0)
            .collect()
    }

    fn lock_orders(&self) -> MutexGuard<'_, Orders> {
        self.orders.lock().expect("orders lock poisoned")
    }

    fn lock_users(&self) -> MutexGuard<'_, HashMap<String, String>> {
        self.users.lock().expect("users lock poisoned")
    }

    fn lock_flushing(&self) -> MutexGuard<'_, HashMap<i32, Arc<DayBucket>>> {
        self.flushing.lock().expect("flushing lock poisoned")
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::thread;

    use crate::logging::tests::memory_logger;
    use crate::logging::{LogLevel, Logger};
    use crate::storage::memory::MemoryStorage;
    use crate::store::{DayBucket, Sale};

    use super::{Aggregate, SalesStore, StoreSettings};

    const SETTINGS: StoreSettings = StoreSettings {
        days_in_memory: 2,
        cache_capacity: 16,
    };

    fn store_with(storage: Arc<MemoryStorage>) -> SalesStore {
        SalesStore::open(SETTINGS, Box::new(storage), Arc::new(Logger::silent()))
            .expect("store should open")
    }

    fn close_days(store: &SalesStore, count: usize) {
        for _ in 0..count {
            store.end_day().expect("day should close");
        }
    }

    #[test]
    fn open_day_is_never_part_of_rolling_aggregates() {
        let store = store_with(Arc::new(MemoryStorage::default()));
        close_days(&store, 3);
        store.add_sale("apple", 7, 14.0);

        assert_eq!(store.current_day(), 3);
        assert_eq!(store.quantity_sold("apple", 1).expect("query"), 0);
        assert_eq!(store.total_volume("apple", 3).expect("query"), 0.0);
    }

    #[test]
    fn rolling_quantity_sums_exactly_the_requested_closed_days() {
        let mut day0 = DayBucket::new();
        day0.record(Sale::new(0, 999, 999.0));
        let mut day1 = DayBucket::new();
        day1.record(Sale::new(0, 5, 10.0));
        let mut day2 = DayBucket::new();
        day2.record(Sale::new(0, 4, 8.0));
        day2.record(Sale::new(0, 6, 30.0));
        let storage = Arc::new(
            MemoryStorage::default()
                .with_day(0, day0)
                .with_day(1, day1)
                .with_day(2, day2)
                .with_current_day(3),
        );
        let store = store_with(storage);
        store.dictionary().get_or_create("apple");

        assert_eq!(store.quantity_sold("apple", 2).expect("query"), 15);
        assert_eq!(store.quantity_sold("apple", 3).expect("query"), 1014);
        assert_eq!(store.quantity_sold("apple", 50).expect("query"), 1014);
        assert_eq!(store.total_volume("apple", 2).expect("query"), 48.0);
        assert_eq!(store.average_price("apple", 2).expect("query"), 3.2);
        assert_eq!(store.max_price("apple", 2).expect("query"), 5.0);
        assert_eq!(store.quantity_sold("apple", 0).expect("query"), 0);
    }

    #[test]
    fn unsold_product_averages_to_zero() {
        let store = store_with(Arc::new(MemoryStorage::default()));
        close_days(&store, 2);

        assert_eq!(store.average_price("ghost", 2).expect("query"), 0.0);
        assert_eq!(store.max_price("ghost", 2).expect("query"), 0.0);
    }

    #[test]
    fn reading_an_unknown_product_allocates_an_id() {
        let store = store_with(Arc::new(MemoryStorage::default()));
        close_days(&store, 1);
        assert_eq!(store.dictionary().id_of("ghost"), None);

        store.quantity_sold("ghost", 1).expect("query");
        assert_eq!(store.dictionary().id_of("ghost"), Some(0));
    }

    #[test]
    fn window_keeps_the_newest_closed_days_and_older_ones_come_from_storage() {
        let storage = Arc::new(MemoryStorage::default());
        let store = store_with(Arc::clone(&storage));
        for day in 0..4 {
            store.add_sale("apple", day + 1, 1.0);
            store.end_day().expect("day should close");
        }

        assert_eq!(store.window_days(), vec![2, 3]);
        assert_eq!(storage.stored_current_day(), 4);
        assert!(storage.stored_day(0).is_some());

        let loads_before = storage.day_loads();
        assert_eq!(store.quantity_sold("apple", 2).expect("query"), 3 + 4);
        assert_eq!(storage.day_loads(), loads_before);

        assert_eq!(store.quantity_sold("apple", 4).expect("query"), 10);
        assert_eq!(storage.day_loads(), loads_before + 2);
    }

    #[test]
    fn closed_day_aggregates_are_cached() {
        let storage = Arc::new(MemoryStorage::default());
        let store = store_with(Arc::clone(&storage));
        store.add_sale("apple", 2, 9.0);
        close_days(&store, 3);

        let first = store.get_aggregate(0, "apple").expect("aggregate");
        let loads = storage.day_loads();
        let second = store.get_aggregate(0, "apple").expect("aggregate");

        assert_eq!(
            first,
            Aggregate {
                quantity: 2,
                volume: 9.0,
                max_unit_price: 4.5
            }
        );
        assert_eq!(first, second);
        assert_eq!(storage.day_loads(), loads);
        assert!(store.cache().contains(0, "apple"));
        assert!(!store.cache().contains(3, "apple"));
    }

    #[test]
    fn failed_persist_keeps_rotation_and_the_day_readable() {
        let (logger, sink) = memory_logger(LogLevel::Error);
        let storage = Arc::new(MemoryStorage::default());
        let store = SalesStore::open(
            StoreSettings {
                days_in_memory: 1,
                cache_capacity: 4,
            },
            Box::new(Arc::clone(&storage)),
            logger,
        )
        .expect("store should open");

        store.add_sale("apple", 3, 3.0);
        storage.fail_writes(true);
        assert!(store.end_day().is_err());
        assert_eq!(store.current_day(), 1);
        assert!(sink
            .snapshot()
            .iter()
            .any(|line| line.contains("Failed to persist closed day")));

        storage.fail_writes(false);
        close_days(&store, 1);
        assert_eq!(store.window_days(), vec![1]);
        assert_eq!(store.quantity_sold("apple", 2).expect("query"), 3);
        assert!(storage.stored_day(0).is_none());

        store.shutdown().expect("shutdown should persist");
        assert!(storage.stored_day(0).is_some());
    }

    #[test]
    fn rotation_is_atomic_with_concurrent_sales() {
        let storage = Arc::new(MemoryStorage::default());
        let store = Arc::new(store_with(Arc::clone(&storage)));
        let sellers: Vec<_> = (0..4)
            .map(|_| {
                let store = Arc::clone(&store);
                thread::spawn(move || {
                    for _ in 0..250 {
                        store.add_sale("apple", 1, 1.0);
                    }
                })
            })
            .collect();
        for _ in 0..5 {
            store.end_day().expect("day should close");
        }
        for seller in sellers {
            seller.join().expect("seller should finish");
        }
        store.end_day().expect("final day should close");

        let total = store.quantity_sold("apple", 6).expect("query");
        assert_eq!(total, 1000);
    }

    #[test]
    fn shutdown_persists_everything_and_restart_recovers_the_open_day() {
        let storage = Arc::new(MemoryStorage::default());
        {
            let store = store_with(Arc::clone(&storage));
            assert!(store.register("ana", "pw"));
            assert!(!store.register("ana", "other"));
            store.add_sale("apple", 1, 2.0);
            close_days(&store, 1);
            store.add_sale("pear", 4, 4.0);

            assert_eq!(store.shutdown().expect("shutdown should persist"), 1);
            assert_eq!(store.shutdown().expect("second shutdown is a no-op"), 1);
        }

        assert_eq!(storage.stored_current_day(), 1);
        assert_eq!(storage.stored_users().get("ana").map(String::as_str), Some("pw"));
        assert_eq!(storage.stored_dictionary().entries.len(), 2);

        let restarted = store_with(Arc::clone(&storage));
        assert!(restarted.authenticate("ana", "pw"));
        assert!(!restarted.authenticate("ana", "nope"));
        assert!(!restarted.authenticate("rui", "pw"));
        assert_eq!(restarted.current_day(), 1);
        assert_eq!(restarted.dictionary().id_of("pear"), Some(1));

        restarted.end_day().expect("day should close");
        assert_eq!(restarted.quantity_sold("pear", 1).expect("query"), 4);
        assert_eq!(restarted.quantity_sold("apple", 2).expect("query"), 1);
    }

    #[test]
    fn shutdown_releases_notification_waiters() {
        let store = Arc::new(store_with(Arc::new(MemoryStorage::default())));
        let product = store.dictionary().get_or_create("apple");
        let waiter = {
            let store = Arc::clone(&store);
            thread::spawn(move || store.notifications().wait_simultaneous(product, product + 1))
        };
        while store.notifications().waiting_count() == 0 {
            thread::yield_now();
        }

        store.shutdown().expect("shutdown should persist");
        assert!(!waiter.join().expect("waiter should finish"));
    }

    #[test]
    fn filter_events_reads_the_single_day_requested() {
        let store = store_with(Arc::new(MemoryStorage::default()));
        store.add_sale("apple", 1, 1.5);
        store.add_sale("pear", 2, 5.0);
        store.add_sale("apple", 3, 4.5);
        close_days(&store, 1);
        store.add_sale("apple", 9, 9.0);
        close_days(&store, 1);

        let events = store
            .filter_events(&["apple".to_owned(), "plum".to_owned(), "apple".to_owned()], 2)
            .expect("filter");
        assert_eq!(
            events,
            vec![(0, vec![Sale::new(0, 1, 1.5), Sale::new(0, 3, 4.5)])]
        );

        assert!(store.filter_events(&["apple".to_owned()], 0).expect("filter").is_empty());
        assert!(store.filter_events(&["apple".to_owned()], 3).expect("filter").is_empty());
    }
}
