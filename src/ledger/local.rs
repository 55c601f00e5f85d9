use std::sync::Arc;

use crate::storage::StorageError;
use crate::store::SalesStore;

use super::{
    shutdown_ack, EndDayReport, FilteredEvents, LedgerError, SaleEvent, SalesLedger,
    DISCONNECT_ACK,
};

impl From<StorageError> for LedgerError {
    fn from(value: StorageError) -> Self {
        Self::Server(value.to_string())
    }
}

/// Runs every operation directly against the store.
#[derive(Clone)]
pub struct LocalLedger {
    store: Arc<SalesStore>,
}

impl LocalLedger {
    pub fn new(store: Arc<SalesStore>) -> Self {
        Self { store }
    }

    pub fn store(&self) -> &Arc<SalesStore> {
        &self.store
    }
}

impl SalesLedger for LocalLedger {
    fn login(&self, username: &str, password: &str) -> Result<bool, LedgerError> {
        Ok(self.store.authenticate(username, password))
    }

    fn register(&self, username: &str, password: &str) -> Result<bool, LedgerError> {
        Ok(self.store.register(username, password))
    }

    fn add_sale(&self, product: &str, quantity: i32, price: f64) -> Result<bool, LedgerError> {
        self.store.add_sale(product, quantity, price);
        Ok(true)
    }

    fn sales_quantity(&self, product: &str, days: i32) -> Result<i64, LedgerError> {
        Ok(self.store.quantity_sold(product, days)?)
    }

    fn sales_volume(&self, product: &str, days: i32) -> Result<f64, LedgerError> {
        Ok(self.store.total_volume(product, days)?)
    }

    fn sales_average_price(&self, product: &str, days: i32) -> Result<f64, LedgerError> {
        Ok(self.store.average_price(product, days)?)
    }

    fn sales_max_price(&self, product: &str, days: i32) -> Result<f64, LedgerError> {
        Ok(self.store.max_price(product, days)?)
    }

    fn end_day(&self) -> Result<EndDayReport, LedgerError> {
        // The store logs the write failure; the rotation itself stands.
        Ok(EndDayReport::new(self.store.end_day().is_ok()))
    }

    fn wait_simultaneous_sales(&self, first: &str, second: &str) -> Result<bool, LedgerError> {
        let dictionary = self.store.dictionary();
        let first = dictionary.get_or_create(first);
        let second = dictionary.get_or_create(second);
        Ok(self.store.notifications().wait_simultaneous(first, second))
    }

    fn wait_consecutive_sales(&self, threshold: i32) -> Result<Option<String>, LedgerError> {
        let notifications = self.store.notifications();
        // Any streak meets a threshold below one: answer with the last
        // product sold today, if any, without waiting.
        let product = match u32::try_from(threshold) {
            Ok(threshold) if threshold > 0 => notifications.wait_consecutive(threshold),
            _ => notifications.check_consecutive(0),
        };
        Ok(product.and_then(|product| self.store.dictionary().name_of(product)))
    }

    fn filter_events(&self, products: &[String], days: i32) -> Result<FilteredEvents, LedgerError> {
        let dictionary = self.store.dictionary();
        let products = self
            .store
            .filter_events(products, days)?
            .into_iter()
            .filter_map(|(id, sales)| {
                let events = sales
                    .iter()
                    .map(|sale| SaleEvent {
                        quantity: sale.quantity,
                        price: sale.price,
                    })
                    .collect();
                dictionary.name_of(id).map(|name| (name, events))
            })
            .collect();
        Ok(FilteredEvents { products })
    }

    fn shutdown(&self) -> Result<String, LedgerError> {
        Ok(shutdown_ack(self.store.shutdown()?))
    }

    fn disconnect(&self) -> Result<String, LedgerError> {
        Ok(DISCONNECT_ACK.to_owned())
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::thread;

    use crate::ledger::{EndDayReport, SaleEvent, SalesLedger};
    use crate::logging::Logger;
    use crate::storage::memory::MemoryStorage;
    use crate::store::{SalesStore, StoreSettings};

    use super::LocalLedger;

    fn ledger_over(storage: Arc<MemoryStorage>) -> LocalLedger {
        let store = SalesStore::open(
            StoreSettings {
                days_in_memory: 2,
                cache_capacity: 8,
            },
            Box::new(storage),
            Arc::new(Logger::silent()),
        )
        .expect("store should open");
        LocalLedger::new(Arc::new(store))
    }

    #[test]
    fn queries_cover_closed_days_only() {
        let ledger = ledger_over(Arc::new(MemoryStorage::default()));
        ledger.add_sale("tea", 2, 3.0).expect("sale");
        ledger.add_sale("tea", 1, 4.0).expect("sale");
        assert_eq!(ledger.end_day().expect("end day"), EndDayReport::new(true));
        ledger.add_sale("tea", 50, 50.0).expect("sale");

        assert_eq!(ledger.sales_quantity("tea", 1).expect("query"), 3);
        assert_eq!(ledger.sales_volume("tea", 1).expect("query"), 7.0);
        assert_eq!(ledger.sales_max_price("tea", 1).expect("query"), 4.0);
        let average = ledger.sales_average_price("tea", 1).expect("query");
        assert!((average - 7.0 / 3.0).abs() < 1e-12);
    }

    #[test]
    fn failed_write_reports_end_day_failure() {
        let storage = Arc::new(MemoryStorage::default());
        let ledger = ledger_over(Arc::clone(&storage));
        storage.fail_writes(true);

        let report = ledger.end_day().expect("end day");
        assert!(!report.persisted);
        assert_eq!(report.message, "Failed to end day.");
        assert_eq!(ledger.store().current_day(), 1);
    }

    #[test]
    fn consecutive_wait_returns_the_product_name() {
        let ledger = Arc::new(ledger_over(Arc::new(MemoryStorage::default())));
        let waiter = {
            let ledger = Arc::clone(&ledger);
            thread::spawn(move || ledger.wait_consecutive_sales(3))
        };
        while ledger.store().notifications().waiting_count() == 0 {
            thread::yield_now();
        }
        for _ in 0..3 {
            ledger.add_sale("jam", 1, 1.0).expect("sale");
        }

        let product = waiter
            .join()
            .expect("waiter should finish")
            .expect("wait should succeed");
        assert_eq!(product.as_deref(), Some("jam"));
    }

    #[test]
    fn threshold_below_one_reports_the_last_product_sold_today() {
        let ledger = ledger_over(Arc::new(MemoryStorage::default()));
        assert_eq!(ledger.wait_consecutive_sales(0).expect("wait"), None);

        ledger.add_sale("jam", 1, 1.0).expect("sale");
        ledger.add_sale("tea", 1, 1.0).expect("sale");
        assert_eq!(
            ledger.wait_consecutive_sales(0).expect("wait").as_deref(),
            Some("tea")
        );
        assert_eq!(
            ledger.wait_consecutive_sales(-4).expect("wait").as_deref(),
            Some("tea")
        );

        assert!(ledger.end_day().expect("end day").persisted);
        assert_eq!(ledger.wait_consecutive_sales(0).expect("wait"), None);
    }

    #[test]
    fn simultaneous_wait_succeeds_when_both_sold_before_waiting() {
        let ledger = ledger_over(Arc::new(MemoryStorage::default()));
        ledger.add_sale("tea", 1, 1.0).expect("sale");
        ledger.add_sale("jam", 1, 1.0).expect("sale");

        assert!(ledger.wait_simultaneous_sales("jam", "tea").expect("wait"));
    }

    #[test]
    fn filter_events_names_products() {
        let ledger = ledger_over(Arc::new(MemoryStorage::default()));
        ledger.add_sale("tea", 2, 3.0).expect("sale");
        ledger.add_sale("jam", 1, 0.5).expect("sale");
        ledger.end_day().expect("end day");

        let events = ledger
            .filter_events(&["jam".to_owned(), "bread".to_owned()], 1)
            .expect("filter");
        assert_eq!(events.products.len(), 1);
        assert_eq!(
            events.events_of("jam"),
            &[SaleEvent {
                quantity: 1,
                price: 0.5
            }]
        );
        assert!(events.events_of("tea").is_empty());
    }

    #[test]
    fn shutdown_acknowledges_with_last_day() {
        let storage = Arc::new(MemoryStorage::default());
        let ledger = ledger_over(Arc::clone(&storage));
        ledger.end_day().expect("end day");
        ledger.end_day().expect("end day");

        assert_eq!(
            ledger.shutdown().expect("shutdown"),
            "Server shutdown. Last day saved: 2"
        );
        assert_eq!(storage.stored_current_day(), 2);
        assert_eq!(ledger.disconnect().expect("disconnect"), "Disconnect acknowledged");
    }
}
