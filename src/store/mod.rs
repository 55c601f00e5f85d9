mod dictionary;
mod sales;

use std::collections::HashMap;

pub use dictionary::{DictionarySnapshot, ProductDictionary};
pub use sales::{Aggregate, SalesStore, StoreSettings};

/// Dense id assigned to a product name on first sight, starting at 0.
pub type ProductId = i32;

#[derive(Clone, Copy, Debug, PartialEq)]
pub struct Sale {
    pub product_id: ProductId,
    pub quantity: i32,
    /// Line total, not the unit price.
    pub price: f64,
}

impl Sale {
    pub fn new(product_id: ProductId, quantity: i32, price: f64) -> Self {
        Self {
            product_id,
            quantity,
            price,
        }
    }

    pub fn unit_price(&self) -> f64 {
        self.price / f64::from(self.quantity)
    }
}

/// Sales of one logical day grouped by product.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct DayBucket {
    sales: HashMap<ProductId, Vec<Sale>>,
}

impl DayBucket {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&mut self, sale: Sale) {
        self.sales.entry(sale.product_id).or_default().push(sale);
    }

    pub fn sales_of(&self, product_id: ProductId) -> &[Sale] {
        self.sales
            .get(&product_id)
            .map(Vec::as_slice)
            .unwrap_or_default()
    }

    /// Product ids in ascending order.
    pub fn product_ids(&self) -> Vec<ProductId> {
        let mut ids: Vec<ProductId> = self.sales.keys().copied().collect();
        ids.sort_unstable();
        ids
    }

    pub fn product_count(&self) -> usize {
        self.sales.len()
    }

    pub fn sale_count(&self) -> usize {
        self.sales.values().map(Vec::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.sales.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::{DayBucket, Sale};

    #[test]
    fn unit_price_divides_line_total_by_quantity() {
        assert_eq!(Sale::new(0, 4, 10.0).unit_price(), 2.5);
    }

    #[test]
    fn bucket_groups_by_product() {
        let mut bucket = DayBucket::new();
        bucket.record(Sale::new(2, 1, 1.0));
        bucket.record(Sale::new(0, 3, 9.0));
        bucket.record(Sale::new(2, 5, 5.0));

        assert_eq!(bucket.product_ids(), vec![0, 2]);
        assert_eq!(bucket.sales_of(2).len(), 2);
        assert!(bucket.sales_of(7).is_empty());
        assert_eq!(bucket.product_count(), 2);
        assert_eq!(bucket.sale_count(), 3);
    }
}
