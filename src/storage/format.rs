//! Byte layouts shared by every engine, all big-endian:
//!
//! * day: `productCount:int32`, then per product `productId:int32,
//!   saleCount:int32, saleCount x {quantity:int32, price:float64}`
//! * users: `count:int32, count x {username:UTF, password:UTF}`
//! * dictionary: `nextId:int32, count:int32, count x {name:UTF, id:int32}`
//! * current day: a single `int32`

use std::collections::HashMap;

use crate::store::{DayBucket, DictionarySnapshot, Sale};
use crate::wire::payload::{PayloadError, PayloadReader, PayloadWriter};

use super::StorageError;

pub(crate) fn encode_day(bucket: &DayBucket) -> Vec<u8> {
    let mut writer = PayloadWriter::new();
    let products = bucket.product_ids();
    writer.put_count(products.len());
    for product_id in products {
        let sales = bucket.sales_of(product_id);
        writer.put_i32(product_id).put_count(sales.len());
        for sale in sales {
            writer.put_i32(sale.quantity).put_f64(sale.price);
        }
    }
    writer.into_bytes()
}

pub(crate) fn decode_day(day: i32, bytes: &[u8]) -> Result<DayBucket, StorageError> {
    let corrupt = |source| StorageError::Corrupt {
        record: format!("day {day}"),
        source,
    };
    let mut reader = PayloadReader::new(bytes);
    let mut bucket = DayBucket::new();

    let products = reader.count().map_err(corrupt)?;
    for _ in 0..products {
        let product_id = reader.i32().map_err(corrupt)?;
        let sales = reader.count().map_err(corrupt)?;
        for _ in 0..sales {
            let quantity = reader.i32().map_err(corrupt)?;
            let price = reader.f64().map_err(corrupt)?;
            bucket.record(Sale::new(product_id, quantity, price));
        }
    }
    reader.finish().map_err(corrupt)?;
    Ok(bucket)
}

pub(crate) fn encode_users(users: &HashMap<String, String>) -> Result<Vec<u8>, StorageError> {
    let encode = |source| StorageError::Encode {
        record: "users".to_owned(),
        source,
    };
    let mut names: Vec<&String> = users.keys().collect();
    names.sort();

    let mut writer = PayloadWriter::new();
    writer.put_count(names.len());
    for name in names {
        writer.put_str(name).map_err(encode)?;
        writer.put_str(&users[name]).map_err(encode)?;
    }
    Ok(writer.into_bytes())
}

pub(crate) fn decode_users(bytes: &[u8]) -> Result<HashMap<String, String>, StorageError> {
    let corrupt = |source| StorageError::Corrupt {
        record: "users".to_owned(),
        source,
    };
    let mut reader = PayloadReader::new(bytes);
    let count = reader.count().map_err(corrupt)?;
    let mut users = HashMap::with_capacity(count.min(reader.remaining()));
    for _ in 0..count {
        let username = reader.string().map_err(corrupt)?;
        let password = reader.string().map_err(corrupt)?;
        users.insert(username, password);
    }
    reader.finish().map_err(corrupt)?;
    Ok(users)
}

pub(crate) fn encode_dictionary(snapshot: &DictionarySnapshot) -> Result<Vec<u8>, StorageError> {
    let encode = |source| StorageError::Encode {
        record: "dictionary".to_owned(),
        source,
    };
    let mut writer = PayloadWriter::new();
    writer.put_i32(snapshot.next_id).put_count(snapshot.entries.len());
    for (name, id) in &snapshot.entries {
        writer.put_str(name).map_err(encode)?;
        writer.put_i32(*id);
    }
    Ok(writer.into_bytes())
}

pub(crate) fn decode_dictionary(bytes: &[u8]) -> Result<DictionarySnapshot, StorageError> {
    let corrupt = |source| StorageError::Corrupt {
        record: "dictionary".to_owned(),
        source,
    };
    let mut reader = PayloadReader::new(bytes);
    let next_id = reader.i32().map_err(corrupt)?;
    let count = reader.count().map_err(corrupt)?;
    let mut entries = Vec::with_capacity(count.min(reader.remaining()));
    for _ in 0..count {
        let name = reader.string().map_err(corrupt)?;
        let id = reader.i32().map_err(corrupt)?;
        if !(0..i32::MAX).contains(&id) {
            return Err(corrupt(PayloadError::ValueOutOfRange {
                field: "product id",
                value: id,
            }));
        }
        entries.push((name, id));
    }
    reader.finish().map_err(corrupt)?;
    Ok(DictionarySnapshot { next_id, entries })
}

pub(crate) fn encode_day_number(day: i32) -> Vec<u8> {
    day.to_be_bytes().to_vec()
}

pub(crate) fn decode_day_number(bytes: &[u8]) -> Result<i32, StorageError> {
    let mut reader = PayloadReader::new(bytes);
    let day = reader.i32().and_then(|day| {
        reader.finish()?;
        Ok(day)
    });
    day.map_err(|source| StorageError::Corrupt {
        record: "current day".to_owned(),
        source,
    })
}
