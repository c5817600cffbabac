//! Columnar aggregate engine.
//!
//! A `ColumnStore` transposes a row set into one contiguous array per
//! numeric column and answers the aggregate kernels over them with
//! cache-linear scans. The store is a rebuildable projection — it is
//! never updated in place and never persisted; durability belongs to the
//! owning storage engine.
//!
//! Integer kernels use four independent accumulators so the compiler can
//! vectorize; integer addition is associative, so the result is
//! bit-identical to the naive loop. Float kernels accumulate
//! sequentially to stay bit-compatible with the row-by-row reference.

use std::collections::HashMap;

use rust_decimal::Decimal;

use crate::error::{Result, VaultError};
use crate::types::{DataType, Value};

enum ColumnData {
    Int(Vec<i64>),
    Real(Vec<f64>),
    Decimal(Vec<Decimal>),
}

struct Column {
    data: ColumnData,
    null_count: usize,
}

pub struct ColumnStore {
    row_count: usize,
    columns: HashMap<String, Column>,
}

impl ColumnStore {
    /// Transpose `rows` (each in schema order) into column arrays.
    /// Non-numeric columns are skipped — the kernels have nothing to say
    /// about them.
    pub fn from_rows(schema: &[(String, DataType)], rows: &[Vec<Value>]) -> Self {
        let mut columns: HashMap<String, Column> = HashMap::new();
        for (position, (name, data_type)) in schema.iter().enumerate() {
            if !data_type.is_numeric() {
                continue;
            }
            let mut null_count = 0usize;
            let column = match data_type {
                DataType::Integer => {
                    let mut values = Vec::with_capacity(rows.len());
                    for row in rows {
                        match row.get(position) {
                            Some(Value::Integer(v)) => values.push(*v),
                            _ => null_count += 1,
                        }
                    }
                    ColumnData::Int(values)
                }
                DataType::Real => {
                    let mut values = Vec::with_capacity(rows.len());
                    for row in rows {
                        match row.get(position) {
                            Some(Value::Real(v)) => values.push(*v),
                            _ => null_count += 1,
                        }
                    }
                    ColumnData::Real(values)
                }
                DataType::Decimal => {
                    let mut values = Vec::with_capacity(rows.len());
                    for row in rows {
                        match row.get(position) {
                            Some(Value::Decimal(v)) => values.push(*v),
                            _ => null_count += 1,
                        }
                    }
                    ColumnData::Decimal(values)
                }
                _ => unreachable!("non-numeric filtered above"),
            };
            columns.insert(
                name.to_lowercase(),
                Column { data: column, null_count },
            );
        }
        ColumnStore { row_count: rows.len(), columns }
    }

    pub fn row_count(&self) -> usize {
        self.row_count
    }

    pub fn has_column(&self, name: &str) -> bool {
        self.columns.contains_key(&name.to_lowercase())
    }

    fn column(&self, name: &str) -> Result<&Column> {
        self.columns
            .get(&name.to_lowercase())
            .ok_or_else(|| VaultError::Execution(format!("no numeric column {name} in column store")))
    }

    /// SUM over non-null values; NULL for an all-null/empty column.
    pub fn sum(&self, name: &str) -> Result<Value> {
        let column = self.column(name)?;
        Ok(match &column.data {
            ColumnData::Int(values) if values.is_empty() => Value::Null,
            ColumnData::Int(values) => Value::Integer(sum_i64(values)),
            ColumnData::Real(values) if values.is_empty() => Value::Null,
            ColumnData::Real(values) => Value::Real(values.iter().sum()),
            ColumnData::Decimal(values) if values.is_empty() => Value::Null,
            ColumnData::Decimal(values) => Value::Decimal(values.iter().copied().sum()),
        })
    }

    /// AVG = SUM / non-null count, as REAL (DECIMAL stays exact).
    pub fn average(&self, name: &str) -> Result<Value> {
        let column = self.column(name)?;
        Ok(match &column.data {
            ColumnData::Int(values) if values.is_empty() => Value::Null,
            ColumnData::Int(values) => {
                Value::Real(sum_i64(values) as f64 / values.len() as f64)
            }
            ColumnData::Real(values) if values.is_empty() => Value::Null,
            ColumnData::Real(values) => {
                Value::Real(values.iter().sum::<f64>() / values.len() as f64)
            }
            ColumnData::Decimal(values) if values.is_empty() => Value::Null,
            ColumnData::Decimal(values) => {
                let total: Decimal = values.iter().copied().sum();
                Value::Decimal(total / Decimal::from(values.len() as i64))
            }
        })
    }

    pub fn min(&self, name: &str) -> Result<Value> {
        let column = self.column(name)?;
        Ok(match &column.data {
            ColumnData::Int(values) => {
                values.iter().copied().min().map(Value::Integer).unwrap_or(Value::Null)
            }
            ColumnData::Real(values) => fold_real(values, |acc, v| if v < acc { v } else { acc }),
            ColumnData::Decimal(values) => {
                values.iter().copied().min().map(Value::Decimal).unwrap_or(Value::Null)
            }
        })
    }

    pub fn max(&self, name: &str) -> Result<Value> {
        let column = self.column(name)?;
        Ok(match &column.data {
            ColumnData::Int(values) => {
                values.iter().copied().max().map(Value::Integer).unwrap_or(Value::Null)
            }
            ColumnData::Real(values) => fold_real(values, |acc, v| if v > acc { v } else { acc }),
            ColumnData::Decimal(values) => {
                values.iter().copied().max().map(Value::Decimal).unwrap_or(Value::Null)
            }
        })
    }

    /// COUNT(col): non-null values.
    pub fn count(&self, name: &str) -> Result<u64> {
        let column = self.column(name)?;
        let stored = match &column.data {
            ColumnData::Int(values) => values.len(),
            ColumnData::Real(values) => values.len(),
            ColumnData::Decimal(values) => values.len(),
        };
        debug_assert_eq!(stored + column.null_count, self.row_count);
        Ok(stored as u64)
    }
}

/// Four-lane unrolled integer sum; associativity makes this exact.
fn sum_i64(values: &[i64]) -> i64 {
    let mut lanes = [0i64; 4];
    let chunks = values.chunks_exact(4);
    let remainder = chunks.remainder();
    for chunk in chunks {
        lanes[0] = lanes[0].wrapping_add(chunk[0]);
        lanes[1] = lanes[1].wrapping_add(chunk[1]);
        lanes[2] = lanes[2].wrapping_add(chunk[2]);
        lanes[3] = lanes[3].wrapping_add(chunk[3]);
    }
    let mut total = lanes[0]
        .wrapping_add(lanes[1])
        .wrapping_add(lanes[2])
        .wrapping_add(lanes[3]);
    for v in remainder {
        total = total.wrapping_add(*v);
    }
    total
}

fn fold_real(values: &[f64], pick: impl Fn(f64, f64) -> f64) -> Value {
    let mut iter = values.iter().copied();
    match iter.next() {
        None => Value::Null,
        Some(first) => Value::Real(iter.fold(first, pick)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn int_schema() -> Vec<(String, DataType)> {
        vec![
            ("id".to_string(), DataType::Integer),
            ("age".to_string(), DataType::Integer),
            ("name".to_string(), DataType::Text),
        ]
    }

    fn make_rows(n: i64) -> Vec<Vec<Value>> {
        (0..n)
            .map(|i| {
                vec![
                    Value::Integer(i),
                    Value::Integer(22 + (i * 7919) % 43), // uniform-ish in [22, 65)
                    Value::Text(format!("row{i}")),
                ]
            })
            .collect()
    }

    #[test]
    fn test_aggregates_match_naive_reference() {
        let rows = make_rows(10_000);
        let store = ColumnStore::from_rows(&int_schema(), &rows);

        let ages: Vec<i64> = rows.iter().map(|r| r[1].as_i64().unwrap()).collect();
        let naive_sum: i64 = ages.iter().sum();
        let naive_min = *ages.iter().min().unwrap();
        let naive_max = *ages.iter().max().unwrap();
        let naive_avg = naive_sum as f64 / ages.len() as f64;

        assert_eq!(store.sum("age").unwrap(), Value::Integer(naive_sum));
        assert_eq!(store.min("age").unwrap(), Value::Integer(naive_min));
        assert_eq!(store.max("age").unwrap(), Value::Integer(naive_max));
        assert_eq!(store.count("age").unwrap(), 10_000);
        match store.average("age").unwrap() {
            Value::Real(avg) => assert!((avg - naive_avg).abs() <= f64::EPSILON * naive_avg.abs()),
            other => panic!("expected REAL average, got {other:?}"),
        }
    }

    #[test]
    fn test_real_aggregates_bit_compatible_with_sequential() {
        let schema = vec![("x".to_string(), DataType::Real)];
        let rows: Vec<Vec<Value>> = (0..5000)
            .map(|i| vec![Value::Real((i as f64) * 0.25 - 300.0)])
            .collect();
        let store = ColumnStore::from_rows(&schema, &rows);
        let xs: Vec<f64> = rows.iter().map(|r| r[0].as_f64().unwrap()).collect();
        let naive: f64 = xs.iter().sum();
        assert_eq!(store.sum("x").unwrap(), Value::Real(naive));
    }

    #[test]
    fn test_nulls_are_skipped() {
        let schema = vec![("v".to_string(), DataType::Integer)];
        let rows = vec![
            vec![Value::Integer(10)],
            vec![Value::Null],
            vec![Value::Integer(20)],
        ];
        let store = ColumnStore::from_rows(&schema, &rows);
        assert_eq!(store.sum("v").unwrap(), Value::Integer(30));
        assert_eq!(store.count("v").unwrap(), 2);
        assert_eq!(store.row_count(), 3);
    }

    #[test]
    fn test_empty_column_yields_null() {
        let schema = vec![("v".to_string(), DataType::Integer)];
        let store = ColumnStore::from_rows(&schema, &[]);
        assert_eq!(store.sum("v").unwrap(), Value::Null);
        assert_eq!(store.min("v").unwrap(), Value::Null);
        assert_eq!(store.count("v").unwrap(), 0);
    }

    #[test]
    fn test_decimal_aggregates_exact() {
        let schema = vec![("price".to_string(), DataType::Decimal)];
        let rows: Vec<Vec<Value>> = (1..=4)
            .map(|i| vec![Value::Decimal(Decimal::new(i * 25, 2))]) // 0.25..1.00
            .collect();
        let store = ColumnStore::from_rows(&schema, &rows);
        assert_eq!(store.sum("price").unwrap(), Value::Decimal(Decimal::new(250, 2)));
        assert_eq!(
            store.average("price").unwrap(),
            Value::Decimal(Decimal::new(250, 2) / Decimal::from(4))
        );
    }

    #[test]
    fn test_multi_aggregate_throughput_smoke() {
        // Generous bound for CI: the 100k multi-aggregate target is
        // < 10 ms on a laptop; allow 20x headroom for shared runners.
        let rows = make_rows(100_000);
        let store = ColumnStore::from_rows(&int_schema(), &rows);
        let start = std::time::Instant::now();
        let _ = store.sum("age").unwrap();
        let _ = store.average("age").unwrap();
        let _ = store.min("age").unwrap();
        let _ = store.max("age").unwrap();
        let _ = store.count("age").unwrap();
        assert!(start.elapsed() < std::time::Duration::from_millis(200));
    }
}
