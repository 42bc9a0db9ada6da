//! Generic keyed table with an optional unique index

use std::fmt::Display;
use std::hash::Hash;

use chrono::{DateTime, Utc};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;

use super::StoreError;

/// A persisted entity
pub trait Record: Clone + Send + Sync + 'static {
    type Key: Eq + Hash + Clone + Display + Send + Sync + 'static;

    /// Entity name used in error messages
    const KIND: &'static str;

    fn key(&self) -> Self::Key;

    fn touch(&mut self, at: DateTime<Utc>);
}

/// Implements [`Record`] for an entity with an `updated` timestamp
#[macro_export]
macro_rules! record {
    ($ty:ty, $kind:literal, $field:ident: $key:ty) => {
        impl $crate::store::Record for $ty {
            type Key = $key;
            const KIND: &'static str = $kind;

            fn key(&self) -> $key {
                self.$field.clone()
            }

            fn touch(&mut self, at: chrono::DateTime<chrono::Utc>) {
                self.updated = at;
            }
        }
    };
}

type UniqueFn<T> = fn(&T) -> String;

pub struct Table<T: Record> {
    rows: DashMap<T::Key, T>,
    unique: Option<UniqueFn<T>>,
    index: DashMap<String, T::Key>,
}

impl<T: Record> Default for Table<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: Record> Table<T> {
    pub fn new() -> Self {
        Self {
            rows: DashMap::new(),
            unique: None,
            index: DashMap::new(),
        }
    }

    /// Table where `unique(row)` must not repeat across rows
    pub fn with_unique(unique: UniqueFn<T>) -> Self {
        Self {
            unique: Some(unique),
            ..Self::new()
        }
    }

    fn claim(&self, row: &T) -> Result<(), StoreError> {
        let Some(unique) = self.unique else {
            return Ok(());
        };
        match self.index.entry(unique(row)) {
            Entry::Occupied(e) if e.get() != &row.key() => {
                Err(StoreError::Duplicate(format!("{} {}", T::KIND, e.key())))
            }
            Entry::Occupied(_) => Ok(()),
            Entry::Vacant(v) => {
                v.insert(row.key());
                Ok(())
            }
        }
    }

    fn release(&self, row: &T) {
        if let Some(unique) = self.unique {
            self.index.remove_if(&unique(row), |_, key| key == &row.key());
        }
    }

    /// Insert a new row; fails if the key or unique value is taken
    pub fn insert(&self, row: T) -> Result<T, StoreError> {
        if self.rows.contains_key(&row.key()) {
            return Err(StoreError::Duplicate(format!("{} {}", T::KIND, row.key())));
        }
        self.claim(&row)?;
        match self.rows.entry(row.key()) {
            Entry::Occupied(_) => {
                self.release(&row);
                Err(StoreError::Duplicate(format!("{} {}", T::KIND, row.key())))
            }
            Entry::Vacant(v) => {
                v.insert(row.clone());
                Ok(row)
            }
        }
    }

    /// Insert or replace by key
    pub fn upsert(&self, mut row: T) -> Result<T, StoreError> {
        row.touch(Utc::now());
        self.claim(&row)?;
        if let Some(previous) = self.rows.insert(row.key(), row.clone()) {
            if let Some(unique) = self.unique {
                if unique(&previous) != unique(&row) {
                    self.release(&previous);
                }
            }
        }
        Ok(row)
    }

    pub fn get(&self, key: &T::Key) -> Result<T, StoreError> {
        self.rows
            .get(key)
            .map(|r| r.clone())
            .ok_or_else(|| StoreError::NotFound(format!("{} {}", T::KIND, key)))
    }

    pub fn contains(&self, key: &T::Key) -> bool {
        self.rows.contains_key(key)
    }

    /// Apply `f` to a row in place and return the updated copy
    pub fn update(&self, key: &T::Key, f: impl FnOnce(&mut T)) -> Result<T, StoreError> {
        let mut row = self
            .rows
            .get_mut(key)
            .ok_or_else(|| StoreError::NotFound(format!("{} {}", T::KIND, key)))?;
        let before = self.unique.map(|u| u(&row));
        f(&mut row);
        row.touch(Utc::now());
        let updated = row.clone();
        drop(row);

        if let (Some(unique), Some(before)) = (self.unique, before) {
            if unique(&updated) != before {
                self.index.remove(&before);
                self.claim(&updated)?;
            }
        }
        Ok(updated)
    }

    pub fn remove(&self, key: &T::Key) -> Option<T> {
        let removed = self.rows.remove(key).map(|(_, row)| row);
        if let Some(row) = &removed {
            self.release(row);
        }
        removed
    }

    /// Remove every row matching `pred`, returning the removed rows
    pub fn remove_where(&self, pred: impl Fn(&T) -> bool) -> Vec<T> {
        let keys: Vec<T::Key> = self
            .rows
            .iter()
            .filter(|r| pred(r.value()))
            .map(|r| r.key().clone())
            .collect();
        keys.iter().filter_map(|k| self.remove(k)).collect()
    }

    pub fn find(&self, pred: impl Fn(&T) -> bool) -> Vec<T> {
        self.rows
            .iter()
            .filter(|r| pred(r.value()))
            .map(|r| r.value().clone())
            .collect()
    }

    pub fn find_one(&self, pred: impl Fn(&T) -> bool) -> Option<T> {
        self.rows
            .iter()
            .find(|r| pred(r.value()))
            .map(|r| r.value().clone())
    }

    pub fn all(&self) -> Vec<T> {
        self.rows.iter().map(|r| r.value().clone()).collect()
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug, Clone)]
    struct Row {
        id: u32,
        name: String,
        updated: DateTime<Utc>,
    }

    crate::record!(Row, "row", id: u32);

    fn row(id: u32, name: &str) -> Row {
        Row {
            id,
            name: name.into(),
            updated: Utc::now(),
        }
    }

    fn by_name(r: &Row) -> String {
        r.name.clone()
    }

    #[test]
    fn test_insert_rejects_duplicate_key() {
        let table = Table::new();
        table.insert(row(1, "a")).unwrap();
        assert!(matches!(table.insert(row(1, "b")), Err(StoreError::Duplicate(_))));
    }

    #[test]
    fn test_unique_index() {
        let table = Table::with_unique(by_name);
        table.insert(row(1, "a")).unwrap();
        assert!(matches!(table.insert(row(2, "a")), Err(StoreError::Duplicate(_))));

        table.remove(&1);
        table.insert(row(2, "a")).unwrap();
    }

    #[test]
    fn test_update_reindexes() {
        let table = Table::with_unique(by_name);
        table.insert(row(1, "a")).unwrap();
        table.update(&1, |r| r.name = "b".into()).unwrap();
        table.insert(row(2, "a")).unwrap();
        assert!(table.insert(row(3, "b")).is_err());
    }

    #[test]
    fn test_get_missing() {
        let table: Table<Row> = Table::new();
        assert!(matches!(table.get(&7), Err(StoreError::NotFound(_))));
    }

    #[test]
    fn test_remove_where() {
        let table = Table::new();
        table.insert(row(1, "a")).unwrap();
        table.insert(row(2, "b")).unwrap();
        let removed = table.remove_where(|r| r.name == "a");
        assert_eq!(removed.len(), 1);
        assert_eq!(table.len(), 1);
    }
}
