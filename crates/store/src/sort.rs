//! Field comparators and the composite multi-key sorter.

use std::cmp::Ordering;

use livequery_core::{DataStoreError, DataStoreResult, FieldAccessor, FieldValue, Model, QuerySortBy};
use smallvec::SmallVec;

/// Compares two models by a single sort field.
///
/// The field accessor is resolved once at construction; an unknown field
/// fails here instead of at comparison time.
pub struct ModelComparator<T: Model> {
    sort_by: QuerySortBy,
    accessor: FieldAccessor<T>,
}

impl<T: Model> ModelComparator<T> {
    pub fn new(sort_by: QuerySortBy) -> DataStoreResult<Self> {
        let accessor = T::field_accessor(&sort_by.field).ok_or_else(|| DataStoreError::UnknownField {
            model: T::MODEL_NAME.to_string(),
            field: sort_by.field.clone(),
        })?;
        Ok(Self { sort_by, accessor })
    }

    pub fn sort_by(&self) -> &QuerySortBy { &self.sort_by }

    pub fn key(&self, item: &T) -> FieldValue { (self.accessor)(item) }

    /// Directed comparison of two models; errors when the values are of different classes.
    pub fn compare(&self, left: &T, right: &T) -> DataStoreResult<Ordering> {
        self.compare_keys(&self.key(left), &self.key(right))
    }

    fn compare_keys(&self, left: &FieldValue, right: &FieldValue) -> DataStoreResult<Ordering> {
        left.ordering(right)
            .map(|o| self.sort_by.direct(o))
            .ok_or_else(|| self.incomparable(left, right))
    }

    fn incomparable(&self, left: &FieldValue, right: &FieldValue) -> DataStoreError {
        DataStoreError::Incomparable {
            model: T::MODEL_NAME.to_string(),
            field: self.sort_by.field.clone(),
            detail: format!("{} vs {}", left.type_name(), right.type_name()),
        }
    }
}

type SortKey = SmallVec<[FieldValue; 4]>;

/// Composite comparator chaining one [`ModelComparator`] per sort spec entry.
pub struct ModelSorter<T: Model> {
    comparators: Vec<ModelComparator<T>>,
}

impl<T: Model> ModelSorter<T> {
    pub fn new(sort_by: &[QuerySortBy]) -> DataStoreResult<Self> {
        let comparators = sort_by
            .iter()
            .cloned()
            .map(ModelComparator::new)
            .collect::<DataStoreResult<Vec<_>>>()?;
        Ok(Self { comparators })
    }

    pub fn is_empty(&self) -> bool { self.comparators.is_empty() }

    /// Compare two models by the full specification, first entry first.
    pub fn compare(&self, left: &T, right: &T) -> DataStoreResult<Ordering> {
        for c in &self.comparators {
            let o = c.compare(left, right)?;
            if o != Ordering::Equal {
                return Ok(o);
            }
        }
        Ok(Ordering::Equal)
    }

    /// Stable in-place sort. Items equal under every entry keep their input order.
    ///
    /// Keys are read once per item. On error `items` is left untouched.
    pub fn sort(&self, items: &mut Vec<T>) -> DataStoreResult<()> {
        if self.comparators.is_empty() || items.len() < 2 {
            return Ok(());
        }
        let keys: Vec<SortKey> = items
            .iter()
            .map(|item| self.comparators.iter().map(|c| c.key(item)).collect())
            .collect();
        self.check_comparable(&keys)?;

        let mut order: Vec<usize> = (0..items.len()).collect();
        // slice::sort_by is stable
        order.sort_by(|&a, &b| self.compare_sort_keys(&keys[a], &keys[b]));

        let mut slots: Vec<Option<T>> = items.drain(..).map(Some).collect();
        items.extend(order.into_iter().filter_map(|i| slots[i].take()));
        Ok(())
    }

    /// Every non-null value in a column must share one class.
    fn check_comparable(&self, keys: &[SortKey]) -> DataStoreResult<()> {
        for (col, c) in self.comparators.iter().enumerate() {
            let mut first: Option<&FieldValue> = None;
            for k in keys {
                let v = &k[col];
                if v.is_null() {
                    continue;
                }
                match first {
                    None => first = Some(v),
                    Some(f) => { c.compare_keys(f, v)?; }
                }
            }
        }
        Ok(())
    }

    fn compare_sort_keys(&self, a: &SortKey, b: &SortKey) -> Ordering {
        for (i, c) in self.comparators.iter().enumerate() {
            let o = c.compare_keys(&a[i], &b[i]).unwrap_or(Ordering::Equal);
            if o != Ordering::Equal {
                return o;
            }
        }
        Ordering::Equal
    }
}
