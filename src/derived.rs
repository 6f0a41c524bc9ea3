use std::collections::BTreeMap;
use std::sync::atomic::Ordering;
use std::sync::{Arc, Mutex};

use crate::controller::{FieldKey, FormController, FormError, FormResult, read_lock};
use crate::store::FormState;
use crate::validation::Validation;

/// Single-slot cache keyed by state identity. Projections recompute only when
/// the key (a store/baseline version pair or a bare store version) moves.
pub(crate) struct Memo<K, T> {
    slot: Arc<Mutex<Option<(K, T)>>>,
}

impl<K, T> Clone for Memo<K, T> {
    fn clone(&self) -> Self {
        Self {
            slot: self.slot.clone(),
        }
    }
}

impl<K, T> Memo<K, T>
where
    K: PartialEq,
    T: Clone,
{
    pub(crate) fn new() -> Self {
        Self {
            slot: Arc::new(Mutex::new(None)),
        }
    }

    pub(crate) fn get_or_compute(&self, key: K, compute: impl FnOnce() -> T) -> FormResult<T> {
        let mut slot = self
            .slot
            .lock()
            .map_err(|_| FormError::StatePoisoned("reading a derived view cache"))?;
        if let Some((cached_key, cached)) = slot.as_ref() {
            if *cached_key == key {
                return Ok(cached.clone());
            }
        }
        let value = compute();
        *slot = Some((key, value.clone()));
        Ok(value)
    }
}

/// Field name to value mapping over the fixed field set.
pub fn values<V>(state: &FormState<V>) -> BTreeMap<FieldKey, V>
where
    V: Clone + PartialEq,
{
    state
        .fields()
        .map(|(key, entry)| (key, entry.value.clone()))
        .collect()
}

/// Field name to validation mapping, omitting fields never validated.
pub fn validation_map<V>(state: &FormState<V>) -> BTreeMap<FieldKey, Validation>
where
    V: Clone + PartialEq,
{
    state
        .fields()
        .filter_map(|(key, entry)| entry.validation.clone().map(|validation| (key, validation)))
        .collect()
}

/// Deep inequality against the current initial-values baseline.
pub fn is_dirty<V>(initial_values: &BTreeMap<FieldKey, V>, values: &BTreeMap<FieldKey, V>) -> bool
where
    V: PartialEq,
{
    initial_values != values
}

/// Default aggregate validity: no `Flag(false)` leaf anywhere in any field's
/// validation tree.
pub fn aggregate_is_valid(validation: &BTreeMap<FieldKey, Validation>) -> bool {
    validation.values().all(Validation::is_valid)
}

impl<V> FormController<V>
where
    V: Clone + PartialEq + Send + Sync + 'static,
{
    /// Coarse read: the canonical state snapshot.
    pub fn state(&self) -> FormResult<FormState<V>> {
        self.store.read_all()
    }

    pub fn values(&self) -> FormResult<BTreeMap<FieldKey, V>> {
        let (state, version) = self.store.read_all_versioned()?;
        self.values_memo.get_or_compute(version, || values(&state))
    }

    pub fn validation(&self) -> FormResult<BTreeMap<FieldKey, Validation>> {
        let (state, version) = self.store.read_all_versioned()?;
        self.validation_memo
            .get_or_compute(version, || validation_map(&state))
    }

    pub fn initial_values(&self) -> FormResult<BTreeMap<FieldKey, V>> {
        Ok(read_lock(&self.initial, "reading the initial values")?.clone())
    }

    pub fn is_dirty(&self) -> FormResult<bool> {
        let version = self.store.version()?;
        let baseline_version = self.baseline_version.load(Ordering::SeqCst);
        let current = self.values()?;
        let initial = self.initial_values()?;
        self.dirty_memo
            .get_or_compute((version, baseline_version), || is_dirty(&initial, &current))
    }

    pub fn is_valid(&self) -> FormResult<bool> {
        let version = self.store.version()?;
        let config_version = self.config_version.load(Ordering::SeqCst);
        let validation = self.validation()?;
        let calculate = read_lock(&self.config, "reading the aggregate validity policy")?
            .calculate_is_valid
            .clone();
        self.valid_memo
            .get_or_compute((version, config_version), || match calculate {
                Some(calculate) => calculate(&validation),
                None => aggregate_is_valid(&validation),
            })
    }

    pub fn is_submitting(&self) -> FormResult<bool> {
        Ok(self.store.read_all()?.is_submitting)
    }

    pub fn submit_count(&self) -> FormResult<u32> {
        Ok(self.store.read_all()?.submit_count)
    }
}
