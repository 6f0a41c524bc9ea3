use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock};

use crate::controller::{FieldKey, FormResult, read_lock, write_lock};
use crate::validation::Validation;

static SUBSCRIPTION_ID_ALLOCATOR: AtomicU64 = AtomicU64::new(1);

#[derive(Clone, Copy, Debug, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct SubscriptionId(pub u64);

impl SubscriptionId {
    fn next() -> Self {
        Self(SUBSCRIPTION_ID_ALLOCATOR.fetch_add(1, Ordering::SeqCst))
    }
}

/// One cell of form state. `validation` stays empty until a validation run
/// completes for the field.
#[derive(Clone, Debug, PartialEq)]
pub struct FieldEntry<V> {
    pub value: V,
    pub validation: Option<Validation>,
}

/// Canonical form state: one [`FieldEntry`] per field plus the global submit
/// flags. Entries are held behind `Arc` so a mutation replaces exactly the
/// cells it touched; pointer identity is the change signal downstream.
#[derive(Clone, Debug)]
pub struct FormState<V> {
    fields: BTreeMap<FieldKey, Arc<FieldEntry<V>>>,
    pub is_submitting: bool,
    pub submit_count: u32,
}

impl<V> FormState<V>
where
    V: Clone + PartialEq,
{
    pub(crate) fn new(initial_values: &BTreeMap<FieldKey, V>) -> Self {
        let fields = initial_values
            .iter()
            .map(|(key, value)| {
                (
                    *key,
                    Arc::new(FieldEntry {
                        value: value.clone(),
                        validation: None,
                    }),
                )
            })
            .collect();
        Self {
            fields,
            is_submitting: false,
            submit_count: 0,
        }
    }

    pub(crate) fn rebuilt(
        resolved: &BTreeMap<FieldKey, (V, Option<Validation>)>,
        is_submitting: bool,
        submit_count: u32,
    ) -> Self {
        let fields = resolved
            .iter()
            .map(|(key, (value, validation))| {
                (
                    *key,
                    Arc::new(FieldEntry {
                        value: value.clone(),
                        validation: validation.clone(),
                    }),
                )
            })
            .collect();
        Self {
            fields,
            is_submitting,
            submit_count,
        }
    }

    pub fn field(&self, key: FieldKey) -> Option<&Arc<FieldEntry<V>>> {
        self.fields.get(&key)
    }

    pub fn fields(&self) -> impl Iterator<Item = (FieldKey, &Arc<FieldEntry<V>>)> {
        self.fields.iter().map(|(key, entry)| (*key, entry))
    }

    pub fn contains(&self, key: FieldKey) -> bool {
        self.fields.contains_key(&key)
    }

    pub fn len(&self) -> usize {
        self.fields.len()
    }

    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }

    /// Replaces the field's value cell. Unknown keys leave the state
    /// untouched; the write paths warn before getting here.
    pub fn with_field_value(&self, key: FieldKey, value: V) -> Self {
        let mut next = self.clone();
        if let Some(entry) = next.fields.get_mut(&key) {
            *entry = Arc::new(FieldEntry {
                value,
                validation: entry.validation.clone(),
            });
        }
        next
    }

    /// Replaces the field's validation slot. A write deep-equal to the stored
    /// validation keeps the existing cell, so no subscriber fires for it.
    pub fn with_field_validation(&self, key: FieldKey, validation: Option<Validation>) -> Self {
        let mut next = self.clone();
        if let Some(entry) = next.fields.get_mut(&key) {
            if entry.validation == validation {
                return next;
            }
            *entry = Arc::new(FieldEntry {
                value: entry.value.clone(),
                validation,
            });
        }
        next
    }

    pub fn with_submitting(&self, is_submitting: bool) -> Self {
        let mut next = self.clone();
        next.is_submitting = is_submitting;
        next
    }

    pub fn with_submit_count(&self, submit_count: u32) -> Self {
        let mut next = self.clone();
        next.submit_count = submit_count;
        next
    }
}

pub(crate) type FieldSubscriberFn<V> = Arc<dyn Fn(&FieldEntry<V>) + Send + Sync>;
pub(crate) type FormSubscriberFn = Arc<dyn Fn(bool, u32) + Send + Sync>;

struct SubscriberTable<V> {
    fields: BTreeMap<FieldKey, Vec<(SubscriptionId, FieldSubscriberFn<V>)>>,
    form: Vec<(SubscriptionId, FormSubscriberFn)>,
}

impl<V> SubscriberTable<V> {
    fn new() -> Self {
        Self {
            fields: BTreeMap::new(),
            form: Vec::new(),
        }
    }
}

struct StoreInner<V> {
    state: FormState<V>,
    version: u64,
}

/// Owner of the canonical [`FormState`]. All writes funnel through
/// [`mutate`](FieldStore::mutate); subscribers are notified per field, and
/// only for fields whose entry cell was actually replaced.
pub struct FieldStore<V>
where
    V: Clone + PartialEq,
{
    inner: Arc<RwLock<StoreInner<V>>>,
    subscribers: Arc<RwLock<SubscriberTable<V>>>,
}

impl<V> Clone for FieldStore<V>
where
    V: Clone + PartialEq,
{
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
            subscribers: self.subscribers.clone(),
        }
    }
}

impl<V> FieldStore<V>
where
    V: Clone + PartialEq,
{
    pub(crate) fn new(initial_values: &BTreeMap<FieldKey, V>) -> Self {
        Self {
            inner: Arc::new(RwLock::new(StoreInner {
                state: FormState::new(initial_values),
                version: 0,
            })),
            subscribers: Arc::new(RwLock::new(SubscriberTable::new())),
        }
    }

    pub fn read(&self, key: FieldKey) -> FormResult<Option<Arc<FieldEntry<V>>>> {
        Ok(read_lock(&self.inner, "reading a field entry")?
            .state
            .field(key)
            .cloned())
    }

    pub fn read_all(&self) -> FormResult<FormState<V>> {
        Ok(read_lock(&self.inner, "reading the form state")?
            .state
            .clone())
    }

    pub(crate) fn read_all_versioned(&self) -> FormResult<(FormState<V>, u64)> {
        let inner = read_lock(&self.inner, "reading the versioned form state")?;
        Ok((inner.state.clone(), inner.version))
    }

    /// Monotonic mutation counter; unchanged by rejected (no-op) mutations.
    pub fn version(&self) -> FormResult<u64> {
        Ok(read_lock(&self.inner, "reading the store version")?.version)
    }

    pub fn contains(&self, key: FieldKey) -> FormResult<bool> {
        Ok(read_lock(&self.inner, "checking a field key")?
            .state
            .contains(key))
    }

    /// The single write entry point. The updater sees the current state and
    /// returns the next one; the swap is atomic under the state lock. Fields
    /// whose entry cell is pointer-identical afterwards notify nobody, and a
    /// mutation that changed nothing at all is dropped without a version bump.
    pub(crate) fn mutate(
        &self,
        updater: impl FnOnce(&FormState<V>) -> FormState<V>,
    ) -> FormResult<()> {
        let (changed, flags) = {
            let mut inner = write_lock(&self.inner, "applying a store mutation")?;
            let next = updater(&inner.state);
            let mut changed = Vec::new();
            for (key, entry) in next.fields() {
                let unchanged = inner
                    .state
                    .field(key)
                    .is_some_and(|current| Arc::ptr_eq(current, entry));
                if !unchanged {
                    changed.push((key, entry.clone()));
                }
            }
            let flags_changed = next.is_submitting != inner.state.is_submitting
                || next.submit_count != inner.state.submit_count;
            if changed.is_empty() && !flags_changed {
                return Ok(());
            }
            let flags = flags_changed.then_some((next.is_submitting, next.submit_count));
            inner.state = next;
            inner.version += 1;
            (changed, flags)
        };
        self.notify(&changed, flags)
    }

    pub fn subscribe_field(
        &self,
        key: FieldKey,
        subscriber: impl Fn(&FieldEntry<V>) + Send + Sync + 'static,
    ) -> FormResult<SubscriptionId> {
        if !self.contains(key)? {
            tracing::warn!(field = %key, "subscribing to a field missing from the initial values");
        }
        let id = SubscriptionId::next();
        write_lock(&self.subscribers, "registering a field subscriber")?
            .fields
            .entry(key)
            .or_default()
            .push((id, Arc::new(subscriber)));
        Ok(id)
    }

    /// Fires when `is_submitting` or `submit_count` change.
    pub fn subscribe_form(
        &self,
        subscriber: impl Fn(bool, u32) + Send + Sync + 'static,
    ) -> FormResult<SubscriptionId> {
        let id = SubscriptionId::next();
        write_lock(&self.subscribers, "registering a form subscriber")?
            .form
            .push((id, Arc::new(subscriber)));
        Ok(id)
    }

    pub fn unsubscribe(&self, id: SubscriptionId) -> FormResult<bool> {
        let mut table = write_lock(&self.subscribers, "removing a subscriber")?;
        let mut removed = false;
        for subscribers in table.fields.values_mut() {
            let before = subscribers.len();
            subscribers.retain(|(existing, _)| *existing != id);
            removed |= subscribers.len() != before;
        }
        let before = table.form.len();
        table.form.retain(|(existing, _)| *existing != id);
        removed |= table.form.len() != before;
        Ok(removed)
    }

    /// Subscribers run outside both store locks, so a callback may read the
    /// store or manage subscriptions without deadlocking.
    fn notify(
        &self,
        changed: &[(FieldKey, Arc<FieldEntry<V>>)],
        flags: Option<(bool, u32)>,
    ) -> FormResult<()> {
        let (field_subscribers, form_subscribers) = {
            let table = read_lock(&self.subscribers, "reading subscribers for notification")?;
            let field_subscribers = changed
                .iter()
                .map(|(key, entry)| {
                    let subscribers = table
                        .fields
                        .get(key)
                        .map(|subscribers| {
                            subscribers
                                .iter()
                                .map(|(_, subscriber)| subscriber.clone())
                                .collect::<Vec<_>>()
                        })
                        .unwrap_or_default();
                    (entry.clone(), subscribers)
                })
                .collect::<Vec<_>>();
            let form_subscribers = flags.map(|flags| {
                (
                    flags,
                    table
                        .form
                        .iter()
                        .map(|(_, subscriber)| subscriber.clone())
                        .collect::<Vec<_>>(),
                )
            });
            (field_subscribers, form_subscribers)
        };
        for (entry, subscribers) in &field_subscribers {
            for subscriber in subscribers {
                subscriber(entry);
            }
        }
        if let Some(((is_submitting, submit_count), subscribers)) = form_subscribers {
            for subscriber in subscribers {
                subscriber(is_submitting, submit_count);
            }
        }
        Ok(())
    }
}
