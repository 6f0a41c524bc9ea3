use std::collections::{BTreeMap, BTreeSet};
use std::fmt::{Display, Formatter};
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};

use crate::derived::{self, Memo};
use crate::store::{FieldEntry, FieldStore, FormState, SubscriptionId};
use crate::validation::{FieldRegistry, Validation, ValidationTicket, ValidatorError};

#[derive(Clone, Copy, Debug, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct FieldKey(&'static str);

impl FieldKey {
    pub const fn new(value: &'static str) -> Self {
        Self(value)
    }

    pub const fn as_str(self) -> &'static str {
        self.0
    }
}

impl Display for FieldKey {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.0)
    }
}

#[derive(Debug, Clone, Eq, PartialEq)]
pub enum FormError {
    StatePoisoned(&'static str),
}

impl Display for FormError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            FormError::StatePoisoned(context) => {
                write!(f, "form state lock poisoned while {context}")
            }
        }
    }
}

impl std::error::Error for FormError {}

pub type FormResult<T> = Result<T, FormError>;

pub(crate) fn read_lock<'a, T>(
    lock: &'a RwLock<T>,
    context: &'static str,
) -> FormResult<RwLockReadGuard<'a, T>> {
    lock.read().map_err(|_| FormError::StatePoisoned(context))
}

pub(crate) fn write_lock<'a, T>(
    lock: &'a RwLock<T>,
    context: &'static str,
) -> FormResult<RwLockWriteGuard<'a, T>> {
    lock.write().map_err(|_| FormError::StatePoisoned(context))
}

/// Host-side submit/reset event. Both hooks default to no-ops so event types
/// without a suppressible default action can implement this trait empty.
pub trait FormEvent {
    fn prevent_default(&mut self) {}
    fn stop_propagation(&mut self) {}
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct FormOptions {
    pub validate_on_change: bool,
    pub validate_on_blur: bool,
    pub validate_on_mount: bool,
}

impl Default for FormOptions {
    fn default() -> Self {
        Self {
            validate_on_change: true,
            validate_on_blur: true,
            validate_on_mount: false,
        }
    }
}

pub type SubmitFuture = Pin<Box<dyn Future<Output = Result<(), ValidatorError>> + Send + 'static>>;
pub(crate) type SubmitFn<V> = Arc<dyn Fn(BTreeMap<FieldKey, V>) -> SubmitFuture + Send + Sync>;
pub(crate) type CalculateIsValidFn =
    Arc<dyn Fn(&BTreeMap<FieldKey, Validation>) -> bool + Send + Sync>;

/// Latest-wins configuration cell. Policy flags and the submit callback are
/// read from here at the point of use, so asynchronous continuations observe
/// the configuration current at resumption, not an at-call-time snapshot.
#[derive(Clone)]
pub struct FormConfig<V> {
    pub(crate) on_submit: Option<SubmitFn<V>>,
    pub(crate) options: FormOptions,
    pub(crate) calculate_is_valid: Option<CalculateIsValidFn>,
}

impl<V> FormConfig<V> {
    pub fn new() -> Self {
        Self {
            on_submit: None,
            options: FormOptions::default(),
            calculate_is_valid: None,
        }
    }

    pub fn options(mut self, options: FormOptions) -> Self {
        self.options = options;
        self
    }

    pub fn on_submit<F, Fut>(mut self, callback: F) -> Self
    where
        F: Fn(BTreeMap<FieldKey, V>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<(), ValidatorError>> + Send + 'static,
    {
        self.on_submit = Some(Arc::new(move |values| Box::pin(callback(values))));
        self
    }

    pub fn calculate_is_valid<F>(mut self, calculate: F) -> Self
    where
        F: Fn(&BTreeMap<FieldKey, Validation>) -> bool + Send + Sync + 'static,
    {
        self.calculate_is_valid = Some(Arc::new(calculate));
        self
    }
}

impl<V> Default for FormConfig<V> {
    fn default() -> Self {
        Self::new()
    }
}

/// Replacement state for [`FormController::reset_form`]. Fields absent from
/// `values` fall back to the initial-values baseline; fields absent from
/// `validation` are cleared.
pub struct ResetState<V> {
    pub values: BTreeMap<FieldKey, V>,
    pub validation: BTreeMap<FieldKey, Validation>,
    pub is_submitting: Option<bool>,
    pub submit_count: Option<u32>,
}

impl<V> Default for ResetState<V> {
    fn default() -> Self {
        Self {
            values: BTreeMap::new(),
            validation: BTreeMap::new(),
            is_submitting: None,
            submit_count: None,
        }
    }
}

#[derive(Clone)]
pub struct FormController<V>
where
    V: Clone + PartialEq + Send + Sync + 'static,
{
    pub(crate) store: FieldStore<V>,
    pub(crate) registry: FieldRegistry<V>,
    pub(crate) runs: Arc<RwLock<BTreeMap<FieldKey, ValidationTicket>>>,
    pub(crate) config: Arc<RwLock<FormConfig<V>>>,
    pub(crate) config_version: Arc<AtomicU64>,
    pub(crate) initial: Arc<RwLock<BTreeMap<FieldKey, V>>>,
    pub(crate) baseline_version: Arc<AtomicU64>,
    pub(crate) values_memo: Memo<u64, BTreeMap<FieldKey, V>>,
    pub(crate) validation_memo: Memo<u64, BTreeMap<FieldKey, Validation>>,
    pub(crate) dirty_memo: Memo<(u64, u64), bool>,
    pub(crate) valid_memo: Memo<(u64, u64), bool>,
}

impl<V> FormController<V>
where
    V: Clone + PartialEq + Send + Sync + 'static,
{
    /// The keys of `initial_values` fix the field set for the lifetime of the
    /// controller; no field is added or removed later.
    pub fn new(initial_values: BTreeMap<FieldKey, V>) -> Self {
        let known = initial_values.keys().copied().collect::<BTreeSet<FieldKey>>();
        Self {
            store: FieldStore::new(&initial_values),
            registry: FieldRegistry::new(known),
            runs: Arc::new(RwLock::new(BTreeMap::new())),
            config: Arc::new(RwLock::new(FormConfig::new())),
            config_version: Arc::new(AtomicU64::new(0)),
            initial: Arc::new(RwLock::new(initial_values)),
            baseline_version: Arc::new(AtomicU64::new(0)),
            values_memo: Memo::new(),
            validation_memo: Memo::new(),
            dirty_memo: Memo::new(),
            valid_memo: Memo::new(),
        }
    }

    pub fn configure(&self, config: FormConfig<V>) -> FormResult<()> {
        *write_lock(&self.config, "replacing form configuration")? = config;
        self.config_version.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    pub fn set_options(&self, options: FormOptions) -> FormResult<()> {
        write_lock(&self.config, "updating form options")?.options = options;
        self.config_version.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    pub fn options(&self) -> FormResult<FormOptions> {
        Ok(read_lock(&self.config, "reading form options")?.options)
    }

    /// Bootstrap entry point: runs the all-fields validation pass when the
    /// `validate_on_mount` option is enabled.
    pub async fn mount(&self) -> FormResult<()> {
        if self.options()?.validate_on_mount {
            let _ = self.validate_all_fields().await?;
        }
        Ok(())
    }

    pub async fn set_field_value(
        &self,
        key: FieldKey,
        value: V,
        should_validate: Option<bool>,
    ) -> FormResult<()> {
        if !self.write_field_value(key, value)? {
            return Ok(());
        }
        if self.should_validate_on_change(should_validate)? {
            let _ = self.validate_field(key, None).await?;
        }
        Ok(())
    }

    /// Updater form of [`set_field_value`](Self::set_field_value); the closure
    /// receives the currently stored value.
    pub async fn update_field_value(
        &self,
        key: FieldKey,
        update: impl FnOnce(&V) -> V,
        should_validate: Option<bool>,
    ) -> FormResult<()> {
        let Some(entry) = self.store.read(key)? else {
            tracing::warn!(field = %key, "ignoring update for a field missing from the initial values");
            return Ok(());
        };
        self.set_field_value(key, update(&entry.value), should_validate)
            .await
    }

    /// Writes several field values in one mutation, then runs the all-fields
    /// validation batch according to the validate-on-change policy.
    pub async fn set_values(
        &self,
        values: BTreeMap<FieldKey, V>,
        should_validate: Option<bool>,
    ) -> FormResult<()> {
        let mut known = Vec::with_capacity(values.len());
        for (key, value) in values {
            if self.store.contains(key)? {
                known.push((key, value));
            } else {
                tracing::warn!(field = %key, "ignoring value for a field missing from the initial values");
            }
        }
        if known.is_empty() {
            return Ok(());
        }
        self.store.mutate(|state| {
            let mut next = state.clone();
            for (key, value) in &known {
                next = next.with_field_value(*key, value.clone());
            }
            next
        })?;
        if self.should_validate_on_change(should_validate)? {
            let _ = self.validate_all_fields().await?;
        }
        Ok(())
    }

    pub async fn set_blur(&self, key: FieldKey) -> FormResult<()> {
        if self.options()?.validate_on_blur {
            let _ = self.validate_field(key, None).await?;
        }
        Ok(())
    }

    /// The only public write path for a field's validation slot. Writes that
    /// are deep-equal to the stored validation are rejected as no-ops.
    pub fn set_field_validation(
        &self,
        key: FieldKey,
        validation: Option<Validation>,
    ) -> FormResult<()> {
        if !self.store.contains(key)? {
            tracing::warn!(field = %key, "ignoring validation for a field missing from the initial values");
            return Ok(());
        }
        self.store
            .mutate(|state| state.with_field_validation(key, validation))
    }

    /// Marks the form submitting, validates every field, invokes the submit
    /// callback when the form is valid and resets the submitting flag on every
    /// exit path. Callback failures are logged, never rethrown.
    pub async fn submit_form(&self) -> FormResult<()> {
        self.store.mutate(|state| {
            state
                .with_submitting(true)
                .with_submit_count(state.submit_count.saturating_add(1))
        })?;
        let sequence = self.run_submit_sequence().await;
        let release = self.store.mutate(|state| state.with_submitting(false));
        sequence.and(release)
    }

    async fn run_submit_sequence(&self) -> FormResult<()> {
        let Some(validation) = self.validate_all_fields().await? else {
            // a validator failed; the form cannot be proven valid
            return Ok(());
        };
        let (calculate, on_submit) = {
            let config = read_lock(&self.config, "reading submit configuration")?;
            (config.calculate_is_valid.clone(), config.on_submit.clone())
        };
        let is_valid = match calculate {
            Some(calculate) => calculate(&validation),
            None => derived::aggregate_is_valid(&validation),
        };
        if !is_valid {
            return Ok(());
        }
        let Some(on_submit) = on_submit else {
            return Ok(());
        };
        let values = derived::values(&self.store.read_all()?);
        if let Err(error) = on_submit(values).await {
            tracing::error!(error = %error, "error caught while calling the on_submit callback");
        }
        Ok(())
    }

    /// Full replace: every field's value resolves from `new_state.values` or
    /// the baseline, every validation slot from `new_state.validation` or
    /// empty, and the baseline itself is re-set to the resolved values.
    pub fn reset_form(&self, new_state: Option<ResetState<V>>) -> FormResult<()> {
        let new_state = new_state.unwrap_or_default();
        let resolved = {
            let mut baseline = write_lock(&self.initial, "re-baselining initial values")?;
            let resolved = baseline
                .iter()
                .map(|(key, initial_value)| {
                    let value = new_state
                        .values
                        .get(key)
                        .cloned()
                        .unwrap_or_else(|| initial_value.clone());
                    let validation = new_state.validation.get(key).cloned();
                    (*key, (value, validation))
                })
                .collect::<BTreeMap<_, _>>();
            *baseline = resolved
                .iter()
                .map(|(key, (value, _))| (*key, value.clone()))
                .collect();
            self.baseline_version.fetch_add(1, Ordering::SeqCst);
            resolved
        };
        let is_submitting = new_state.is_submitting.unwrap_or(false);
        let submit_count = new_state.submit_count.unwrap_or(0);
        self.store
            .mutate(|_| FormState::rebuilt(&resolved, is_submitting, submit_count))
    }

    pub async fn handle_submit(&self, event: Option<&mut dyn FormEvent>) -> FormResult<()> {
        if let Some(event) = event {
            event.prevent_default();
            event.stop_propagation();
        }
        self.submit_form().await
    }

    pub async fn handle_reset(&self, event: Option<&mut dyn FormEvent>) -> FormResult<()> {
        if let Some(event) = event {
            event.prevent_default();
            event.stop_propagation();
        }
        self.reset_form(None)
    }

    /// Fine-grained read access to the slice store: per-field reads,
    /// snapshots and subscriptions. All writes stay behind the controller.
    pub fn store(&self) -> &FieldStore<V> {
        &self.store
    }

    pub fn subscribe_field(
        &self,
        key: FieldKey,
        subscriber: impl Fn(&FieldEntry<V>) + Send + Sync + 'static,
    ) -> FormResult<SubscriptionId> {
        self.store.subscribe_field(key, subscriber)
    }

    pub fn subscribe_form(
        &self,
        subscriber: impl Fn(bool, u32) + Send + Sync + 'static,
    ) -> FormResult<SubscriptionId> {
        self.store.subscribe_form(subscriber)
    }

    pub fn unsubscribe(&self, id: SubscriptionId) -> FormResult<bool> {
        self.store.unsubscribe(id)
    }

    fn write_field_value(&self, key: FieldKey, value: V) -> FormResult<bool> {
        if !self.store.contains(key)? {
            tracing::warn!(field = %key, "ignoring value for a field missing from the initial values");
            return Ok(false);
        }
        self.store
            .mutate(move |state| state.with_field_value(key, value))?;
        Ok(true)
    }

    fn should_validate_on_change(&self, should_validate: Option<bool>) -> FormResult<bool> {
        match should_validate {
            Some(explicit) => Ok(explicit),
            None => Ok(self.options()?.validate_on_change),
        }
    }
}
