use std::collections::{BTreeMap, BTreeSet};
use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, RwLock};
use std::time::Duration;

use futures::future::join_all;
use futures_timer::Delay;

use crate::controller::{FieldKey, FormController, FormResult, read_lock, write_lock};

#[derive(Clone, Copy, Debug, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct ValidationTicket(pub u64);

/// Validation result tree. A `Flag(false)` leaf anywhere marks the result
/// invalid; message leaves and everything else count as valid, so a result
/// can carry advisory text without failing the form.
#[derive(Clone, Debug, PartialEq)]
pub enum Validation {
    Flag(bool),
    Message(String),
    Group(BTreeMap<String, Validation>),
}

impl Validation {
    pub fn group<K, I>(entries: I) -> Self
    where
        K: Into<String>,
        I: IntoIterator<Item = (K, Validation)>,
    {
        Self::Group(
            entries
                .into_iter()
                .map(|(key, validation)| (key.into(), validation))
                .collect(),
        )
    }

    pub fn is_valid(&self) -> bool {
        match self {
            Validation::Flag(flag) => *flag,
            Validation::Message(_) => true,
            Validation::Group(entries) => entries.values().all(Validation::is_valid),
        }
    }
}

impl From<bool> for Validation {
    fn from(flag: bool) -> Self {
        Validation::Flag(flag)
    }
}

impl From<&str> for Validation {
    fn from(message: &str) -> Self {
        Validation::Message(message.to_owned())
    }
}

impl From<String> for Validation {
    fn from(message: String) -> Self {
        Validation::Message(message)
    }
}

pub type ValidatorError = Box<dyn std::error::Error + Send + Sync + 'static>;
pub type ValidationFuture =
    Pin<Box<dyn Future<Output = Result<Validation, ValidatorError>> + Send + 'static>>;
pub(crate) type ValidateFn<V> = Arc<dyn Fn(V) -> ValidationFuture + Send + Sync>;
pub(crate) type ValidationHookFn<V> = Arc<dyn Fn(&V) -> Result<(), ValidatorError> + Send + Sync>;

/// Per-field validation callbacks, registered as one unit. Re-registering a
/// field overwrites the previous registration wholesale; validation runs
/// already in flight keep the callbacks they captured.
pub struct FieldRegistration<V> {
    pub(crate) validate: Option<ValidateFn<V>>,
    pub(crate) before_validate: Option<ValidationHookFn<V>>,
    pub(crate) after_validate: Option<ValidationHookFn<V>>,
    pub(crate) debounce: Duration,
}

impl<V> Clone for FieldRegistration<V> {
    fn clone(&self) -> Self {
        Self {
            validate: self.validate.clone(),
            before_validate: self.before_validate.clone(),
            after_validate: self.after_validate.clone(),
            debounce: self.debounce,
        }
    }
}

impl<V> FieldRegistration<V>
where
    V: Clone + PartialEq + Send + Sync + 'static,
{
    pub fn new() -> Self {
        Self {
            validate: None,
            before_validate: None,
            after_validate: None,
            debounce: Duration::ZERO,
        }
    }

    pub fn validate<F>(mut self, validator: F) -> Self
    where
        F: Fn(&V) -> Validation + Send + Sync + 'static,
    {
        self.validate = Some(Arc::new(move |value: V| {
            let validation = validator(&value);
            Box::pin(std::future::ready(Ok(validation))) as ValidationFuture
        }));
        self
    }

    pub fn validate_async<F, Fut>(mut self, validator: F) -> Self
    where
        F: Fn(V) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Validation, ValidatorError>> + Send + 'static,
    {
        self.validate = Some(Arc::new(move |value: V| {
            Box::pin(validator(value)) as ValidationFuture
        }));
        self
    }

    pub fn before_validate<F>(mut self, hook: F) -> Self
    where
        F: Fn(&V) -> Result<(), ValidatorError> + Send + Sync + 'static,
    {
        self.before_validate = Some(Arc::new(hook));
        self
    }

    pub fn after_validate<F>(mut self, hook: F) -> Self
    where
        F: Fn(&V) -> Result<(), ValidatorError> + Send + Sync + 'static,
    {
        self.after_validate = Some(Arc::new(hook));
        self
    }

    /// Delays the validator after a run is issued; a run superseded during
    /// the window never invokes the validator at all.
    pub fn debounce(mut self, window: Duration) -> Self {
        self.debounce = window;
        self
    }
}

impl<V> Default for FieldRegistration<V>
where
    V: Clone + PartialEq + Send + Sync + 'static,
{
    fn default() -> Self {
        Self::new()
    }
}

/// Side table of field registrations, held outside the store: re-registering
/// callbacks never notifies field subscribers.
pub(crate) struct FieldRegistry<V> {
    known: Arc<BTreeSet<FieldKey>>,
    entries: Arc<RwLock<BTreeMap<FieldKey, FieldRegistration<V>>>>,
}

impl<V> Clone for FieldRegistry<V> {
    fn clone(&self) -> Self {
        Self {
            known: self.known.clone(),
            entries: self.entries.clone(),
        }
    }
}

impl<V> FieldRegistry<V>
where
    V: Clone + PartialEq + Send + Sync + 'static,
{
    pub(crate) fn new(known: BTreeSet<FieldKey>) -> Self {
        Self {
            known: Arc::new(known),
            entries: Arc::new(RwLock::new(BTreeMap::new())),
        }
    }

    pub(crate) fn register(
        &self,
        key: FieldKey,
        registration: FieldRegistration<V>,
    ) -> FormResult<()> {
        if !self.known.contains(&key) {
            tracing::warn!(field = %key, "registering callbacks for a field missing from the initial values");
        }
        write_lock(&self.entries, "registering field callbacks")?.insert(key, registration);
        Ok(())
    }

    pub(crate) fn get(&self, key: FieldKey) -> FormResult<Option<FieldRegistration<V>>> {
        if !self.known.contains(&key) {
            tracing::warn!(field = %key, "looking up callbacks for a field missing from the initial values");
        }
        Ok(read_lock(&self.entries, "reading field callbacks")?
            .get(&key)
            .cloned())
    }

    /// Snapshot of every field that currently has a validator.
    pub(crate) fn validators(&self) -> FormResult<Vec<(FieldKey, ValidateFn<V>)>> {
        Ok(read_lock(&self.entries, "reading registered validators")?
            .iter()
            .filter_map(|(key, registration)| {
                registration
                    .validate
                    .clone()
                    .map(|validate| (*key, validate))
            })
            .collect())
    }
}

/// Runs the registered callbacks for one field in order: `before_validate`,
/// `validate`, then `after_validate` only when `validate` succeeded. Any
/// failure is logged and yields `None`, and a `None` run writes no state.
async fn run_field_validate_fn<V>(
    key: FieldKey,
    registration: &FieldRegistration<V>,
    value: &V,
) -> Option<Validation>
where
    V: Clone + PartialEq + Send + Sync + 'static,
{
    if let Some(before_validate) = &registration.before_validate {
        if let Err(error) = before_validate(value) {
            tracing::warn!(field = %key, error = %error, "error caught while calling the before_validate hook");
            return None;
        }
    }
    let validate = registration.validate.as_ref()?;
    match validate(value.clone()).await {
        Ok(validation) => {
            if let Some(after_validate) = &registration.after_validate {
                if let Err(error) = after_validate(value) {
                    tracing::warn!(field = %key, error = %error, "error caught while calling the after_validate hook");
                    return None;
                }
            }
            Some(validation)
        }
        Err(error) => {
            tracing::warn!(field = %key, error = %error, "error caught while calling the validate function");
            None
        }
    }
}

impl<V> FormController<V>
where
    V: Clone + PartialEq + Send + Sync + 'static,
{
    pub fn register(&self, key: FieldKey, registration: FieldRegistration<V>) -> FormResult<()> {
        self.registry.register(key, registration)
    }

    /// Validates one field against `value`, or its stored value when `value`
    /// is `None`. Fields without a validator resolve to `Ok(None)` with no
    /// state change. A run superseded by a newer one for the same field
    /// discards its result silently; only the most recently issued run ever
    /// writes the field's validation slot.
    pub async fn validate_field(
        &self,
        key: FieldKey,
        value: Option<V>,
    ) -> FormResult<Option<Validation>> {
        let Some(registration) = self.registry.get(key)? else {
            return Ok(None);
        };
        if registration.validate.is_none() {
            return Ok(None);
        }
        let value = match value {
            Some(value) => value,
            None => match self.store.read(key)? {
                Some(entry) => entry.value.clone(),
                None => {
                    tracing::warn!(field = %key, "validating a field missing from the initial values");
                    return Ok(None);
                }
            },
        };
        let ticket = self.mint_ticket(key)?;
        if !registration.debounce.is_zero() {
            Delay::new(registration.debounce).await;
            if !self.is_latest_ticket(key, ticket)? {
                return Ok(None);
            }
        }
        let Some(validation) = run_field_validate_fn(key, &registration, &value).await else {
            return Ok(None);
        };
        if !self.is_latest_ticket(key, ticket)? {
            return Ok(None);
        }
        self.set_field_validation(key, Some(validation.clone()))?;
        Ok(Some(validation))
    }

    /// Validates every field with a registered validator as one batch: the
    /// validators run concurrently against the current values, and the
    /// results land in the store in a single mutation. Runs issued here are
    /// not ticketed; a batch is one transaction, not per-field runs. When any
    /// validator fails the whole merge is skipped, leaving every field's
    /// prior validation in place, and `Ok(None)` is returned.
    pub async fn validate_all_fields(&self) -> FormResult<Option<BTreeMap<FieldKey, Validation>>> {
        let validators = self.registry.validators()?;
        let state = self.store.read_all()?;
        let mut keys = Vec::with_capacity(validators.len());
        let mut runs = Vec::with_capacity(validators.len());
        for (key, validate) in validators {
            let Some(entry) = state.field(key) else {
                tracing::warn!(field = %key, "skipping validator for a field missing from the initial values");
                continue;
            };
            keys.push(key);
            runs.push(validate(entry.value.clone()));
        }
        let results = join_all(runs).await;
        let mut merged = BTreeMap::new();
        let mut failed = false;
        for (key, result) in keys.into_iter().zip(results) {
            match result {
                Ok(validation) => {
                    merged.insert(key, validation);
                }
                Err(error) => {
                    tracing::warn!(field = %key, error = %error, "error caught while validating all fields");
                    failed = true;
                }
            }
        }
        if failed {
            return Ok(None);
        }
        self.store.mutate(|current| {
            let mut next = current.clone();
            for (key, validation) in &merged {
                next = next.with_field_validation(*key, Some(validation.clone()));
            }
            next
        })?;
        Ok(Some(merged))
    }

    fn mint_ticket(&self, key: FieldKey) -> FormResult<ValidationTicket> {
        let mut runs = write_lock(&self.runs, "minting a validation ticket")?;
        let next = ValidationTicket(
            runs.get(&key)
                .copied()
                .unwrap_or(ValidationTicket(0))
                .0
                + 1,
        );
        runs.insert(key, next);
        Ok(next)
    }

    fn is_latest_ticket(&self, key: FieldKey, ticket: ValidationTicket) -> FormResult<bool> {
        Ok(read_lock(&self.runs, "checking the latest validation ticket")?
            .get(&key)
            .copied()
            == Some(ticket))
    }
}
