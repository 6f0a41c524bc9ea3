use crate::controller::{FieldKey, FormController, FormResult};
use crate::store::{FieldEntry, SubscriptionId};
use crate::validation::{FieldRegistration, Validation};

/// Per-field surface handed to a view binding: fine-grained read, write,
/// blur and subscription for exactly one field.
pub struct FieldHandle<V>
where
    V: Clone + PartialEq + Send + Sync + 'static,
{
    controller: FormController<V>,
    key: FieldKey,
}

impl<V> Clone for FieldHandle<V>
where
    V: Clone + PartialEq + Send + Sync + 'static,
{
    fn clone(&self) -> Self {
        Self {
            controller: self.controller.clone(),
            key: self.key,
        }
    }
}

impl<V> FormController<V>
where
    V: Clone + PartialEq + Send + Sync + 'static,
{
    /// Read-only handle for one field. Unknown names warn and yield a handle
    /// over an empty slice rather than failing.
    pub fn field(&self, key: FieldKey) -> FormResult<FieldHandle<V>> {
        if !self.store.contains(key)? {
            tracing::warn!(field = %key, "requested a field missing from the initial values");
        }
        Ok(FieldHandle {
            controller: self.clone(),
            key,
        })
    }

    /// Binds one field: stores (or overwrites) its validation callbacks and
    /// returns its handle. The latest registration always wins.
    pub fn bind(
        &self,
        key: FieldKey,
        registration: FieldRegistration<V>,
    ) -> FormResult<FieldHandle<V>> {
        self.register(key, registration)?;
        self.field(key)
    }
}

impl<V> FieldHandle<V>
where
    V: Clone + PartialEq + Send + Sync + 'static,
{
    pub fn key(&self) -> FieldKey {
        self.key
    }

    pub fn entry(&self) -> FormResult<Option<FieldEntry<V>>> {
        Ok(self
            .controller
            .store
            .read(self.key)?
            .map(|entry| (*entry).clone()))
    }

    pub fn value(&self) -> FormResult<Option<V>> {
        Ok(self.entry()?.map(|entry| entry.value))
    }

    pub fn validation(&self) -> FormResult<Option<Validation>> {
        Ok(self.entry()?.and_then(|entry| entry.validation))
    }

    /// Writes the field's value and validates it according to the
    /// validate-on-change policy.
    pub async fn set_value(&self, value: V) -> FormResult<()> {
        self.controller.set_field_value(self.key, value, None).await
    }

    pub async fn on_blur(&self) -> FormResult<()> {
        self.controller.set_blur(self.key).await
    }

    pub fn subscribe(
        &self,
        subscriber: impl Fn(&FieldEntry<V>) + Send + Sync + 'static,
    ) -> FormResult<SubscriptionId> {
        self.controller.subscribe_field(self.key, subscriber)
    }
}
