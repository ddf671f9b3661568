/// A value slot with explicit presence tracking.
///
/// A slot that was never set and a slot that was invalidated look the same
/// to readers. The type does no locking of its own; it lives inside regions
/// that are already serialized.
#[derive(Debug, Clone, PartialEq)]
pub struct TimestampedValue<T> {
    value: Option<T>,
}

impl<T> TimestampedValue<T> {
    pub const fn new() -> Self {
        Self { value: None }
    }

    pub fn with_value(value: T) -> Self {
        Self { value: Some(value) }
    }

    /// Stores `value` and marks the slot valid.
    pub fn set(&mut self, value: T) {
        self.value = Some(value);
    }

    /// Returns the stored value.
    ///
    /// # Panics
    ///
    /// Panics if the slot is not valid. Callers check [`is_valid`](Self::is_valid) first.
    pub fn get(&self) -> &T {
        match &self.value {
            Some(value) => value,
            None => panic!("TimestampedValue::get called on an invalid slot"),
        }
    }

    pub fn invalidate(&mut self) {
        self.value = None;
    }

    pub fn is_valid(&self) -> bool {
        self.value.is_some()
    }

    pub fn as_option(&self) -> Option<&T> {
        self.value.as_ref()
    }
}

impl<T> Default for TimestampedValue<T> {
    fn default() -> Self {
        Self::new()
    }
}
