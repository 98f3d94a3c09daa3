//! Cached values and their hit/miss/expiration state
//!
//! A [`CachedValue`] is what a pool hands out on lookup and takes back on save.
//! It is a hit only after an explicit [`CachedValue::set`] and only until its
//! deadline passes. Backends that track deadlines themselves can attach a
//! [`DeadlineSender`] and receive a [`DeadlineEvent`] whenever an absolute
//! deadline is set.

use serde::{Deserialize, Deserializer, Serialize, de::DeserializeOwned};
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tokio::sync::mpsc;
use tracing::debug;

use crate::{CacheError, Result};

/// Characters a key must not contain.
pub const RESERVED_KEY_CHARS: &str = "{}()/\\@:";

/// Trait for types that can be cached
pub trait Cacheable: Serialize + DeserializeOwned + Clone + Send + Sync + 'static {}
impl<T> Cacheable for T where T: Serialize + DeserializeOwned + Clone + Send + Sync + 'static {}

/// Emitted when an absolute deadline is set on a value with an attached listener.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeadlineEvent {
    pub key: String,
    pub deadline: SystemTime,
}

/// Sending half of a deadline channel
pub type DeadlineSender = mpsc::UnboundedSender<DeadlineEvent>;

/// Returns true if `key` contains none of [`RESERVED_KEY_CHARS`].
pub fn is_valid_key(key: &str) -> bool {
    !key.contains(|c: char| RESERVED_KEY_CHARS.contains(c))
}

/// Fails with [`CacheError::InvalidKey`] if `key` contains a reserved character.
pub fn validate_key(key: &str) -> Result<()> {
    if is_valid_key(key) {
        Ok(())
    } else {
        Err(CacheError::InvalidKey(key.to_owned()))
    }
}

/// A present field is always `Some`, so a stored `null` stays a value.
fn present<'de, D, T>(deserializer: D) -> std::result::Result<Option<T>, D::Error>
where
    D: Deserializer<'de>,
    T: Deserialize<'de>,
{
    T::deserialize(deserializer).map(Some)
}

fn none<T>() -> Option<T> {
    None
}

/// A named cache entry: key, optional value, optional deadline and hit flag.
///
/// The serialized form carries the full state (listener excluded), so a value
/// written to a raw store and read back behaves identically.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CachedValue<V> {
    key: String,
    #[serde(
        default = "none",
        skip_serializing_if = "Option::is_none",
        deserialize_with = "present",
        bound(deserialize = "V: Deserialize<'de>")
    )]
    value: Option<V>,
    expires_at: Option<SystemTime>,
    hit: bool,
    #[serde(skip)]
    listener: Option<DeadlineSender>,
}

impl<V> CachedValue<V> {
    /// Create a miss for `key`: no value, no deadline.
    pub fn new(key: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            value: None,
            expires_at: None,
            hit: false,
            listener: None,
        }
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    /// The stored value if this is a hit, `None` otherwise.
    ///
    /// Reads the clock once, so the answer always agrees with the hit state at
    /// the moment of the call.
    pub fn get(&self) -> Option<&V> {
        if self.is_hit() {
            self.value.as_ref()
        } else {
            None
        }
    }

    /// Consuming variant of [`CachedValue::get`].
    pub fn into_value(self) -> Option<V> {
        if self.is_hit() { self.value } else { None }
    }

    /// True if the value was set and its deadline, if any, has not passed.
    pub fn is_hit(&self) -> bool {
        self.is_hit_at(SystemTime::now())
    }

    fn is_hit_at(&self, now: SystemTime) -> bool {
        if !self.hit {
            return false;
        }
        match self.expires_at {
            None => true,
            Some(deadline) => now < deadline,
        }
    }

    /// Store `value` and mark the entry as a hit.
    pub fn set(&mut self, value: V) -> &mut Self {
        self.hit = true;
        self.value = Some(value);
        self
    }

    /// Set or clear the absolute deadline.
    ///
    /// A `Some` deadline is reported to the attached listener, if any.
    pub fn expires_at(&mut self, deadline: Option<SystemTime>) -> &mut Self {
        self.expires_at = deadline;
        self.notify();
        self
    }

    /// Set the deadline relative to now; `None` means never expire.
    pub fn expires_after(&mut self, ttl: Option<Duration>) -> &mut Self {
        self.expires_at = ttl.and_then(|ttl| SystemTime::now().checked_add(ttl));
        self
    }

    /// Set the deadline to `secs` seconds from now. Negative values put the
    /// deadline in the past.
    pub fn expires_after_secs(&mut self, secs: i64) -> &mut Self {
        let now = SystemTime::now();
        let delta = Duration::from_secs(secs.unsigned_abs());
        self.expires_at = if secs >= 0 {
            // past the representable range: never expires
            now.checked_add(delta)
        } else {
            Some(now.checked_sub(delta).unwrap_or(UNIX_EPOCH))
        };
        self
    }

    /// The absolute deadline, if any.
    pub fn expiration(&self) -> Option<SystemTime> {
        self.expires_at
    }

    /// Time left before the deadline; zero once it has passed.
    pub fn remaining_ttl(&self) -> Option<Duration> {
        self.expires_at.map(|deadline| {
            deadline
                .duration_since(SystemTime::now())
                .unwrap_or(Duration::ZERO)
        })
    }

    /// Attach a deadline listener, replacing any previous one.
    pub fn attach(&mut self, listener: DeadlineSender) {
        self.listener = Some(listener);
    }

    pub fn detach(&mut self) {
        self.listener = None;
    }

    pub fn has_listener(&self) -> bool {
        self.listener.is_some()
    }

    fn notify(&self) {
        let (Some(listener), Some(deadline)) = (&self.listener, self.expires_at) else {
            return;
        };
        let event = DeadlineEvent {
            key: self.key.clone(),
            deadline,
        };
        if listener.send(event).is_err() {
            debug!("Deadline listener for key {} is gone", self.key);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn test_new_item_is_miss() {
        let item = CachedValue::<String>::new("my_key");
        assert_eq!(item.key(), "my_key");
        assert!(!item.is_hit());
        assert_eq!(item.get(), None);
    }

    #[test]
    fn test_set_marks_hit() {
        let mut item = CachedValue::new("my_key");
        item.set("value".to_owned());
        assert!(item.is_hit());
        assert_eq!(item.get().map(String::as_str), Some("value"));

        item.set("overwrite".to_owned());
        assert_eq!(item.get().map(String::as_str), Some("overwrite"));
    }

    #[test]
    fn test_null_is_a_legitimate_value() {
        let mut item = CachedValue::new("my_key");
        item.set(serde_json::Value::Null);
        assert!(item.is_hit());
        assert_eq!(item.get(), Some(&serde_json::Value::Null));

        let mut item = CachedValue::<Option<u32>>::new("other");
        item.set(None);
        assert_eq!(item.get(), Some(&None));
    }

    #[test]
    fn test_map_value() {
        let mut map = HashMap::new();
        map.insert("1".to_owned(), "hello".to_owned());
        map.insert("world".to_owned(), "2".to_owned());

        let mut item = CachedValue::new("my_key");
        item.set(map.clone());
        assert_eq!(item.get(), Some(&map));
    }

    #[test]
    fn test_expires_after_seconds() {
        let mut item = CachedValue::new("my_key");
        item.set(1u32).expires_after_secs(10);
        assert!(item.is_hit());

        item.expires_after_secs(-10);
        assert!(!item.is_hit());
        assert_eq!(item.get(), None);

        item.expires_after_secs(0);
        assert!(!item.is_hit());
    }

    #[test]
    fn test_expires_after_duration() {
        let mut item = CachedValue::new("my_key");
        item.set(1u32).expires_after(Some(Duration::from_secs(60)));
        assert!(item.is_hit());

        item.expires_after(Some(Duration::ZERO));
        assert!(!item.is_hit());

        item.expires_after(None);
        assert!(item.is_hit());
        assert_eq!(item.expiration(), None);
    }

    #[test]
    fn test_expires_at() {
        let day = Duration::from_secs(24 * 60 * 60);
        let mut item = CachedValue::new("my_key");
        item.set(1u32);

        item.expires_at(SystemTime::now().checked_add(day));
        assert!(item.is_hit());

        item.expires_at(SystemTime::now().checked_sub(day));
        assert!(!item.is_hit());

        item.expires_at(None);
        assert!(item.is_hit());
    }

    #[test]
    fn test_expired_without_set_is_miss() {
        let mut item = CachedValue::<u32>::new("my_key");
        item.expires_after_secs(60);
        assert!(!item.is_hit());
    }

    #[test]
    fn test_remaining_ttl() {
        let mut item = CachedValue::new("my_key");
        item.set(1u32);
        assert_eq!(item.remaining_ttl(), None);

        item.expires_after_secs(60);
        let ttl = item.remaining_ttl().unwrap();
        assert!(ttl > Duration::from_secs(58) && ttl <= Duration::from_secs(60));

        item.expires_after_secs(-5);
        assert_eq!(item.remaining_ttl(), Some(Duration::ZERO));
    }

    #[test]
    fn test_deadline_listener() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let mut item = CachedValue::new("my_key");
        item.set(1u32);
        item.attach(tx);
        assert!(item.has_listener());

        let deadline = SystemTime::now() + Duration::from_secs(30);
        item.expires_at(Some(deadline));
        assert_eq!(
            rx.try_recv().unwrap(),
            DeadlineEvent {
                key: "my_key".to_owned(),
                deadline
            }
        );

        // clearing or relative deadlines are not reported
        item.expires_at(None);
        item.expires_after(Some(Duration::from_secs(5)));
        item.expires_after_secs(5);
        assert!(rx.try_recv().is_err());

        item.detach();
        item.expires_at(Some(deadline));
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn test_closed_listener_is_ignored() {
        let (tx, rx) = mpsc::unbounded_channel();
        drop(rx);
        let mut item = CachedValue::new("my_key");
        item.set(1u32);
        item.attach(tx);
        item.expires_at(Some(SystemTime::now()));
        assert!(!item.is_hit());
    }

    #[test]
    fn test_serialization_keeps_state() {
        let mut item = CachedValue::new("hello");
        item.set("world".to_owned()).expires_after_secs(60);

        let json = serde_json::to_vec(&item).unwrap();
        let back: CachedValue<String> = serde_json::from_slice(&json).unwrap();
        assert!(back.is_hit());
        assert_eq!(back.key(), "hello");
        assert_eq!(back.get(), item.get());
        assert_eq!(back.expiration(), item.expiration());
        assert!(!back.has_listener());
    }

    /// Values only need to be `Cacheable`, not `Default`.
    fn decode<V: Cacheable>(bytes: &[u8]) -> CachedValue<V> {
        serde_json::from_slice(bytes).unwrap()
    }

    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    struct Profile {
        name: String,
        age: u8,
    }

    #[test]
    fn test_generic_decode_without_default() {
        let profile = Profile {
            name: "ada".to_owned(),
            age: 36,
        };
        let mut item = CachedValue::new("profile");
        item.set(profile.clone());
        let back: CachedValue<Profile> = decode(&serde_json::to_vec(&item).unwrap());
        assert_eq!(back.get(), Some(&profile));

        let miss = CachedValue::<Profile>::new("nobody");
        let back: CachedValue<Profile> = decode(&serde_json::to_vec(&miss).unwrap());
        assert!(!back.is_hit());
        assert_eq!(back.get(), None);
    }

    #[test]
    fn test_serialized_null_stays_a_value() {
        let mut item = CachedValue::new("nothing");
        item.set(serde_json::Value::Null);
        let json = serde_json::to_vec(&item).unwrap();
        let back: CachedValue<serde_json::Value> = serde_json::from_slice(&json).unwrap();
        assert_eq!(back.get(), Some(&serde_json::Value::Null));

        let miss = CachedValue::<serde_json::Value>::new("empty");
        let json = serde_json::to_vec(&miss).unwrap();
        let back: CachedValue<serde_json::Value> = serde_json::from_slice(&json).unwrap();
        assert!(!back.is_hit());
    }

    #[test]
    fn test_key_validation() {
        assert!(is_valid_key("my_key"));
        assert!(is_valid_key("with spaces.and-dots"));
        assert!(is_valid_key(""));
        for c in RESERVED_KEY_CHARS.chars() {
            let key = format!("bad{}key", c);
            assert!(!is_valid_key(&key), "{} should be rejected", key);
            assert!(matches!(
                validate_key(&key),
                Err(CacheError::InvalidKey(k)) if k == key
            ));
        }
    }
}
