//! Last-value cache of signals

use crosspoint_core::{Signal, SignalKey, SignalValue};
use std::collections::BTreeMap;

/// Signals that are currently "set", keyed by `(smart object, number, type)`.
///
/// Digital highs are cached and digital lows remove the entry, so the cache
/// only holds digitals that need releasing. Analog and serial values are
/// overwritten.
#[derive(Debug, Default, Clone)]
pub struct SigCache {
    entries: BTreeMap<SignalKey, SignalValue>,
}

impl SigCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn apply(&mut self, signal: &Signal) {
        match signal.value {
            SignalValue::Digital(false) => {
                self.entries.remove(&signal.key());
            }
            _ => {
                self.entries.insert(signal.key(), signal.value.clone());
            }
        }
    }

    pub fn apply_all(&mut self, signals: &[Signal]) {
        for signal in signals {
            self.apply(signal);
        }
    }

    pub fn get(&self, key: &SignalKey) -> Option<&SignalValue> {
        self.entries.get(key)
    }

    /// Current contents, in key order
    pub fn snapshot(&self) -> Vec<Signal> {
        self.entries
            .iter()
            .map(|(key, value)| Signal::new(key.smart_object_id, key.number, value.clone()))
            .collect()
    }

    /// Empty the cache, returning every entry as its released value
    pub fn drain_cleared(&mut self) -> Vec<Signal> {
        let cleared = self
            .entries
            .iter()
            .map(|(key, value)| Signal::new(key.smart_object_id, key.number, value.cleared()))
            .collect();
        self.entries.clear();
        cleared
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_digital_low_removes() {
        let mut cache = SigCache::new();
        cache.apply(&Signal::digital(0, 1, true));
        assert_eq!(cache.len(), 1);
        cache.apply(&Signal::digital(0, 1, false));
        assert!(cache.is_empty());
    }

    #[test]
    fn test_analog_and_serial_overwrite() {
        let mut cache = SigCache::new();
        cache.apply_all(&[
            Signal::analog(0, 1, 10),
            Signal::analog(0, 1, 20),
            Signal::serial(0, 1, "a"),
        ]);
        assert_eq!(cache.len(), 2);
        assert_eq!(
            cache.snapshot(),
            vec![Signal::analog(0, 1, 20), Signal::serial(0, 1, "a")]
        );
    }

    #[test]
    fn test_drain_cleared_empties() {
        let mut cache = SigCache::new();
        cache.apply_all(&[Signal::digital(2, 7, true), Signal::analog(1, 3, 500)]);
        let cleared = cache.drain_cleared();
        assert_eq!(
            cleared,
            vec![Signal::analog(1, 3, 0), Signal::digital(2, 7, false)]
        );
        assert!(cache.is_empty());
    }
}
