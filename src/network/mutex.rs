use parking_lot::Mutex;
use std::collections::HashMap;
use std::time::{Duration, Instant};

/// Registry of recently seen message mutex tokens.
///
/// A token stays registered for `window`; expired entries are pruned on every
/// access so nothing outlives its window by more than one call.
#[derive(Debug)]
pub struct MutexRegistry {
    window: Duration,
    seen: Mutex<HashMap<String, Instant>>,
}

impl MutexRegistry {
    pub fn new(window: Duration) -> Self {
        MutexRegistry {
            window,
            seen: Mutex::new(HashMap::new()),
        }
    }

    fn prune(seen: &mut HashMap<String, Instant>, now: Instant) {
        seen.retain(|_, expires| *expires > now);
    }

    /// Registers `token`. Returns false when it was already live.
    pub fn check_and_register(&self, token: &str) -> bool {
        let now = Instant::now();
        let mut seen = self.seen.lock();
        Self::prune(&mut seen, now);
        if seen.contains_key(token) {
            return false;
        }
        seen.insert(token.to_string(), now + self.window);
        true
    }

    /// Registers or refreshes `token`.
    pub fn register(&self, token: &str) {
        let now = Instant::now();
        let mut seen = self.seen.lock();
        Self::prune(&mut seen, now);
        seen.insert(token.to_string(), now + self.window);
    }

    pub fn contains(&self, token: &str) -> bool {
        let now = Instant::now();
        let mut seen = self.seen.lock();
        Self::prune(&mut seen, now);
        seen.contains_key(token)
    }

    pub fn len(&self) -> usize {
        let mut seen = self.seen.lock();
        Self::prune(&mut seen, Instant::now());
        seen.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_duplicate_within_window() {
        let registry = MutexRegistry::new(Duration::from_secs(60));
        assert!(registry.check_and_register("t1"));
        assert!(!registry.check_and_register("t1"));
        assert!(registry.check_and_register("t2"));
        assert_eq!(registry.len(), 2);
    }

    #[test]
    fn test_token_expires() {
        let registry = MutexRegistry::new(Duration::from_millis(20));
        registry.register("t1");
        assert!(registry.contains("t1"));
        std::thread::sleep(Duration::from_millis(40));
        assert!(!registry.contains("t1"));
        assert!(registry.is_empty());
        assert!(registry.check_and_register("t1"));
    }
}
