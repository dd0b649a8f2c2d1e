use parking_lot::Mutex;
use std::collections::HashMap;

/// The in-memory sliding window, used when no redis backend is
/// configured and as the fail-open fallback when it misbehaves.
pub(crate) struct MemoryWindow {
    keys: Mutex<HashMap<String, Vec<f64>>>,
}

impl MemoryWindow {
    pub fn new() -> Self {
        Self {
            keys: Mutex::new(HashMap::new()),
        }
    }

    /// Record a hit at `now` and return how many hits fall within the
    /// trailing window, the new one included.
    pub fn hit(&self, key: &str, now: f64, window_secs: u64) -> u64 {
        let mut keys = self.keys.lock();
        let stamps = keys.entry(key.to_string()).or_default();
        stamps.push(now);
        let horizon = now - window_secs as f64;
        stamps.retain(|&stamp| stamp >= horizon);
        stamps.len() as u64
    }

    #[cfg(test)]
    pub fn len(&self) -> usize {
        self.keys.lock().len()
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn counts_only_inside_window() {
        let window = MemoryWindow::new();
        assert_eq!(window.hit("k", 100.0, 60), 1);
        assert_eq!(window.hit("k", 110.0, 60), 2);
        // a hit far in the future prunes the stale ones
        assert_eq!(window.hit("k", 500.0, 60), 1);
    }

    #[test]
    fn keys_are_independent() {
        let window = MemoryWindow::new();
        assert_eq!(window.hit("a", 1.0, 60), 1);
        assert_eq!(window.hit("b", 1.0, 60), 1);
        assert_eq!(window.len(), 2);
    }
}
