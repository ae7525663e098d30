use std::fmt;
use std::sync::atomic::{AtomicIsize, Ordering};

use serde::{Serialize, Serializer};
use serde_json::json;

/// Current value plus the highest value ever observed.
#[derive(Default)]
pub struct Counter {
    current: AtomicIsize,
    max: AtomicIsize,
}

impl Clone for Counter {
    fn clone(&self) -> Self {
        Counter {
            current: AtomicIsize::new(self.count()),
            max: AtomicIsize::new(self.max()),
        }
    }
}

impl fmt::Debug for Counter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, r#"{{ "count":{}, "max":{} }}"#, self.count(), self.max())
    }
}

impl Serialize for Counter {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        self.to_json().serialize(serializer)
    }
}

impl Counter {
    #[inline]
    pub fn new() -> Self {
        Self::default()
    }

    #[inline]
    pub fn inc(&self) {
        self.incs(1);
    }

    #[inline]
    pub fn incs(&self, c: isize) {
        let prev = self.current.fetch_add(c, Ordering::SeqCst);
        self.max.fetch_max(prev + c, Ordering::SeqCst);
    }

    #[inline]
    pub fn dec(&self) {
        self.decs(1)
    }

    #[inline]
    pub fn decs(&self, c: isize) {
        self.current.fetch_sub(c, Ordering::SeqCst);
    }

    #[inline]
    pub fn sets(&self, c: isize) {
        self.current.store(c, Ordering::SeqCst);
        self.max.fetch_max(c, Ordering::SeqCst);
    }

    #[inline]
    pub fn count(&self) -> isize {
        self.current.load(Ordering::SeqCst)
    }

    #[inline]
    pub fn max(&self) -> isize {
        self.max.load(Ordering::SeqCst)
    }

    #[inline]
    pub fn to_json(&self) -> serde_json::Value {
        json!({
            "count": self.count(),
            "max": self.max()
        })
    }
}

#[cfg(test)]
mod tests {
    use super::Counter;

    #[test]
    fn tracks_max() {
        let c = Counter::new();
        c.incs(5);
        c.decs(3);
        c.inc();
        assert_eq!(c.count(), 3);
        assert_eq!(c.max(), 5);
        c.sets(10);
        assert_eq!(c.max(), 10);
        assert_eq!(c.clone().count(), 10);
    }
}
