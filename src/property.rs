//! `PropertyCell<T>` — the redesigned property-interception capability (§4.5, §9).
//!
//! The source observes in-place container mutation through a dynamic-language proxy trap. That
//! mechanism has no Rust equivalent, so §9 prescribes a capability type instead: container
//! properties are exposed behind `PropertyCell<T>`, whose mutation methods emit `PropertiesChanged`
//! synchronously after the mutation completes. There is no `DerefMut` to the backing collection —
//! mutation only happens through the methods below, which is what makes the "exactly one signal
//! per mutation" contract (§8 invariant 5) checkable at the type level rather than by convention.

use std::sync::Mutex;

/// A notifier a `PropertyCell` calls after every mutation, carrying the field's current value.
/// `ObjectNode`/`Interface` wiring supplies the closure; it is what turns a cell mutation into a
/// `PropertiesChanged` signal (§4.5).
pub type ChangeNotifier<T> = Box<dyn Fn(&T) + Send + Sync>;

/// A property value with interception wired in. Plain scalar properties don't need this — it
/// exists for `Vec`-shaped and map-shaped properties, where in-place mutation would otherwise be
/// invisible to `PropertiesChanged` subscribers.
pub struct PropertyCell<T> {
    value: Mutex<T>,
    notify: ChangeNotifier<T>,
}

impl<T> PropertyCell<T> {
    pub fn new(initial: T, notify: ChangeNotifier<T>) -> Self {
        Self {
            value: Mutex::new(initial),
            notify,
        }
    }

    /// Read the current value.
    pub fn get(&self) -> T
    where
        T: Clone,
    {
        self.value.lock().expect("lock poisoned").clone()
    }

    /// Replace the whole value, as a plain `Set` would (§4.4), and notify once.
    pub fn replace(&self, new_value: T) {
        let mut guard = self.value.lock().expect("lock poisoned");
        *guard = new_value;
        (self.notify)(&guard);
    }

    /// Mutate in place through an arbitrary closure, notifying exactly once regardless of how
    /// many changes the closure makes. Every other mutation method on this type is expressed in
    /// terms of this one.
    pub fn mutate(&self, f: impl FnOnce(&mut T)) {
        let mut guard = self.value.lock().expect("lock poisoned");
        f(&mut guard);
        (self.notify)(&guard);
    }
}

impl<T: std::fmt::Debug> std::fmt::Debug for PropertyCell<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PropertyCell")
            .field("value", &self.value.lock().expect("lock poisoned"))
            .finish()
    }
}

impl<T> PropertyCell<Vec<T>> {
    pub fn push(&self, item: T) {
        self.mutate(|v| v.push(item));
    }

    pub fn pop(&self) -> Option<T> {
        let mut guard = self.value.lock().expect("lock poisoned");
        let popped = guard.pop();
        (self.notify)(&guard);
        popped
    }

    pub fn insert(&self, index: usize, item: T) {
        self.mutate(|v| v.insert(index, item));
    }

    pub fn remove(&self, index: usize) -> T {
        let mut guard = self.value.lock().expect("lock poisoned");
        let removed = guard.remove(index);
        (self.notify)(&guard);
        removed
    }

    pub fn retain(&self, f: impl FnMut(&T) -> bool) {
        self.mutate(|v| v.retain(f));
    }

    pub fn clear(&self) {
        self.mutate(|v| v.clear());
    }

    pub fn reverse(&self) {
        self.mutate(|v| v.reverse());
    }

    pub fn sort_by(&self, compare: impl FnMut(&T, &T) -> std::cmp::Ordering) {
        self.mutate(|v| v.sort_by(compare));
    }

    pub fn len(&self) -> usize {
        self.value.lock().expect("lock poisoned").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl<K, V> PropertyCell<Vec<(K, V)>> {
    /// `remove_where`-by-key, the map-shaped analogue of `Vec::retain` named per §9's suggested
    /// surface (`PropertyCell` mutation methods "chosen per contained collection kind").
    pub fn remove_where(&self, mut predicate: impl FnMut(&K, &V) -> bool) {
        self.mutate(|entries| entries.retain(|(k, v)| !predicate(k, v)));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    #[test]
    fn replace_notifies_exactly_once() {
        let calls = Arc::new(AtomicUsize::new(0));
        let calls2 = calls.clone();
        let cell = PropertyCell::new(0u32, Box::new(move |_| {
            calls2.fetch_add(1, Ordering::SeqCst);
        }));
        cell.replace(42);
        assert_eq!(cell.get(), 42);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn vec_push_notifies_once_with_current_contents() {
        let seen: Arc<Mutex<Vec<Vec<i32>>>> = Arc::new(Mutex::new(Vec::new()));
        let seen2 = seen.clone();
        let cell: PropertyCell<Vec<i32>> = PropertyCell::new(
            Vec::new(),
            Box::new(move |v| seen2.lock().unwrap().push(v.clone())),
        );
        cell.push(1);
        cell.push(2);
        assert_eq!(cell.get(), vec![1, 2]);
        assert_eq!(seen.lock().unwrap().len(), 2);
        assert_eq!(seen.lock().unwrap().last().unwrap(), &vec![1, 2]);
    }
}
