/* Execution context: the key/value pairs describing the current desktop state
 * (window class, title, device name, ...) that profile lookups match against.
 *
 * Keys are unique but insertion-unordered. Merging replaces values and treats
 * an empty value as a deletion marker. */

/* A set of unique string entries, kept in a flat vector. Contexts are small
 * (a handful of entries), linear scans beat hashing here. */
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Context {
    values: Vec<(String, String)>,
}

impl Context {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.values
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
    }

    /* Insert or replace a single entry. An empty value removes the key. */
    pub fn insert(&mut self, key: impl Into<String>, value: impl Into<String>) {
        let key = key.into();
        let value = value.into();
        match self.values.iter().position(|(k, _)| *k == key) {
            Some(idx) => {
                if value.is_empty() {
                    self.values.swap_remove(idx);
                } else {
                    self.values[idx].1 = value;
                }
            }
            None => {
                if !value.is_empty() {
                    self.values.push((key, value));
                }
            }
        }
    }

    /* Merge another context into this one. Values from `other` replace
     * existing ones; an empty value deletes the key. */
    pub fn merge(&mut self, other: &Context) {
        for (key, value) in &other.values {
            self.insert(key.clone(), value.clone());
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.values.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }
}

impl<K: Into<String>, V: Into<String>> FromIterator<(K, V)> for Context {
    fn from_iter<T: IntoIterator<Item = (K, V)>>(iter: T) -> Self {
        let mut ctx = Context::new();
        for (k, v) in iter {
            ctx.insert(k, v);
        }
        ctx
    }
}
