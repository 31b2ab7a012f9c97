use std::collections::HashMap;
use std::rc::Rc;

use crate::value::Value;

/// Name to value map that remembers insertion order, used for class and
/// instance fields so stringified objects list keys as they were declared.
#[derive(Debug, Clone, Default)]
pub struct Table {
    keys: Vec<Rc<str>>,
    entries: HashMap<Rc<str>, Value>,
}

impl Table {
    pub fn new() -> Table {
        Table::default()
    }

    pub fn insert(&mut self, key: Rc<str>, value: Value) -> Option<Value> {
        if !self.entries.contains_key(&key) {
            self.keys.push(Rc::clone(&key));
        }
        self.entries.insert(key, value)
    }

    pub fn find(&self, key: &str) -> Option<Value> {
        self.entries.get(key).cloned()
    }

    pub fn contains(&self, key: &str) -> bool {
        self.entries.contains_key(key)
    }

    pub fn remove(&mut self, key: &str) -> Option<Value> {
        let removed = self.entries.remove(key);
        if removed.is_some() {
            self.keys.retain(|k| k.as_ref() != key);
        }
        removed
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn keys(&self) -> impl Iterator<Item = &Rc<str>> {
        self.keys.iter()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&Rc<str>, &Value)> {
        self.keys.iter().filter_map(|key| self.entries.get(key).map(|value| (key, value)))
    }

    /// Copies every entry of `other` over this table, overriding existing keys.
    pub fn extend_from(&mut self, other: &Table) {
        for (key, value) in other.iter() {
            self.insert(Rc::clone(key), value.clone());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::Table;
    use crate::value::Value;

    #[test]
    fn test_keeps_insertion_order() {
        let mut table = Table::new();
        table.insert("b".into(), Value::Int(1));
        table.insert("a".into(), Value::Int(2));
        table.insert("b".into(), Value::Int(3));
        let keys: Vec<&str> = table.keys().map(|k| k.as_ref()).collect();
        assert_eq!(keys, vec!["b", "a"]);
        assert_eq!(table.find("b"), Some(Value::Int(3)));

        table.remove("b");
        assert_eq!(table.len(), 1);
        assert_eq!(table.find("b"), None);
    }
}
