//! Positional parameter allocation.
//!
//! Every compilation call owns exactly one [`ParameterAllocator`]. Names are
//! handed out as `p0, p1, ...` in first-use order and rendered in SQL as
//! `$p<N>` tokens; the executor rewrites those into the engine's native
//! placeholder syntax right before dispatch.

use crate::value::Value;

/// Ordered `paramName → value` mapping produced by one compilation call.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct ParameterMap {
    values: Vec<Value>,
}

impl ParameterMap {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    /// Look up a parameter by name (`"p3"`).
    pub fn get(&self, name: &str) -> Option<&Value> {
        name.strip_prefix('p')
            .and_then(|n| n.parse::<usize>().ok())
            .and_then(|i| self.values.get(i))
    }

    pub fn get_index(&self, index: usize) -> Option<&Value> {
        self.values.get(index)
    }

    /// Parameters in allocation order, with their names.
    pub fn iter(&self) -> impl Iterator<Item = (String, &Value)> {
        self.values
            .iter()
            .enumerate()
            .map(|(i, v)| (param_name(i), v))
    }

    pub fn values(&self) -> &[Value] {
        &self.values
    }

    pub fn into_values(self) -> Vec<Value> {
        self.values
    }
}

impl<V: Into<Value>> FromIterator<V> for ParameterMap {
    fn from_iter<I: IntoIterator<Item = V>>(iter: I) -> Self {
        Self {
            values: iter.into_iter().map(Into::into).collect(),
        }
    }
}

fn param_name(index: usize) -> String {
    format!("p{}", index)
}

/// Issues uniquely named placeholders for a single compilation call.
#[derive(Debug, Default)]
pub struct ParameterAllocator {
    params: ParameterMap,
}

impl ParameterAllocator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Bind `value` to the next free name and return its SQL token (`$p<N>`).
    pub fn push(&mut self, value: Value) -> String {
        let token = format!("${}", param_name(self.params.values.len()));
        self.params.values.push(value);
        token
    }

    pub fn len(&self) -> usize {
        self.params.len()
    }

    pub fn is_empty(&self) -> bool {
        self.params.is_empty()
    }

    pub fn finish(self) -> ParameterMap {
        self.params
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_allocation_order() {
        let mut alloc = ParameterAllocator::new();
        assert_eq!(alloc.push(Value::Int(18)), "$p0");
        assert_eq!(alloc.push(Value::Int(65)), "$p1");
        assert_eq!(alloc.push(Value::Bool(true)), "$p2");

        let params = alloc.finish();
        assert_eq!(params.len(), 3);
        assert_eq!(params.get("p0"), Some(&Value::Int(18)));
        assert_eq!(params.get("p2"), Some(&Value::Bool(true)));
        assert_eq!(params.get("p3"), None);
        assert_eq!(params.get("x0"), None);

        let names: Vec<String> = params.iter().map(|(n, _)| n).collect();
        assert_eq!(names, vec!["p0", "p1", "p2"]);
    }

    #[test]
    fn test_fresh_allocators_do_not_share_state() {
        let mut a = ParameterAllocator::new();
        a.push(Value::Int(1));
        a.push(Value::Int(2));

        let mut b = ParameterAllocator::new();
        assert_eq!(b.push(Value::Int(3)), "$p0");
    }
}
