use std::fmt::{Write, Debug, Formatter};
use std::slice::Iter;


/// A collection of parameters, either from a startup packet or reported by a backend in ParameterStatus
#[derive(Clone, Default)]
pub struct ServerParams {
    params: Vec<(String, String)>,
}

impl ServerParams {
    pub const fn new() -> Self {
        Self{params: Vec::new()}
    }

    /// Add a new parameter to the collection, without checking if it exists first
    pub fn add(&mut self, k: String, v: String) {
        self.params.push((k, v));
    }

    /// Add or overwrite a parameter
    pub fn set(&mut self, k: String, v: String) {
        match self.params.iter_mut().find(|(key, _)| *key == k) {
            Some(entry) => entry.1 = v,
            None => self.add(k, v),
        }
    }

    /// Get a parameter (or None if it doesn't exist in the collection.)
    /// The passed key is compared case sensitively and should be lower case.
    pub fn get<'a>(&'a self, k: &'_ str) -> Option<&'a str> {
        self.params.iter().find(|(key, _)| key == k).map(|(_, v)| v.as_str())
    }

    pub fn len(&self) -> usize {
        self.params.len()
    }

    pub fn is_empty(&self) -> bool {
        self.params.is_empty()
    }

    pub fn iter(&self) -> Iter<(String, String)> {
        self.params.iter()
    }
}

impl Debug for ServerParams {
    /// Format the ServerParams object as a map literal {key: value, ...}
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_char('{')?;
        for (i, (key, val)) in self.iter().enumerate() {
            if i != 0 {
                f.write_str(", ")?;
            }
            f.write_str(key)?;
            f.write_str(": ")?;
            f.write_str(val)?;
        }
        f.write_char('}')
    }
}
