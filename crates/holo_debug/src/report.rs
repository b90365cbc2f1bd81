//! Accumulation of findings across a pass.
//!
//! Passes record each violation with its full context and keep scanning; the
//! caller prints them and turns a non-empty set into one failure at the end.

use std::fmt;
use std::io::{self, Write};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Findings<T> {
    items: Vec<T>,
}

impl<T> Default for Findings<T> {
    fn default() -> Self {
        Self { items: Vec::new() }
    }
}

impl<T> Findings<T> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, item: T) {
        self.items.push(item);
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn iter(&self) -> std::slice::Iter<'_, T> {
        self.items.iter()
    }
}

impl<T: fmt::Display> Findings<T> {
    /// Print one finding per line.
    pub fn write_to(&self, out: &mut dyn Write) -> io::Result<()> {
        for item in &self.items {
            writeln!(out, "{item}")?;
        }
        Ok(())
    }
}

impl<'a, T> IntoIterator for &'a Findings<T> {
    type Item = &'a T;
    type IntoIter = std::slice::Iter<'a, T>;

    fn into_iter(self) -> Self::IntoIter {
        self.items.iter()
    }
}
