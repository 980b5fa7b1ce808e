//! Ordered release of resources.
//!
//! [`CloseStack`] collects close actions as resources are acquired. On a
//! normal shutdown they run in the order they were pushed; on a failed start
//! they run in reverse acquisition order. In both cases every action is
//! attempted and only the first error is kept.

use crate::error::Result;

type CloseFn = Box<dyn FnOnce() -> Result<()> + Send>;

#[derive(Default)]
pub struct CloseStack {
    items: Vec<(&'static str, CloseFn)>,
}

impl std::fmt::Debug for CloseStack {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let names: Vec<&str> = self.items.iter().map(|(name, _)| *name).collect();
        f.debug_struct("CloseStack").field("items", &names).finish()
    }
}

impl CloseStack {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push<F>(&mut self, name: &'static str, close: F)
    where
        F: FnOnce() -> Result<()> + Send + 'static,
    {
        self.items.push((name, Box::new(close)));
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    /// Run every action in push order, returning the first error.
    pub fn close_all(self) -> Result<()> {
        let mut first_error = None;
        for (name, close) in self.items {
            if let Err(e) = close() {
                log::warn!("Failed to close {name}: {e}");
                first_error.get_or_insert(e);
            }
        }
        match first_error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    /// Run every action in reverse push order, logging and discarding errors.
    pub fn rollback(self) {
        for (name, close) in self.items.into_iter().rev() {
            if let Err(e) = close() {
                log::warn!("Failed to close {name} during rollback: {e}");
            }
        }
    }
}
