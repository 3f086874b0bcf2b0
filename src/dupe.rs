//! Explicitly cheap clones.
// SPDX-License-Identifier: Apache-2.0 OR GPL-3.0-or-later

use std::sync::Arc;
use tokio::sync::mpsc;

/// A cheap clone.
///
/// Calling `dupe` documents that the copy is a reference-count bump or a
/// handle duplication, never a deep copy.
pub trait Dupe {
    /// Duplicate the handle.
    #[must_use]
    fn dupe(&self) -> Self;
}

impl<T> Dupe for Arc<T> {
    #[inline]
    fn dupe(&self) -> Self {
        Self::clone(self)
    }
}

impl<T> Dupe for mpsc::UnboundedSender<T> {
    #[inline]
    fn dupe(&self) -> Self {
        self.clone()
    }
}

impl<T> Dupe for mpsc::Sender<T> {
    #[inline]
    fn dupe(&self) -> Self {
        self.clone()
    }
}
