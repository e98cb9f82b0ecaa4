//! Owned NCHW tensor buffers with explicit, idempotent disposal.
//!
//! Every [`TensorHandle`] is accounted in a shared [`TensorLedger`] so a whole
//! `execute()` call can be checked for leaks: after settlement the ledger's
//! `live()` count returns to where it started.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use anyhow::{bail, Result};
use ndarray::Array4;

#[derive(Debug, Default)]
pub struct TensorLedger {
    allocated: AtomicU64,
    disposed: AtomicU64,
}

impl TensorLedger {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn allocated(&self) -> u64 {
        self.allocated.load(Ordering::SeqCst)
    }

    pub fn disposed(&self) -> u64 {
        self.disposed.load(Ordering::SeqCst)
    }

    pub fn live(&self) -> u64 {
        self.allocated().saturating_sub(self.disposed())
    }

    fn record_allocation(&self) {
        self.allocated.fetch_add(1, Ordering::SeqCst);
    }

    fn record_disposal(&self) {
        self.disposed.fetch_add(1, Ordering::SeqCst);
    }
}

/// `[N, C, H, W]` float32 buffer, values in the 0–255 range.
#[derive(Debug)]
pub struct TensorHandle {
    data: Option<Array4<f32>>,
    ledger: Arc<TensorLedger>,
}

impl TensorHandle {
    pub fn new(ledger: &Arc<TensorLedger>, data: Array4<f32>) -> Self {
        ledger.record_allocation();
        Self {
            data: Some(data),
            ledger: Arc::clone(ledger),
        }
    }

    pub fn zeros(ledger: &Arc<TensorLedger>, shape: (usize, usize, usize, usize)) -> Self {
        Self::new(ledger, Array4::zeros(shape))
    }

    pub fn array(&self) -> Result<&Array4<f32>> {
        match self.data.as_ref() {
            Some(data) => Ok(data),
            None => bail!("tensor used after disposal"),
        }
    }

    pub fn array_mut(&mut self) -> Result<&mut Array4<f32>> {
        match self.data.as_mut() {
            Some(data) => Ok(data),
            None => bail!("tensor used after disposal"),
        }
    }

    /// `(batch, channels, height, width)`, or `None` once disposed.
    pub fn dims(&self) -> Option<(usize, usize, usize, usize)> {
        self.data.as_ref().map(|data| data.dim())
    }

    pub fn is_disposed(&self) -> bool {
        self.data.is_none()
    }

    /// Releases the buffer. Returns `false` when it was already released.
    pub fn dispose(&mut self) -> bool {
        if self.data.take().is_some() {
            self.ledger.record_disposal();
            true
        } else {
            false
        }
    }

    /// Moves the buffer out of ledger accounting and hands it to the caller.
    pub fn into_array(mut self) -> Result<Array4<f32>> {
        let Some(data) = self.data.take() else {
            bail!("tensor used after disposal");
        };
        self.ledger.record_disposal();
        Ok(data)
    }
}

impl Drop for TensorHandle {
    fn drop(&mut self) {
        self.dispose();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_dispose_is_idempotent() {
        let ledger = TensorLedger::new();
        let mut tensor = TensorHandle::zeros(&ledger, (1, 3, 2, 2));
        assert_eq!(ledger.live(), 1);

        assert!(tensor.dispose());
        assert!(!tensor.dispose());
        assert!(!tensor.dispose());
        assert_eq!(ledger.allocated(), 1);
        assert_eq!(ledger.disposed(), 1);
        assert_eq!(ledger.live(), 0);
    }

    #[test]
    fn test_use_after_dispose_is_an_error() {
        let ledger = TensorLedger::new();
        let mut tensor = TensorHandle::zeros(&ledger, (1, 3, 2, 2));
        tensor.dispose();
        assert!(tensor.array().is_err());
        assert!(tensor.array_mut().is_err());
        assert!(tensor.dims().is_none());
    }

    #[test]
    fn test_drop_releases_undisposed_tensor() {
        let ledger = TensorLedger::new();
        {
            let _a = TensorHandle::zeros(&ledger, (1, 1, 1, 1));
            let mut b = TensorHandle::zeros(&ledger, (1, 1, 1, 1));
            b.dispose();
        }
        assert_eq!(ledger.allocated(), 2);
        assert_eq!(ledger.disposed(), 2);
    }

    #[test]
    fn test_into_array_hands_off_ownership() {
        let ledger = TensorLedger::new();
        let tensor = TensorHandle::new(&ledger, Array4::from_elem((1, 3, 1, 2), 7.0));
        let data = tensor.into_array().unwrap();
        assert_eq!(data.dim(), (1, 3, 1, 2));
        assert_eq!(ledger.live(), 0);
        assert_eq!(ledger.disposed(), 1);
    }
}
