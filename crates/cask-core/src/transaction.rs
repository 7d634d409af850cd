/// Rollback steps for a multi-step repo mutation.
///
/// Steps accumulate while the operation makes progress; `commit` forgets
/// them. Dropping an uncommitted transaction runs the steps in reverse
/// order. Every step is best-effort: it logs its own failure and the next
/// one still runs, so rollback never masks the error that triggered it.
#[must_use]
pub struct Transaction {
    rollbacks: Vec<Box<dyn FnOnce() + Send>>,
    committed: bool,
}

impl Transaction {
    pub fn new() -> Self {
        Self {
            rollbacks: Vec::new(),
            committed: false,
        }
    }

    pub fn add_rollback(&mut self, step: impl FnOnce() + Send + 'static) {
        self.rollbacks.push(Box::new(step));
    }

    pub fn commit(mut self) {
        self.committed = true;
        self.rollbacks.clear();
    }
}

impl Default for Transaction {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for Transaction {
    fn drop(&mut self) {
        if self.committed {
            return;
        }
        for step in self.rollbacks.drain(..).rev() {
            step();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    #[test]
    fn commit_forgets_rollbacks() {
        let counter = Arc::new(AtomicUsize::new(0));
        let mut tx = Transaction::new();
        let seen = Arc::clone(&counter);
        tx.add_rollback(move || {
            seen.fetch_add(1, Ordering::SeqCst);
        });
        tx.commit();
        assert_eq!(counter.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn drop_runs_rollbacks_in_reverse_order() {
        let order = Arc::new(std::sync::Mutex::new(Vec::new()));
        {
            let mut tx = Transaction::new();
            for step in 1..=3 {
                let order = Arc::clone(&order);
                tx.add_rollback(move || order.lock().unwrap().push(step));
            }
        }
        assert_eq!(*order.lock().unwrap(), vec![3, 2, 1]);
    }
}
