//! Two-phase handles for segment and index mutations.

use crate::error::{CoreError, CoreResult};
use tracing::warn;

/// One undoable mutation.
pub trait Transaction: Send {
    /// Makes the mutation durable.
    ///
    /// # Errors
    ///
    /// Returns an error if the mutation cannot be made durable.
    fn commit(&mut self) -> CoreResult<()>;

    /// Undoes the mutation.
    ///
    /// # Errors
    ///
    /// Returns an error if the previous state cannot be restored.
    fn rollback(&mut self) -> CoreResult<()>;

    /// Undoes the mutation after it was committed.
    ///
    /// Used when a later step of a chain fails. Mutations that cannot be
    /// taken back once durable keep this default.
    ///
    /// # Errors
    ///
    /// Returns an error if the mutation cannot be undone.
    fn revert(&mut self) -> CoreResult<()> {
        Err(CoreError::invalid_operation(
            "committed mutation cannot be undone",
        ))
    }
}

/// State of a [`Pending`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PendingState {
    /// Neither committed nor rolled back yet.
    Active,
    /// Committed.
    Committed,
    /// Rolled back.
    RolledBack,
}

/// A mutation awaiting commit or rollback.
///
/// Dropping an active `Pending` rolls it back.
#[must_use = "dropping a Pending rolls it back"]
pub struct Pending {
    tx: Option<Box<dyn Transaction>>,
    state: PendingState,
}

impl std::fmt::Debug for Pending {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Pending")
            .field("state", &self.state)
            .field("noop", &self.tx.is_none())
            .finish()
    }
}

impl Pending {
    /// Wraps a transaction.
    pub fn new(tx: Box<dyn Transaction>) -> Self {
        Self {
            tx: Some(tx),
            state: PendingState::Active,
        }
    }

    /// A pending with nothing to do.
    pub fn noop() -> Self {
        Self {
            tx: None,
            state: PendingState::Active,
        }
    }

    /// Builds a pending from commit and rollback closures.
    pub fn from_fns<C, R>(commit: C, rollback: R) -> Self
    where
        C: FnMut() -> CoreResult<()> + Send + 'static,
        R: FnMut() -> CoreResult<()> + Send + 'static,
    {
        Self::new(Box::new(FnTransaction { commit, rollback }))
    }

    /// Commits `first`, then `second`. Rollback runs in reverse order.
    ///
    /// If `second` fails to commit, an already committed `first` is
    /// reverted.
    pub fn chain(first: Pending, second: Pending) -> Self {
        Self::new(Box::new(Chain { first, second }))
    }

    /// Returns the current state.
    #[must_use]
    pub const fn state(&self) -> PendingState {
        self.state
    }

    /// Commits the mutation.
    ///
    /// # Errors
    ///
    /// Returns the commit error; the mutation is then rolled back.
    pub fn commit(mut self) -> CoreResult<()> {
        self.commit_in_place()
    }

    /// Rolls the mutation back.
    ///
    /// # Errors
    ///
    /// Returns an error if the previous state cannot be restored.
    pub fn rollback(mut self) -> CoreResult<()> {
        self.rollback_in_place()
    }

    fn commit_in_place(&mut self) -> CoreResult<()> {
        self.ensure_active()?;
        if let Some(tx) = self.tx.as_mut() {
            tx.commit()?;
        }
        self.state = PendingState::Committed;
        Ok(())
    }

    fn rollback_in_place(&mut self) -> CoreResult<()> {
        if self.state != PendingState::Active {
            return Ok(());
        }
        self.state = PendingState::RolledBack;
        match self.tx.as_mut() {
            Some(tx) => tx.rollback(),
            None => Ok(()),
        }
    }

    /// Rolls back an active mutation or reverts a committed one.
    fn undo_in_place(&mut self) -> CoreResult<()> {
        match self.state {
            PendingState::Active => self.rollback_in_place(),
            PendingState::Committed => {
                self.state = PendingState::RolledBack;
                match self.tx.as_mut() {
                    Some(tx) => tx.revert(),
                    None => Ok(()),
                }
            }
            PendingState::RolledBack => Ok(()),
        }
    }

    fn ensure_active(&self) -> CoreResult<()> {
        match self.state {
            PendingState::Active => Ok(()),
            PendingState::Committed => Err(CoreError::invalid_operation(
                "pending is already committed",
            )),
            PendingState::RolledBack => Err(CoreError::invalid_operation(
                "pending is already rolled back",
            )),
        }
    }
}

impl Drop for Pending {
    fn drop(&mut self) {
        if self.state == PendingState::Active {
            if let Err(e) = self.rollback_in_place() {
                warn!(error = %e, "rollback of abandoned pending failed");
            }
        }
    }
}

struct FnTransaction<C, R> {
    commit: C,
    rollback: R,
}

impl<C, R> Transaction for FnTransaction<C, R>
where
    C: FnMut() -> CoreResult<()> + Send,
    R: FnMut() -> CoreResult<()> + Send,
{
    fn commit(&mut self) -> CoreResult<()> {
        (self.commit)()
    }

    fn rollback(&mut self) -> CoreResult<()> {
        (self.rollback)()
    }
}

struct Chain {
    first: Pending,
    second: Pending,
}

impl Transaction for Chain {
    fn commit(&mut self) -> CoreResult<()> {
        self.first.commit_in_place()?;
        self.second.commit_in_place()
    }

    fn rollback(&mut self) -> CoreResult<()> {
        let second = self.second.rollback_in_place();
        let first = self.first.undo_in_place();
        second.and(first)
    }
}
