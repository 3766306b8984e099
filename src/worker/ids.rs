use std::collections::BTreeSet;

use crate::error::SqlLeaseError;

/// Identifies a statement within one handle's command stream.
pub type StatementId = u32;

/// Most statements a handle can have alive at once.
pub const MAX_LIVE_STATEMENTS: u32 = 65_536;

/// Small-integer allocator for statement ids.
///
/// Finalizing frees an id, and the lowest freed id is handed out first, so
/// ids stay dense and deterministic.
#[derive(Debug, Default)]
pub struct StatementIds {
    next: StatementId,
    free: BTreeSet<StatementId>,
}

impl StatementIds {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// # Errors
    /// [`SqlLeaseError::ProtocolViolation`] when every id is in use.
    pub fn allocate(&mut self) -> Result<StatementId, SqlLeaseError> {
        if let Some(id) = self.free.pop_first() {
            return Ok(id);
        }
        if self.next >= MAX_LIVE_STATEMENTS {
            return Err(SqlLeaseError::protocol(format!(
                "statement id space exhausted ({MAX_LIVE_STATEMENTS} live statements)"
            )));
        }
        let id = self.next;
        self.next += 1;
        Ok(id)
    }

    /// Return `id` to the allocator. Unknown or already freed ids are ignored.
    pub fn release(&mut self, id: StatementId) {
        if id < self.next {
            self.free.insert(id);
        }
    }

    #[must_use]
    pub fn live(&self) -> usize {
        self.next as usize - self.free.len()
    }
}
