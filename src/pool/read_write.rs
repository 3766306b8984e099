use std::sync::Arc;

use crate::error::SqlLeaseError;

use super::lease::Lease;
use super::multi::MultiPool;
use super::single::SinglePool;
use super::{ManageHandle, PoolStatus, ReserveOptions};

/// One writer plus a lazily grown set of readers.
///
/// `reserve` routes on [`ReserveOptions::readonly`]: `Some(true)` goes to the
/// readers, anything else to the writer.
pub struct ReadWritePool<M: ManageHandle> {
    writer: SinglePool<M>,
    readers: MultiPool<M>,
}

impl<M: ManageHandle> Clone for ReadWritePool<M> {
    fn clone(&self) -> Self {
        Self {
            writer: self.writer.clone(),
            readers: self.readers.clone(),
        }
    }
}

impl<M: ManageHandle> ReadWritePool<M> {
    /// Open the writer (awaited) and set up the reader pool (lazy).
    ///
    /// # Errors
    /// The writer's open error, or [`SqlLeaseError::ConfigError`] for a zero
    /// reader cap.
    pub async fn open(
        writer: Arc<M>,
        readers: Arc<M>,
        max_connections: usize,
    ) -> Result<Self, SqlLeaseError> {
        let readers = MultiPool::new(readers, max_connections)?;
        let writer = SinglePool::open(writer, "writer").await?;
        Ok(Self { writer, readers })
    }

    /// # Errors
    /// See [`SinglePool::reserve`] and [`MultiPool::reserve`].
    pub async fn reserve(
        &self,
        options: &ReserveOptions,
    ) -> Result<Lease<M::Handle>, SqlLeaseError> {
        if options.is_readonly() {
            self.readers.reserve(options).await
        } else {
            self.writer.reserve(options).await
        }
    }

    /// Close both sub-pools, reporting every handle that failed. Both wait for
    /// their outstanding leases.
    ///
    /// # Errors
    /// [`SqlLeaseError::CloseFailed`] with the failures of both sub-pools.
    pub async fn close(&self) -> Result<(), SqlLeaseError> {
        let mut failures = Vec::new();
        let (writer, readers) = tokio::join!(self.writer.close(), self.readers.close());
        for outcome in [writer, readers] {
            match outcome {
                Ok(()) => {}
                Err(SqlLeaseError::CloseFailed(mut more)) => failures.append(&mut more),
                Err(other) => failures.push(other.to_string()),
            }
        }
        if failures.is_empty() {
            Ok(())
        } else {
            Err(SqlLeaseError::CloseFailed(failures))
        }
    }

    #[must_use]
    pub fn writer_status(&self) -> PoolStatus {
        self.writer.status()
    }

    #[must_use]
    pub fn reader_status(&self) -> PoolStatus {
        self.readers.status()
    }
}
