use super::state::{FlushGrant, Lifecycle, State};
use crate::core::{DbError, Result};
use std::sync::Arc;
use tokio::sync::oneshot;
use tracing::{Instrument, Level, event, info_span};

/// Options for [`State::close`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CloseOptions {
    /// Skip draining in-flight operations.
    pub force: bool,
}

impl CloseOptions {
    pub fn force() -> Self {
        Self { force: true }
    }
}

impl State {
    /// Release the substrate connection once in-flight I/O has drained.
    ///
    /// Flushes issued while suspended queue until [`State::resume`]. Reads
    /// wait. Suspending an already suspended database is a no-op.
    pub async fn suspend(&self) -> Result<()> {
        let span = info_span!("state.suspend", location = %self.location);
        async {
            {
                let mut inner = self.lock_inner();
                match inner.lifecycle {
                    Lifecycle::Open => self.set_lifecycle(&mut inner, Lifecycle::Suspending),
                    Lifecycle::Suspending | Lifecycle::Suspended => return Ok(()),
                    Lifecycle::Closing | Lifecycle::Closed => return Err(self.closed_error()),
                    other => {
                        return Err(DbError::NotOpen(format!(
                            "cannot suspend database '{}' while {:?}",
                            self.location, other
                        )));
                    }
                }
            }

            self.io.idle().await;

            // Opens by other instances before this point are not a conflict;
            // resume compares against the generation seen at suspension.
            let generation = self.substrate.generation(&self.location).await;
            let released = {
                let mut inner = self.lock_inner();
                if inner.lifecycle != Lifecycle::Suspending {
                    // Closed while draining.
                    return Err(self.closed_error());
                }
                inner.generation = generation;
                self.set_lifecycle(&mut inner, Lifecycle::Suspended);
                inner.connection.take()
            };
            if let Some(connection) = released {
                self.release_connection(connection, "suspend").await;
            }
            event!(Level::INFO, generation, "database suspended");
            Ok(())
        }
        .instrument(span)
        .await
    }

    /// Reconnect a suspended database and release queued flushes in order.
    ///
    /// Fails with [`DbError::SuspensionConflict`] when another connection
    /// opened the location during suspension; the database then stays
    /// suspended.
    pub async fn resume(&self) -> Result<()> {
        let span = info_span!("state.resume", location = %self.location);
        async {
            let _schema = self.schema_lock.lock().await;
            self.wait_for_suspended().await?;

            let recorded = self.lock_inner().generation;
            let observed = self.substrate.generation(&self.location).await;
            if observed != recorded {
                event!(
                    Level::WARN,
                    recorded,
                    observed,
                    "location was opened elsewhere during suspension"
                );
                return Err(DbError::SuspensionConflict(self.location.clone()));
            }

            let (connection, generation) = self.connect().await?;
            let rejected = {
                let mut inner = self.lock_inner();
                if inner.lifecycle == Lifecycle::Suspended {
                    self.install_connection(&mut inner, connection, generation);
                    None
                } else {
                    Some(connection)
                }
            };
            if let Some(connection) = rejected {
                self.release_connection(connection, "resume raced close").await;
                return Err(self.closed_error());
            }

            let mut released = 0usize;
            loop {
                let grant = {
                    let mut inner = self.lock_inner();
                    if inner.lifecycle != Lifecycle::Suspended {
                        return Err(self.closed_error());
                    }
                    match inner.flush_queue.pop_front() {
                        Some(grant) => grant,
                        None => {
                            self.set_lifecycle(&mut inner, Lifecycle::Open);
                            break;
                        }
                    }
                };
                release_flush(grant).await;
                released += 1;
            }

            event!(Level::INFO, released, generation, "database resumed");
            Ok(())
        }
        .instrument(span)
        .await
    }

    async fn wait_for_suspended(&self) -> Result<()> {
        let mut changes = self.lifecycle_tx.subscribe();
        loop {
            match self.lock_inner().lifecycle {
                Lifecycle::Suspended => return Ok(()),
                Lifecycle::Suspending => {}
                Lifecycle::Closing | Lifecycle::Closed => return Err(self.closed_error()),
                other => {
                    return Err(DbError::InvalidArgument(format!(
                        "cannot resume database '{}' while {:?}",
                        self.location, other
                    )));
                }
            }
            changes.changed().await.map_err(|_| self.closed_error())?;
        }
    }

    /// Close the database. Never fails; substrate errors are logged.
    ///
    /// Without `force`, waits for in-flight I/O and caller operations first.
    /// Flushes still queued from a suspension are rejected with
    /// [`DbError::Closed`]. Concurrent calls all wait for the same close.
    pub async fn close(self: &Arc<Self>, options: CloseOptions) {
        let span = info_span!(
            "state.close",
            location = %self.location,
            force = options.force
        );
        async {
            let queued = {
                let mut inner = self.lock_inner();
                if inner.lifecycle.is_terminal() {
                    None
                } else {
                    self.set_lifecycle(&mut inner, Lifecycle::Closing);
                    Some(std::mem::take(&mut inner.flush_queue))
                }
            };
            let Some(queued) = queued else {
                self.wait_for_closed().await;
                return;
            };
            if !queued.is_empty() {
                event!(Level::WARN, rejected = queued.len(), "rejecting flushes queued during suspension");
            }
            drop(queued);

            if !options.force {
                self.io.idle().await;
                self.refs.idle().await;
            }

            let (sessions, snapshots, connection) = {
                let mut inner = self.lock_inner();
                inner.read_pool.clear();
                inner.write_pool.clear();
                (
                    std::mem::take(&mut inner.sessions),
                    std::mem::take(&mut inner.snapshots),
                    inner.connection.take(),
                )
            };

            // Newest first; each slot releases its snapshot reference.
            let session_count = sessions.len();
            for slot in sessions.into_iter().rev() {
                drop(slot);
            }
            for data in snapshots.values() {
                data.retire();
            }

            if let Some(connection) = connection {
                self.release_connection(connection, "close").await;
            }

            {
                let mut inner = self.lock_inner();
                self.set_lifecycle(&mut inner, Lifecycle::Closed);
            }
            self.unregister();
            event!(Level::INFO, sessions = session_count, "database closed");
        }
        .instrument(span)
        .await
    }

    async fn wait_for_closed(&self) {
        let mut changes = self.lifecycle_tx.subscribe();
        while self.lock_inner().lifecycle != Lifecycle::Closed {
            if changes.changed().await.is_err() {
                return;
            }
        }
    }

    fn unregister(self: &Arc<Self>) {
        let Some(registry) = self.registry.upgrade() else {
            return;
        };
        let mut states = match registry.lock() {
            Ok(states) => states,
            Err(poisoned) => poisoned.into_inner(),
        };
        if states
            .get(&self.location)
            .is_some_and(|current| Arc::ptr_eq(current, self))
        {
            states.remove(&self.location);
        }
    }
}

/// Let one queued flush run and wait until it has settled.
async fn release_flush(grant: FlushGrant) {
    let (settled_tx, settled_rx) = oneshot::channel();
    if grant.send(settled_tx).is_ok() {
        // Resolves with an error once the flush drops its sender.
        let _ = settled_rx.await;
    }
}
