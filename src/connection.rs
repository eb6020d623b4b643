//! Lazy, memoized connection supervision.
//!
//! [`ConnectionCell`] owns the one broker connection shared by every
//! operation of a `Receiver` or `Sender`. The connection is established on
//! first use and the outcome, success or failure, is memoized for the
//! cell's lifetime. Concurrent first callers serialize on the cell lock, so
//! exactly one connect attempt ever runs; there is no internal retry.

use std::sync::Arc;

use tokio::sync::Mutex;
use tracing::{debug, info};

use crate::broker::{BrokerConnection, BrokerConnector};
use crate::error::BridgeError;

/// Resolution state of the shared connection.
enum CellState {
    /// No connect attempt has run yet.
    Unresolved,

    /// The connect attempt succeeded; all callers share this connection.
    Resolved(Arc<dyn BrokerConnection>),

    /// The connect attempt failed; all callers observe this error.
    Failed(BridgeError),

    /// The cell was explicitly closed.
    Closed,
}

/// One-shot connection cell with memoized success or failure.
pub struct ConnectionCell {
    connector: Arc<dyn BrokerConnector>,
    state: Mutex<CellState>,
}

impl ConnectionCell {
    /// Creates an unresolved cell over the given connector.
    #[must_use]
    pub fn new(connector: Arc<dyn BrokerConnector>) -> Self {
        Self {
            connector,
            state: Mutex::new(CellState::Unresolved),
        }
    }

    /// Returns the shared connection, establishing it on first call.
    ///
    /// # Errors
    ///
    /// Returns the memoized [`BridgeError::ConnectionFailed`] once the
    /// single connect attempt has failed, or if the cell has been closed.
    pub async fn connection(&self) -> Result<Arc<dyn BrokerConnection>, BridgeError> {
        let mut state = self.state.lock().await;
        match &*state {
            CellState::Resolved(connection) => Ok(Arc::clone(connection)),
            CellState::Failed(err) => Err(err.clone()),
            CellState::Closed => Err(BridgeError::ConnectionFailed(
                "connection cell closed".into(),
            )),
            CellState::Unresolved => {
                // Holding the lock across connect() is what guarantees a
                // single attempt: later callers block here and then hit the
                // memoized arms above.
                debug!("establishing broker connection");
                match self.connector.connect().await {
                    Ok(connection) => {
                        info!("broker connection established");
                        *state = CellState::Resolved(Arc::clone(&connection));
                        Ok(connection)
                    }
                    Err(err) => {
                        *state = CellState::Failed(err.clone());
                        Err(err)
                    }
                }
            }
        }
    }

    /// Closes the cell, releasing the connection if one was established.
    ///
    /// Idempotent: closing an already-closed or never-resolved cell is a
    /// no-op returning `Ok(())`.
    ///
    /// # Errors
    ///
    /// Returns [`BridgeError::TeardownFailed`] if the underlying connection
    /// close fails; the cell still transitions to closed.
    pub async fn close(&self) -> Result<(), BridgeError> {
        let mut state = self.state.lock().await;
        let previous = std::mem::replace(&mut *state, CellState::Closed);
        drop(state);

        if let CellState::Resolved(connection) = previous {
            debug!("closing broker connection");
            connection.close().await?;
        }
        Ok(())
    }
}

impl std::fmt::Debug for ConnectionCell {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionCell").finish_non_exhaustive()
    }
}
