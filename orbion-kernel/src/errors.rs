use crate::bus::BusError;
use crate::dispatch::DispatchError;
use crate::models::{HostId, ObjectId};
use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

/// Erreurs visibles par l'appelant. Le timeout et l'annulation sont des
/// variantes distinctes et rattrapables, jamais confondues avec une panne dure.
#[derive(Debug, Error)]
pub enum Error {
    #[error("operation timed out")]
    Timeout,

    #[error("operation cancelled")]
    Cancelled,

    #[error(transparent)]
    Bus(#[from] BusError),

    #[error(transparent)]
    Dispatch(#[from] DispatchError),

    #[error("unknown cloud object {0}")]
    UnknownObject(ObjectId),

    #[error("unknown host {0}")]
    UnknownHost(HostId),

    #[error("host is not online")]
    HostOffline,

    #[error("host startup failed: {0}")]
    HostStartup(String),

    #[error("migration failed: {0}")]
    Migration(String),

    #[error("remote error: {0}")]
    Remote(String),

    #[error("invalid state: {0}")]
    InvalidState(String),
}

impl Error {
    /// Vrai pour les erreurs de délai uniquement : le timeout est un signal
    /// distinct, pas une panne dure.
    pub fn is_timeout(&self) -> bool {
        matches!(self, Error::Timeout | Error::Bus(BusError::Timeout))
    }
}
