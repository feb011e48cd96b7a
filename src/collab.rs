//! Post-commit collaborators: loyalty accrual and guest email. These run
//! after the reservation transaction has committed; their outcome is logged
//! and discarded, never surfaced to the caller and never rolled back into
//! the triggering operation.

use std::sync::Arc;

use async_trait::async_trait;
use tracing::warn;

use crate::model::Reservation;

pub type CollabError = Box<dyn std::error::Error + Send + Sync>;

#[async_trait]
pub trait LoyaltyProgram: Send + Sync {
    /// Accrue points for a completed stay.
    async fn accrue_stay(&self, reservation: &Reservation) -> Result<(), CollabError>;
}

#[async_trait]
pub trait GuestMailer: Send + Sync {
    async fn reservation_created(&self, reservation: &Reservation) -> Result<(), CollabError>;
    async fn reservation_cancelled(&self, reservation: &Reservation) -> Result<(), CollabError>;
}

pub struct NoopLoyalty;

#[async_trait]
impl LoyaltyProgram for NoopLoyalty {
    async fn accrue_stay(&self, _reservation: &Reservation) -> Result<(), CollabError> {
        Ok(())
    }
}

pub struct NoopMailer;

#[async_trait]
impl GuestMailer for NoopMailer {
    async fn reservation_created(&self, _reservation: &Reservation) -> Result<(), CollabError> {
        Ok(())
    }

    async fn reservation_cancelled(&self, _reservation: &Reservation) -> Result<(), CollabError> {
        Ok(())
    }
}

/// The collaborator bundle handed to the engine. Dispatch helpers spawn the
/// call and log failures; the `Result` is discarded on purpose.
pub struct Collaborators {
    pub loyalty: Arc<dyn LoyaltyProgram>,
    pub mailer: Arc<dyn GuestMailer>,
}

impl Collaborators {
    pub fn new(loyalty: Arc<dyn LoyaltyProgram>, mailer: Arc<dyn GuestMailer>) -> Arc<Self> {
        Arc::new(Self { loyalty, mailer })
    }

    pub fn noop() -> Arc<Self> {
        Self::new(Arc::new(NoopLoyalty), Arc::new(NoopMailer))
    }

    pub fn dispatch_created(&self, reservation: &Reservation) {
        let mailer = self.mailer.clone();
        let reservation = reservation.clone();
        tokio::spawn(async move {
            if let Err(e) = mailer.reservation_created(&reservation).await {
                warn!(reservation = %reservation.id, "create mail failed, continuing: {e}");
            }
        });
    }

    pub fn dispatch_cancelled(&self, reservation: &Reservation) {
        let mailer = self.mailer.clone();
        let reservation = reservation.clone();
        tokio::spawn(async move {
            if let Err(e) = mailer.reservation_cancelled(&reservation).await {
                warn!(reservation = %reservation.id, "cancel mail failed, continuing: {e}");
            }
        });
    }

    pub fn dispatch_stay_completed(&self, reservation: &Reservation) {
        let loyalty = self.loyalty.clone();
        let reservation = reservation.clone();
        tokio::spawn(async move {
            if let Err(e) = loyalty.accrue_stay(&reservation).await {
                warn!(reservation = %reservation.id, "loyalty accrual failed, continuing: {e}");
            }
        });
    }
}
