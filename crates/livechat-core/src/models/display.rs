use serde::{Deserialize, Serialize};

use crate::models::Record;

/// Delivery state of a rendered record.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum Delivery {
    /// Present in the store's latest snapshot
    Confirmed,
    /// Optimistic echo, write in flight or acknowledged but not yet in a snapshot
    Pending,
    /// Optimistic echo the store never confirmed. Stays visible until removed or resubmitted.
    Failed(String),
}

impl Delivery {
    pub fn label(&self) -> &'static str {
        match self {
            Self::Confirmed => "sent",
            Self::Pending => "sending",
            Self::Failed(_) => "failed",
        }
    }
}

/// The unit published to observers: a record plus how far it got.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct DisplayRecord {
    pub record: Record,
    pub delivery: Delivery,
}

impl DisplayRecord {
    pub fn confirmed(record: Record) -> Self {
        Self {
            record,
            delivery: Delivery::Confirmed,
        }
    }

    pub fn id(&self) -> &str {
        &self.record.id
    }

    pub fn is_confirmed(&self) -> bool {
        self.delivery == Delivery::Confirmed
    }

    pub fn is_failed(&self) -> bool {
        matches!(self.delivery, Delivery::Failed(_))
    }
}
