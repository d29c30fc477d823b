//! Registration ledger

use thiserror::Error;
use tracing::debug;

use crate::protocol::Envelope;

/// Protocol invariant violations
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum LedgerError {
    #[error("Deregister received with no active peers")]
    DeregisterWithoutPeers,
}

/// What a deregistration left behind
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Departure {
    /// Other peers are still registered
    Remaining(u64),
    /// The last peer left
    Drained,
}

/// Count of currently registered peers
#[derive(Debug, Default)]
pub struct Ledger {
    active: u64,
    peak: u64,
    registrations: u64,
}

impl Ledger {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn active(&self) -> u64 {
        self.active
    }

    /// Highest simultaneous peer count seen
    pub fn peak(&self) -> u64 {
        self.peak
    }

    /// Total registrations accepted over the ledger's lifetime
    pub fn registrations(&self) -> u64 {
        self.registrations
    }

    /// Record a registration and produce the acknowledgement to send back
    pub fn on_register(&mut self) -> Envelope {
        self.active += 1;
        self.registrations += 1;
        self.peak = self.peak.max(self.active);
        debug!(active = self.active, "Ledger::on_register: peer registered");
        Envelope::Ack
    }

    /// Record a deregistration; fails if nobody is registered
    pub fn on_deregister(&mut self) -> Result<Departure, LedgerError> {
        if self.active == 0 {
            return Err(LedgerError::DeregisterWithoutPeers);
        }
        self.active -= 1;
        debug!(active = self.active, "Ledger::on_deregister: peer left");

        if self.active == 0 {
            Ok(Departure::Drained)
        } else {
            Ok(Departure::Remaining(self.active))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_register_returns_ack() {
        let mut ledger = Ledger::new();
        assert_eq!(ledger.on_register(), Envelope::Ack);
        assert_eq!(ledger.active(), 1);
    }

    #[test]
    fn test_deregister_on_empty_ledger_fails() {
        let mut ledger = Ledger::new();
        assert_eq!(ledger.on_deregister(), Err(LedgerError::DeregisterWithoutPeers));
        assert_eq!(ledger.active(), 0);
    }

    #[test]
    fn test_two_peers_drain() {
        let mut ledger = Ledger::new();
        ledger.on_register();
        ledger.on_register();
        assert_eq!(ledger.on_deregister(), Ok(Departure::Remaining(1)));
        assert_eq!(ledger.on_deregister(), Ok(Departure::Drained));
        assert_eq!(ledger.peak(), 2);
        assert_eq!(ledger.registrations(), 2);
    }

    proptest! {
        #[test]
        fn prop_count_never_negative(ops in proptest::collection::vec(any::<bool>(), 0..200)) {
            let mut ledger = Ledger::new();
            let mut model: u64 = 0;

            for register in ops {
                if register {
                    ledger.on_register();
                    model += 1;
                } else {
                    let result = ledger.on_deregister();
                    if model == 0 {
                        prop_assert_eq!(result, Err(LedgerError::DeregisterWithoutPeers));
                    } else {
                        model -= 1;
                        prop_assert!(result.is_ok());
                        prop_assert_eq!(result.unwrap() == Departure::Drained, model == 0);
                    }
                }
                prop_assert_eq!(ledger.active(), model);
            }
        }
    }
}
