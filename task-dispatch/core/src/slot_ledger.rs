// Copyright 2025 Umberto Gotti <umberto.gotti@umbertogotti.dev>
// Licensed under the Apache License, Version 2.0
// http://www.apache.org/licenses/LICENSE-2.0

use crate::error::ProtocolError;

/// Who currently owns a slot of the shared buffer
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SlotState {
    /// Coordinator may write the next item here
    Free,
    /// A worker owns the slot and is computing `index`
    InFlight { index: usize },
    /// Result for `index` is back; the caller holds it until the slot is released
    Completed { index: usize },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SlotEvent {
    Assigned { slot: usize, index: usize },
    Completed { slot: usize, index: usize },
    Released { slot: usize, index: usize },
}

/// Coordinator-side record of slot ownership.
///
/// A slot cycles `Free -> InFlight -> Completed -> Free`; any other transition is a
/// protocol error. Free slots are handed out lowest first.
#[derive(Debug, Clone)]
pub struct SlotLedger {
    slots: Vec<SlotState>,
    history: Vec<SlotEvent>,
}

impl SlotLedger {
    pub fn new(slot_count: usize) -> Self {
        Self {
            slots: vec![SlotState::Free; slot_count],
            history: Vec::new(),
        }
    }

    pub fn slot_count(&self) -> usize {
        self.slots.len()
    }

    pub fn free_slot(&self) -> Option<usize> {
        self.slots.iter().position(|s| *s == SlotState::Free)
    }

    pub fn in_flight(&self) -> usize {
        self.slots
            .iter()
            .filter(|s| matches!(s, SlotState::InFlight { .. }))
            .count()
    }

    /// Every ownership change, in order
    pub fn history(&self) -> &[SlotEvent] {
        &self.history
    }

    pub fn assign(&mut self, slot: usize, index: usize) -> Result<(), ProtocolError> {
        let state = self.slot_entry(slot)?;
        match *state {
            SlotState::Free => *state = SlotState::InFlight { index },
            SlotState::InFlight { index: occupant } | SlotState::Completed { index: occupant } => {
                return Err(ProtocolError::SlotBusy { slot, occupant })
            }
        }
        self.history.push(SlotEvent::Assigned { slot, index });
        Ok(())
    }

    pub fn complete(&mut self, slot: usize, index: usize) -> Result<(), ProtocolError> {
        let state = self.slot_entry(slot)?;
        match *state {
            SlotState::InFlight { index: held } if held == index => {
                *state = SlotState::Completed { index };
            }
            SlotState::InFlight { index: held } | SlotState::Completed { index: held } => {
                return Err(ProtocolError::SlotMismatch {
                    slot,
                    reported: index,
                    held: Some(held),
                })
            }
            SlotState::Free => {
                return Err(ProtocolError::SlotMismatch {
                    slot,
                    reported: index,
                    held: None,
                })
            }
        }
        self.history.push(SlotEvent::Completed { slot, index });
        Ok(())
    }

    /// Hands a completed slot back to the coordinator for the next item
    pub fn release(&mut self, slot: usize) -> Result<usize, ProtocolError> {
        let state = self.slot_entry(slot)?;
        match *state {
            SlotState::Completed { index } => {
                *state = SlotState::Free;
                self.history.push(SlotEvent::Released { slot, index });
                Ok(index)
            }
            SlotState::InFlight { index } => Err(ProtocolError::SlotBusy {
                slot,
                occupant: index,
            }),
            SlotState::Free => Err(ProtocolError::SlotMismatch {
                slot,
                reported: slot,
                held: None,
            }),
        }
    }

    fn slot_entry(&mut self, slot: usize) -> Result<&mut SlotState, ProtocolError> {
        let slots = self.slots.len();
        self.slots
            .get_mut(slot)
            .ok_or(ProtocolError::InvalidSlot { slot, slots })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_liveness_slot_cycles_back_to_free() {
        let mut ledger = SlotLedger::new(2);
        assert_eq!(ledger.free_slot(), Some(0));
        ledger.assign(0, 0).unwrap();
        ledger.assign(1, 1).unwrap();
        assert_eq!(ledger.free_slot(), None);
        assert_eq!(ledger.in_flight(), 2);

        ledger.complete(1, 1).unwrap();
        assert_eq!(ledger.free_slot(), None);
        assert_eq!(ledger.release(1), Ok(1));
        assert_eq!(ledger.free_slot(), Some(1));

        ledger.assign(1, 2).unwrap();
        assert_eq!(
            ledger.history(),
            &[
                SlotEvent::Assigned { slot: 0, index: 0 },
                SlotEvent::Assigned { slot: 1, index: 1 },
                SlotEvent::Completed { slot: 1, index: 1 },
                SlotEvent::Released { slot: 1, index: 1 },
                SlotEvent::Assigned { slot: 1, index: 2 },
            ]
        );
    }

    #[test]
    fn test_safety_slot_not_reused_before_release() {
        let mut ledger = SlotLedger::new(1);
        ledger.assign(0, 0).unwrap();
        assert_eq!(
            ledger.assign(0, 1),
            Err(ProtocolError::SlotBusy {
                slot: 0,
                occupant: 0
            })
        );

        ledger.complete(0, 0).unwrap();
        assert_eq!(
            ledger.assign(0, 1),
            Err(ProtocolError::SlotBusy {
                slot: 0,
                occupant: 0
            })
        );
    }

    #[test]
    fn test_safety_completion_must_match_occupant() {
        let mut ledger = SlotLedger::new(2);
        ledger.assign(0, 4).unwrap();
        assert_eq!(
            ledger.complete(0, 5),
            Err(ProtocolError::SlotMismatch {
                slot: 0,
                reported: 5,
                held: Some(4)
            })
        );
        assert_eq!(
            ledger.complete(1, 0),
            Err(ProtocolError::SlotMismatch {
                slot: 1,
                reported: 0,
                held: None
            })
        );
        assert_eq!(
            ledger.complete(7, 0),
            Err(ProtocolError::InvalidSlot { slot: 7, slots: 2 })
        );
    }

    #[test]
    fn test_safety_in_flight_slot_cannot_be_released() {
        let mut ledger = SlotLedger::new(1);
        ledger.assign(0, 3).unwrap();
        assert_eq!(
            ledger.release(0),
            Err(ProtocolError::SlotBusy {
                slot: 0,
                occupant: 3
            })
        );
    }
}
