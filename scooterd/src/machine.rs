//! The deterministic state machine.  Every replica feeds decided commands through [StateMachine],
//! so the scooter map is a pure function of the decided log prefix this replica has observed.

use std::collections::BTreeMap;
use std::sync::RwLock;

use biometrics::{Collector, Counter};
use serde::{Deserialize, Serialize};
use zerror_core::ErrorCore;

use scooter_pb::Error;

//////////////////////////////////////////// biometrics ////////////////////////////////////////////

static APPLY: Counter = Counter::new("scooterd.machine.apply");
static APPLY_REJECTED: Counter = Counter::new("scooterd.machine.apply.rejected");
static SNAPSHOT_TAKEN: Counter = Counter::new("scooterd.machine.snapshot.taken");
static SNAPSHOT_LOADED: Counter = Counter::new("scooterd.machine.snapshot.loaded");

pub fn register_biometrics(collector: &mut Collector) {
    collector.register_counter(&APPLY);
    collector.register_counter(&APPLY_REJECTED);
    collector.register_counter(&SNAPSHOT_TAKEN);
    collector.register_counter(&SNAPSHOT_LOADED);
}

////////////////////////////////////////////// Scooter /////////////////////////////////////////////

/// A rentable scooter.  `is_available` holds iff `reservation_id` is empty, and `total_distance`
/// never decreases.
#[derive(Clone, Debug, Default, Deserialize, PartialEq, Serialize)]
pub struct Scooter {
    pub id: String,
    pub is_available: bool,
    pub total_distance: f64,
    pub reservation_id: String,
}

////////////////////////////////////////////// Command /////////////////////////////////////////////

/// A command as carried through consensus:  a self-describing JSON blob the log treats as opaque
/// bytes and the state machine interprets.
#[derive(Clone, Debug, Deserialize, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Command {
    Create { id: String },
    Reserve { id: String, reservation_id: String },
    Release { id: String, distance: f64 },
    Noop,
}

impl Command {
    /// Encode this command for the log.
    pub fn encode(&self) -> Result<Vec<u8>, Error> {
        serde_json::to_vec(self).map_err(|err| Error::CodecError {
            core: ErrorCore::default(),
            what: err.to_string(),
        })
    }

    /// Decode command bytes pulled from the log.
    pub fn decode(buf: &[u8]) -> Result<Command, Error> {
        serde_json::from_slice(buf).map_err(|err| Error::CodecError {
            core: ErrorCore::default(),
            what: err.to_string(),
        })
    }
}

/////////////////////////////////////////// StateMachine ///////////////////////////////////////////

#[derive(Default)]
struct Inner {
    scooters: BTreeMap<String, Scooter>,
    snapshot_data: Vec<u8>,
    snapshot_index: i64,
}

/// The scooter state machine.  Apply and snapshot operations are writers; reads are readers.
pub struct StateMachine {
    inner: RwLock<Inner>,
}

impl StateMachine {
    pub fn new() -> Self {
        let inner = Inner {
            scooters: BTreeMap::new(),
            snapshot_data: Vec::new(),
            snapshot_index: -1,
        };
        Self {
            inner: RwLock::new(inner),
        }
    }

    /// Apply one decided command.  A domain error leaves the map untouched; the caller's slot is
    /// still consumed, which is the point:  every replica observes the same rejection.
    pub fn apply(&self, command: &[u8]) -> Result<(), Error> {
        APPLY.click();
        let command = Command::decode(command)?;
        let mut inner = self.inner.write().unwrap();
        let ret = Self::dispatch(&mut inner.scooters, command);
        if ret.is_err() {
            APPLY_REJECTED.click();
        }
        ret
    }

    fn dispatch(scooters: &mut BTreeMap<String, Scooter>, command: Command) -> Result<(), Error> {
        match command {
            Command::Create { id } => {
                if scooters.contains_key(&id) {
                    return Err(Error::AlreadyExists {
                        core: ErrorCore::default(),
                        id,
                    });
                }
                let scooter = Scooter {
                    id: id.clone(),
                    is_available: true,
                    total_distance: 0.0,
                    reservation_id: String::new(),
                };
                scooters.insert(id, scooter);
                Ok(())
            }
            Command::Reserve { id, reservation_id } => {
                let Some(scooter) = scooters.get_mut(&id) else {
                    return Err(Error::NotFound {
                        core: ErrorCore::default(),
                        id,
                    });
                };
                if !scooter.is_available {
                    return Err(Error::NotAvailable {
                        core: ErrorCore::default(),
                        id,
                    });
                }
                scooter.is_available = false;
                scooter.reservation_id = reservation_id;
                Ok(())
            }
            Command::Release { id, distance } => {
                if distance < 0.0 {
                    return Err(Error::InvalidDistance {
                        core: ErrorCore::default(),
                        distance,
                    });
                }
                let Some(scooter) = scooters.get_mut(&id) else {
                    return Err(Error::NotFound {
                        core: ErrorCore::default(),
                        id,
                    });
                };
                if scooter.is_available {
                    return Err(Error::NotReserved {
                        core: ErrorCore::default(),
                        id,
                    });
                }
                scooter.is_available = true;
                scooter.total_distance += distance;
                scooter.reservation_id = String::new();
                Ok(())
            }
            Command::Noop => Ok(()),
        }
    }

    /// A consistent read of one scooter.
    pub fn get_scooter(&self, id: &str) -> Option<Scooter> {
        self.inner.read().unwrap().scooters.get(id).cloned()
    }

    /// A consistent read of every scooter, in id order.
    pub fn scooters(&self) -> Vec<Scooter> {
        self.inner.read().unwrap().scooters.values().cloned().collect()
    }

    /// Capture a snapshot of the map as of log index `index`.  The serialization is a BTreeMap in
    /// key order, so two replicas with the same map produce identical bytes.
    pub fn take_snapshot(&self, index: i64) -> Result<(), Error> {
        let mut inner = self.inner.write().unwrap();
        let data = serde_json::to_vec(&inner.scooters).map_err(|err| Error::CodecError {
            core: ErrorCore::default(),
            what: err.to_string(),
        })?;
        inner.snapshot_data = data;
        inner.snapshot_index = index;
        SNAPSHOT_TAKEN.click();
        Ok(())
    }

    /// Replace the map with a snapshot pulled from a peer.
    pub fn load_snapshot(&self, data: &[u8], index: i64) -> Result<(), Error> {
        let scooters: BTreeMap<String, Scooter> =
            serde_json::from_slice(data).map_err(|err| Error::CodecError {
                core: ErrorCore::default(),
                what: err.to_string(),
            })?;
        let mut inner = self.inner.write().unwrap();
        inner.scooters = scooters;
        inner.snapshot_data = data.to_vec();
        inner.snapshot_index = index;
        SNAPSHOT_LOADED.click();
        Ok(())
    }

    /// The last captured snapshot.  The index is -1 when no snapshot has been taken.
    pub fn snapshot(&self) -> (Vec<u8>, i64) {
        let inner = self.inner.read().unwrap();
        (inner.snapshot_data.clone(), inner.snapshot_index)
    }
}

impl Default for StateMachine {
    fn default() -> Self {
        Self::new()
    }
}

/////////////////////////////////////////////// tests //////////////////////////////////////////////

#[cfg(test)]
mod tests {
    use super::*;

    fn apply(machine: &StateMachine, command: Command) -> Result<(), Error> {
        machine.apply(&command.encode().unwrap())
    }

    #[test]
    fn create_reserve_release() {
        let machine = StateMachine::new();
        apply(&machine, Command::Create { id: "x".to_owned() }).unwrap();
        let scooter = machine.get_scooter("x").unwrap();
        assert!(scooter.is_available);
        assert_eq!(0.0, scooter.total_distance);
        assert_eq!("", scooter.reservation_id);
        apply(
            &machine,
            Command::Reserve {
                id: "x".to_owned(),
                reservation_id: "r1".to_owned(),
            },
        )
        .unwrap();
        let scooter = machine.get_scooter("x").unwrap();
        assert!(!scooter.is_available);
        assert_eq!("r1", scooter.reservation_id);
        apply(
            &machine,
            Command::Release {
                id: "x".to_owned(),
                distance: 500.0,
            },
        )
        .unwrap();
        let scooter = machine.get_scooter("x").unwrap();
        assert!(scooter.is_available);
        assert_eq!(500.0, scooter.total_distance);
        assert_eq!("", scooter.reservation_id);
    }

    #[test]
    fn domain_errors_leave_the_map_alone() {
        let machine = StateMachine::new();
        apply(&machine, Command::Create { id: "x".to_owned() }).unwrap();
        let before = machine.scooters();
        let err = apply(&machine, Command::Create { id: "x".to_owned() }).unwrap_err();
        assert!(matches!(err, Error::AlreadyExists { .. }));
        let err = apply(
            &machine,
            Command::Release {
                id: "x".to_owned(),
                distance: 1.0,
            },
        )
        .unwrap_err();
        assert!(matches!(err, Error::NotReserved { .. }));
        let err = apply(
            &machine,
            Command::Reserve {
                id: "y".to_owned(),
                reservation_id: "r1".to_owned(),
            },
        )
        .unwrap_err();
        assert!(matches!(err, Error::NotFound { .. }));
        assert_eq!(before, machine.scooters());
    }

    #[test]
    fn double_reserve_rejected() {
        let machine = StateMachine::new();
        apply(&machine, Command::Create { id: "x".to_owned() }).unwrap();
        apply(
            &machine,
            Command::Reserve {
                id: "x".to_owned(),
                reservation_id: "r1".to_owned(),
            },
        )
        .unwrap();
        let err = apply(
            &machine,
            Command::Reserve {
                id: "x".to_owned(),
                reservation_id: "r2".to_owned(),
            },
        )
        .unwrap_err();
        assert!(matches!(err, Error::NotAvailable { .. }));
        assert_eq!("r1", machine.get_scooter("x").unwrap().reservation_id);
    }

    #[test]
    fn negative_distance_rejected() {
        let machine = StateMachine::new();
        apply(&machine, Command::Create { id: "x".to_owned() }).unwrap();
        apply(
            &machine,
            Command::Reserve {
                id: "x".to_owned(),
                reservation_id: "r1".to_owned(),
            },
        )
        .unwrap();
        let err = apply(
            &machine,
            Command::Release {
                id: "x".to_owned(),
                distance: -1.0,
            },
        )
        .unwrap_err();
        assert!(matches!(err, Error::InvalidDistance { .. }));
        assert!(!machine.get_scooter("x").unwrap().is_available);
    }

    #[test]
    fn malformed_bytes_are_an_error_not_a_panic() {
        let machine = StateMachine::new();
        let err = machine.apply(b"not json").unwrap_err();
        assert!(matches!(err, Error::CodecError { .. }));
    }

    #[test]
    fn distance_is_monotone() {
        let machine = StateMachine::new();
        apply(&machine, Command::Create { id: "x".to_owned() }).unwrap();
        let mut last = 0.0;
        for i in 0..10 {
            apply(
                &machine,
                Command::Reserve {
                    id: "x".to_owned(),
                    reservation_id: format!("r{}", i),
                },
            )
            .unwrap();
            apply(
                &machine,
                Command::Release {
                    id: "x".to_owned(),
                    distance: (i % 3) as f64,
                },
            )
            .unwrap();
            let total = machine.get_scooter("x").unwrap().total_distance;
            assert!(total >= last);
            last = total;
        }
    }

    #[test]
    fn snapshot_round_trips() {
        let machine = StateMachine::new();
        for id in ["a", "b", "c"] {
            apply(&machine, Command::Create { id: id.to_owned() }).unwrap();
        }
        apply(
            &machine,
            Command::Reserve {
                id: "b".to_owned(),
                reservation_id: "r1".to_owned(),
            },
        )
        .unwrap();
        machine.take_snapshot(3).unwrap();
        let before = machine.scooters();
        let (data, index) = machine.snapshot();
        assert_eq!(3, index);
        let restored = StateMachine::new();
        restored.load_snapshot(&data, index).unwrap();
        assert_eq!(before, restored.scooters());
        assert_eq!(3, restored.snapshot().1);
    }
}
