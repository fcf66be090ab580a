/// Presence counting engine.
///
/// Capture callbacks call [`PresenceCounter::add_observation`] directly from
/// radio context; the scheduler calls [`PresenceCounter::reset_cycle`] at the
/// end of a counting cycle. Both take a short critical section around the
/// whole read-modify-write, so a reset can never interleave with an insert.
use core::cell::RefCell;

use critical_section::Mutex;
use heapless::index_set::FnvIndexSet;
use serde::Serialize;

use crate::config::CountFilter;
use crate::defaults::DEDUP_CAPACITY;
use crate::error::CountError;
use crate::filter;
use crate::hash::{AnonymizedId, MacHasher};
use crate::salt::{Salt, SaltManager, SaltSource};
use crate::scanner::{LinkType, RawObservation};

/// Ids seen this cycle for one link type.
pub type DedupSet = FnvIndexSet<u16, DEDUP_CAPACITY>;

/// Snapshot of the live counts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
pub struct Counters {
    pub wifi: u16,
    pub ble: u16,
    pub total: u16,
}

struct CycleState {
    salt: SaltManager,
    wifi: DedupSet,
    ble: DedupSet,
    filter: CountFilter,
}

impl CycleState {
    fn set_for(&mut self, link: LinkType) -> &mut DedupSet {
        match link {
            LinkType::Wifi => &mut self.wifi,
            LinkType::Ble => &mut self.ble,
        }
    }

    fn counters(&self) -> Counters {
        let wifi = self.wifi.len() as u16;
        let ble = self.ble.len() as u16;
        Counters {
            wifi,
            ble,
            total: wifi + ble,
        }
    }
}

/// Salt, hasher and per-link dedup sets behind one critical section.
pub struct PresenceCounter {
    hasher: MacHasher,
    state: Mutex<RefCell<CycleState>>,
}

impl PresenceCounter {
    pub const fn new(initial_salt: Salt, filter: CountFilter) -> Self {
        Self {
            hasher: MacHasher,
            state: Mutex::new(RefCell::new(CycleState {
                salt: SaltManager::new(initial_salt),
                wifi: FnvIndexSet::new(),
                ble: FnvIndexSet::new(),
                filter,
            })),
        }
    }

    /// Count an observation. Returns whether the device is new this cycle.
    ///
    /// Filtered observations return `Ok(false)`. A full dedup set returns
    /// [`CountError::CapacityExhausted`] and the observation is not counted.
    pub fn add_observation(&self, obs: &RawObservation) -> Result<bool, CountError> {
        critical_section::with(|cs| {
            let mut state = self.state.borrow_ref_mut(cs);
            if filter::admit(obs, &state.filter).is_err() {
                return Ok(false);
            }

            let AnonymizedId(id) = self.hasher.anonymize(&obs.address, state.salt.current());
            let set = state.set_for(obs.link);
            match set.insert(id) {
                Ok(is_new) => {
                    if is_new {
                        log::trace!("new {} id {:04X}", obs.link.as_str(), id);
                    }
                    Ok(is_new)
                }
                Err(_) => Err(CountError::CapacityExhausted {
                    capacity: DEDUP_CAPACITY,
                }),
            }
        })
    }

    /// Start a new counting cycle: clear both sets and draw a fresh salt.
    pub fn reset_cycle(&self, rng: &mut impl SaltSource) {
        let salt = critical_section::with(|cs| {
            let mut state = self.state.borrow_ref_mut(cs);
            state.wifi.clear();
            state.ble.clear();
            state.salt.rotate(rng)
        });
        log::info!("Counting cycle reset, salt {:04X}", salt.0);
    }

    pub fn counts(&self) -> Counters {
        critical_section::with(|cs| self.state.borrow_ref(cs).counters())
    }

    pub fn salt(&self) -> Salt {
        critical_section::with(|cs| self.state.borrow_ref(cs).salt.current())
    }

    /// Whether either dedup set has no room left.
    pub fn is_saturated(&self) -> bool {
        critical_section::with(|cs| {
            let state = self.state.borrow_ref(cs);
            state.wifi.len() == DEDUP_CAPACITY || state.ble.len() == DEDUP_CAPACITY
        })
    }

    pub fn filter(&self) -> CountFilter {
        critical_section::with(|cs| self.state.borrow_ref(cs).filter)
    }

    pub fn set_filter(&self, filter: CountFilter) {
        critical_section::with(|cs| self.state.borrow_ref_mut(cs).filter = filter);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::salt::XorShiftSalt;

    const A1: [u8; 6] = [0xAC, 0xBC, 0x32, 0x11, 0x22, 0x33];
    const A2: [u8; 6] = [0x7A, 0x01, 0x02, 0x03, 0x04, 0x05];

    struct Sequence(u16);

    impl SaltSource for Sequence {
        fn next_salt(&mut self) -> Salt {
            self.0 = self.0.wrapping_add(1);
            Salt(self.0)
        }
    }

    fn counter() -> PresenceCounter {
        PresenceCounter::new(Salt(0x1234), CountFilter::new())
    }

    fn wifi(address: [u8; 6], rssi: i8) -> RawObservation {
        RawObservation::new(address, rssi, LinkType::Wifi)
    }

    fn ble(address: [u8; 6], rssi: i8) -> RawObservation {
        RawObservation::new(address, rssi, LinkType::Ble)
    }

    #[test]
    fn repeat_observation_is_idempotent() {
        let c = counter();
        assert_eq!(c.add_observation(&wifi(A1, -50)), Ok(true));
        let after_first = c.counts();
        assert_eq!(after_first.wifi, 1);

        for _ in 0..5 {
            assert_eq!(c.add_observation(&wifi(A1, -50)), Ok(false));
        }
        assert_eq!(c.counts(), after_first);
    }

    #[test]
    fn rssi_filter_spares_ble() {
        let c = PresenceCounter::new(
            Salt(1),
            CountFilter {
                rssi_limit: Some(-60),
                ..CountFilter::new()
            },
        );
        assert_eq!(c.add_observation(&wifi(A1, -40)), Ok(true));
        assert_eq!(c.add_observation(&ble(A2, -70)), Ok(true));
        assert_eq!(
            c.counts(),
            Counters {
                wifi: 1,
                ble: 1,
                total: 2
            }
        );
    }

    #[test]
    fn weak_wifi_is_not_counted() {
        let c = PresenceCounter::new(
            Salt(1),
            CountFilter {
                rssi_limit: Some(-60),
                ..CountFilter::new()
            },
        );
        assert_eq!(c.add_observation(&wifi(A1, -75)), Ok(false));
        assert_eq!(c.counts(), Counters::default());
    }

    #[test]
    fn same_wifi_address_twice_counts_once() {
        let c = counter();
        c.add_observation(&wifi(A1, -50)).unwrap();
        c.add_observation(&wifi(A1, -45)).unwrap();
        assert_eq!(c.counts().wifi, 1);
        assert_eq!(c.counts().total, 1);
    }

    #[test]
    fn reset_between_observations_counts_each_cycle() {
        let c = counter();
        let mut rng = Sequence(0);

        assert_eq!(c.add_observation(&wifi(A1, -50)), Ok(true));
        assert_eq!(c.counts().wifi, 1);

        c.reset_cycle(&mut rng);
        assert_eq!(c.counts(), Counters::default());

        assert_eq!(c.add_observation(&wifi(A1, -50)), Ok(true));
        assert_eq!(c.counts().wifi, 1);
    }

    #[test]
    fn reset_always_empties() {
        let c = counter();
        let mut rng = XorShiftSalt::new(7);
        for i in 0..40u8 {
            let _ = c.add_observation(&wifi([0x02, 0, 0, 0, 1, i], -50));
            let _ = c.add_observation(&ble([0x42, 0, 0, 0, 2, i], -50));
        }
        assert!(c.counts().total > 0);
        c.reset_cycle(&mut rng);
        assert_eq!(c.counts(), Counters::default());
        // Resetting an empty counter is fine too
        c.reset_cycle(&mut rng);
        assert_eq!(c.counts(), Counters::default());
    }

    #[test]
    fn reset_rotates_salt() {
        let c = counter();
        let before = c.salt();
        c.reset_cycle(&mut Sequence(0x4000));
        assert_ne!(c.salt(), before);
        assert_eq!(c.salt(), Salt(0x4001));
    }

    #[test]
    fn link_types_are_counted_separately() {
        let c = counter();
        // Same address on both links shows up once per link
        assert_eq!(c.add_observation(&wifi(A1, -50)), Ok(true));
        assert_eq!(c.add_observation(&ble(A1, -50)), Ok(true));
        assert_eq!(
            c.counts(),
            Counters {
                wifi: 1,
                ble: 1,
                total: 2
            }
        );
    }

    #[test]
    fn total_matches_set_sizes() {
        let c = counter();
        for i in 0..100u8 {
            let _ = c.add_observation(&wifi([0x02, 0, 0, 0, 1, i], -50));
        }
        for i in 0..30u8 {
            let _ = c.add_observation(&ble([0x42, 0, 0, 0, 2, i], -50));
        }
        let counts = c.counts();
        assert_eq!(counts.total, counts.wifi + counts.ble);
        // A handful of 16-bit collisions at most
        assert!(counts.wifi >= 95);
        assert!(counts.ble >= 28);
    }

    #[test]
    fn full_set_reports_exhaustion() {
        let c = counter();
        let mut i = 0u32;
        let mut exhausted = false;
        while i < 200_000 {
            let b = i.to_be_bytes();
            match c.add_observation(&wifi([0x02, 0x00, b[0], b[1], b[2], b[3]], -50)) {
                Ok(_) => {}
                Err(e) => {
                    assert_eq!(
                        e,
                        CountError::CapacityExhausted {
                            capacity: DEDUP_CAPACITY
                        }
                    );
                    exhausted = true;
                    break;
                }
            }
            i += 1;
        }
        assert!(exhausted);
        assert!(c.is_saturated());
        assert_eq!(c.counts().wifi as usize, DEDUP_CAPACITY);
    }

    #[test]
    fn filter_can_be_replaced() {
        let c = counter();
        let mut f = c.filter();
        f.wifi_enabled = false;
        c.set_filter(f);
        assert_eq!(c.add_observation(&wifi(A1, -50)), Ok(false));
        assert_eq!(c.filter(), f);
    }
}
