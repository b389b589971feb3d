//! The reservation engine: an insertion-ordered event catalog behind a
//! reader/writer lock, with per-event seat mutexes for fine-grained claims.
//!
//! Locking discipline: the catalog lock covers lookup and append only; seat
//! work happens on a cloned event handle after the catalog lock is released.
//! Every operation that takes more than one seat mutex takes them in
//! ascending seat-index order, which is what makes overlapping concurrent
//! reservations deadlock-free.

mod event;

use std::fmt::Write as _;
use std::sync::{Arc, RwLock};
use std::time::Duration;

use thiserror::Error;

pub use event::{Event, SeatGrid};

#[derive(Debug, Error, PartialEq, Eq)]
pub enum EmsError {
    #[error("event {0} already exists")]
    DuplicateEvent(u32),
    #[error("event {0} not found")]
    EventNotFound(u32),
    #[error("event dimensions must be at least 1x1")]
    InvalidDimensions,
    #[error("seat ({0}, {1}) is out of bounds")]
    SeatOutOfBounds(usize, usize),
    #[error("seat ({0}, {1}) requested more than once")]
    DuplicateSeat(usize, usize),
    #[error("seat ({0}, {1}) is already reserved")]
    SeatTaken(usize, usize),
}

/// The engine value. One per process, shared by handle; owns the catalog
/// and the configured access delay.
pub struct Ems {
    catalog: RwLock<Vec<Arc<Event>>>,
    access_delay: Duration,
}

impl Ems {
    pub fn new(access_delay_us: u64) -> Self {
        Self {
            catalog: RwLock::new(Vec::new()),
            access_delay: Duration::from_micros(access_delay_us),
        }
    }

    /// Simulates a costly memory-hierarchy access around catalog scans.
    /// A no-op at the default of zero.
    fn pause(&self) {
        if !self.access_delay.is_zero() {
            std::thread::sleep(self.access_delay);
        }
    }

    /// Catalog lookup under the read lock. Returns a handle so seat work
    /// happens with the catalog lock released.
    fn find(&self, event_id: u32) -> Result<Arc<Event>, EmsError> {
        let catalog = self.catalog.read().unwrap();
        self.pause();
        catalog
            .iter()
            .find(|event| event.id == event_id)
            .cloned()
            .ok_or(EmsError::EventNotFound(event_id))
    }

    /// Create a new event with a zero-filled seat grid. The event becomes
    /// visible to all lookups as soon as the catalog lock is released.
    pub fn create(&self, event_id: u32, rows: usize, cols: usize) -> Result<(), EmsError> {
        if rows == 0 || cols == 0 || rows.checked_mul(cols).is_none() {
            return Err(EmsError::InvalidDimensions);
        }
        let mut catalog = self.catalog.write().unwrap();
        self.pause();
        if catalog.iter().any(|event| event.id == event_id) {
            return Err(EmsError::DuplicateEvent(event_id));
        }
        catalog.push(Arc::new(Event::new(event_id, rows, cols)));
        Ok(())
    }

    /// Atomically claim a set of distinct seats under one fresh reservation
    /// id. Either every listed seat is stamped and the event's counter
    /// advances by exactly one, or nothing changes and an error is returned.
    pub fn reserve(&self, event_id: u32, coords: &[(usize, usize)]) -> Result<u32, EmsError> {
        let event = self.find(event_id)?;

        // Sorting imposes the total order on seat mutexes; a duplicate pair
        // would stamp the same slot twice, so it is rejected here before any
        // seat is examined.
        let mut seats = coords.to_vec();
        seats.sort_unstable();
        for pair in seats.windows(2) {
            if pair[0] == pair[1] {
                return Err(EmsError::DuplicateSeat(pair[0].0, pair[0].1));
            }
        }
        // An out-of-range coordinate has no mutex to take, so range is
        // checked before any lock is acquired. No state has been touched yet.
        for &(row, col) in &seats {
            if !event.in_bounds(row, col) {
                return Err(EmsError::SeatOutOfBounds(row, col));
            }
        }

        let mut guards = Vec::with_capacity(seats.len());
        for &(row, col) in &seats {
            guards.push(event.lock_seat(event.seat_index(row, col)));
        }
        for (guard, &(row, col)) in guards.iter().zip(&seats) {
            if **guard != 0 {
                // Dropping the guards releases every held seat untouched.
                return Err(EmsError::SeatTaken(row, col));
            }
        }

        let reservation_id = event.next_reservation_id();
        for guard in &mut guards {
            **guard = reservation_id;
        }
        Ok(reservation_id)
    }

    /// Snapshot of an event's grid as of a single instant.
    pub fn show(&self, event_id: u32) -> Result<SeatGrid, EmsError> {
        let event = self.find(event_id)?;
        Ok(event.snapshot())
    }

    /// Event ids in insertion order.
    pub fn list(&self) -> Vec<u32> {
        let catalog = self.catalog.read().unwrap();
        self.pause();
        catalog.iter().map(|event| event.id).collect()
    }

    /// Current reservation counter of an event. Diagnostic accessor.
    pub fn reservation_count(&self, event_id: u32) -> Result<u32, EmsError> {
        Ok(self.find(event_id)?.reservation_count())
    }

    /// Render every event's id and grid for the diagnostic dump. Runs under
    /// the catalog read lock; each grid is a per-event atomic snapshot.
    pub fn dump_state(&self) -> String {
        let catalog = self.catalog.read().unwrap();
        if catalog.is_empty() {
            return "No Events\n".to_string();
        }
        let mut out = String::new();
        for event in catalog.iter() {
            let grid = event.snapshot();
            let _ = writeln!(out, "Event id: {}", event.id);
            for row in 1..=grid.rows {
                let line: Vec<String> = (1..=grid.cols)
                    .map(|col| grid.seat(row, col).to_string())
                    .collect();
                let _ = writeln!(out, "{}", line.join(" "));
            }
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn create_then_show_empty_grid() {
        let ems = Ems::new(0);
        ems.create(1, 2, 2).unwrap();
        let grid = ems.show(1).unwrap();
        assert_eq!(grid.rows, 2);
        assert_eq!(grid.cols, 2);
        assert_eq!(grid.seats, vec![0, 0, 0, 0]);
    }

    #[test]
    fn duplicate_create_is_rejected() {
        let ems = Ems::new(0);
        ems.create(1, 2, 2).unwrap();
        assert_eq!(ems.create(1, 3, 3), Err(EmsError::DuplicateEvent(1)));
        // The existing grid is untouched.
        assert_eq!(ems.show(1).unwrap().rows, 2);
    }

    #[test]
    fn zero_dimension_is_rejected() {
        let ems = Ems::new(0);
        assert_eq!(ems.create(1, 0, 3), Err(EmsError::InvalidDimensions));
        assert_eq!(ems.create(1, 3, 0), Err(EmsError::InvalidDimensions));
        assert_eq!(ems.show(1), Err(EmsError::EventNotFound(1)));
    }

    #[test]
    fn reserve_stamps_all_listed_seats() {
        let ems = Ems::new(0);
        ems.create(7, 2, 3).unwrap();
        ems.reserve(7, &[(1, 1), (1, 2), (2, 3)]).unwrap();
        let grid = ems.show(7).unwrap();
        assert_eq!(grid.seats, vec![1, 1, 0, 0, 0, 1]);
    }

    #[test]
    fn duplicate_seat_rolls_back_completely() {
        let ems = Ems::new(0);
        ems.create(7, 2, 3).unwrap();
        assert_eq!(
            ems.reserve(7, &[(1, 1), (1, 1)]),
            Err(EmsError::DuplicateSeat(1, 1))
        );
        assert_eq!(ems.show(7).unwrap().seats, vec![0; 6]);
        assert_eq!(ems.reservation_count(7).unwrap(), 0);
    }

    #[test]
    fn out_of_bounds_rolls_back_completely() {
        let ems = Ems::new(0);
        ems.create(3, 2, 2).unwrap();
        assert_eq!(
            ems.reserve(3, &[(1, 1), (3, 1)]),
            Err(EmsError::SeatOutOfBounds(3, 1))
        );
        assert_eq!(
            ems.reserve(3, &[(0, 1)]),
            Err(EmsError::SeatOutOfBounds(0, 1))
        );
        assert_eq!(ems.show(3).unwrap().seats, vec![0; 4]);
        assert_eq!(ems.reservation_count(3).unwrap(), 0);
    }

    #[test]
    fn taken_seat_fails_without_partial_stamp() {
        let ems = Ems::new(0);
        ems.create(1, 1, 1).unwrap();
        assert_eq!(ems.reserve(1, &[(1, 1)]), Ok(1));
        assert_eq!(ems.reserve(1, &[(1, 1)]), Err(EmsError::SeatTaken(1, 1)));
        assert_eq!(ems.reservation_count(1).unwrap(), 1);
    }

    #[test]
    fn overlapping_reserve_leaves_first_claim_intact() {
        let ems = Ems::new(0);
        ems.create(1, 2, 2).unwrap();
        let first = ems.reserve(1, &[(1, 1), (1, 2)]).unwrap();
        assert_eq!(
            ems.reserve(1, &[(1, 2), (2, 1)]),
            Err(EmsError::SeatTaken(1, 2))
        );
        let grid = ems.show(1).unwrap();
        assert_eq!(grid.seat(1, 1), first);
        assert_eq!(grid.seat(1, 2), first);
        assert_eq!(grid.seat(2, 1), 0);
        assert_eq!(grid.seat(2, 2), 0);
    }

    #[test]
    fn reservation_ids_are_dense_and_increasing() {
        let ems = Ems::new(0);
        ems.create(1, 3, 3).unwrap();
        assert_eq!(ems.reserve(1, &[(1, 1)]), Ok(1));
        assert_eq!(ems.reserve(1, &[(2, 2)]), Ok(2));
        assert_eq!(ems.reserve(1, &[(3, 3)]), Ok(3));
        assert_eq!(ems.reservation_count(1).unwrap(), 3);
    }

    #[test]
    fn unknown_event_is_not_found() {
        let ems = Ems::new(0);
        assert_eq!(ems.show(9), Err(EmsError::EventNotFound(9)));
        assert_eq!(ems.reserve(9, &[(1, 1)]), Err(EmsError::EventNotFound(9)));
    }

    #[test]
    fn list_preserves_insertion_order() {
        let ems = Ems::new(0);
        assert!(ems.list().is_empty());
        ems.create(3, 1, 1).unwrap();
        ems.create(1, 1, 1).unwrap();
        ems.create(2, 1, 1).unwrap();
        assert_eq!(ems.list(), vec![3, 1, 2]);
    }

    #[test]
    fn dump_renders_grids_row_by_row() {
        let ems = Ems::new(0);
        assert_eq!(ems.dump_state(), "No Events\n");
        ems.create(7, 2, 3).unwrap();
        ems.reserve(7, &[(1, 1), (1, 2), (2, 3)]).unwrap();
        assert_eq!(ems.dump_state(), "Event id: 7\n1 1 0\n0 0 1\n");
    }

    #[test]
    fn access_delay_does_not_change_results() {
        let ems = Ems::new(50);
        ems.create(1, 1, 2).unwrap();
        assert_eq!(ems.reserve(1, &[(1, 1)]), Ok(1));
        assert_eq!(ems.show(1).unwrap().seats, vec![1, 0]);
    }
}
