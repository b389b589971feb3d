use std::sync::{Mutex, MutexGuard};

/// One ticketed event: a rectangular seat grid plus its reservation counter.
///
/// The grid is a dense row-major slab of mutex-wrapped cells, so concurrent
/// reservations over disjoint seat sets never contend. The slab is owned by
/// the event and lives exactly as long as it does. A seat holds 0 while free
/// and the claiming reservation id once stamped.
pub struct Event {
    pub id: u32,
    pub rows: usize,
    pub cols: usize,
    reservations: Mutex<u32>,
    seats: Vec<Mutex<u32>>,
}

impl Event {
    pub(crate) fn new(id: u32, rows: usize, cols: usize) -> Self {
        Self {
            id,
            rows,
            cols,
            reservations: Mutex::new(0),
            seats: (0..rows * cols).map(|_| Mutex::new(0)).collect(),
        }
    }

    /// Row-major index of a 1-based (row, col) coordinate.
    pub(crate) fn seat_index(&self, row: usize, col: usize) -> usize {
        (row - 1) * self.cols + (col - 1)
    }

    pub(crate) fn in_bounds(&self, row: usize, col: usize) -> bool {
        (1..=self.rows).contains(&row) && (1..=self.cols).contains(&col)
    }

    pub(crate) fn lock_seat(&self, index: usize) -> MutexGuard<'_, u32> {
        self.seats[index].lock().unwrap()
    }

    /// Advance the per-event counter and return the fresh reservation id.
    pub(crate) fn next_reservation_id(&self) -> u32 {
        let mut count = self.reservations.lock().unwrap();
        *count += 1;
        *count
    }

    pub(crate) fn reservation_count(&self) -> u32 {
        *self.reservations.lock().unwrap()
    }

    /// Single-instant snapshot of the whole grid: every seat mutex is held
    /// at once, in index order, before any value is copied out.
    pub(crate) fn snapshot(&self) -> SeatGrid {
        let guards: Vec<_> = self.seats.iter().map(|seat| seat.lock().unwrap()).collect();
        SeatGrid {
            rows: self.rows,
            cols: self.cols,
            seats: guards.iter().map(|guard| **guard).collect(),
        }
    }
}

/// The grid state returned by SHOW: row-major seat values, 0 for free.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SeatGrid {
    pub rows: usize,
    pub cols: usize,
    pub seats: Vec<u32>,
}

impl SeatGrid {
    /// Value of the 1-based (row, col) seat.
    pub fn seat(&self, row: usize, col: usize) -> u32 {
        self.seats[(row - 1) * self.cols + (col - 1)]
    }
}
