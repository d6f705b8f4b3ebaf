//! Server message ids and validation of client ones.

use std::sync::atomic::{AtomicI64, Ordering};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

/// Issues strictly increasing server message ids.
///
/// An id is `unix_time * 2^32` plus the sub-second fraction, rounded down
/// to a multiple of 4 and tagged `+1` for responses or `+3` for
/// server-originated messages. Safe to share between tasks.
#[derive(Debug, Default)]
pub struct MessageIdGenerator {
    last: AtomicI64,
}

impl MessageIdGenerator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Next id from the system clock.
    pub fn next(&self, response: bool) -> i64 {
        self.next_at(now(), response)
    }

    /// Next id as if the clock read `since_epoch`.
    pub fn next_at(&self, since_epoch: Duration, response: bool) -> i64 {
        let tag = if response { 1 } else { 3 };
        let candidate = (time_part(since_epoch) & !3) | tag;

        let mut issued = candidate;
        // The closure never returns `None`, so the update always succeeds.
        let _ = self.last.fetch_update(Ordering::SeqCst, Ordering::SeqCst, |last| {
            issued = candidate;
            if issued <= last {
                issued += ((last - issued) / 4 + 1) * 4;
            }
            Some(issued)
        });
        issued
    }

    /// The most recently issued id, or 0.
    pub fn last(&self) -> i64 {
        self.last.load(Ordering::SeqCst)
    }
}

/// Client-side id generator: plain multiples of 4.
#[derive(Debug, Default)]
pub struct ClientMessageIds {
    last: AtomicI64,
}

impl ClientMessageIds {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn next(&self) -> i64 {
        let candidate = time_part(now()) & !3;
        let mut issued = candidate;
        let _ = self.last.fetch_update(Ordering::SeqCst, Ordering::SeqCst, |last| {
            issued = if candidate > last { candidate } else { last + 4 };
            Some(issued)
        });
        issued
    }
}

fn now() -> Duration {
    SystemTime::now().duration_since(UNIX_EPOCH).unwrap_or_default()
}

fn time_part(since_epoch: Duration) -> i64 {
    let secs = since_epoch.as_secs() as i64;
    let frac = ((since_epoch.subsec_nanos() as u64) << 32) / 1_000_000_000;
    (secs << 32) | frac as i64
}

/// Seconds encoded in the high half of a message id.
pub fn msg_id_time(msg_id: i64) -> i64 {
    msg_id >> 32
}

/// `bad_msg_notification` error codes.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(i32)]
pub enum BadMsgCode {
    MsgIdTooLow = 16,
    MsgIdTooHigh = 17,
    MsgIdNotDivisibleBy4 = 18,
    ContainerMsgIdReused = 19,
    SeqNoTooLow = 32,
    SeqNoTooHigh = 33,
    EvenSeqNoExpected = 34,
    OddSeqNoExpected = 35,
    BadServerSalt = 48,
    InvalidContainer = 64,
}

impl BadMsgCode {
    pub fn code(self) -> i32 {
        self as i32
    }
}

/// Window a client message id must fall into relative to the server clock.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct MsgIdWindow {
    pub max_past: Duration,
    pub max_future: Duration,
}

impl Default for MsgIdWindow {
    fn default() -> Self {
        Self { max_past: Duration::from_secs(300), max_future: Duration::from_secs(30) }
    }
}

impl MsgIdWindow {
    /// Checks a client id against the system clock.
    pub fn check(&self, msg_id: i64) -> Result<(), BadMsgCode> {
        self.check_at(msg_id, now())
    }

    pub fn check_at(&self, msg_id: i64, since_epoch: Duration) -> Result<(), BadMsgCode> {
        if msg_id % 4 != 0 {
            return Err(BadMsgCode::MsgIdNotDivisibleBy4);
        }
        let sent = msg_id_time(msg_id);
        let now = since_epoch.as_secs() as i64;
        if sent < now - self.max_past.as_secs() as i64 {
            return Err(BadMsgCode::MsgIdTooLow);
        }
        if sent > now + self.max_future.as_secs() as i64 {
            return Err(BadMsgCode::MsgIdTooHigh);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const T: Duration = Duration::from_secs(1_700_000_000);

    #[test]
    fn tags_and_monotonicity() {
        let ids = MessageIdGenerator::new();
        let mut prev = 0;
        for i in 0..1000 {
            let response = i % 3 != 0;
            // The clock never moves, so every call after the first is bumped.
            let id = ids.next_at(T, response);
            assert!(id > prev);
            assert_eq!(id.rem_euclid(4), if response { 1 } else { 3 });
            prev = id;
        }
        assert_eq!(ids.last(), prev);
    }

    #[test]
    fn backwards_clock_still_increases() {
        let ids = MessageIdGenerator::new();
        let a = ids.next_at(T + Duration::from_secs(10), true);
        let b = ids.next_at(T, false);
        assert!(b > a);
        assert_eq!(b % 4, 3);
    }

    #[test]
    fn id_encodes_the_clock() {
        let ids = MessageIdGenerator::new();
        let id = ids.next_at(T + Duration::from_millis(500), true);
        assert_eq!(msg_id_time(id), T.as_secs() as i64);
        assert_eq!((id & 0xffff_ffff) >> 31, 1);
    }

    #[test]
    fn concurrent_callers_never_collide() {
        let ids = std::sync::Arc::new(MessageIdGenerator::new());
        let handles: Vec<_> = (0..4)
            .map(|_| {
                let ids = ids.clone();
                std::thread::spawn(move || (0..500).map(|_| ids.next(true)).collect::<Vec<_>>())
            })
            .collect();
        let mut all: Vec<i64> = handles.into_iter().flat_map(|h| h.join().unwrap()).collect();
        let len = all.len();
        all.sort_unstable();
        all.dedup();
        assert_eq!(all.len(), len);
    }

    #[test]
    fn client_window() {
        let window = MsgIdWindow::default();
        let base = (T.as_secs() as i64) << 32;
        assert_eq!(window.check_at(base, T), Ok(()));
        assert_eq!(window.check_at(base + 1, T), Err(BadMsgCode::MsgIdNotDivisibleBy4));
        assert_eq!(window.check_at(base - (301 << 32), T), Err(BadMsgCode::MsgIdTooLow));
        assert_eq!(window.check_at(base + (31 << 32), T), Err(BadMsgCode::MsgIdTooHigh));
        assert_eq!(BadMsgCode::BadServerSalt.code(), 48);
    }

    #[test]
    fn client_ids_are_multiples_of_four() {
        let ids = ClientMessageIds::new();
        let a = ids.next();
        let b = ids.next();
        assert_eq!(a % 4, 0);
        assert_eq!(b % 4, 0);
        assert!(b > a);
    }
}
