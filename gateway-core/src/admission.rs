use std::sync::atomic::{AtomicU32, Ordering};

use gateway_common::config::MaxStartups;
use rand::Rng;

use gateway_common::helpers::rng::get_crypto_rng;

/// OpenSSH-style probabilistic admission throttle. `startups` tracks
/// in-flight authentication attempts (incremented in `login_begin`,
/// decremented in `login_finish`), independent of how many of them
/// eventually succeed.
pub struct Admission {
    limits: MaxStartups,
    startups: AtomicU32,
}

impl Admission {
    pub fn new(limits: MaxStartups) -> Self {
        Self {
            limits,
            startups: AtomicU32::new(0),
        }
    }

    pub fn begin(&self) {
        self.startups.fetch_add(1, Ordering::SeqCst);
    }

    pub fn finish(&self) {
        self.startups.fetch_sub(1, Ordering::SeqCst);
    }

    pub fn current(&self) -> u32 {
        self.startups.load(Ordering::SeqCst)
    }

    /// Whether a new authentication attempt may proceed, given the current
    /// in-flight count. `max_startups == 0` disables the throttle entirely.
    pub fn can_start(&self) -> bool {
        let MaxStartups { begin, rate, max } = self.limits;
        if max == 0 {
            return true;
        }
        let startups = self.current();
        if startups <= begin {
            return true;
        }
        if startups > max {
            return false;
        }
        if rate == 100 {
            return false;
        }

        let p = (100 - rate) as f64 * (startups - begin) as f64 / (max - begin) as f64 + rate as f64;
        let r: f64 = get_crypto_rng().gen_range(0.0..100.0);
        r >= p
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn always_admits_at_or_below_begin() {
        let a = Admission::new(MaxStartups { begin: 10, rate: 30, max: 60 });
        for _ in 0..10 {
            a.begin();
        }
        assert!(a.can_start());
    }

    #[test]
    fn never_admits_above_max() {
        let a = Admission::new(MaxStartups { begin: 10, rate: 30, max: 60 });
        for _ in 0..61 {
            a.begin();
        }
        assert!(!a.can_start());
    }

    #[test]
    fn full_rate_rejects_once_past_begin() {
        let a = Admission::new(MaxStartups { begin: 1, rate: 100, max: 1 });
        a.begin();
        a.begin();
        assert!(!a.can_start());
    }

    #[test]
    fn disabled_when_max_is_zero() {
        let a = Admission::new(MaxStartups { begin: 0, rate: 100, max: 0 });
        for _ in 0..1000 {
            a.begin();
        }
        assert!(a.can_start());
    }

    #[test]
    fn begin_and_finish_balance() {
        let a = Admission::new(MaxStartups::default());
        a.begin();
        a.begin();
        a.finish();
        assert_eq!(a.current(), 1);
        a.finish();
        assert_eq!(a.current(), 0);
    }
}
