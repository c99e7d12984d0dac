use std::{collections::BTreeMap, time::Instant};

use crate::ChannelId;

#[derive(Debug, Copy, Clone, Ord, PartialOrd, Eq, PartialEq, Hash)]
pub(crate) enum Timer {
    /// Per connection timers.
    Conn(ConnTimer),
    /// Per channel timers.
    Channel(ChannelId, ChannelTimer),
}

#[derive(Debug, Copy, Clone, Ord, PartialOrd, Eq, PartialEq, Hash)]
pub(crate) enum ConnTimer {
    /// When to start the next connection attempt
    Retry = 0,
    /// When to give up on an attempt that has not seen CONNECTED
    Connect = 1,
    /// When to consider a silent transport dead
    Idle = 2,
    /// When the server discards the state of a disconnected connection
    StateTtl = 3,
    /// When to stop waiting for CLOSED
    Close = 4,
    /// When the oldest outstanding heartbeat times out
    Ping = 5,
}

impl ConnTimer {
    const VALUES: [Self; 6] = [
        Self::Retry,
        Self::Connect,
        Self::Idle,
        Self::StateTtl,
        Self::Close,
        Self::Ping,
    ];
}

#[derive(Debug, Copy, Clone, Ord, PartialOrd, Eq, PartialEq, Hash)]
pub(crate) enum ChannelTimer {
    /// When an outstanding ATTACH or DETACH times out
    Operation = 0,
    /// When a Suspended channel retries its attach
    Retry = 1,
}

impl ChannelTimer {
    const VALUES: [Self; 2] = [Self::Operation, Self::Retry];
}

#[derive(Debug, Clone, Copy, Default)]
struct ChannelTimerTable {
    timers: [Option<Instant>; ChannelTimer::VALUES.len()],
}

impl ChannelTimerTable {
    fn is_empty(&self) -> bool {
        self.timers.iter().all(Option::is_none)
    }

    /// Remove the next timer up until `now`, including it
    fn expire_before(&mut self, now: Instant) -> Option<(ChannelTimer, Instant)> {
        for timer in ChannelTimer::VALUES {
            if let Some(time) = self.timers[timer as usize] {
                if time <= now {
                    self.timers[timer as usize] = None;
                    return Some((timer, time));
                }
            }
        }
        None
    }
}

/// Keeps track of the nearest timeout for each `Timer`
///
/// The [`TimerTable`] is advanced with [`TimerTable::expire_before`].
#[derive(Debug, Clone, Default)]
pub(crate) struct TimerTable {
    generic: [Option<Instant>; ConnTimer::VALUES.len()],
    channels: BTreeMap<ChannelId, ChannelTimerTable>,
}

impl TimerTable {
    /// Sets the timer unconditionally
    pub(crate) fn set(&mut self, timer: Timer, time: Instant) {
        match timer {
            Timer::Conn(timer) => self.generic[timer as usize] = Some(time),
            Timer::Channel(id, timer) => {
                self.channels.entry(id).or_default().timers[timer as usize] = Some(time);
            }
        }
    }

    pub(crate) fn stop(&mut self, timer: Timer) {
        match timer {
            Timer::Conn(timer) => self.generic[timer as usize] = None,
            Timer::Channel(id, timer) => {
                if let Some(table) = self.channels.get_mut(&id) {
                    table.timers[timer as usize] = None;
                    if table.is_empty() {
                        self.channels.remove(&id);
                    }
                }
            }
        }
    }

    pub(crate) fn is_set(&self, timer: Timer) -> bool {
        match timer {
            Timer::Conn(timer) => self.generic[timer as usize].is_some(),
            Timer::Channel(id, timer) => self
                .channels
                .get(&id)
                .is_some_and(|t| t.timers[timer as usize].is_some()),
        }
    }

    /// Stops all timers of one channel
    pub(crate) fn stop_channel(&mut self, id: ChannelId) {
        self.channels.remove(&id);
    }

    /// Get the next queued timeout
    pub(crate) fn peek(&self) -> Option<Instant> {
        let min_generic = self.generic.iter().filter_map(|&x| x).min();
        let min_channel = self
            .channels
            .values()
            .flat_map(|c| c.timers.iter().filter_map(|&x| x))
            .min();

        match (min_generic, min_channel) {
            (None, None) => None,
            (Some(val), None) | (None, Some(val)) => Some(val),
            (Some(a), Some(b)) => Some(a.min(b)),
        }
    }

    /// Remove the next timer up until `now`, including it
    pub(crate) fn expire_before(&mut self, now: Instant) -> Option<(Timer, Instant)> {
        for timer in ConnTimer::VALUES {
            if let Some(time) = self.generic[timer as usize] {
                if time <= now {
                    self.generic[timer as usize] = None;
                    return Some((Timer::Conn(timer), time));
                }
            }
        }

        let mut res = None;
        for (&id, timers) in self.channels.iter_mut() {
            if let Some((timer, time)) = timers.expire_before(now) {
                res = Some((Timer::Channel(id, timer), time));
                break;
            }
        }

        // clear out old timers
        self.channels.retain(|_, timers| !timers.is_empty());
        res
    }

    /// Stops every connection and channel timer
    pub(crate) fn reset(&mut self) {
        for timer in ConnTimer::VALUES {
            self.generic[timer as usize] = None;
        }
        self.channels.clear();
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;

    #[test]
    fn timer_table() {
        let mut timers = TimerTable::default();
        let sec = Duration::from_secs(1);
        let now = Instant::now() + Duration::from_secs(10);
        timers.set(Timer::Conn(ConnTimer::Idle), now - 3 * sec);
        timers.set(Timer::Conn(ConnTimer::Close), now - 2 * sec);

        assert_eq!(timers.peek(), Some(now - 3 * sec));
        assert_eq!(
            timers.expire_before(now),
            Some((Timer::Conn(ConnTimer::Idle), now - 3 * sec))
        );
        assert_eq!(
            timers.expire_before(now),
            Some((Timer::Conn(ConnTimer::Close), now - 2 * sec))
        );
        assert_eq!(timers.expire_before(now), None);
    }

    #[test]
    fn channel_timers() {
        let mut timers = TimerTable::default();
        let sec = Duration::from_secs(1);
        let now = Instant::now();
        let retry = Timer::Channel(ChannelId(1), ChannelTimer::Retry);
        timers.set(retry, now + 5 * sec);
        timers.set(Timer::Channel(ChannelId(2), ChannelTimer::Operation), now + sec);
        timers.set(Timer::Conn(ConnTimer::Retry), now + 3 * sec);

        assert_eq!(timers.peek(), Some(now + sec));
        timers.stop_channel(ChannelId(2));
        assert_eq!(timers.peek(), Some(now + 3 * sec));
        assert!(timers.is_set(retry));
        assert_eq!(timers.expire_before(now + 4 * sec).map(|x| x.0), Some(Timer::Conn(ConnTimer::Retry)));
        assert_eq!(timers.expire_before(now + 4 * sec), None);
        assert_eq!(timers.expire_before(now + 5 * sec), Some((retry, now + 5 * sec)));
        assert_eq!(timers.peek(), None);

        timers.set(retry, now);
        timers.reset();
        assert!(!timers.is_set(retry));
    }
}
