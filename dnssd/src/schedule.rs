use std::collections::{BTreeMap, HashMap};
use std::time::Duration;
use tokio::time::Instant;

use crate::dns::Message;
use crate::transport::{Destination, Family};

pub(crate) type SessionId = u64;
pub(crate) type BrowseId = u64;

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub(crate) enum Timer {
    Probe(SessionId),
    Announce(SessionId),
    Reannounce(SessionId),
    Coalesce(SessionId),
    RegisterDeadline(SessionId),
    /// Keyed by canonical `<service>.<domain>`.
    Query(String),
    /// Keyed by canonical instance name.
    ResolveRetry(String),
    ResolveDeadline(String),
    Reopen(Family),
}

#[derive(Debug)]
pub(crate) enum Effect {
    Send(Message, Destination),
    Schedule(Timer, Duration),
    Cancel(Timer),
}

#[derive(Debug, Default)]
pub(crate) struct Outbox {
    effects: Vec<Effect>,
}

impl Outbox {
    pub fn send(&mut self, message: Message, destination: Destination) {
        if !message.is_empty() {
            self.effects.push(Effect::Send(message, destination));
        }
    }

    pub fn multicast(&mut self, message: Message) {
        self.send(message, Destination::Multicast);
    }

    pub fn schedule(&mut self, timer: Timer, delay: Duration) {
        self.effects.push(Effect::Schedule(timer, delay));
    }

    pub fn cancel(&mut self, timer: Timer) {
        self.effects.push(Effect::Cancel(timer));
    }

    pub fn drain(&mut self) -> std::vec::Drain<'_, Effect> {
        self.effects.drain(..)
    }

    #[cfg(test)]
    pub fn sent(&self) -> Vec<&Message> {
        self.effects
            .iter()
            .filter_map(|effect| match effect {
                Effect::Send(message, _) => Some(message),
                _ => None,
            })
            .collect()
    }

    #[cfg(test)]
    pub fn scheduled(&self, timer: &Timer) -> Option<Duration> {
        self.effects.iter().rev().find_map(|effect| match effect {
            Effect::Schedule(t, delay) if t == timer => Some(*delay),
            _ => None,
        })
    }
}

/// Pending timers ordered by deadline. Scheduling a timer that is already
/// pending moves it.
#[derive(Debug, Default)]
pub(crate) struct TimerQueue {
    due: BTreeMap<(Instant, u64), Timer>,
    index: HashMap<Timer, (Instant, u64)>,
    seq: u64,
}

impl TimerQueue {
    pub fn schedule(&mut self, timer: Timer, at: Instant) {
        self.cancel(&timer);
        self.seq += 1;
        let slot = (at, self.seq);
        self.index.insert(timer.clone(), slot);
        self.due.insert(slot, timer);
    }

    pub fn cancel(&mut self, timer: &Timer) {
        if let Some(slot) = self.index.remove(timer) {
            self.due.remove(&slot);
        }
    }

    pub fn is_scheduled(&self, timer: &Timer) -> bool {
        self.index.contains_key(timer)
    }

    pub fn next_deadline(&self) -> Option<Instant> {
        self.due.keys().next().map(|(at, _)| *at)
    }

    /// Removes and returns every timer due at `now`, earliest first.
    pub fn pop_due(&mut self, now: Instant) -> Vec<Timer> {
        let mut fired = Vec::new();
        while let Some(entry) = self.due.first_entry() {
            if entry.key().0 > now {
                break;
            }
            let timer = entry.remove();
            self.index.remove(&timer);
            fired.push(timer);
        }
        fired
    }
}
