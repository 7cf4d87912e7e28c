//! Per-cellet backlog of sends made while a connection is down

use std::collections::VecDeque;

use crate::primitive::Primitive;

/// Two FIFO queues of deferred sends, split by ack requirement
///
/// Replay order is the whole ack queue first, then the whole no-ack queue.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Backlog {
    ack: VecDeque<Primitive>,
    no_ack: VecDeque<Primitive>,
}

impl Backlog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue a send at the tail of its queue
    pub fn push(&mut self, primitive: Primitive, ack: bool) {
        if ack {
            self.ack.push_back(primitive);
        } else {
            self.no_ack.push_back(primitive);
        }
    }

    /// Next entry to replay and whether it needs an ack
    pub fn pop_next(&mut self) -> Option<(Primitive, bool)> {
        if let Some(primitive) = self.ack.pop_front() {
            return Some((primitive, true));
        }
        self.no_ack.pop_front().map(|primitive| (primitive, false))
    }

    /// Put back an entry whose replay failed, ahead of everything queued
    pub fn requeue_front(&mut self, primitive: Primitive, ack: bool) {
        if ack {
            self.ack.push_front(primitive);
        } else {
            self.no_ack.push_front(primitive);
        }
    }

    pub fn ack_len(&self) -> usize {
        self.ack.len()
    }

    pub fn no_ack_len(&self) -> usize {
        self.no_ack.len()
    }

    pub fn len(&self) -> usize {
        self.ack.len() + self.no_ack.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ack.is_empty() && self.no_ack.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::primitive::Stuff;

    fn msg(text: &str) -> Primitive {
        Primitive::new().with(Stuff::subject(text))
    }

    fn drain(backlog: &mut Backlog) -> Vec<(String, bool)> {
        std::iter::from_fn(|| backlog.pop_next())
            .map(|(p, ack)| (p.to_string(), ack))
            .collect()
    }

    #[test]
    fn test_ack_queue_replays_first() {
        let mut backlog = Backlog::new();
        backlog.push(msg("m1"), false);
        backlog.push(msg("m2"), true);
        backlog.push(msg("m3"), false);
        assert_eq!(backlog.ack_len(), 1);
        assert_eq!(backlog.no_ack_len(), 2);

        let order = drain(&mut backlog);
        assert_eq!(
            order,
            vec![
                (msg("m2").to_string(), true),
                (msg("m1").to_string(), false),
                (msg("m3").to_string(), false),
            ]
        );
        assert!(backlog.is_empty());
    }

    #[test]
    fn test_requeue_keeps_failed_entry_ahead_of_new_sends() {
        let mut backlog = Backlog::new();
        backlog.push(msg("a1"), true);
        backlog.push(msg("n1"), false);

        let (first, ack) = backlog.pop_next().unwrap();
        backlog.requeue_front(first, ack);
        backlog.push(msg("a2"), true);
        backlog.push(msg("n2"), false);
        assert_eq!(backlog.len(), 4);

        let order: Vec<_> = drain(&mut backlog).into_iter().map(|(p, _)| p).collect();
        assert_eq!(
            order,
            vec![
                msg("a1").to_string(),
                msg("a2").to_string(),
                msg("n1").to_string(),
                msg("n2").to_string(),
            ]
        );
    }
}
