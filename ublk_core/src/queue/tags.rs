// SPDX-License-Identifier: BSD-3-Clause
// Copyright 2025. Triad National Security, LLC.

//! Per-tag request state. Each of a queue's `D` tags cycles through
//! fetch-in-flight, owned, and commit-in-flight until the kernel retires it
//! at shutdown; the table rejects any transition the protocol does not
//! allow.

use crate::{sys, Error};

/// Where one tag is in its fetch → owned → commit-and-fetch cycle.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum TagState {
    /// A fetch is outstanding; the kernel completes it when it has work.
    FetchInFlight,

    /// The kernel delivered a request; userspace holds exclusive read
    /// access to the tag's descriptor until the commit goes out.
    Owned,

    /// A commit-and-fetch is outstanding, carrying the finished request's
    /// result and re-arming the tag in the same message.
    CommitInFlight,

    /// Retired; no further transitions.
    Done,
}

/// The fixed table of a queue's tag states. Tags are never allocated or
/// freed; the set is the integers `[0, depth)` for the queue's lifetime.
pub struct TagTable {
    states: Vec<TagState>,
    live: usize,
}

impl TagTable {
    /// A table with every tag armed, matching the queue's state right
    /// after the initial fetch batch is published.
    pub fn new(depth: u16) -> Self {
        Self {
            states: vec![TagState::FetchInFlight; depth as usize],
            live: depth as usize,
        }
    }

    pub fn get(&self, tag: u16) -> TagState {
        self.states[tag as usize]
    }

    /// Tags that have not retired yet. The queue is finished once this
    /// reaches zero.
    pub fn live(&self) -> usize {
        self.live
    }

    pub fn count(&self, state: TagState) -> usize {
        self.states.iter().filter(|&&s| s == state).count()
    }

    /// Apply the completion of `tag`'s in-flight command. A result of
    /// [`sys::IO_RES_OK`] hands the tag's request to userspace; anything
    /// else retires the tag.
    ///
    /// A completion for a tag with no command in flight is a protocol
    /// violation and must abort the queue.
    pub fn on_completion(&mut self, tag: u16, res: i32) -> Result<TagState, Error> {
        let Some(&current) = self.states.get(tag as usize) else {
            // A tag outside the table is reported against the terminal
            // state; it has no slot to be in.
            return Err(Error::ProtocolViolation {
                tag,
                state: TagState::Done,
            });
        };

        match current {
            TagState::FetchInFlight | TagState::CommitInFlight => {
                let next = if res == sys::IO_RES_OK {
                    TagState::Owned
                } else {
                    self.live -= 1;
                    TagState::Done
                };
                self.states[tag as usize] = next;
                Ok(next)
            }
            _ => Err(Error::ProtocolViolation {
                tag,
                state: current,
            }),
        }
    }

    /// Record that `tag`'s commit-and-fetch has been prepared for
    /// submission. Only an owned tag may commit.
    pub fn on_commit(&mut self, tag: u16) -> Result<(), Error> {
        match self.states.get(tag as usize) {
            Some(TagState::Owned) => {
                self.states[tag as usize] = TagState::CommitInFlight;
                Ok(())
            }
            Some(&current) => Err(Error::ProtocolViolation {
                tag,
                state: current,
            }),
            None => Err(Error::ProtocolViolation {
                tag,
                state: TagState::Done,
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn population(table: &TagTable) -> usize {
        table.count(TagState::FetchInFlight)
            + table.count(TagState::Owned)
            + table.count(TagState::CommitInFlight)
    }

    #[test]
    fn boot_state_is_all_fetches() {
        let table = TagTable::new(32);
        assert_eq!(table.count(TagState::FetchInFlight), 32);
        assert_eq!(table.live(), 32);
        assert_eq!(population(&table), 32);
    }

    #[test]
    fn fetch_commit_cycle() {
        let mut table = TagTable::new(4);

        assert_eq!(table.on_completion(2, sys::IO_RES_OK).unwrap(), TagState::Owned);
        assert_eq!(population(&table), 4);

        table.on_commit(2).unwrap();
        assert_eq!(table.get(2), TagState::CommitInFlight);
        assert_eq!(population(&table), 4);

        // The fetch half of commit-and-fetch returned with more work.
        assert_eq!(table.on_completion(2, sys::IO_RES_OK).unwrap(), TagState::Owned);
        assert_eq!(population(&table), 4);
    }

    #[test]
    fn abort_retires_the_tag() {
        let mut table = TagTable::new(2);

        assert_eq!(
            table.on_completion(0, sys::IO_RES_ABORT).unwrap(),
            TagState::Done
        );
        assert_eq!(table.live(), 1);

        table.on_completion(1, sys::IO_RES_OK).unwrap();
        table.on_commit(1).unwrap();
        assert_eq!(table.on_completion(1, -libc::ENODEV).unwrap(), TagState::Done);
        assert_eq!(table.live(), 0);
    }

    #[test]
    fn completion_while_owned_is_a_violation() {
        let mut table = TagTable::new(2);
        table.on_completion(0, sys::IO_RES_OK).unwrap();

        match table.on_completion(0, sys::IO_RES_OK) {
            Err(Error::ProtocolViolation {
                tag: 0,
                state: TagState::Owned,
            }) => {}
            other => panic!("expected a protocol violation, got {other:?}"),
        }
    }

    #[test]
    fn completion_after_retirement_is_a_violation() {
        let mut table = TagTable::new(1);
        table.on_completion(0, sys::IO_RES_ABORT).unwrap();
        assert!(table.on_completion(0, sys::IO_RES_OK).is_err());
    }

    #[test]
    fn commit_requires_ownership() {
        let mut table = TagTable::new(2);
        assert!(table.on_commit(0).is_err());

        table.on_completion(0, sys::IO_RES_OK).unwrap();
        table.on_commit(0).unwrap();
        assert!(table.on_commit(0).is_err());
    }

    #[test]
    fn out_of_range_tags_are_violations() {
        let mut table = TagTable::new(2);
        assert!(table.on_completion(7, sys::IO_RES_OK).is_err());
        assert!(table.on_commit(7).is_err());
    }
}
