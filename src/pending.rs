// Copyright 2021 Joyent, Inc.

//! The request table correlates outstanding calls with their replies. Every
//! call draws a fresh 31-bit tag and parks a oneshot waiter under it; the
//! switchboard completes the waiter when a message addressed to this node
//! arrives with a matching tag.

use std::collections::HashMap;
use std::sync::Mutex;

use rand::Rng;
use tokio::sync::oneshot;

use crate::protocol::PatchMessage;

/// The lowest tag handed out for calls. Zero is the announcement tag; one and
/// two are kept clear of the allocator.
pub(crate) const FIRST_TAG: i32 = 3;

#[derive(Default)]
pub(crate) struct RequestTable {
    waiting: Mutex<HashMap<i32, oneshot::Sender<PatchMessage>>>,
}

impl RequestTable {
    /// Allocates a fresh tag and parks a waiter under it. The receiver lives
    /// on the caller's stack until the call completes or is abandoned.
    pub(crate) fn create(&self) -> (i32, oneshot::Receiver<PatchMessage>) {
        let (tx, rx) = oneshot::channel();
        let mut waiting = self.waiting.lock().unwrap();
        let seed = rand::thread_rng().gen_range(FIRST_TAG..=i32::MAX);
        let tag = next_free(seed, &waiting);
        waiting.insert(tag, tx);
        (tag, rx)
    }

    /// Delivers `msg` to the waiter parked under `tag` and retires the entry.
    /// Returns the message back when no such waiter exists.
    pub(crate) fn complete(
        &self,
        tag: i32,
        msg: PatchMessage,
    ) -> Result<(), PatchMessage> {
        match self.waiting.lock().unwrap().remove(&tag) {
            // The waiter may have given up in the meantime; the reply is
            // simply dropped along with the disconnected sender.
            Some(tx) => {
                let _ = tx.send(msg);
                Ok(())
            }
            None => Err(msg),
        }
    }

    /// Retires `tag` without waking anyone.
    pub(crate) fn cancel(&self, tag: i32) {
        self.waiting.lock().unwrap().remove(&tag);
    }
}

// TODO: sweep entries whose receivers have disconnected, so a caller that
// never gets a reply and never times out cleanly does not pin its tag
// forever.

/// Linear probe upward from `seed`, wrapping through [`FIRST_TAG`] at the
/// top of the 31-bit space, until an unused tag is found.
fn next_free(
    seed: i32,
    occupied: &HashMap<i32, oneshot::Sender<PatchMessage>>,
) -> i32 {
    let mut tag = seed;
    while occupied.contains_key(&tag) {
        tag = if tag == i32::MAX { FIRST_TAG } else { tag + 1 };
    }
    tag
}

#[cfg(test)]
mod test {
    use super::*;

    fn occupy(tags: &[i32]) -> HashMap<i32, oneshot::Sender<PatchMessage>> {
        tags.iter()
            .map(|&t| (t, oneshot::channel().0))
            .collect()
    }

    #[test]
    fn probe_skips_occupied_tags() {
        let occupied = occupy(&[10, 11, 12]);
        assert_eq!(next_free(10, &occupied), 13);
        assert_eq!(next_free(9, &occupied), 9);
    }

    #[test]
    fn probe_wraps_through_first_tag() {
        let occupied = occupy(&[i32::MAX, FIRST_TAG]);
        assert_eq!(next_free(i32::MAX, &occupied), FIRST_TAG + 1);
    }

    #[test]
    fn allocations_are_distinct() {
        let table = RequestTable::default();
        let mut seen = std::collections::HashSet::new();
        let mut receivers = Vec::new();
        for _ in 0..256 {
            let (tag, rx) = table.create();
            assert!(tag >= FIRST_TAG);
            assert!(seen.insert(tag), "tag {} allocated twice", tag);
            receivers.push(rx);
        }
    }

    #[tokio::test]
    async fn complete_wakes_the_waiter() {
        let table = RequestTable::default();
        let (tag, rx) = table.create();

        let reply = PatchMessage::request("me", "you", tag, "", "done");
        assert!(table.complete(tag, reply).is_ok());

        let got = rx.await.unwrap();
        assert_eq!(got.va2, "done");

        // The entry is gone; a second completion has nowhere to land.
        let dup = PatchMessage::request("me", "you", tag, "", "again");
        assert!(table.complete(tag, dup).is_err());
    }

    #[test]
    fn cancel_retires_the_tag() {
        let table = RequestTable::default();
        let (tag, _rx) = table.create();
        table.cancel(tag);
        let msg = PatchMessage::request("me", "you", tag, "", "");
        assert!(table.complete(tag, msg).is_err());
    }
}
