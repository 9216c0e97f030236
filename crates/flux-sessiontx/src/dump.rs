//! Debug dump of the event mailbox, for `flux-ctl`. Never called from the
//! hot path — takes a full snapshot under the mailbox's lock.

use std::fmt::Write as _;

use crate::{event::SessionEvent, mailbox::EventMailbox};

/// Pretty-prints every event currently queued in `mailbox`, one per line,
/// in drain order.
pub fn dump_mailbox(mailbox: &EventMailbox) -> String {
    let events = mailbox.snapshot();
    let mut out = String::new();
    let _ = writeln!(out, "mailbox: {} / {} events", events.len(), mailbox.capacity());
    for (i, event) in events.iter().enumerate() {
        let _ = writeln!(out, "  [{i}] {}", format_event(event));
    }
    out
}

fn format_event(event: &SessionEvent) -> String {
    match event {
        SessionEvent::Tx { session_index } => format!("TX session={session_index}"),
        SessionEvent::BuiltinRx { session_index } => format!("BUILTIN_RX session={session_index}"),
        SessionEvent::Disconnect { session_index, postponed } => {
            format!("DISCONNECT session={session_index} postponed={postponed}")
        }
        SessionEvent::Rpc { .. } => "RPC".to_string(),
        SessionEvent::AppRx { session_index } => format!("APP_RX session={session_index} (unhandled)"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn dump_lists_events_in_order() {
        let mb = EventMailbox::new(8);
        mb.try_push(SessionEvent::Tx { session_index: 3 });
        mb.try_push(SessionEvent::Disconnect { session_index: 3, postponed: false });
        let text = dump_mailbox(&mb);
        assert!(text.contains("2 / 8 events"));
        assert!(text.contains("[0] TX session=3"));
        assert!(text.contains("[1] DISCONNECT session=3 postponed=false"));
    }

    #[test]
    fn dump_of_empty_mailbox() {
        let mb = EventMailbox::new(4);
        let text = dump_mailbox(&mb);
        assert!(text.contains("0 / 4 events"));
    }
}
