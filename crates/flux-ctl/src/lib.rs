//! Thin CLI adapter over `flux-sessiontx`'s debug surfaces. Kept separate
//! from the engine crate itself so the hot-path code never has to know
//! about `clap`, file I/O, or JSON.

use std::path::{Path, PathBuf};

use flux_sessiontx::{EventMailbox, SessionEvent, dump};
use serde::Deserialize;

/// JSON-friendly stand-in for `SessionEvent`. The real `Rpc` variant carries
/// a raw function pointer and can't round-trip through a file, so it's
/// deliberately left out here — this tool previews the mailbox dump format
/// against captured or hand-written Tx/BuiltinRx/Disconnect/AppRx traffic,
/// not arbitrary live engine state.
#[derive(Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum EventDescriptor {
    Tx { session_index: u32 },
    BuiltinRx { session_index: u32 },
    Disconnect { session_index: u32, postponed: bool },
    AppRx { session_index: u32 },
}

impl From<EventDescriptor> for SessionEvent {
    fn from(d: EventDescriptor) -> Self {
        match d {
            EventDescriptor::Tx { session_index } => Self::Tx { session_index },
            EventDescriptor::BuiltinRx { session_index } => Self::BuiltinRx { session_index },
            EventDescriptor::Disconnect { session_index, postponed } => {
                Self::Disconnect { session_index, postponed }
            }
            EventDescriptor::AppRx { session_index } => Self::AppRx { session_index },
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum CtlError {
    #[error("reading events file {0:?}: {1}")]
    Read(PathBuf, std::io::Error),
    #[error("parsing events file {0:?}: {1}")]
    Parse(PathBuf, serde_json::Error),
}

/// Loads a JSON array of `EventDescriptor`s from `path`, replays them into a
/// fresh mailbox in file order, and renders the same text
/// `dump::dump_mailbox` would produce against a live engine.
pub fn dump_mailbox_from_file(path: &Path) -> Result<String, CtlError> {
    let text = std::fs::read_to_string(path).map_err(|e| CtlError::Read(path.to_path_buf(), e))?;
    let descriptors: Vec<EventDescriptor> =
        serde_json::from_str(&text).map_err(|e| CtlError::Parse(path.to_path_buf(), e))?;

    let mailbox = EventMailbox::new(descriptors.len().max(1));
    for d in descriptors {
        mailbox.try_push(d.into());
    }
    Ok(dump::dump_mailbox(&mailbox))
}
