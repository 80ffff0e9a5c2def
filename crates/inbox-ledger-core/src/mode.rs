//! Batch parse modes as a strategy table.
//!
//! Each [`ParseMode`] maps to one [`ModeStrategy`]: an optional reset pass,
//! the message selection, and the write policy applied on a successful
//! parse. The batch driver reads only this table, so the idempotency
//! contract of every mode is visible here.
//!
//! | Mode | Reset | Selects | On success |
//! |------|-------|---------|------------|
//! | `quick` | - | unparsed | create |
//! | `smart-full` | orphaned → unparsed | unparsed | create |
//! | `full-reparse` | - | all | create unless one already references the message |
//! | `force-full` | - | all | create, even when one exists |

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ParseMode {
    Quick,
    SmartFull,
    FullReparse,
    ForceFull,
}

/// Which messages a pass operates on.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MessageSelection {
    Unparsed,
    /// `parsed_ok` with no associated transaction.
    Orphaned,
    All,
    Ids(Vec<String>),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WritePolicy {
    AlwaysCreate,
    /// Skip (as a duplicate) when any transaction already references the
    /// message. Re-parsing after a rule edit therefore never supersedes an
    /// existing transaction.
    SkipIfExisting,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ModeStrategy {
    /// Messages reset to `unparsed` before the main pass.
    pub reset: Option<MessageSelection>,
    pub selection: MessageSelection,
    pub write: WritePolicy,
}

impl ParseMode {
    pub const ALL: [ParseMode; 4] = [
        ParseMode::Quick,
        ParseMode::SmartFull,
        ParseMode::FullReparse,
        ParseMode::ForceFull,
    ];

    pub fn strategy(self) -> ModeStrategy {
        match self {
            ParseMode::Quick => ModeStrategy {
                reset: None,
                selection: MessageSelection::Unparsed,
                write: WritePolicy::AlwaysCreate,
            },
            ParseMode::SmartFull => ModeStrategy {
                reset: Some(MessageSelection::Orphaned),
                selection: MessageSelection::Unparsed,
                write: WritePolicy::AlwaysCreate,
            },
            ParseMode::FullReparse => ModeStrategy {
                reset: None,
                selection: MessageSelection::All,
                write: WritePolicy::SkipIfExisting,
            },
            ParseMode::ForceFull => ModeStrategy {
                reset: None,
                selection: MessageSelection::All,
                write: WritePolicy::AlwaysCreate,
            },
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ParseMode::Quick => "quick",
            ParseMode::SmartFull => "smart-full",
            ParseMode::FullReparse => "full-reparse",
            ParseMode::ForceFull => "force-full",
        }
    }
}

impl fmt::Display for ParseMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ParseMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        ParseMode::ALL
            .into_iter()
            .find(|m| m.as_str() == s)
            .ok_or_else(|| {
                format!(
                    "unknown parse mode: '{}'. Must be quick, smart-full, full-reparse, or force-full.",
                    s
                )
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn modes_parse_from_kebab_case() {
        for mode in ParseMode::ALL {
            assert_eq!(mode.as_str().parse::<ParseMode>().unwrap(), mode);
        }
        assert!("full".parse::<ParseMode>().is_err());
    }

    #[test]
    fn only_full_reparse_checks_existing_transactions() {
        let skipping: Vec<ParseMode> = ParseMode::ALL
            .into_iter()
            .filter(|m| m.strategy().write == WritePolicy::SkipIfExisting)
            .collect();
        assert_eq!(skipping, vec![ParseMode::FullReparse]);
    }

    #[test]
    fn quick_never_selects_parsed_messages() {
        assert_eq!(ParseMode::Quick.strategy().selection, MessageSelection::Unparsed);
        assert_eq!(ParseMode::Quick.strategy().reset, None);
    }
}
