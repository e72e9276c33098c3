//! Session lifecycle engine

pub mod elimination;
pub mod error;
pub mod index;
pub mod phase;
pub mod player;
pub mod roster;
pub mod session;
pub mod team;
pub mod timer;

pub use elimination::{EliminationTracker, MatchSummary, StatLine};
pub use error::{SessionError, ValidationError};
pub use index::{Claim, MembershipIndex};
pub use phase::{EndReason, SessionState, TeamMode};
pub use player::{GameMode, ItemStack, PlayerId, PlayerSnapshot, StatusEffect};
pub use roster::{AdmitOutcome, Membership, PlayerRoster, RosterError, RosterView, SpectatorReason};
pub use session::{Session, SessionContext, SessionDetail, SessionOverview};
pub use team::{Team, TeamBoard};
pub use timer::{PhaseTimer, TimerEvent, TimerSettings};
